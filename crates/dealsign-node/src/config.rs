use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use libp2p::PeerId;

use crate::wallet::ExportedKey;

#[derive(Parser, Debug)]
#[command(name = "dealsign", about = "Relayed delegated signing for storage deal proposals")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the signing server behind the relays.
    Run(RunConfig),

    /// Ask a remote signer to sign a test proposal.
    Test(TestConfig),

    /// Generate a new Ed25519 peer identity.
    GeneratePeer,
}

#[derive(Args, Debug)]
pub struct RunConfig {
    /// base64 protobuf-encoded libp2p private key of this node.
    #[arg(long, short = 'k', env = "IDENTITY_KEY")]
    pub identity_key: String,

    /// Peers allowed to request signatures (can repeat, or comma-separate).
    #[arg(long = "allowed-requester", short = 'r', env = "ALLOWED_REQUESTERS", value_delimiter = ',')]
    pub allowed_requesters: Vec<PeerId>,

    /// Exported private keys to sign with (can repeat, or comma-separate).
    #[arg(long = "sign-key", short = 's', env = "SIGN_KEYS", value_delimiter = ',')]
    pub sign_keys: Vec<ExportedKey>,

    /// Relay multiaddrs ending in /p2p/<relay id>.
    /// Replaces the built-in relays when given.
    #[arg(long = "relay-info", env = "RELAY_INFOS", value_delimiter = ',')]
    pub relay_infos: Vec<String>,

    /// Health endpoint listen address.
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8088")]
    pub health_addr: SocketAddr,
}

#[derive(Args, Debug)]
pub struct TestConfig {
    /// base64 protobuf-encoded libp2p private key of this client.
    #[arg(long, short = 'k', env = "IDENTITY_KEY")]
    pub identity_key: String,

    /// Peer id of the signer.
    #[arg(long, short = 'd')]
    pub destination: PeerId,

    /// Client address (base58) whose key the signer should use.
    #[arg(long, short = 'c')]
    pub client: dealsign_protocol::Address,

    /// Relay multiaddrs the signer is reserved on.
    #[arg(long = "relay-info", env = "RELAY_INFOS", value_delimiter = ',')]
    pub relay_infos: Vec<String>,

    /// Give up after this many seconds.
    #[arg(long, default_value = "60")]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_repeated_and_delimited_values() {
        let a = PeerId::random();
        let b = PeerId::random();
        let cli = Cli::try_parse_from([
            "dealsign".to_string(),
            "run".into(),
            "-k".into(),
            "CAESQ".into(),
            "-r".into(),
            format!("{a},{b}"),
            "--sign-key".into(),
            "deadbeef".into(),
            "-s".into(),
            "cafe".into(),
        ])
        .unwrap();

        let Command::Run(run) = cli.command else { panic!("expected run") };
        assert_eq!(run.allowed_requesters, vec![a, b]);
        assert_eq!(run.sign_keys.len(), 2);
        assert!(run.relay_infos.is_empty());
        assert_eq!(run.health_addr, "0.0.0.0:8088".parse().unwrap());
    }

    #[test]
    fn test_command_defaults_timeout() {
        let dest = PeerId::random();
        let client = dealsign_protocol::Address::from_bytes([5u8; 32]);
        let cli = Cli::try_parse_from([
            "dealsign".to_string(),
            "test".into(),
            "-k".into(),
            "CAESQ".into(),
            "-d".into(),
            dest.to_string(),
            "-c".into(),
            client.to_string(),
        ])
        .unwrap();

        let Command::Test(test) = cli.command else { panic!("expected test") };
        assert_eq!(test.destination, dest);
        assert_eq!(test.client, client);
        assert_eq!(test.timeout_secs, 60);
    }

    #[test]
    fn bad_peer_id_is_rejected() {
        let err = Cli::try_parse_from(["dealsign", "run", "-k", "x", "-r", "not-a-peer"]);
        assert!(err.is_err());
    }
}
