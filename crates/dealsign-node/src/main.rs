use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use clap::Parser;
use dealsign_node::{
    config::{Cli, Command, RunConfig, TestConfig},
    health,
    identity::{decode_identity, generate_peer},
    relay::relays_or_default,
    Ed25519Wallet, KeyStore, Libp2pHost, SignerClient, SignerServer,
};
use dealsign_protocol::{Address, DealProposal, TokenAmount};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dealsign=info,dealsign_node=info,libp2p=warn".parse().unwrap()),
        )
        .init();

    match Cli::parse().command {
        Command::Run(config) => run(config).await,
        Command::Test(config) => test(config).await,
        Command::GeneratePeer => {
            let peer = generate_peer().context("failed to generate peer identity")?;
            println!("Peer ID:     {}", peer.peer_id);
            println!("Public key:  {}", peer.public_key);
            println!("Private key: {}", peer.private_key);
            Ok(())
        }
    }
}

async fn run(config: RunConfig) -> anyhow::Result<()> {
    let keypair = decode_identity(&config.identity_key).context("failed to decode identity key")?;
    let relays = relays_or_default(&config.relay_infos).context("failed to parse relay info")?;

    let wallet = Arc::new(Ed25519Wallet::new());
    let store = KeyStore::new(wallet.as_ref(), config.sign_keys, config.allowed_requesters)
        .context("failed to load signing keys")?;
    for address in store.addresses() {
        tracing::info!(%address, "signing key loaded");
    }
    for peer in store.allowed_requesters() {
        tracing::info!(%peer, "allowed requester");
    }

    let shutdown = CancellationToken::new();
    let host = Arc::new(Libp2pHost::spawn(keypair, shutdown.clone())?);
    let server: SignerServer<_, _> = SignerServer::new(host, wallet, store, relays);
    let signer = server
        .start(shutdown.child_token())
        .context("failed to register signing protocol")?;

    let mut health = tokio::spawn(health::serve(config.health_addr, shutdown.child_token()));

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            Ok(())
        }
        exited = &mut health => match exited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("health endpoint failed"),
            Err(e) => Err(e).context("health endpoint task failed"),
        },
    };

    shutdown.cancel();
    signer.join().await;
    if !health.is_finished() {
        let _ = health.await;
    }
    result
}

async fn test(config: TestConfig) -> anyhow::Result<()> {
    let keypair = decode_identity(&config.identity_key).context("failed to decode identity key")?;
    let relays = relays_or_default(&config.relay_infos).context("failed to parse relay info")?;

    let shutdown = CancellationToken::new();
    let _stop_host = shutdown.clone().drop_guard();
    let host = Arc::new(Libp2pHost::spawn(keypair, shutdown)?);

    let client = SignerClient::new(host, Ed25519Wallet::new(), relays)
        .with_timeout(Duration::from_secs(config.timeout_secs));

    tracing::info!(dest = %config.destination, client = %config.client, "requesting test signature");
    let signature = client
        .sign_proposal(config.destination, &test_proposal(config.client))
        .await
        .context("signing request failed")?;

    let bytes = signature.marshal_binary().context("failed to marshal signature")?;
    tracing::info!(signature = %B64.encode(bytes), "received signature");
    Ok(())
}

fn test_proposal(client: Address) -> DealProposal {
    DealProposal {
        piece_cid:               b"baga6ea4seaqtestproposal".to_vec(),
        piece_size:              2048,
        verified_deal:           false,
        client,
        provider:                Address::from_bytes([0u8; 32]),
        label:                   "dealsign test proposal".into(),
        start_epoch:             0,
        end_epoch:               1,
        storage_price_per_epoch: TokenAmount(0),
        provider_collateral:     TokenAmount(0),
        client_collateral:       TokenAmount(0),
    }
}
