//! Signing client: asks a relayed signer to sign a proposal and verifies
//! the answer before handing it back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealsign_protocol::{
    ProtocolError, SignablePayload, Signature, SignerResponse, StatusCode, MAX_RESPONSE_SIZE,
    SIGN_PROPOSAL_PROTOCOL,
};
use futures::io::AsyncWriteExt;
use libp2p::{PeerId, StreamProtocol};
use thiserror::Error;

use crate::{
    relay::{circuit_addresses, RelayDescriptor},
    transport::{read_to_end_bounded, Transport, TransportError},
    wallet::{Ed25519Wallet, Wallet, WalletError},
};

/// The signer answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed with status code {} ({}): {}", .code.as_u64(), .code, .message)]
pub struct RequestError {
    pub code:    StatusCode,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to encode proposal: {0}")]
    Encode(#[source] ProtocolError),

    #[error("failed to open stream: {0}")]
    OpenStream(#[from] TransportError),

    #[error("failed to write proposal: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read response: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to decode response: {0}")]
    DecodeResponse(#[source] ProtocolError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("failed to verify signature: {0}")]
    Verify(#[source] WalletError),

    #[error("signature does not verify against the proposal")]
    InvalidSignature,

    #[error("failed to unmarshal signature: {0}")]
    UnmarshalSignature(#[source] ProtocolError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Anything that can get a proposal signed by a remote peer.
#[async_trait]
pub trait ProposalSigner<P>: Send + Sync
where
    P: SignablePayload + Sync,
{
    async fn sign_proposal(&self, dest: PeerId, proposal: &P) -> Result<Signature, ClientError>;
}

pub struct SignerClient<T: Transport, W: Wallet = Ed25519Wallet> {
    transport: Arc<T>,
    wallet:    W,
    relays:    Vec<RelayDescriptor>,
    timeout:   Option<Duration>,
}

impl<T: Transport, W: Wallet> SignerClient<T, W> {
    /// `relays` are the relays the destination is expected to be reserved on.
    pub fn new(transport: Arc<T>, wallet: W, relays: Vec<RelayDescriptor>) -> Self {
        Self { transport, wallet, relays, timeout: None }
    }

    /// Bound the whole exchange, from stream open to the decoded response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn sign_proposal<P>(&self, dest: PeerId, proposal: &P) -> Result<Signature, ClientError>
    where
        P: SignablePayload + Sync,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(dest, proposal))
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => self.exchange(dest, proposal).await,
        }
    }

    async fn exchange<P>(&self, dest: PeerId, proposal: &P) -> Result<Signature, ClientError>
    where
        P: SignablePayload + Sync,
    {
        let addrs = circuit_addresses(&self.relays, dest);
        tracing::debug!(%dest, addrs = addrs.len(), "registering relay circuit addresses");
        self.transport.add_addresses(dest, addrs).await;

        // These exact bytes are what the signature must cover.
        let request = proposal.to_canonical_bytes().map_err(ClientError::Encode)?;

        // Relayed connections are the only route to the signer.
        let mut stream = self
            .transport
            .open_stream(dest, StreamProtocol::new(SIGN_PROPOSAL_PROTOCOL))
            .await?;

        stream.write_all(&request).await.map_err(ClientError::Write)?;
        stream.close().await.map_err(ClientError::Write)?;

        let body = read_to_end_bounded(&mut stream, MAX_RESPONSE_SIZE)
            .await
            .map_err(ClientError::Read)?;
        drop(stream);

        let response = SignerResponse::from_cbor(&body).map_err(ClientError::DecodeResponse)?;
        if !response.code.is_success() {
            return Err(RequestError { code: response.code, message: response.message }.into());
        }

        let valid = self
            .wallet
            .verify(proposal.selector(), &request, &response.signature)
            .map_err(ClientError::Verify)?;
        if !valid {
            return Err(ClientError::InvalidSignature);
        }

        let signature =
            Signature::unmarshal_binary(&response.signature).map_err(ClientError::UnmarshalSignature)?;
        tracing::info!(%dest, "proposal signed by remote signer");
        Ok(signature)
    }
}

#[async_trait]
impl<T, W, P> ProposalSigner<P> for SignerClient<T, W>
where
    T: Transport,
    W: Wallet,
    P: SignablePayload + Sync,
{
    async fn sign_proposal(&self, dest: PeerId, proposal: &P) -> Result<Signature, ClientError> {
        SignerClient::sign_proposal(self, dest, proposal).await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
