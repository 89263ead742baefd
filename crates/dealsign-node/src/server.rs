//! Signing server: answers `/cmd/signproposal/v1` streams.
//!
//! Each inbound stream is handled by its own task. The remote peer is
//! authorized before anything is read; the request must survive a
//! decode/encode round trip byte for byte before it is signed, so the
//! signature always covers exactly what the requester sent.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use dealsign_protocol::{
    DealProposal, ProtocolError, SignablePayload, SignerResponse, StatusCode, MAX_REQUEST_SIZE,
    SIGN_PROPOSAL_PROTOCOL, STREAM_TIMEOUT,
};
use futures::io::{AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    connectivity::{spawn_relay_tasks, BackoffPolicy},
    keystore::KeyStore,
    relay::RelayDescriptor,
    transport::{read_to_end_bounded, ByteStream, IncomingStreams, Transport, TransportError},
    wallet::Wallet,
};

// ============================================================================
// SignerServer
// ============================================================================

pub struct SignerServer<T: Transport, W: Wallet, P = DealProposal> {
    transport:      Arc<T>,
    store:          Arc<KeyStore>,
    wallet:         Arc<W>,
    relays:         Vec<RelayDescriptor>,
    backoff:        BackoffPolicy,
    stream_timeout: Duration,
    _payload:       PhantomData<fn() -> P>,
}

/// Tasks started by [`SignerServer::start`].
pub struct ServerHandle {
    accept: JoinHandle<()>,
    relays: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Wait for the accept loop and every relay task to finish.
    pub async fn join(self) {
        if let Err(e) = self.accept.await {
            tracing::error!("accept loop panicked: {e}");
        }
        for task in self.relays {
            if let Err(e) = task.await {
                tracing::error!("relay task panicked: {e}");
            }
        }
    }
}

impl<T, W, P> SignerServer<T, W, P>
where
    T: Transport,
    W: Wallet,
    P: SignablePayload + Send + 'static,
{
    pub fn new(
        transport: Arc<T>,
        wallet: Arc<W>,
        store: KeyStore,
        relays: Vec<RelayDescriptor>,
    ) -> Self {
        Self {
            transport,
            store: Arc::new(store),
            wallet,
            relays,
            backoff: BackoffPolicy::default(),
            stream_timeout: STREAM_TIMEOUT,
            _payload: PhantomData,
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    /// Override the per-stream time limit (default [`STREAM_TIMEOUT`]).
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Register the protocol handler and start one connectivity task per
    /// relay. Everything stops when `cancel` fires; streams already being
    /// handled run to completion within their timeout.
    pub fn start(&self, cancel: CancellationToken) -> Result<ServerHandle, TransportError> {
        let incoming = self
            .transport
            .accept(StreamProtocol::new(SIGN_PROPOSAL_PROTOCOL))?;

        tracing::info!(
            peer_id = %self.transport.local_peer_id(),
            relays  = self.relays.len(),
            keys    = self.store.addresses().count(),
            "signer listening on {SIGN_PROPOSAL_PROTOCOL}"
        );

        let handler = RequestHandler::<W, P>::new(Arc::clone(&self.store), Arc::clone(&self.wallet))
            .with_stream_timeout(self.stream_timeout);
        let accept = tokio::spawn(accept_loop(incoming, Arc::new(handler), cancel.clone()));
        let relays = spawn_relay_tasks(
            Arc::clone(&self.transport),
            &self.relays,
            self.backoff,
            cancel,
        );

        Ok(ServerHandle { accept, relays })
    }
}

async fn accept_loop<S, W, P>(
    mut incoming: IncomingStreams<S>,
    handler: Arc<RequestHandler<W, P>>,
    cancel: CancellationToken,
) where
    S: ByteStream,
    W: Wallet,
    P: SignablePayload + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = incoming.next() => next,
        };
        let Some((remote, stream)) = next else {
            tracing::warn!("inbound stream source closed");
            break;
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.handle_stream(remote, stream).await });
    }
    tracing::info!("accept loop stopped");
}

// ============================================================================
// RequestHandler
// ============================================================================

/// Per-request logic, shared read-only by every stream task.
pub struct RequestHandler<W, P = DealProposal> {
    store:          Arc<KeyStore>,
    wallet:         Arc<W>,
    stream_timeout: Duration,
    _payload:       PhantomData<fn() -> P>,
}

impl<W, P> RequestHandler<W, P>
where
    W: Wallet,
    P: SignablePayload,
{
    pub fn new(store: Arc<KeyStore>, wallet: Arc<W>) -> Self {
        Self {
            store,
            wallet,
            stream_timeout: STREAM_TIMEOUT,
            _payload: PhantomData,
        }
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Answer one stream. The stream is closed and dropped on every path.
    pub async fn handle_stream<S: ByteStream>(&self, remote: PeerId, mut stream: S) {
        tracing::debug!(%remote, "sign proposal request");

        let response = self.respond(remote, &mut stream).await;
        if response.code.is_success() {
            tracing::info!(%remote, "proposal signed");
        } else {
            tracing::warn!(%remote, code = %response.code, "request rejected: {}", response.message);
        }

        let reply = async {
            send_response(&mut stream, &response, remote).await;
            if let Err(e) = stream.close().await {
                tracing::debug!(%remote, "failed to close stream: {e}");
            }
        };
        if tokio::time::timeout(self.stream_timeout, reply).await.is_err() {
            tracing::warn!(%remote, "timed out writing response");
        }
    }

    async fn respond<S: ByteStream>(&self, remote: PeerId, stream: &mut S) -> SignerResponse {
        if !self.store.is_allowed(&remote) {
            return SignerResponse::failure(
                StatusCode::UnauthorizedRequester,
                format!("peer {remote} is not an allowed requester"),
            );
        }

        let read = tokio::time::timeout(
            self.stream_timeout,
            read_to_end_bounded(stream, MAX_REQUEST_SIZE),
        )
        .await;
        let request = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                return SignerResponse::failure(
                    StatusCode::ReadStreamError,
                    format!("failed to read request: {e}"),
                )
            }
            Err(_) => {
                return SignerResponse::failure(
                    StatusCode::ReadStreamError,
                    format!("timed out reading request after {:?}", self.stream_timeout),
                )
            }
        };

        self.sign_request(&request)
    }

    /// Validate a complete request body and sign it.
    pub fn sign_request(&self, request: &[u8]) -> SignerResponse {
        let proposal = match P::from_canonical_bytes(request) {
            Ok(p) => p,
            Err(e) => {
                return SignerResponse::failure(
                    StatusCode::DecodeRequestError,
                    format!("failed to decode proposal: {e}"),
                )
            }
        };

        let canonical = match proposal.to_canonical_bytes() {
            Ok(b) => b,
            Err(e) => {
                return SignerResponse::failure(
                    StatusCode::EncodeRequestError,
                    format!("failed to re-encode proposal: {e}"),
                )
            }
        };

        if canonical != request {
            return SignerResponse::failure(
                StatusCode::ProposalRemarshalMismatch,
                "proposal is not canonically encoded: re-encoded bytes differ from request",
            );
        }

        let selector = proposal.selector();
        let Some(key) = self.store.key_for(selector) else {
            return SignerResponse::failure(
                StatusCode::WalletKeyNotFound,
                format!("no signing key for address {selector}"),
            );
        };

        let signature = match self.wallet.sign(key, &canonical) {
            Ok(sig) => sig,
            Err(e) => {
                return SignerResponse::failure(
                    StatusCode::WalletSignError,
                    format!("failed to sign proposal: {e}"),
                )
            }
        };

        match signature.marshal_binary() {
            Ok(bytes) => SignerResponse::success(bytes),
            Err(e) => SignerResponse::failure(
                StatusCode::MarshalSignatureError,
                format!("failed to marshal signature: {e}"),
            ),
        }
    }
}

/// Encode and write `response`. Errors are logged, never returned, so this
/// is safe on a stream that is already closed or reset.
pub async fn send_response<S>(stream: &mut S, response: &SignerResponse, remote: PeerId)
where
    S: AsyncWrite + Unpin,
{
    let Some(bytes) = response_frame(response, remote, SignerResponse::to_cbor) else {
        return;
    };

    if let Err(e) = stream.write_all(&bytes).await {
        tracing::error!(%remote, "failed to send response: {e}");
        return;
    }
    if let Err(e) = stream.flush().await {
        tracing::error!(%remote, "failed to flush response: {e}");
    }
}

/// Encode `response`, falling back to an `EncodeResponseError` frame when
/// that fails. `None` only if the fallback cannot be encoded either.
fn response_frame(
    response: &SignerResponse,
    remote: PeerId,
    encode: impl Fn(&SignerResponse) -> Result<Vec<u8>, ProtocolError>,
) -> Option<Vec<u8>> {
    let err = match encode(response) {
        Ok(bytes) => return Some(bytes),
        Err(e) => e,
    };
    tracing::error!(%remote, "failed to encode response: {err}");

    let fallback = SignerResponse::failure(
        StatusCode::EncodeResponseError,
        format!("failed to encode response: {err}"),
    );
    match encode(&fallback) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(%remote, "failed to encode error response: {e}");
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
