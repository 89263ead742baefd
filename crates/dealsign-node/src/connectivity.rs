//! Keeps the node reachable through its relays.
//!
//! One task per relay loops forever: probe the connection, connect if
//! needed, then hold a reservation, backing off exponentially on failure.
//! Failures are logged, never fatal; only the cancellation token ends a task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dealsign_protocol::{RELAY_ATTEMPT_TIMEOUT, RELAY_BACKOFF_MAX, RELAY_BACKOFF_MIN};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    relay::RelayDescriptor,
    transport::{Connectedness, Transport, TransportError},
};

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min:    Duration,
    pub max:    Duration,
    pub factor: u32,
    /// Draw each delay uniformly from `[min, computed]` instead of using the
    /// computed delay directly.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min:    RELAY_BACKOFF_MIN,
            max:    RELAY_BACKOFF_MAX,
            factor: 2,
            jitter: false,
        }
    }
}

/// Exponential backoff: `min * factor^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy:  BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = self.policy.factor.max(1).saturating_pow(self.attempt);
        let computed = self
            .policy
            .min
            .saturating_mul(multiplier)
            .clamp(self.policy.min, self.policy.max.max(self.policy.min));
        self.attempt = self.attempt.saturating_add(1);

        if self.policy.jitter && computed > self.policy.min {
            rand::thread_rng().gen_range(self.policy.min..=computed)
        } else {
            computed
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn min(&self) -> Duration {
        self.policy.min
    }
}

// ============================================================================
// Relay state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    ConnectedUnreserved,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    Probed { connected: bool },
    ConnectOk,
    ConnectFailed,
    ReserveOk,
    ReserveFailed,
}

impl RelayState {
    /// Transition table. Events that do not apply to a state leave it as is.
    pub fn on(self, event: RelayEvent) -> RelayState {
        use RelayEvent::*;
        use RelayState::*;

        match (self, event) {
            (_, Probed { connected: false }) => Connecting,
            (Disconnected | Connecting, Probed { connected: true }) => ConnectedUnreserved,
            (state, Probed { connected: true }) => state,

            (Connecting, ConnectOk) => ConnectedUnreserved,
            (Connecting, ConnectFailed) => Disconnected,

            (ConnectedUnreserved | Reserved, ReserveOk) => Reserved,
            (ConnectedUnreserved | Reserved, ReserveFailed) => ConnectedUnreserved,

            (state, _) => state,
        }
    }
}

// ============================================================================
// Relay tasks
// ============================================================================

/// Spawn one connectivity task per relay.
pub fn spawn_relay_tasks<T: Transport>(
    transport: Arc<T>,
    relays: &[RelayDescriptor],
    policy: BackoffPolicy,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    relays
        .iter()
        .cloned()
        .map(|relay| {
            tokio::spawn(maintain_relay(
                Arc::clone(&transport),
                relay,
                policy,
                cancel.clone(),
            ))
        })
        .collect()
}

/// Keep `relay` connected and reserved until `cancel` fires.
pub async fn maintain_relay<T: Transport>(
    transport: Arc<T>,
    relay: RelayDescriptor,
    policy: BackoffPolicy,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(policy);
    let mut state = RelayState::Disconnected;

    while !cancel.is_cancelled() {
        let connected = transport.connectedness(relay.id).await == Connectedness::Connected;
        state = state.on(RelayEvent::Probed { connected });

        if state == RelayState::Connecting {
            tracing::info!(relay = %relay.id, "connecting to relay server");
            let Some(result) = attempt(&cancel, transport.connect(&relay)).await else {
                break;
            };
            if let Err(e) = result {
                state = state.on(RelayEvent::ConnectFailed);
                let wait = backoff.next_delay();
                tracing::warn!(relay = %relay.id, "failed to connect to relay server: {e} (retry in {wait:?})");
                if !wait_or_cancel(&cancel, wait).await {
                    break;
                }
                continue;
            }
            state = state.on(RelayEvent::ConnectOk);
        }

        tracing::debug!(relay = %relay.id, ?state, "making reservation");
        let Some(result) = attempt(&cancel, transport.reserve(&relay)).await else {
            break;
        };
        let wait = match result {
            Ok(reservation) => {
                state = state.on(RelayEvent::ReserveOk);
                if reservation.renewal {
                    tracing::debug!(relay = %relay.id, "reservation still held");
                } else {
                    tracing::info!(relay = %relay.id, "reserved spot on relay server");
                }
                backoff.reset();
                backoff.min()
            }
            Err(e) => {
                state = state.on(RelayEvent::ReserveFailed);
                let wait = backoff.next_delay();
                tracing::warn!(relay = %relay.id, "failed to reserve spot: {e} (retry in {wait:?})");
                wait
            }
        };
        if !wait_or_cancel(&cancel, wait).await {
            break;
        }
    }

    tracing::debug!(relay = %relay.id, ?state, "relay connectivity task stopped");
}

/// Run one connect / reserve attempt, bounded by the attempt timeout.
/// `None` means cancelled.
async fn attempt<F, R>(cancel: &CancellationToken, fut: F) -> Option<Result<R, TransportError>>
where
    F: Future<Output = Result<R, TransportError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout(RELAY_ATTEMPT_TIMEOUT, fut) => {
            Some(result.unwrap_or(Err(TransportError::Timeout)))
        }
    }
}

/// Sleep for `wait`. Returns false if cancelled first.
async fn wait_or_cancel(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use libp2p::{Multiaddr, PeerId, StreamProtocol};
    use tokio::time::Instant;

    use super::*;
    use crate::transport::{IncomingStreams, Reservation};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn backoff_reset_returns_to_min() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), RELAY_BACKOFF_MIN);
        assert_eq!(b.min(), RELAY_BACKOFF_MIN);
    }

    #[test]
    fn backoff_never_leaves_bounds() {
        let policy = BackoffPolicy { jitter: true, ..BackoffPolicy::default() };
        let mut b = Backoff::new(policy);
        for _ in 0..200 {
            let d = b.next_delay();
            assert!(d >= policy.min && d <= policy.max, "{d:?} out of bounds");
        }
        let mut huge = Backoff::new(BackoffPolicy { factor: 1_000, ..policy });
        for _ in 0..50 {
            assert!(huge.next_delay() <= policy.max);
        }
    }

    #[test]
    fn transition_table() {
        use RelayEvent::*;
        use RelayState::*;

        let cases = [
            (Disconnected, Probed { connected: false }, Connecting),
            (Disconnected, Probed { connected: true }, ConnectedUnreserved),
            (Reserved, Probed { connected: false }, Connecting),
            (Reserved, Probed { connected: true }, Reserved),
            (ConnectedUnreserved, Probed { connected: true }, ConnectedUnreserved),
            (Connecting, ConnectOk, ConnectedUnreserved),
            (Connecting, ConnectFailed, Disconnected),
            (ConnectedUnreserved, ReserveOk, Reserved),
            (ConnectedUnreserved, ReserveFailed, ConnectedUnreserved),
            (Reserved, ReserveOk, Reserved),
            (Reserved, ReserveFailed, ConnectedUnreserved),
            (Disconnected, ReserveOk, Disconnected),
        ];
        for (from, event, to) in cases {
            assert_eq!(from.on(event), to, "{from:?} --{event:?}-->");
        }
    }

    /// Transport whose connect / reserve outcomes are scripted; once a script
    /// runs out the operation succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        connected:        Mutex<bool>,
        connect_script:   Mutex<VecDeque<bool>>,
        reserve_script:   Mutex<VecDeque<bool>>,
        connect_attempts: Mutex<Vec<Instant>>,
        reserve_attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(connect: &[bool], reserve: &[bool]) -> Self {
            Self {
                connect_script: Mutex::new(connect.iter().copied().collect()),
                reserve_script: Mutex::new(reserve.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn offsets(attempts: &Mutex<Vec<Instant>>, start: Instant) -> Vec<u64> {
            attempts
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.duration_since(start).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Stream = futures::io::Cursor<Vec<u8>>;

        fn local_peer_id(&self) -> PeerId {
            PeerId::random()
        }

        async fn connectedness(&self, _peer: PeerId) -> Connectedness {
            if *self.connected.lock().unwrap() {
                Connectedness::Connected
            } else {
                Connectedness::NotConnected
            }
        }

        async fn connect(&self, relay: &RelayDescriptor) -> Result<(), TransportError> {
            self.connect_attempts.lock().unwrap().push(Instant::now());
            let ok = self.connect_script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                *self.connected.lock().unwrap() = true;
                Ok(())
            } else {
                Err(TransportError::Dial { peer: relay.id, reason: "refused".into() })
            }
        }

        async fn reserve(&self, relay: &RelayDescriptor) -> Result<Reservation, TransportError> {
            self.reserve_attempts.lock().unwrap().push(Instant::now());
            let ok = self.reserve_script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(Reservation { relay: relay.id, renewal: false })
            } else {
                Err(TransportError::Reservation { relay: relay.id, reason: "denied".into() })
            }
        }

        async fn add_addresses(&self, _peer: PeerId, _addrs: Vec<Multiaddr>) {}

        async fn open_stream(
            &self,
            peer: PeerId,
            _protocol: StreamProtocol,
        ) -> Result<Self::Stream, TransportError> {
            Err(TransportError::NoAddresses(peer))
        }

        fn accept(
            &self,
            protocol: StreamProtocol,
        ) -> Result<IncomingStreams<Self::Stream>, TransportError> {
            Err(TransportError::AlreadyRegistered(protocol.to_string()))
        }
    }

    fn relay() -> RelayDescriptor {
        RelayDescriptor::new(PeerId::random(), vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()])
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_exponentially() {
        let transport = Arc::new(ScriptedTransport::new(&[false, false, false], &[]));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(maintain_relay(
            Arc::clone(&transport),
            relay(),
            BackoffPolicy::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        task.await.unwrap();

        // Fail at 0, retry after 10s, 20s, 40s; the fourth attempt succeeds.
        assert_eq!(
            ScriptedTransport::offsets(&transport.connect_attempts, start),
            vec![0, 10, 30, 70]
        );
        // Reserved right after connecting, renewed every backoff minimum.
        assert_eq!(
            ScriptedTransport::offsets(&transport.reserve_attempts, start),
            vec![70, 80, 90]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_failure_retries_without_reconnecting() {
        let transport = Arc::new(ScriptedTransport::new(&[], &[false, false]));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(maintain_relay(
            Arc::clone(&transport),
            relay(),
            BackoffPolicy::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(45)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(ScriptedTransport::offsets(&transport.connect_attempts, start), vec![0]);
        // Fail at 0 and 10; success at 30 resets the backoff to 10s.
        assert_eq!(
            ScriptedTransport::offsets(&transport.reserve_attempts, start),
            vec![0, 10, 30, 40]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_every_task_within_one_wait() {
        let transport = Arc::new(ScriptedTransport::new(&[false; 64], &[]));
        let cancel = CancellationToken::new();
        let relays = vec![relay(), relay(), relay()];
        let tasks = spawn_relay_tasks(
            Arc::clone(&transport),
            &relays,
            BackoffPolicy::default(),
            cancel.clone(),
        );
        assert_eq!(tasks.len(), 3);

        tokio::time::sleep(Duration::from_secs(200)).await;
        cancel.cancel();
        let joined = tokio::time::timeout(
            RELAY_BACKOFF_MAX,
            futures::future::join_all(tasks),
        )
        .await
        .expect("relay tasks must stop after cancellation");
        for result in joined {
            result.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_task_does_nothing() {
        let transport = Arc::new(ScriptedTransport::new(&[], &[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        maintain_relay(Arc::clone(&transport), relay(), BackoffPolicy::default(), cancel).await;
        assert!(transport.connect_attempts.lock().unwrap().is_empty());
    }
}
