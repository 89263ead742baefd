// ============================================================================
// Protocol constants
// ============================================================================

use std::time::Duration;

/// libp2p protocol string for the proposal signing exchange.
///
/// Versioned: a server accepts exactly this identifier and nothing else.
pub const SIGN_PROPOSAL_PROTOCOL: &str = "/cmd/signproposal/v1";

// --- Transport --------------------------------------------------------------

/// Maximum request body accepted by a signer (canonical proposal bytes).
pub const MAX_REQUEST_SIZE: usize = 65_536; // 64 KB

/// Maximum response body a client will read.
pub const MAX_RESPONSE_SIZE: usize = 4_096;

/// Upper bound on the lifetime of one inbound signing stream.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

// --- Relay connectivity -----------------------------------------------------

/// First retry delay after a failed relay connect / reserve.
pub const RELAY_BACKOFF_MIN: Duration = Duration::from_secs(10);

/// Retry delay ceiling.
pub const RELAY_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Upper bound on a single relay connect or reservation attempt.
pub const RELAY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
