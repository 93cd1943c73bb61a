//! The sender's own tunables. The producer's broader user-facing
//! configuration is an external collaborator (spec.md §1); this is only the
//! slice the sender itself consumes.

use serde::Deserialize;

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_linger_ms() -> u64 {
    0
}

fn default_request_timeout_ms() -> i32 {
    30_000
}

fn default_transaction_timeout_ms() -> i32 {
    60_000
}

fn default_acks() -> i16 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub transactional_id: Option<String>,

    #[serde(default)]
    pub enable_idempotence: bool,

    #[serde(default = "default_acks")]
    pub acks: i16,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: i32,

    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: i32,
}

impl SenderConfig {
    /// True if either idempotence or a transactional id requires Init-PID
    /// before anything else can be dispatched (spec.md I4).
    pub fn requires_pid(&self) -> bool {
        self.enable_idempotence || self.transactional_id.is_some()
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            transactional_id: None,
            enable_idempotence: false,
            acks: default_acks(),
            retry_backoff_ms: default_retry_backoff_ms(),
            linger_ms: default_linger_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
        }
    }
}
