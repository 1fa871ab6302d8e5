//! Engine configuration.

use std::time::Duration;

const DEFAULT_MAX_PENDING: usize = 1024;

fn max_pending_calls() -> usize {
    std::env::var("HUBLINK_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

/// How trust-store entries are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificatePinning {
    /// Key by the server's unique identifier. A re-provisioned device that
    /// reuses an identifier inherits its trust entry.
    #[default]
    ServerId,
    /// Key by server identifier and endpoint address; the same identifier on
    /// a different endpoint re-prompts.
    ServerIdAndEndpoint,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name sent with authenticate and push-button requests, shown by
    /// the hub when listing authorized clients.
    pub client_name: String,
    /// Deadline for a pending push-button transaction. `None` keeps the
    /// transaction until the hub answers or the connection drops.
    pub push_button_timeout: Option<Duration>,
    /// Trust-store key policy.
    pub certificate_pinning: CertificatePinning,
    /// Maximum outstanding calls before `send_command` refuses.
    /// Overridable via `HUBLINK_MAX_PENDING`.
    pub max_pending_calls: usize,
}

impl ClientConfig {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "hublink".to_owned(),
            push_button_timeout: None,
            certificate_pinning: CertificatePinning::default(),
            max_pending_calls: max_pending_calls(),
        }
    }
}
