//! Events the engine surfaces to its caller.
//!
//! One typed stream, distinct variants per failure class — a UI reacts to
//! `AuthenticationFailed` differently than to `VerifyCertificate`, so they
//! are never collapsed into a generic error.

use std::collections::BTreeMap;

use bytes::Bytes;
use hublink_core::ProtocolVersion;

use crate::auth::{Capabilities, CloudConnectionState};
use crate::client::ConnectionStatus;

#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Emitted exactly once per real status transition.
    ConnectionStatusChanged(ConnectionStatus),
    /// The connection attempt or session failed below the protocol layer.
    ConnectionFailed(String),
    /// The handshake reply arrived; capability flags are now known.
    HandshakeReceived(Capabilities),
    /// The hub rejected the credentials. No retry happens here.
    AuthenticationFailed,
    /// The pending push-button transaction was rejected or timed out.
    PushButtonAuthFailed,
    /// `create_user` succeeded.
    UserCreated,
    /// `create_user` failed; the string is the hub's error, verbatim.
    UserCreationFailed(String),
    /// The presented certificate is not in the trust store. The connection
    /// is held until `accept_certificate` or `reject_certificate`.
    VerifyCertificate {
        server_id: String,
        issuer_info: BTreeMap<String, String>,
        pem: Bytes,
    },
    /// `ensure_server_version` found the hub too old. Informational only;
    /// the engine takes no action of its own.
    InvalidProtocolVersion {
        actual: Option<ProtocolVersion>,
        minimum: ProtocolVersion,
    },
    /// The cloud relay sub-state changed.
    CloudStateChanged(CloudConnectionState),
}
