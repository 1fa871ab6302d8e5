//! Authentication, capability and cloud-state bookkeeping.
//!
//! [`AuthController`] owns everything the handshake and the login flows
//! derive: capability flags, the session token, the push-button transaction
//! slot and the cloud sub-state. It never touches the transport — the client
//! core calls in from its demux loop and turns the returned outcomes into
//! events and follow-up calls.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use hublink_core::ProtocolVersion;

/// Authentication state, tracked separately from the connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// A password or push-button attempt is in flight.
    Authenticating,
    Authenticated,
}

/// Cloud relay sub-state, reported by the hub once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudConnectionState {
    #[default]
    Disabled,
    Unconfigured,
    Connecting,
    Connected,
}

impl CloudConnectionState {
    /// Wire strings as the hub reports them in `connectionState`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "unconfigured" => Some(Self::Unconfigured),
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            _ => None,
        }
    }
}

/// Push-button transaction slot. At most one transaction is in flight; a
/// second request while this is non-idle fails fast instead of queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PushButtonState {
    #[default]
    Idle,
    /// Request sent; the hub has not assigned a transaction id yet.
    Requested,
    /// Waiting for the out-of-band finish carrying this transaction id.
    Pending(u64),
}

fn lenient_version<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<ProtocolVersion>, D::Error> {
    // An unparseable version string downgrades to "unknown" rather than
    // failing the whole handshake.
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(|s| s.parse().ok()))
}

/// Capability flags and informational fields from the handshake reply.
/// Immutable until the next handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    /// Product name.
    pub server: String,
    /// Server release version string.
    pub version: String,
    /// JSON-RPC protocol version, if the hub reported a parseable one.
    #[serde(deserialize_with = "lenient_version")]
    pub protocol_version: Option<ProtocolVersion>,
    /// Server unique identifier.
    #[serde(rename = "uuid")]
    pub server_id: String,
    pub initial_setup_required: bool,
    pub authentication_required: bool,
    pub push_button_auth_available: bool,
    /// Server runtime version string.
    pub runtime_version: Option<String>,
    /// Server runtime build version string.
    pub runtime_build_version: Option<String>,
}

/// What the push-button finish notification amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushButtonOutcome {
    /// The matching transaction succeeded; behave like a login success.
    Authenticated { token: String },
    /// The matching transaction was rejected; the slot is clear again.
    Failed,
    /// No pending transaction, or a foreign transaction id. Dropped.
    Ignored,
}

/// Per-connection authentication and trust-derived state.
#[derive(Debug, Default)]
pub(crate) struct AuthController {
    pub state: AuthState,
    pub capabilities: Option<Capabilities>,
    pub token: Option<String>,
    pub push_button: PushButtonState,
    pub cloud_state: CloudConnectionState,
}

impl AuthController {
    /// Back to the post-construction state. Called on every disconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Digest the handshake reply.
    pub fn handshake(&mut self, params: Value) -> Result<Capabilities, serde_json::Error> {
        let capabilities: Capabilities = serde_json::from_value(params)?;
        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// Extract the session token from an authenticate reply, if it succeeded.
    pub fn login_token(params: &Value) -> Option<String> {
        let success = params
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let token = params
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        match (success, token) {
            (true, Some(token)) => Some(token.to_owned()),
            _ => None,
        }
    }

    /// Move to Authenticated, holding the session token for this session
    /// only. `None` is the no-authentication-required path.
    pub fn authenticated(&mut self, token: Option<String>) {
        self.state = AuthState::Authenticated;
        self.token = token;
        self.push_button = PushButtonState::Idle;
    }

    pub fn push_button_available(&self) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|c| c.push_button_auth_available)
    }

    /// Digest the out-of-band push-button finish notification.
    pub fn push_button_finished(&mut self, params: &Value) -> PushButtonOutcome {
        let transaction_id = params.get("transactionId").and_then(Value::as_u64);
        let PushButtonState::Pending(expected) = self.push_button else {
            return PushButtonOutcome::Ignored;
        };
        if transaction_id != Some(expected) {
            return PushButtonOutcome::Ignored;
        }

        let success = params
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let token = params
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        // The slot clears either way; on success the client core runs the
        // same authenticated tail as a password login.
        self.push_button = PushButtonState::Idle;
        match (success, token) {
            (true, Some(token)) => PushButtonOutcome::Authenticated {
                token: token.to_owned(),
            },
            _ => PushButtonOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello_params() -> Value {
        json!({
            "server": "hubd",
            "version": "1.4.0",
            "protocolVersion": "6.2",
            "uuid": "2f87ae5b-110e-4b5c-95a5-3d5b71f5ec4b",
            "initialSetupRequired": false,
            "authenticationRequired": true,
            "pushButtonAuthAvailable": true,
            "runtimeVersion": "5.15.2",
            "runtimeBuildVersion": "5.15.2-static"
        })
    }

    #[test]
    fn handshake_extracts_capabilities() {
        let mut auth = AuthController::default();
        let caps = auth.handshake(hello_params()).unwrap();
        assert_eq!(caps.server, "hubd");
        assert_eq!(caps.protocol_version, Some(ProtocolVersion::new(6, 2)));
        assert_eq!(caps.server_id, "2f87ae5b-110e-4b5c-95a5-3d5b71f5ec4b");
        assert!(caps.authentication_required);
        assert!(caps.push_button_auth_available);
        assert!(!caps.initial_setup_required);
        assert_eq!(caps.runtime_version.as_deref(), Some("5.15.2"));
        assert!(auth.capabilities.is_some());
    }

    #[test]
    fn handshake_tolerates_missing_and_bad_fields() {
        let mut auth = AuthController::default();
        let caps = auth
            .handshake(json!({"uuid": "x", "protocolVersion": "not-a-version"}))
            .unwrap();
        assert_eq!(caps.protocol_version, None);
        assert!(!caps.authentication_required);
    }

    #[test]
    fn login_token_requires_success_and_token() {
        assert_eq!(
            AuthController::login_token(&json!({"success": true, "token": "tok"})).as_deref(),
            Some("tok")
        );
        assert!(AuthController::login_token(&json!({"success": false, "token": "tok"})).is_none());
        assert!(AuthController::login_token(&json!({"success": true, "token": ""})).is_none());
        assert!(AuthController::login_token(&json!({"success": true})).is_none());
    }

    #[test]
    fn push_button_finish_matches_only_the_pending_transaction() {
        let mut auth = AuthController::default();
        assert_eq!(
            auth.push_button_finished(&json!({"transactionId": 1, "success": true, "token": "t"})),
            PushButtonOutcome::Ignored
        );

        auth.push_button = PushButtonState::Pending(7);
        assert_eq!(
            auth.push_button_finished(&json!({"transactionId": 8, "success": true, "token": "t"})),
            PushButtonOutcome::Ignored
        );
        assert_eq!(auth.push_button, PushButtonState::Pending(7));

        assert_eq!(
            auth.push_button_finished(&json!({"transactionId": 7, "success": false})),
            PushButtonOutcome::Failed
        );
        assert_eq!(auth.push_button, PushButtonState::Idle);
    }

    #[test]
    fn push_button_success_clears_the_slot_and_yields_the_token() {
        let mut auth = AuthController::default();
        auth.push_button = PushButtonState::Pending(3);
        let outcome =
            auth.push_button_finished(&json!({"transactionId": 3, "success": true, "token": "t"}));
        assert_eq!(
            outcome,
            PushButtonOutcome::Authenticated {
                token: "t".to_owned()
            }
        );
        assert_eq!(auth.push_button, PushButtonState::Idle);
    }

    #[test]
    fn reset_clears_everything() {
        let mut auth = AuthController::default();
        auth.handshake(hello_params()).unwrap();
        auth.authenticated(Some("tok".to_owned()));
        auth.cloud_state = CloudConnectionState::Connected;
        auth.reset();
        assert_eq!(auth.state, AuthState::Unauthenticated);
        assert!(auth.capabilities.is_none());
        assert!(auth.token.is_none());
        assert_eq!(auth.cloud_state, CloudConnectionState::Disabled);
    }
}
