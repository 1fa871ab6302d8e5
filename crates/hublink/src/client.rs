//! HubClient: the composition root.
//!
//! Owns the transport handle and combines the pending-call registry, the
//! envelope codec, the notification router and the authentication controller
//! into one engine.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────┐
//!            │            HubClient             │
//!            ├──────────────────────────────────┤
//!            │  transport: Box<dyn Transport>   │
//!            │  state:   status / auth / codec  │
//!            │  pending: PendingCalls<Internal> │
//!            │  router:  NotificationRouter     │
//!            │  trust:   Box<dyn TrustStore>    │
//!            └───────────────┬──────────────────┘
//!                            │
//!                      demux loop (run)
//!                            │
//!        ┌───────────────────┼────────────────────┐
//!        │                   │                    │
//!   reply (id)        notification           lifecycle event
//!        │                   │                    │
//!  ┌─────▼─────┐   ┌─────────▼─────────┐  ┌───────▼────────┐
//!  │ oneshot / │   │ engine handling,  │  │ handshake /    │
//!  │ internal  │   │ then router fan-  │  │ teardown drain │
//!  │ tag match │   │ out to handlers   │  │                │
//!  └───────────┘   └───────────────────┘  └────────────────┘
//! ```
//!
//! # Key invariant
//!
//! Only [`HubClient::run`] consumes transport events. Frames are processed
//! strictly in arrival order, and a call's resolution is handed to its sink
//! before the next frame is looked at.

use core::fmt;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use hublink_core::{
    CallError, CallResult, CallSink, EnvelopeCodec, InboundMessage, MethodFilter, Notification,
    NotificationRouter, PendingCalls, ProtocolVersion, ReplyEnvelope, SubscriberId,
    TransportError, encode_request, split_method,
};

use crate::auth::{AuthController, AuthState, Capabilities, CloudConnectionState, PushButtonState};
use crate::config::{CertificatePinning, ClientConfig};
use crate::event::HubEvent;
use crate::transport::{Transport, TransportEvent};
use crate::trust::TrustStore;

/// Wire constants for the engine-owned namespace.
mod methods {
    pub const NAMESPACE: &str = "JsonRpc";

    pub const HELLO: &str = "Hello";
    pub const AUTHENTICATE: &str = "Authenticate";
    pub const CREATE_USER: &str = "CreateUser";
    pub const REQUEST_PUSH_BUTTON_AUTH: &str = "RequestPushButtonAuth";
    pub const SET_NOTIFICATION_STATUS: &str = "SetNotificationStatus";
    pub const IS_CLOUD_CONNECTED: &str = "IsCloudConnected";

    pub const NOTIFY_PUSH_BUTTON_FINISHED: &str = "PushButtonAuthFinished";
    pub const NOTIFY_CLOUD_CONNECTED_CHANGED: &str = "CloudConnectedChanged";
}

/// Connection status of the engine. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    /// Transport is up; handshake sent or settled, not yet authenticated.
    Connected,
    /// Ready for general calls.
    Authenticated,
    /// Close requested, waiting for transport confirmation.
    Disconnecting,
}

/// Where to connect. Supplied by the caller; the engine does no discovery.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// URL-like descriptor the transport knows how to dial.
    pub url: String,
    /// Server identifier the caller expects at this endpoint; pins the
    /// certificate trust entry. Without one, the URL itself is the pin key.
    pub server_id: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            server_id: None,
        }
    }

    pub fn with_server_id(url: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            server_id: Some(server_id.into()),
        }
    }
}

/// Errors from [`HubClient::connect`].
#[derive(Debug)]
pub enum ConnectError {
    /// Already connecting or connected; the engine never opens a second
    /// transport.
    AlreadyConnected,
    Transport(TransportError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Send-side failures. These are synchronous — no call id was issued.
#[derive(Debug)]
pub enum CommandError {
    /// The connection is not at least Connected.
    NotConnected,
    /// `create_user` is only valid pre-authentication.
    AlreadyAuthenticated,
    /// The hub did not report push-button capability.
    PushButtonUnavailable,
    /// A push-button transaction is already in flight; it stays pending.
    PushButtonPending,
    /// Method string is not of the form `Namespace.Method`.
    InvalidMethod(String),
    /// Too many calls outstanding.
    QueueFull,
    Transport(TransportError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyAuthenticated => write!(f, "already authenticated"),
            Self::PushButtonUnavailable => write!(f, "push-button authentication not available"),
            Self::PushButtonPending => write!(f, "a push-button transaction is already pending"),
            Self::InvalidMethod(m) => {
                write!(f, "method {m:?} is not of the form Namespace.Method")
            }
            Self::QueueFull => write!(f, "too many outstanding calls"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// A caller-held outstanding call. Await it for the result.
///
/// Dropping it abandons interest in the reply; the call itself is not
/// cancelled and the reply, when it arrives, is discarded.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingReply {
    /// The call identifier embedded in the outgoing frame. Callers layering
    /// their own timeout or bookkeeping correlate on this.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The engine completes every record it drops, so a closed channel
            // only happens across a teardown race.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Engine-internal reply continuations, matched inline by the demux loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalReply {
    Hello,
    Authenticate,
    CreateUser,
    PushButtonAuth,
    NotificationStatus,
    CloudStatus,
}

struct HeldCertificate {
    server_id: String,
    key: String,
}

struct ClientState {
    status: ConnectionStatus,
    endpoint: Option<Endpoint>,
    auth: AuthController,
    codec: EnvelopeCodec,
    held_certificate: Option<HeldCertificate>,
}

/// Client engine for one hub connection.
///
/// Construct with [`HubClient::new`], spawn [`HubClient::run`], then drive it
/// through the public methods. All aggregate state exposed here is the union
/// of the component states — the client holds nothing else.
pub struct HubClient {
    weak: Weak<HubClient>,
    transport: Box<dyn Transport>,
    config: ClientConfig,
    events: mpsc::UnboundedSender<HubEvent>,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    state: Mutex<ClientState>,
    pending: Mutex<PendingCalls<InternalReply>>,
    router: Mutex<NotificationRouter>,
    trust: Mutex<Box<dyn TrustStore>>,
}

impl HubClient {
    /// Create a client over an injected transport and trust store.
    ///
    /// `transport_events` is the receiving half of the channel the transport
    /// pushes its events into. The returned receiver is the engine's event
    /// stream; the caller consumes it at its own pace.
    pub fn new(
        transport: Box<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        trust: Box<dyn TrustStore>,
        config: ClientConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let max_pending = config.max_pending_calls;
        let client = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            transport,
            config,
            events: events_tx,
            transport_events: Mutex::new(Some(transport_events)),
            state: Mutex::new(ClientState {
                status: ConnectionStatus::Disconnected,
                endpoint: None,
                auth: AuthController::default(),
                codec: EnvelopeCodec::new(),
                held_certificate: None,
            }),
            pending: Mutex::new(PendingCalls::new(max_pending)),
            router: Mutex::new(NotificationRouter::new()),
            trust: Mutex::new(trust),
        });
        (client, events_rx)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect to an endpoint. Valid only from Disconnected.
    pub fn connect(&self, endpoint: Endpoint) -> Result<(), ConnectError> {
        {
            let mut st = self.state.lock();
            if st.status != ConnectionStatus::Disconnected {
                return Err(ConnectError::AlreadyConnected);
            }
            st.status = ConnectionStatus::Connecting;
            st.endpoint = Some(endpoint.clone());
        }
        self.emit(HubEvent::ConnectionStatusChanged(
            ConnectionStatus::Connecting,
        ));
        tracing::info!(url = %endpoint.url, "connecting");

        if let Err(error) = self.transport.open(&endpoint.url) {
            tracing::warn!(%error, "connect failed");
            self.state.lock().status = ConnectionStatus::Disconnected;
            self.emit(HubEvent::ConnectionFailed(error.to_string()));
            self.emit(HubEvent::ConnectionStatusChanged(
                ConnectionStatus::Disconnected,
            ));
            return Err(ConnectError::Transport(error));
        }
        Ok(())
    }

    /// Request a close. No-op when already Disconnected or Disconnecting;
    /// finalizes to Disconnected when the transport confirms.
    pub fn disconnect(&self) {
        let proceed = {
            let mut st = self.state.lock();
            match st.status {
                ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting => false,
                _ => {
                    st.status = ConnectionStatus::Disconnecting;
                    true
                }
            }
        };
        if proceed {
            self.emit(HubEvent::ConnectionStatusChanged(
                ConnectionStatus::Disconnecting,
            ));
            self.transport.close();
        }
    }

    /// Demux loop. Spawn exactly once; it exits when the transport event
    /// channel closes.
    pub async fn run(self: Arc<Self>) {
        let receiver = self.transport_events.lock().take();
        let Some(mut events) = receiver else {
            tracing::error!("HubClient::run called twice; ignoring");
            return;
        };
        tracing::debug!("demux loop starting");
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => self.on_transport_connected(),
                TransportEvent::Data(data) => self.on_data(&data),
                TransportEvent::CertificateCheck { issuer_info, pem } => {
                    self.on_certificate_check(issuer_info, pem);
                }
                TransportEvent::Error(error) => self.teardown(Some(error)),
                TransportEvent::Disconnected => self.teardown(None),
            }
        }
        tracing::debug!("transport event channel closed; demux loop exiting");
    }

    fn on_transport_connected(&self) {
        self.transition(ConnectionStatus::Connected);
        // The handshake is the first call on every connection.
        if let Err(error) = self.submit(
            methods::NAMESPACE,
            methods::HELLO,
            json!({}),
            CallSink::Internal(InternalReply::Hello),
        ) {
            tracing::error!(%error, "failed to send handshake");
            self.transport.close();
        }
    }

    /// Teardown to Disconnected: drain every outstanding call with a
    /// connection-lost result and reset capability and authentication state.
    fn teardown(&self, error: Option<TransportError>) {
        let was_connected = {
            let mut st = self.state.lock();
            if st.status == ConnectionStatus::Disconnected {
                false
            } else {
                st.status = ConnectionStatus::Disconnected;
                st.auth.reset();
                st.codec.reset();
                st.held_certificate = None;
                true
            }
        };
        if !was_connected {
            if let Some(error) = error {
                tracing::debug!(%error, "transport error while already disconnected");
            }
            return;
        }

        for record in self.pending.lock().drain_all() {
            match record.sink {
                CallSink::Caller(tx) => {
                    let _ = tx.send(Err(CallError::ConnectionLost));
                }
                CallSink::Internal(kind) => {
                    tracing::debug!(?kind, id = record.id, "internal call dropped by teardown");
                }
            }
        }

        if let Some(error) = error {
            tracing::warn!(%error, "connection failed");
            self.emit(HubEvent::ConnectionFailed(error.to_string()));
        } else {
            tracing::info!("disconnected");
        }
        self.emit(HubEvent::ConnectionStatusChanged(
            ConnectionStatus::Disconnected,
        ));
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    fn on_data(&self, data: &[u8]) {
        self.state.lock().codec.extend(data);
        loop {
            let message = self.state.lock().codec.next_message();
            let Some(message) = message else { break };
            match message {
                InboundMessage::Reply(reply) => self.on_reply(reply),
                InboundMessage::Notification(notification) => self.on_notification(notification),
            }
        }
    }

    fn on_reply(&self, reply: ReplyEnvelope) {
        let ReplyEnvelope {
            id,
            status,
            params,
            error,
        } = reply;
        let Some(record) = self.pending.lock().resolve(id) else {
            tracing::warn!(id, "reply with no matching pending call; ignoring");
            return;
        };
        let result: CallResult = if status == "success" {
            Ok(params)
        } else {
            Err(CallError::Rejected(error.unwrap_or(status)))
        };
        tracing::debug!(
            id,
            namespace = %record.namespace,
            method = %record.method,
            ok = result.is_ok(),
            "call resolved"
        );
        match record.sink {
            CallSink::Caller(tx) => {
                // The caller may have dropped its PendingReply; fine.
                let _ = tx.send(result);
            }
            CallSink::Internal(kind) => self.on_internal_reply(kind, result),
        }
    }

    fn on_internal_reply(&self, kind: InternalReply, result: CallResult) {
        match kind {
            InternalReply::Hello => self.on_hello_reply(result),
            InternalReply::Authenticate => self.on_authenticate_reply(result),
            InternalReply::CreateUser => self.on_create_user_reply(result),
            InternalReply::PushButtonAuth => self.on_push_button_reply(result),
            InternalReply::NotificationStatus => match result {
                Ok(_) => tracing::debug!("notifications enabled"),
                Err(CallError::ConnectionLost) => {}
                Err(CallError::Rejected(error)) => {
                    tracing::warn!(%error, "hub refused notification enablement");
                }
            },
            InternalReply::CloudStatus => self.on_cloud_status_reply(result),
        }
    }

    fn on_hello_reply(&self, result: CallResult) {
        let params = match result {
            Ok(params) => params,
            Err(CallError::ConnectionLost) => return,
            Err(CallError::Rejected(error)) => {
                tracing::error!(%error, "handshake rejected by hub");
                return;
            }
        };
        let capabilities = {
            let mut st = self.state.lock();
            match st.auth.handshake(params) {
                Ok(capabilities) => capabilities,
                Err(error) => {
                    tracing::error!(%error, "malformed handshake reply");
                    return;
                }
            }
        };
        tracing::info!(
            server = %capabilities.server,
            version = %capabilities.version,
            protocol = ?capabilities.protocol_version,
            server_id = %capabilities.server_id,
            "handshake received"
        );
        self.emit(HubEvent::HandshakeReceived(capabilities.clone()));
        if !capabilities.authentication_required {
            self.become_authenticated(None);
        }
    }

    fn on_authenticate_reply(&self, result: CallResult) {
        match result {
            Ok(params) => match AuthController::login_token(&params) {
                Some(token) => self.become_authenticated(Some(token)),
                None => self.fail_authentication("credentials rejected"),
            },
            Err(CallError::ConnectionLost) => {}
            Err(CallError::Rejected(error)) => self.fail_authentication(&error),
        }
    }

    fn fail_authentication(&self, reason: &str) {
        self.state.lock().auth.state = AuthState::Unauthenticated;
        tracing::warn!(reason, "authentication failed");
        self.emit(HubEvent::AuthenticationFailed);
    }

    /// Shared tail of every successful authentication path, including the
    /// no-authentication-required handshake.
    fn become_authenticated(&self, token: Option<String>) {
        self.state.lock().auth.authenticated(token);
        self.transition(ConnectionStatus::Authenticated);

        // Notification delivery and the cloud sub-state both ride on auth.
        if let Err(error) = self.submit(
            methods::NAMESPACE,
            methods::SET_NOTIFICATION_STATUS,
            json!({"enabled": true}),
            CallSink::Internal(InternalReply::NotificationStatus),
        ) {
            tracing::warn!(%error, "failed to request notification enablement");
        }
        if let Err(error) = self.submit(
            methods::NAMESPACE,
            methods::IS_CLOUD_CONNECTED,
            json!({}),
            CallSink::Internal(InternalReply::CloudStatus),
        ) {
            tracing::warn!(%error, "failed to query cloud state");
        }
    }

    fn on_create_user_reply(&self, result: CallResult) {
        match result {
            Ok(params) => {
                let success = params
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if success {
                    tracing::info!("user created");
                    self.emit(HubEvent::UserCreated);
                } else {
                    let error = params
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_owned();
                    tracing::warn!(%error, "user creation failed");
                    self.emit(HubEvent::UserCreationFailed(error));
                }
            }
            Err(CallError::ConnectionLost) => {}
            Err(CallError::Rejected(error)) => {
                tracing::warn!(%error, "user creation failed");
                self.emit(HubEvent::UserCreationFailed(error));
            }
        }
    }

    fn on_push_button_reply(&self, result: CallResult) {
        match result {
            Ok(params) => {
                let Some(transaction_id) = params.get("transactionId").and_then(Value::as_u64)
                else {
                    self.state.lock().auth.push_button = PushButtonState::Idle;
                    tracing::warn!("push-button reply carried no transaction id");
                    self.emit(HubEvent::PushButtonAuthFailed);
                    return;
                };
                self.state.lock().auth.push_button = PushButtonState::Pending(transaction_id);
                tracing::debug!(transaction_id, "push-button transaction pending");
                if let Some(timeout) = self.config.push_button_timeout {
                    let weak = self.weak.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(client) = weak.upgrade() {
                            client.expire_push_button(transaction_id);
                        }
                    });
                }
            }
            Err(CallError::ConnectionLost) => {}
            Err(CallError::Rejected(error)) => {
                self.state.lock().auth.push_button = PushButtonState::Idle;
                tracing::warn!(%error, "push-button request rejected");
                self.emit(HubEvent::PushButtonAuthFailed);
            }
        }
    }

    fn expire_push_button(&self, transaction_id: u64) {
        let expired = {
            let mut st = self.state.lock();
            if st.auth.push_button == PushButtonState::Pending(transaction_id) {
                st.auth.push_button = PushButtonState::Idle;
                st.auth.state = AuthState::Unauthenticated;
                true
            } else {
                false
            }
        };
        if expired {
            tracing::warn!(transaction_id, "push-button transaction timed out");
            self.emit(HubEvent::PushButtonAuthFailed);
        }
    }

    fn on_notification(&self, notification: Notification) {
        if notification.namespace == methods::NAMESPACE {
            self.on_engine_notification(&notification);
        }
        let delivered = self.router.lock().dispatch(&notification);
        tracing::trace!(
            namespace = %notification.namespace,
            method = %notification.method,
            delivered,
            "notification dispatched"
        );
    }

    fn on_engine_notification(&self, notification: &Notification) {
        use crate::auth::PushButtonOutcome;

        match notification.method.as_str() {
            methods::NOTIFY_PUSH_BUTTON_FINISHED => {
                let outcome = self
                    .state
                    .lock()
                    .auth
                    .push_button_finished(&notification.params);
                match outcome {
                    PushButtonOutcome::Authenticated { token } => {
                        tracing::info!("push-button authentication confirmed");
                        self.become_authenticated(Some(token));
                    }
                    PushButtonOutcome::Failed => {
                        self.state.lock().auth.state = AuthState::Unauthenticated;
                        tracing::warn!("push-button authentication failed");
                        self.emit(HubEvent::PushButtonAuthFailed);
                    }
                    PushButtonOutcome::Ignored => {
                        tracing::debug!("unmatched push-button notification; ignoring");
                    }
                }
            }
            methods::NOTIFY_CLOUD_CONNECTED_CHANGED => {
                self.update_cloud_state(&notification.params);
            }
            other => {
                tracing::trace!(method = other, "unhandled engine notification");
            }
        }
    }

    fn on_cloud_status_reply(&self, result: CallResult) {
        match result {
            Ok(params) => self.update_cloud_state(&params),
            Err(CallError::ConnectionLost) => {}
            Err(CallError::Rejected(error)) => {
                tracing::debug!(%error, "cloud state query rejected");
            }
        }
    }

    fn update_cloud_state(&self, params: &Value) {
        let Some(state) = params
            .get("connectionState")
            .and_then(Value::as_str)
            .and_then(CloudConnectionState::parse)
        else {
            tracing::debug!("cloud state report without a known connectionState");
            return;
        };
        let changed = {
            let mut st = self.state.lock();
            if st.auth.cloud_state == state {
                false
            } else {
                st.auth.cloud_state = state;
                true
            }
        };
        if changed {
            tracing::debug!(?state, "cloud state changed");
            self.emit(HubEvent::CloudStateChanged(state));
        }
    }

    // ========================================================================
    // Certificate trust
    // ========================================================================

    fn on_certificate_check(&self, issuer_info: BTreeMap<String, String>, pem: Bytes) {
        let Some(endpoint) = self.state.lock().endpoint.clone() else {
            tracing::warn!("certificate check without an endpoint; rejecting");
            self.transport.set_certificate_trusted(false);
            return;
        };
        let (server_id, key) = self.pin_key(&endpoint);

        let stored = self.trust.lock().load(&key);
        if stored.as_deref() == Some(pem.as_ref()) {
            tracing::debug!(server_id = %server_id, "certificate matches pinned entry");
            self.transport.set_certificate_trusted(true);
            return;
        }

        tracing::info!(
            server_id = %server_id,
            known = stored.is_some(),
            "certificate requires verification"
        );
        self.state.lock().held_certificate = Some(HeldCertificate {
            server_id: server_id.clone(),
            key,
        });
        self.emit(HubEvent::VerifyCertificate {
            server_id,
            issuer_info,
            pem,
        });
    }

    /// Persist the certificate for `server_id` and release a connection held
    /// on its verification, if one is pending.
    pub fn accept_certificate(&self, server_id: &str, pem: &[u8]) -> std::io::Result<()> {
        let held = {
            let mut st = self.state.lock();
            match &st.held_certificate {
                Some(held) if held.server_id == server_id => st.held_certificate.take(),
                _ => None,
            }
        };
        match held {
            Some(held) => {
                self.trust.lock().save(&held.key, pem)?;
                tracing::info!(server_id, "certificate accepted");
                self.transport.set_certificate_trusted(true);
            }
            None => {
                // Nothing held for this identifier; persist for the next
                // attempt.
                let key = {
                    let st = self.state.lock();
                    match (self.config.certificate_pinning, st.endpoint.as_ref()) {
                        (CertificatePinning::ServerIdAndEndpoint, Some(endpoint)) => {
                            format!("{server_id}@{}", endpoint.url)
                        }
                        _ => server_id.to_owned(),
                    }
                };
                self.trust.lock().save(&key, pem)?;
                tracing::debug!(server_id, "certificate stored without a held connection");
            }
        }
        Ok(())
    }

    /// Abandon a connection held on certificate verification. The attempt
    /// fails with a trust error; nothing is persisted.
    pub fn reject_certificate(&self) {
        let held = self.state.lock().held_certificate.take();
        if let Some(held) = held {
            tracing::info!(server_id = %held.server_id, "certificate rejected");
            self.transport.set_certificate_trusted(false);
        }
    }

    fn pin_key(&self, endpoint: &Endpoint) -> (String, String) {
        let server_id = endpoint
            .server_id
            .clone()
            .unwrap_or_else(|| endpoint.url.clone());
        let key = match self.config.certificate_pinning {
            CertificatePinning::ServerId => server_id.clone(),
            CertificatePinning::ServerIdAndEndpoint => {
                format!("{server_id}@{}", endpoint.url)
            }
        };
        (server_id, key)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Issue a command. `method` is `"Namespace.Method"`. Fails immediately
    /// unless the connection is at least Connected; no call id is issued on
    /// failure.
    pub fn send_command(&self, method: &str, params: Value) -> Result<PendingReply, CommandError> {
        let (namespace, name) =
            split_method(method).ok_or_else(|| CommandError::InvalidMethod(method.to_owned()))?;
        let (tx, rx) = oneshot::channel();
        let id = self.submit(namespace, name, params, CallSink::Caller(tx))?;
        Ok(PendingReply { id, rx })
    }

    fn submit(
        &self,
        namespace: &str,
        method: &str,
        params: Value,
        sink: CallSink<InternalReply>,
    ) -> Result<u64, CommandError> {
        let token = {
            let st = self.state.lock();
            match st.status {
                ConnectionStatus::Connected | ConnectionStatus::Authenticated => {}
                _ => return Err(CommandError::NotConnected),
            }
            st.auth.token.clone()
        };
        let id = {
            let mut pending = self.pending.lock();
            if pending.is_full() {
                tracing::warn!(
                    outstanding = pending.outstanding(),
                    "too many outstanding calls; refusing new call"
                );
                return Err(CommandError::QueueFull);
            }
            pending.register(namespace, method, sink)
        };
        let frame = encode_request(id, namespace, method, &params, token.as_deref());
        if let Err(error) = self.transport.send(frame) {
            // The frame never left; take the record back out.
            self.pending.lock().resolve(id);
            return Err(CommandError::Transport(error));
        }
        Ok(id)
    }

    // ========================================================================
    // Authentication flows
    // ========================================================================

    /// Create the initial user account. Valid only pre-authentication.
    pub fn create_user(&self, username: &str, password: &str) -> Result<(), CommandError> {
        if self.state.lock().auth.state == AuthState::Authenticated {
            return Err(CommandError::AlreadyAuthenticated);
        }
        self.submit(
            methods::NAMESPACE,
            methods::CREATE_USER,
            json!({"username": username, "password": password}),
            CallSink::Internal(InternalReply::CreateUser),
        )?;
        Ok(())
    }

    /// Log in with credentials. Success stores the session token and moves to
    /// Authenticated; failure emits [`HubEvent::AuthenticationFailed`] and
    /// leaves the decision to retry with the caller.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), CommandError> {
        self.submit(
            methods::NAMESPACE,
            methods::AUTHENTICATE,
            json!({
                "username": username,
                "password": password,
                "deviceName": self.config.client_name,
            }),
            CallSink::Internal(InternalReply::Authenticate),
        )?;
        self.state.lock().auth.state = AuthState::Authenticating;
        Ok(())
    }

    /// Start a push-button authentication attempt. At most one transaction is
    /// in flight; a second request fails fast with
    /// [`CommandError::PushButtonPending`] while the first stays pending.
    pub fn request_push_button_auth(&self) -> Result<(), CommandError> {
        {
            let mut st = self.state.lock();
            if !st.auth.push_button_available() {
                return Err(CommandError::PushButtonUnavailable);
            }
            if st.auth.push_button != PushButtonState::Idle {
                return Err(CommandError::PushButtonPending);
            }
            st.auth.push_button = PushButtonState::Requested;
            st.auth.state = AuthState::Authenticating;
        }
        if let Err(error) = self.submit(
            methods::NAMESPACE,
            methods::REQUEST_PUSH_BUTTON_AUTH,
            json!({"deviceName": self.config.client_name}),
            CallSink::Internal(InternalReply::PushButtonAuth),
        ) {
            let mut st = self.state.lock();
            st.auth.push_button = PushButtonState::Idle;
            st.auth.state = AuthState::Unauthenticated;
            return Err(error);
        }
        Ok(())
    }

    /// Compare the handshake-reported protocol version against a required
    /// minimum. On mismatch emits [`HubEvent::InvalidProtocolVersion`] and
    /// returns false; the engine itself stays connected.
    pub fn ensure_server_version(&self, minimum: ProtocolVersion) -> bool {
        let actual = self
            .state
            .lock()
            .auth
            .capabilities
            .as_ref()
            .and_then(|c| c.protocol_version);
        match actual {
            Some(version) if version >= minimum => true,
            _ => {
                tracing::warn!(?actual, %minimum, "server protocol version too old");
                self.emit(HubEvent::InvalidProtocolVersion { actual, minimum });
                false
            }
        }
    }

    // ========================================================================
    // Notification handlers
    // ========================================================================

    /// Subscribe `owner` to a namespace. Re-registering the same
    /// `(owner, namespace)` replaces the previous subscription.
    pub fn register_notification_handler(
        &self,
        owner: SubscriberId,
        namespace: &str,
        filter: MethodFilter,
    ) -> mpsc::UnboundedReceiver<Notification> {
        self.router.lock().register(owner, namespace, filter)
    }

    /// Drop every subscription held by `owner`. Idempotent.
    pub fn unregister_notification_handler(&self, owner: SubscriberId) {
        self.router.lock().unregister_owner(owner);
    }

    // ========================================================================
    // Aggregate state
    // ========================================================================

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn connected(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::Authenticated
        )
    }

    pub fn authenticated(&self) -> bool {
        self.state.lock().auth.state == AuthState::Authenticated
    }

    pub fn auth_state(&self) -> AuthState {
        self.state.lock().auth.state
    }

    /// Capability flags from the last handshake, if one completed.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.state.lock().auth.capabilities.clone()
    }

    pub fn cloud_state(&self) -> CloudConnectionState {
        self.state.lock().auth.cloud_state
    }

    /// Sorted ids of outstanding calls (diagnostics).
    pub fn pending_call_ids(&self) -> Vec<u64> {
        self.pending.lock().ids()
    }

    fn transition(&self, to: ConnectionStatus) {
        let changed = {
            let mut st = self.state.lock();
            if st.status == to {
                false
            } else {
                tracing::debug!(from = ?st.status, to = ?to, "connection status");
                st.status = to;
                true
            }
        };
        if changed {
            self.emit(HubEvent::ConnectionStatusChanged(to));
        }
    }

    fn emit(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}
