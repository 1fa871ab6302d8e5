//! hublink-testkit: In-memory transport for hublink tests.
//!
//! This is the semantic reference for the transport boundary: an engine-side
//! [`MemTransport`] that implements [`Transport`], and a test-controlled
//! [`HubHandle`] that plays the hub — it decodes the client's requests,
//! scripts replies and notifications, drops the connection, and can gate the
//! connect on a certificate check.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, transport_rx, mut hub) = mem_transport();
//! let (client, mut events) = HubClient::new(
//!     Box::new(transport),
//!     transport_rx,
//!     Box::new(MemoryTrustStore::new()),
//!     ClientConfig::default(),
//! );
//! tokio::spawn(client.clone().run());
//!
//! client.connect(Endpoint::new("mem://hub"))?;
//! hub.answer_hello(&HelloParams::open()).await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use hublink::{Transport, TransportEvent};
use hublink_core::{RequestEnvelope, TransportError, decode_request};

/// Create a connected engine/hub pair.
///
/// Returns the engine-side transport, the event receiver to hand to
/// `HubClient::new`, and the hub-side handle for the test.
pub fn mem_transport() -> (
    MemTransport,
    mpsc::UnboundedReceiver<TransportEvent>,
    HubHandle,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(MemInner {
        events: events_tx,
        frames: frames_tx,
        connected: AtomicBool::new(false),
        check_held: AtomicBool::new(false),
        certificate_gate: Mutex::new(None),
        last_endpoint: Mutex::new(None),
    });
    (
        MemTransport {
            inner: inner.clone(),
        },
        events_rx,
        HubHandle {
            inner,
            frames: frames_rx,
        },
    )
}

#[derive(Debug, Clone)]
struct CertificateGate {
    issuer_info: BTreeMap<String, String>,
    pem: Bytes,
}

struct MemInner {
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    /// An open is parked on a certificate check.
    check_held: AtomicBool,
    /// Armed certificate presented on every open until cleared.
    certificate_gate: Mutex<Option<CertificateGate>>,
    last_endpoint: Mutex<Option<String>>,
}

impl MemInner {
    fn push(&self, event: TransportEvent) {
        // The engine owns the receiver; if it is gone the test is over.
        let _ = self.events.send(event);
    }
}

/// Engine-side half of the in-memory transport.
pub struct MemTransport {
    inner: Arc<MemInner>,
}

impl Transport for MemTransport {
    fn open(&self, endpoint: &str) -> Result<(), TransportError> {
        *self.inner.last_endpoint.lock() = Some(endpoint.to_owned());
        let gate = self.inner.certificate_gate.lock().clone();
        match gate {
            Some(gate) => {
                self.inner.check_held.store(true, Ordering::Release);
                self.inner.push(TransportEvent::CertificateCheck {
                    issuer_info: gate.issuer_info,
                    pem: gate.pem,
                });
            }
            None => {
                self.inner.connected.store(true, Ordering::Release);
                self.inner.push(TransportEvent::Connected);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.inner.check_held.store(false, Ordering::Release);
        self.inner.connected.store(false, Ordering::Release);
        self.inner.push(TransportEvent::Disconnected);
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner
            .frames
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn set_certificate_trusted(&self, trusted: bool) {
        if !self.inner.check_held.swap(false, Ordering::AcqRel) {
            return;
        }
        if trusted {
            self.inner.connected.store(true, Ordering::Release);
            self.inner.push(TransportEvent::Connected);
        } else {
            self.inner
                .push(TransportEvent::Error(TransportError::CertificateRejected));
        }
    }
}

/// Hub side of the pair: what the test scripts.
pub struct HubHandle {
    inner: Arc<MemInner>,
    frames: mpsc::UnboundedReceiver<Bytes>,
}

impl HubHandle {
    /// Next request the client put on the wire.
    ///
    /// # Panics
    ///
    /// Panics if the transport is gone or the frame does not decode — both
    /// are test failures, not scenarios.
    pub async fn recv_request(&mut self) -> RequestEnvelope {
        let frame = self.frames.recv().await.expect("client side dropped");
        let body = frame.strip_suffix(b"\n").unwrap_or(&frame);
        decode_request(body).expect("client sent an undecodable request")
    }

    /// Receive the next request and assert its method.
    pub async fn expect_request(&mut self, method: &str) -> RequestEnvelope {
        let request = self.recv_request().await;
        assert_eq!(request.method, method, "unexpected request on the wire");
        request
    }

    /// Answer the client's handshake.
    pub async fn answer_hello(&mut self, hello: &HelloParams) -> RequestEnvelope {
        let request = self.expect_request("JsonRpc.Hello").await;
        self.reply_success(request.id, hello.to_params());
        request
    }

    /// Consume the notification-enablement and cloud-status requests the
    /// client issues after authenticating, answering both.
    pub async fn settle_post_auth(&mut self) {
        let request = self.expect_request("JsonRpc.SetNotificationStatus").await;
        self.reply_success(request.id, json!({}));
        let request = self.expect_request("JsonRpc.IsCloudConnected").await;
        self.reply_success(request.id, json!({"connectionState": "unconfigured"}));
    }

    pub fn reply_success(&self, id: u64, params: Value) {
        self.inject_json(json!({"id": id, "status": "success", "params": params}));
    }

    pub fn reply_error(&self, id: u64, error: &str) {
        self.inject_json(json!({"id": id, "status": "error", "error": error}));
    }

    pub fn notify(&self, name: &str, params: Value) {
        self.inject_json(json!({"notification": name, "params": params}));
    }

    pub fn inject_json(&self, value: Value) {
        let mut wire = serde_json::to_vec(&value).expect("JSON value serialization cannot fail");
        wire.push(b'\n');
        self.inject_raw(wire);
    }

    /// Push raw bytes at the client, delimiter and framing included — or not,
    /// for malformed-frame tests.
    pub fn inject_raw(&self, bytes: impl Into<Bytes>) {
        self.inner.push(TransportEvent::Data(bytes.into()));
    }

    /// Drop the connection out from under the client.
    pub fn drop_connection(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.push(TransportEvent::Disconnected);
    }

    /// Report a transport-level failure to the client.
    pub fn fail_connection(&self, error: std::io::Error) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.push(TransportEvent::Error(error.into()));
    }

    /// Present this certificate on every subsequent open, forcing the engine
    /// through its trust path.
    pub fn gate_with_certificate(&self, issuer_info: BTreeMap<String, String>, pem: Bytes) {
        *self.inner.certificate_gate.lock() = Some(CertificateGate { issuer_info, pem });
    }

    pub fn clear_certificate_gate(&self) {
        *self.inner.certificate_gate.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Endpoint string of the most recent open.
    pub fn last_endpoint(&self) -> Option<String> {
        self.inner.last_endpoint.lock().clone()
    }
}

/// Handshake reply parameters, with builders for the common shapes.
#[derive(Debug, Clone)]
pub struct HelloParams {
    pub server_id: String,
    pub protocol_version: String,
    pub initial_setup_required: bool,
    pub authentication_required: bool,
    pub push_button_auth_available: bool,
}

impl Default for HelloParams {
    fn default() -> Self {
        Self {
            server_id: "9e4c2b7a-5d31-46a8-b7de-0f8b6f2a4c11".to_owned(),
            protocol_version: "6.2".to_owned(),
            initial_setup_required: false,
            authentication_required: false,
            push_button_auth_available: false,
        }
    }
}

impl HelloParams {
    /// A hub with authentication switched off.
    pub fn open() -> Self {
        Self::default()
    }

    /// A hub requiring password authentication.
    pub fn with_auth() -> Self {
        Self {
            authentication_required: true,
            ..Self::default()
        }
    }

    /// A hub requiring authentication and offering push-button auth.
    pub fn with_push_button() -> Self {
        Self {
            authentication_required: true,
            push_button_auth_available: true,
            ..Self::default()
        }
    }

    pub fn to_params(&self) -> Value {
        json!({
            "server": "testhubd",
            "version": "0.1.0",
            "protocolVersion": self.protocol_version,
            "uuid": self.server_id,
            "initialSetupRequired": self.initial_setup_required,
            "authenticationRequired": self.authentication_required,
            "pushButtonAuthAvailable": self.push_button_auth_available,
            "runtimeVersion": "1.80.0",
            "runtimeBuildVersion": "1.80.0-test"
        })
    }
}
