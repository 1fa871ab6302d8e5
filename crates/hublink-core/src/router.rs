//! Notification router.
//!
//! Maps `(owner, namespace)` registrations to method filters and delivers
//! inbound notifications over per-registration channels. Unknown
//! namespace/method combinations are dropped without error so the hub can
//! grow its notification surface without breaking older clients.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::Notification;

/// Opaque handle identifying a notification subscriber.
///
/// The router never dereferences it; equality is all that matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which methods of a namespace a registration wants.
#[derive(Debug, Clone)]
pub enum MethodFilter {
    /// Every method in the namespace.
    All,
    /// Only the listed methods.
    Methods(HashSet<String>),
}

impl MethodFilter {
    pub fn methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Methods(methods.into_iter().map(Into::into).collect())
    }

    fn matches(&self, method: &str) -> bool {
        match self {
            Self::All => true,
            Self::Methods(set) => set.contains(method),
        }
    }
}

#[derive(Debug)]
struct Registration {
    owner: SubscriberId,
    namespace: String,
    filter: MethodFilter,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Registry of notification subscriptions.
#[derive(Debug, Default)]
pub struct NotificationRouter {
    registrations: Vec<Registration>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `owner` for a namespace. A second registration for the same
    /// `(owner, namespace)` replaces the first — the old receiver's stream
    /// ends rather than double-delivering.
    pub fn register(
        &mut self,
        owner: SubscriberId,
        namespace: &str,
        filter: MethodFilter,
    ) -> mpsc::UnboundedReceiver<Notification> {
        self.registrations
            .retain(|r| !(r.owner == owner && r.namespace == namespace));
        let (tx, rx) = mpsc::unbounded_channel();
        self.registrations.push(Registration {
            owner,
            namespace: namespace.to_owned(),
            filter,
            tx,
        });
        tracing::debug!(?owner, namespace, "notification handler registered");
        rx
    }

    /// Remove every registration held by `owner`. Idempotent.
    pub fn unregister_owner(&mut self, owner: SubscriberId) {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.owner != owner);
        if self.registrations.len() != before {
            tracing::debug!(?owner, "notification handler unregistered");
        }
    }

    /// Deliver a notification to every matching registration, in order.
    ///
    /// Registrations whose receiver is gone are pruned here. Returns how many
    /// deliveries happened; zero is not an error.
    pub fn dispatch(&mut self, notification: &Notification) -> usize {
        let mut delivered = 0;
        self.registrations.retain(|r| {
            if r.namespace != notification.namespace || !r.filter.matches(&notification.method) {
                return true;
            }
            if r.tx.send(notification.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(
                    owner = ?r.owner,
                    namespace = %r.namespace,
                    "pruning registration with dropped receiver"
                );
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
