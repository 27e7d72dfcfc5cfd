use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::device::DeviceIdentity;

/// Terminal answer of a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum PermissionOutcome {
    Granted,
    Denied,
    Error(String),
}

/// A decision for one device, as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionEvent {
    pub device: DeviceIdentity,
    pub outcome: PermissionOutcome,
}

impl PermissionEvent {
    pub fn granted(device: DeviceIdentity) -> Self {
        Self {
            device,
            outcome: PermissionOutcome::Granted,
        }
    }

    pub fn denied(device: DeviceIdentity) -> Self {
        Self {
            device,
            outcome: PermissionOutcome::Denied,
        }
    }

    pub fn error(device: DeviceIdentity, reason: impl Into<String>) -> Self {
        Self {
            device,
            outcome: PermissionOutcome::Error(reason.into()),
        }
    }
}

/// Asynchronous grant/deny oracle keyed by device identity.
///
/// The returned event may name a different device than the one requested;
/// callers must check it.
pub trait PermissionGate: Send + Sync + 'static {
    fn request(&self, device: &DeviceIdentity) -> impl Future<Output = PermissionEvent> + Send;

    /// Invalidate anything remembered about `device`.
    fn on_device_removed(&self, _device: &DeviceIdentity) {}
}

/// Gate for hosts without a permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGrant;

impl PermissionGate for AlwaysGrant {
    async fn request(&self, device: &DeviceIdentity) -> PermissionEvent {
        PermissionEvent::granted(device.clone())
    }
}

/// Host hook that shows the platform permission dialog.
///
/// The host answers later by calling [`PermissionBroker::deliver`].
pub trait PermissionPrompt: Send + Sync + 'static {
    fn prompt(&self, device: &DeviceIdentity);
}

impl<F> PermissionPrompt for F
where
    F: Fn(&DeviceIdentity) + Send + Sync + 'static,
{
    fn prompt(&self, device: &DeviceIdentity) {
        self(device)
    }
}

struct Pending {
    id: u64,
    tx: oneshot::Sender<PermissionOutcome>,
}

#[derive(Default)]
struct BrokerState {
    granted: HashSet<DeviceIdentity>,
    pending: HashMap<DeviceIdentity, Pending>,
    next_id: u64,
}

/// Owner of the process-wide permission cache.
///
/// Turns the host's prompt-then-callback flow into a single future per
/// request. Grants are cached until [`clear_cache`](Self::clear_cache) or
/// [`forget`](Self::forget); denials are never cached. Clones share state.
pub struct PermissionBroker<P> {
    prompt: Arc<P>,
    state: Arc<Mutex<BrokerState>>,
}

impl<P> Clone for PermissionBroker<P> {
    fn clone(&self) -> Self {
        Self {
            prompt: Arc::clone(&self.prompt),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P> fmt::Debug for PermissionBroker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PermissionBroker")
            .field("granted", &state.granted.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<P: PermissionPrompt> PermissionBroker<P> {
    pub fn new(prompt: P) -> Self {
        Self {
            prompt: Arc::new(prompt),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Entry point for the host's permission callback.
    ///
    /// Resolves the pending request for `event.device`. Returns `false` and
    /// changes nothing when no request for that device is pending.
    pub fn deliver(&self, event: PermissionEvent) -> bool {
        let mut state = lock(&self.state);
        let Some(pending) = state.pending.remove(&event.device) else {
            warn!(
                device = %event.device,
                outcome = ?event.outcome,
                "permission event does not match a pending request, ignoring"
            );
            return false;
        };
        if event.outcome == PermissionOutcome::Granted {
            state.granted.insert(event.device.clone());
        }
        debug!(device = %event.device, outcome = ?event.outcome, "permission resolved");
        // The requester may have given up already; the cache update still stands.
        let _ = pending.tx.send(event.outcome);
        true
    }

    pub fn is_granted(&self, device: &DeviceIdentity) -> bool {
        lock(&self.state).granted.contains(device)
    }

    /// Number of requests waiting for the host.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Drop every cached grant.
    pub fn clear_cache(&self) {
        lock(&self.state).granted.clear();
    }

    /// Drop the cached grant for `device` and abandon its pending request.
    pub fn forget(&self, device: &DeviceIdentity) {
        let mut state = lock(&self.state);
        state.granted.remove(device);
        if state.pending.remove(device).is_some() {
            debug!(%device, "pending permission request abandoned");
        }
    }
}

impl<P: PermissionPrompt> PermissionGate for PermissionBroker<P> {
    async fn request(&self, device: &DeviceIdentity) -> PermissionEvent {
        let (id, rx) = {
            let mut state = lock(&self.state);
            if state.granted.contains(device) {
                debug!(%device, "permission granted from cache");
                return PermissionEvent::granted(device.clone());
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            if state.pending.insert(device.clone(), Pending { id, tx }).is_some() {
                debug!(%device, "superseding earlier permission request");
            }
            (id, rx)
        };

        let _registration = Registration {
            state: Arc::clone(&self.state),
            device: device.clone(),
            id,
        };
        self.prompt.prompt(device);

        let outcome = rx.await.unwrap_or_else(|_| {
            PermissionOutcome::Error("permission request abandoned".to_string())
        });
        PermissionEvent {
            device: device.clone(),
            outcome,
        }
    }

    fn on_device_removed(&self, device: &DeviceIdentity) {
        self.forget(device);
    }
}

/// Removes a pending registration when its request finishes or is dropped.
struct Registration {
    state: Arc<Mutex<BrokerState>>,
    device: DeviceIdentity,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state
            .pending
            .get(&self.device)
            .is_some_and(|pending| pending.id == self.id)
        {
            state.pending.remove(&self.device);
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
