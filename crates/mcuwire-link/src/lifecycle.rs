use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mcuwire_frame::{Connection, ConnectionConfig};
use mcuwire_transport::{Transport, TransportConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connector::{DefaultConnector, TransportConnector};
use crate::device::{DeviceEnumerator, DeviceEvent, DeviceIdentity, DiscoveredDevice};
use crate::error::{LinkError, Result};
use crate::permission::{PermissionGate, PermissionOutcome};

/// Where the lifecycle currently is.
///
/// `Connected` and `Error` end an attempt; only a new `connect()` or
/// `disconnect()` leaves them.
pub enum ConnectionState<T: Transport> {
    Disconnected,
    RequestingPermission,
    Connecting,
    Connected(Arc<Connection<T>>),
    Error(String),
}

impl<T: Transport> ConnectionState<T> {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::RequestingPermission => "requesting_permission",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Error(_) => "error",
        }
    }

    /// Whether a new attempt may start from here.
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Error(_)
        )
    }

    pub fn connection(&self) -> Option<&Arc<Connection<T>>> {
        match self {
            ConnectionState::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ConnectionState::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl<T: Transport> Clone for ConnectionState<T> {
    fn clone(&self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::RequestingPermission => ConnectionState::RequestingPermission,
            ConnectionState::Connecting => ConnectionState::Connecting,
            ConnectionState::Connected(conn) => ConnectionState::Connected(Arc::clone(conn)),
            ConnectionState::Error(message) => ConnectionState::Error(message.clone()),
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected(conn) => f.debug_tuple("Connected").field(conn).finish(),
            ConnectionState::Error(message) => f.debug_tuple("Error").field(message).finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl<T: Transport> fmt::Display for ConnectionState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    device: Option<DeviceIdentity>,
    cancel: Option<CancellationToken>,
}

/// Single-flight state machine: permission, then transport, then connection.
///
/// One lifecycle manages one logical connection slot. A `connect()` while an
/// attempt is running or a connection is up is rejected without side
/// effects. `disconnect()` always wins over an attempt in flight.
pub struct ConnectionLifecycle<G, C = DefaultConnector>
where
    C: TransportConnector,
{
    gate: G,
    connector: C,
    connection_config: ConnectionConfig,
    state: watch::Sender<ConnectionState<C::Transport>>,
    slot: Mutex<Slot>,
}

impl<G, C> ConnectionLifecycle<G, C>
where
    G: PermissionGate,
    C: TransportConnector,
{
    pub fn new(gate: G, connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            gate,
            connector,
            connection_config: ConnectionConfig::default(),
            state,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Tunables for connections created from now on.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ConnectionState<C::Transport> {
        self.state.borrow().clone()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState<C::Transport>> {
        self.state.subscribe()
    }

    /// The live connection, if connected.
    pub fn connection(&self) -> Option<Arc<Connection<C::Transport>>> {
        self.state.borrow().connection().cloned()
    }

    /// Device of the attempt or connection currently holding the slot.
    pub fn current_device(&self) -> Option<DeviceIdentity> {
        self.slot().device.clone()
    }

    /// Ask for permission to use `device`, then open `transport` for it.
    ///
    /// Rejected with [`LinkError::AttemptInProgress`] unless the lifecycle is
    /// `Disconnected` or `Error`; a rejected call sends no permission request.
    pub async fn connect(
        &self,
        device: DeviceIdentity,
        transport: TransportConfig,
    ) -> Result<Arc<Connection<C::Transport>>> {
        let (generation, cancel) = {
            let mut slot = self.slot();
            let current = self.state.borrow().name();
            if !self.state.borrow().accepts_connect() {
                warn!(%device, state = current, "connect rejected, attempt already in progress");
                return Err(LinkError::AttemptInProgress { state: current });
            }
            slot.generation += 1;
            let cancel = CancellationToken::new();
            slot.cancel = Some(cancel.clone());
            slot.device = Some(device.clone());
            self.state.send_replace(ConnectionState::RequestingPermission);
            (slot.generation, cancel)
        };
        let _attempt = AttemptGuard {
            lifecycle: self,
            generation,
        };
        info!(%device, endpoint = %transport, "requesting permission");

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            event = self.gate.request(&device) => event,
        };

        if event.device != device {
            return Err(self.fail(
                generation,
                LinkError::PermissionMismatch {
                    expected: device.to_string(),
                    actual: event.device.to_string(),
                },
            ));
        }
        match event.outcome {
            PermissionOutcome::Granted => {}
            PermissionOutcome::Denied => {
                return Err(self.fail(generation, LinkError::PermissionDenied(device.to_string())))
            }
            PermissionOutcome::Error(reason) => {
                return Err(self.fail(generation, LinkError::Permission(reason)))
            }
        }

        if !self.advance(generation, ConnectionState::Connecting) {
            return Err(LinkError::Cancelled);
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            opened = self.connector.connect(&transport) => opened,
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => return Err(self.fail(generation, err)),
        };

        let conn = Arc::new(Connection::with_config(
            transport,
            self.connection_config.clone(),
        ));
        if !self.advance(generation, ConnectionState::Connected(Arc::clone(&conn))) {
            conn.close().await;
            return Err(LinkError::Cancelled);
        }
        Ok(conn)
    }

    /// Return to `Disconnected`, cancelling any attempt and closing any connection.
    ///
    /// Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        let previous = {
            let mut slot = self.slot();
            slot.generation += 1;
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
            slot.device = None;
            self.state.send_replace(ConnectionState::Disconnected)
        };

        if let ConnectionState::Connected(conn) = &previous {
            conn.close().await;
        }
        if !matches!(previous, ConnectionState::Disconnected) {
            info!(from = previous.name(), "disconnected");
        }
    }

    /// React to a host attach/detach notification, then rescan.
    ///
    /// Detaching the current device forces a disconnect first. Any detach
    /// invalidates the gate's memory of that device.
    pub async fn handle_device_event<E: DeviceEnumerator>(
        &self,
        event: &DeviceEvent,
        enumerator: &E,
    ) -> Result<Vec<DiscoveredDevice>> {
        if let DeviceEvent::Detached(identity) = event {
            let current = self.current_device();
            if current.as_ref() == Some(identity) {
                info!(device = %identity, "current device detached");
                self.disconnect().await;
            }
            self.gate.on_device_removed(identity);
        }
        enumerator.enumerate().await
    }

    fn advance(&self, generation: u64, next: ConnectionState<C::Transport>) -> bool {
        let slot = self.slot();
        if slot.generation != generation {
            return false;
        }
        if let Some(device) = &slot.device {
            info!(%device, state = next.name(), "connection state changed");
        }
        self.state.send_replace(next);
        true
    }

    fn fail(&self, generation: u64, err: LinkError) -> LinkError {
        let message = match &err {
            LinkError::PermissionDenied(_) => "permission denied".to_string(),
            other => other.to_string(),
        };
        if self.advance(generation, ConnectionState::Error(message)) {
            warn!(error = %err, "connection attempt failed");
            err
        } else {
            LinkError::Cancelled
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the slot when a `connect()` future is dropped mid-attempt.
///
/// Finished attempts leave `Connected` or `Error` behind and are not touched.
struct AttemptGuard<'a, G, C>
where
    C: TransportConnector,
{
    lifecycle: &'a ConnectionLifecycle<G, C>,
    generation: u64,
}

impl<G, C> Drop for AttemptGuard<'_, G, C>
where
    C: TransportConnector,
{
    fn drop(&mut self) {
        let lifecycle = self.lifecycle;
        let mut slot = lifecycle.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != self.generation {
            return;
        }
        let in_flight = matches!(
            *lifecycle.state.borrow(),
            ConnectionState::RequestingPermission | ConnectionState::Connecting
        );
        if !in_flight {
            return;
        }
        slot.generation += 1;
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        let device = slot.device.take();
        lifecycle.state.send_replace(ConnectionState::Disconnected);
        drop(slot);
        match device {
            Some(device) => info!(%device, "connection attempt abandoned"),
            None => info!("connection attempt abandoned"),
        }
    }
}

impl<G, C> fmt::Debug for ConnectionLifecycle<G, C>
where
    C: TransportConnector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use mcuwire_transport::{SerialConfig, SerialTransport, TransportError};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::device::StaticDevices;
    use crate::permission::{AlwaysGrant, PermissionBroker, PermissionEvent};

    /// Hands out in-memory serial devices and keeps the far ends alive.
    #[derive(Default)]
    struct PipeConnector {
        far_ends: Mutex<Vec<DuplexStream>>,
        opened: AtomicUsize,
        fail: bool,
    }

    impl TransportConnector for PipeConnector {
        type Transport = SerialTransport;

        async fn connect(&self, config: &TransportConfig) -> Result<SerialTransport> {
            if self.fail {
                return Err(TransportError::InvalidConfig("no such port".to_string()).into());
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (host, device) = tokio::io::duplex(64);
            self.far_ends.lock().unwrap().push(device);
            Ok(SerialTransport::from_device(
                host,
                SerialConfig::new(config.to_string()),
            ))
        }
    }

    struct WrongDevice;

    impl PermissionGate for WrongDevice {
        async fn request(&self, _device: &DeviceIdentity) -> PermissionEvent {
            PermissionEvent::granted(DeviceIdentity::new(0xdead, 0xbeef, "impostor"))
        }
    }

    fn uno() -> DeviceIdentity {
        DeviceIdentity::new(0x2341, 0x0043, "Arduino Uno")
    }

    fn port() -> TransportConfig {
        TransportConfig::serial("/dev/ttyACM0")
    }

    type BrokerLifecycle = ConnectionLifecycle<PermissionBroker<fn(&DeviceIdentity)>, PipeConnector>;

    fn brokered() -> BrokerLifecycle {
        fn no_dialog(_: &DeviceIdentity) {}
        ConnectionLifecycle::new(
            PermissionBroker::new(no_dialog as fn(&DeviceIdentity)),
            PipeConnector::default(),
        )
    }

    async fn wait_for_state<G, C>(lifecycle: &ConnectionLifecycle<G, C>, name: &str)
    where
        G: PermissionGate,
        C: TransportConnector,
    {
        let mut rx = lifecycle.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.name() == name))
            .await
            .expect("state should be reached")
            .unwrap();
    }

    #[tokio::test]
    async fn denied_then_granted() {
        let lifecycle = Arc::new(brokered());

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle.gate().deliver(PermissionEvent::denied(uno()));

        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::PermissionDenied(_)));
        let state = lifecycle.state();
        assert!(state.error().unwrap().contains("denied"));
        assert_eq!(lifecycle.connector.opened.load(Ordering::SeqCst), 0);

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle.gate().deliver(PermissionEvent::granted(uno()));

        let conn = attempt.await.unwrap().unwrap();
        assert!(matches!(lifecycle.state(), ConnectionState::Connected(_)));
        assert!(Arc::ptr_eq(&conn, &lifecycle.connection().unwrap()));
        assert_eq!(lifecycle.current_device(), Some(uno()));
    }

    #[tokio::test]
    async fn second_connect_is_rejected_while_pending() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prompts);
        let lifecycle = ConnectionLifecycle::new(
            PermissionBroker::new(move |_: &DeviceIdentity| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            PipeConnector::default(),
        );

        let (first, second) = tokio::join!(lifecycle.connect(uno(), port()), async {
            wait_for_state(&lifecycle, "requesting_permission").await;
            let second = lifecycle.connect(uno(), port()).await;
            lifecycle.gate().deliver(PermissionEvent::granted(uno()));
            second
        });

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(LinkError::AttemptInProgress {
                state: "requesting_permission"
            })
        ));
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.connector.opened.load(Ordering::SeqCst), 1);

        assert!(matches!(
            lifecycle.connect(uno(), port()).await,
            Err(LinkError::AttemptInProgress { state: "connected" })
        ));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_request() {
        let lifecycle = Arc::new(brokered());

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle.disconnect().await;

        assert!(matches!(attempt.await.unwrap(), Err(LinkError::Cancelled)));
        assert!(matches!(lifecycle.state(), ConnectionState::Disconnected));
        assert_eq!(lifecycle.gate().pending(), 0);
        assert_eq!(lifecycle.connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_attempt_frees_the_slot() {
        let lifecycle = Arc::new(brokered());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), lifecycle.connect(uno(), port())).await;
        assert!(abandoned.is_err());
        assert!(matches!(lifecycle.state(), ConnectionState::Disconnected));
        assert_eq!(lifecycle.current_device(), None);
        assert_eq!(lifecycle.gate().pending(), 0);

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle.gate().deliver(PermissionEvent::granted(uno()));

        attempt.await.unwrap().unwrap();
        assert!(matches!(lifecycle.state(), ConnectionState::Connected(_)));
        assert_eq!(lifecycle.connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_attempt_keeps_its_outcome() {
        let lifecycle = ConnectionLifecycle::new(WrongDevice, PipeConnector::default());
        let _ = lifecycle.connect(uno(), port()).await;
        assert!(lifecycle.state().error().is_some());

        let lifecycle = ConnectionLifecycle::new(AlwaysGrant, PipeConnector::default());
        lifecycle.connect(uno(), port()).await.unwrap();
        assert!(matches!(lifecycle.state(), ConnectionState::Connected(_)));
        assert_eq!(lifecycle.current_device(), Some(uno()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_connection() {
        let lifecycle = ConnectionLifecycle::new(AlwaysGrant, PipeConnector::default());
        lifecycle.disconnect().await;

        let conn = lifecycle.connect(uno(), port()).await.unwrap();
        lifecycle.disconnect().await;
        lifecycle.disconnect().await;

        assert!(conn.is_closed());
        assert!(matches!(lifecycle.state(), ConnectionState::Disconnected));
        assert!(lifecycle.connection().is_none());
        assert_eq!(lifecycle.current_device(), None);
    }

    #[tokio::test]
    async fn mismatched_grant_is_not_applied() {
        let lifecycle = ConnectionLifecycle::new(WrongDevice, PipeConnector::default());

        let err = lifecycle.connect(uno(), port()).await.unwrap_err();
        assert!(matches!(err, LinkError::PermissionMismatch { .. }));
        assert!(lifecycle.state().error().is_some());
        assert_eq!(lifecycle.connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gate_error_reason_is_kept() {
        let lifecycle = Arc::new(brokered());

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle
            .gate()
            .deliver(PermissionEvent::error(uno(), "usb host busy"));

        assert!(matches!(
            attempt.await.unwrap(),
            Err(LinkError::Permission(reason)) if reason == "usb host busy"
        ));
        assert!(lifecycle.state().error().unwrap().contains("usb host busy"));
    }

    #[tokio::test]
    async fn transport_failure_ends_in_error_and_allows_retry() {
        let lifecycle = ConnectionLifecycle::new(
            AlwaysGrant,
            PipeConnector {
                fail: true,
                ..PipeConnector::default()
            },
        );

        let err = lifecycle.connect(uno(), port()).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        assert!(lifecycle.state().error().unwrap().contains("no such port"));

        let again = lifecycle.connect(uno(), port()).await.unwrap_err();
        assert!(matches!(again, LinkError::Transport(_)));
    }

    #[tokio::test]
    async fn states_are_published_in_order() {
        let lifecycle = ConnectionLifecycle::new(AlwaysGrant, PipeConnector::default());
        let mut rx = lifecycle.subscribe();
        assert_eq!(rx.borrow_and_update().name(), "disconnected");

        lifecycle.connect(uno(), port()).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().name(), "connected");
    }

    #[tokio::test]
    async fn detaching_current_device_disconnects_and_forgets() {
        let lifecycle = Arc::new(brokered());
        let other = DeviceIdentity::new(0x0483, 0x5740, "STM32 VCP");
        let devices = StaticDevices::new(vec![DiscoveredDevice {
            identity: other.clone(),
            transport: TransportConfig::serial("/dev/ttyACM1"),
        }]);

        let attempt = tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.connect(uno(), port()).await }
        });
        wait_for_state(&lifecycle, "requesting_permission").await;
        lifecycle.gate().deliver(PermissionEvent::granted(uno()));
        let conn = attempt.await.unwrap().unwrap();
        assert!(lifecycle.gate().is_granted(&uno()));

        let found = lifecycle
            .handle_device_event(&DeviceEvent::Detached(other.clone()), &devices)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(lifecycle.state(), ConnectionState::Connected(_)));

        lifecycle
            .handle_device_event(&DeviceEvent::Attached(other), &devices)
            .await
            .unwrap();
        assert!(matches!(lifecycle.state(), ConnectionState::Connected(_)));

        lifecycle
            .handle_device_event(&DeviceEvent::Detached(uno()), &devices)
            .await
            .unwrap();
        assert!(matches!(lifecycle.state(), ConnectionState::Disconnected));
        assert!(conn.is_closed());
        assert!(!lifecycle.gate().is_granted(&uno()));
    }
}
