//! Permission-gated connection lifecycle for mcuwire devices.
//!
//! A caller asks [`ConnectionLifecycle::connect`] for a device. The lifecycle
//! asks its [`PermissionGate`], opens the transport through a
//! [`TransportConnector`] on grant, and hands back a shared
//! [`Connection`](mcuwire_frame::Connection). It is single-flight: one attempt
//! or connection per lifecycle at a time.

pub mod connector;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod permission;

pub use connector::{DefaultConnector, TransportConnector};
#[cfg(feature = "serial")]
pub use device::SerialEnumerator;
pub use device::{DeviceEnumerator, DeviceEvent, DeviceIdentity, DiscoveredDevice, StaticDevices};
pub use error::{LinkError, Result};
pub use lifecycle::{ConnectionLifecycle, ConnectionState};
pub use permission::{
    AlwaysGrant, PermissionBroker, PermissionEvent, PermissionGate, PermissionOutcome,
    PermissionPrompt,
};
