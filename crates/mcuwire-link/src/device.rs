use std::fmt;
use std::future::Future;

use mcuwire_transport::TransportConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stable key for a physical or network device.
///
/// Created at discovery time and only ever compared. The permission cache is
/// keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.into(),
        }
    }

    /// Identity for an endpoint without USB descriptors, keyed by its address.
    pub fn from_endpoint(endpoint: impl Into<String>) -> Self {
        Self::new(0, 0, endpoint)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// A present device and how to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub transport: TransportConfig,
}

/// Attach/detach notification from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceIdentity),
    Detached(DeviceIdentity),
}

impl DeviceEvent {
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            DeviceEvent::Attached(identity) | DeviceEvent::Detached(identity) => identity,
        }
    }
}

/// Query for the devices currently present.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> impl Future<Output = Result<Vec<DiscoveredDevice>>> + Send;
}

/// Fixed device list, for network peers configured up front.
#[derive(Debug, Clone, Default)]
pub struct StaticDevices {
    devices: Vec<DiscoveredDevice>,
}

impl StaticDevices {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceEnumerator for StaticDevices {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.clone())
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialEnumerator;

#[cfg(feature = "serial")]
mod serial {
    use mcuwire_transport::{SerialConfig, TransportConfig};
    use tokio_serial::SerialPortType;
    use tracing::debug;

    use super::{DeviceEnumerator, DeviceIdentity, DiscoveredDevice};
    use crate::error::{LinkError, Result};

    /// Lists USB serial ports with their VID/PID and product name.
    ///
    /// Each discovered port is opened with the line settings of `template`.
    #[derive(Debug, Clone, Default)]
    pub struct SerialEnumerator {
        template: SerialConfig,
    }

    impl SerialEnumerator {
        pub fn new(template: SerialConfig) -> Self {
            Self { template }
        }
    }

    impl DeviceEnumerator for SerialEnumerator {
        async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
            let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
                .await
                .map_err(|err| LinkError::Enumeration(err.to_string()))?
                .map_err(|err| LinkError::Enumeration(err.to_string()))?;

            let devices: Vec<DiscoveredDevice> = ports
                .into_iter()
                .filter_map(|port| match port.port_type {
                    SerialPortType::UsbPort(usb) => {
                        let name = usb.product.unwrap_or_else(|| port.port_name.clone());
                        Some(DiscoveredDevice {
                            identity: DeviceIdentity::new(usb.vid, usb.pid, name),
                            transport: TransportConfig::Serial(SerialConfig {
                                path: port.port_name,
                                ..self.template.clone()
                            }),
                        })
                    }
                    _ => None,
                })
                .collect();

            debug!(count = devices.len(), "usb serial devices enumerated");
            Ok(devices)
        }
    }
}
