use std::future::Future;

use mcuwire_transport::{AnyTransport, Transport, TransportConfig};

use crate::error::Result;

/// Builds the transport for a granted connection attempt.
pub trait TransportConnector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self::Transport>> + Send;
}

/// Opens whichever transport `config` describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl TransportConnector for DefaultConnector {
    type Transport = AnyTransport;

    async fn connect(&self, config: &TransportConfig) -> Result<AnyTransport> {
        Ok(AnyTransport::open(config).await?)
    }
}
