use mcuwire_link::DiscoveredDevice;

use crate::cmd::DevicesArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_devices, OutputFormat};

pub async fn run(args: DevicesArgs, format: OutputFormat) -> CliResult<i32> {
    let devices = discover(&args).await?;
    print_devices(&devices, format);
    Ok(SUCCESS)
}

#[cfg(feature = "serial")]
async fn discover(args: &DevicesArgs) -> CliResult<Vec<DiscoveredDevice>> {
    use mcuwire_link::{DeviceEnumerator, SerialEnumerator};
    use mcuwire_transport::SerialConfig;

    let mut template = SerialConfig::default();
    if let Some(baud) = args.baud {
        template.baud_rate = baud;
    }
    SerialEnumerator::new(template)
        .enumerate()
        .await
        .map_err(|err| crate::exit::link_error("enumeration failed", err))
}

#[cfg(not(feature = "serial"))]
async fn discover(_args: &DevicesArgs) -> CliResult<Vec<DiscoveredDevice>> {
    tracing::warn!("built without the `serial` feature, no devices can be listed");
    Ok(Vec::new())
}
