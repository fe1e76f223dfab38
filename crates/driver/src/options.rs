use crate::metadata::Metadata;
use clap::Parser;
use csi_proto::Endpoint;

pub const DEFAULT_ENDPOINT: &str = "unix:///var/lib/csi/sockets/pluginproxy/csi.sock";
pub const DEFAULT_DRIVER_NAME: &str = "blockvol.csi.io";

#[derive(Debug, Parser)]
#[command(name = "blockvol-controller")]
#[command(about = "CSI controller plugin for remote block volumes", version)]
pub struct DriverOptions {
  /// CSI endpoint, either unix:///path/to/socket or tcp://host:port
  #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
  pub endpoint: Endpoint,

  /// Provider ID of the node the controller runs on,
  /// <scheme>://<region>/<zone>/<service_instance_id>/<machine_id>
  #[arg(long, env = "PROVIDER_ID")]
  pub provider_id: Metadata,

  /// Name the plugin reports to the CO
  #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
  pub driver_name: String,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(long, env = "CSI_DEBUG")]
  pub debug: bool,
}

impl DriverOptions {
  /// Default log filter when `RUST_LOG` is unset.
  pub fn log_level(&self) -> &'static str {
    if self.debug {
      "debug"
    } else {
      "info"
    }
  }
}
