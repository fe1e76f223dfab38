use blockvol_driver::{DriverOptions, MemoryDiskStore, VolumeController};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let options = DriverOptions::parse();

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| options.log_level().into()))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let metadata = &options.provider_id;
  info!(
    driver = %options.driver_name,
    region = metadata.region(),
    zone = metadata.zone(),
    service_instance = metadata.cloud_instance_id(),
    "starting controller"
  );

  // Disks live in process memory; the node this runs on is the only
  // attachment target.
  let store = Arc::new(MemoryDiskStore::new());
  store.add_instance(metadata.pvm_instance_id(), metadata.pvm_instance_id());

  let controller = VolumeController::new(options.driver_name.clone(), store);
  csi_proto::serve(controller, &options.endpoint, async {
    if let Err(err) = tokio::signal::ctrl_c().await {
      warn!(%err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
  })
  .await?;

  Ok(())
}
