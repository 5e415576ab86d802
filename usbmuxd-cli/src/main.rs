//! Thin binary wiring the mux core's reference collaborators together:
//! a `nusb`-backed USB transport, a filesystem-backed pairing-record
//! store, and a preflight stub that marks every device visible
//! immediately. See `usbmuxd_core::dispatcher::MuxCore` for the engine
//! this just assembles and runs.

use std::sync::Arc;

use anyhow::Context;
use usbmuxd_core::{MuxConfig, MuxCore};
use usbmuxd_core::config::FsConfigStore;
use usbmuxd_core::preflight::AlwaysVisiblePreflight;
use usbmuxd_core::transport::NusbTransport;
use usbmuxd_core::util::MonotonicClock;

fn default_config_dir() -> std::path::PathBuf {
    std::env::var_os("USBMUXD_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/var/lib/lockdown"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = MuxConfig::new(default_config_dir());
    log::info!("starting usbmuxd-core on 127.0.0.1:{} (config dir {})", config.listen_port, config.config_dir.display());

    let transport = Arc::new(NusbTransport::new());
    transport.spawn_hotplug_watcher();
    let config_store = Arc::new(FsConfigStore::new(config.config_dir.clone()));
    let preflight = Arc::new(AlwaysVisiblePreflight);
    let clock = Arc::new(MonotonicClock::new());

    let core = MuxCore::new(transport, config_store, preflight, clock);
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let shutdown_for_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested, draining connections");
        shutdown_for_signal.notify_one();
    })
    .context("failed to install ctrl-c handler")?;

    core.run(config.listen_port, shutdown).await.context("reactor exited with an error")?;
    Ok(())
}
