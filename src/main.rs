mod config;
mod controller;
mod coordinator;
mod models;
mod mpv;
mod store;
mod studio;
mod ui;
mod voice;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let handle = controller::start_controller();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build console runtime")?;
    rt.block_on(ui::run(handle))
}
