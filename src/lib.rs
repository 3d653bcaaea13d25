pub mod agents;
pub mod app;
pub mod commands;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod providers;
pub mod ui;

use anyhow::Result;

pub use app::Mode;
pub use config::SwarmConfig;

/// Starts the agents described by `config` and serves input in `mode`.
/// Returns false when a one-shot command did not succeed.
pub async fn run(config: SwarmConfig, mode: Mode) -> Result<bool> {
    config.validate()?;
    let app = app::Application::new(&config).await?;
    app.run(mode).await
}
