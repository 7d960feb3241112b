pub mod app;
pub mod comm;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
