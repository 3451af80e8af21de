//! Interactive binary for the voxloop pipeline.
//!
//! Usage: `voxloop [config.toml]`. Once running, the prompt accepts
//! `q`/`quit`/`exit` to shut down, `v<0..1>` to adjust VAD sensitivity,
//! and anything else as a text turn for the assistant.

use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use voxloop::{PipelineConfig, PipelineCoordinator};

/// `voxloop.toml` in the working directory, falling back to the
/// platform config directory.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from("voxloop.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("voxloop").join("voxloop.toml"))
        .unwrap_or(local)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let loaded = PipelineConfig::from_file(&config_path);
    let config_fallback = loaded.is_err();
    let config = loaded.unwrap_or_default();

    // Console logging plus an optional non-blocking file layer.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("voxloop={}", config.logging.level)));
    let file_guard = match &config.logging.file {
        Some(file) => {
            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            let name = file.file_name().map(|n| n.to_owned()).unwrap_or_default();
            std::fs::create_dir_all(dir).ok();
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, name),
            );
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    };
    let _file_guard = file_guard;

    if config_fallback {
        tracing::warn!(
            "no usable config at {}, running with built-in defaults",
            config_path.display()
        );
    }

    println!("voxloop v{}", env!("CARGO_PKG_VERSION"));
    println!("Speak into your microphone, or type. q to quit, v<0..1> to set VAD sensitivity.\n");

    let pipeline = PipelineCoordinator::new(config);
    let cancel = pipeline.cancel_token();

    // Handle Ctrl+C like a `q`.
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    pipeline.run().await?;

    Ok(())
}
