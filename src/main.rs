//! Slide scanner control panel server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slidescan::app::App;
use slidescan::capture::simulated::{PatternProvider, SimulatedSdk};
use slidescan::capture::{V4l2Provider, VideoDeviceProvider};
use slidescan::stage::StageClient;
use slidescan::{stream, utils, Config, PreviewBackend};

#[derive(Debug, Parser)]
#[command(version, about = "Microscope slide scanner control panel")]
struct Args {
    /// Config file (defaults to ./slidescan.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.bind
    #[arg(short, long)]
    bind: Option<String>,

    /// Preview camera backend, overrides preview.backend
    #[arg(long, value_enum)]
    preview: Option<PreviewBackend>,

    /// Skip connecting to the stage controller
    #[arg(long)]
    no_stage: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slidescan=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    info!("Slidescan launching...");

    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(backend) = args.preview {
        config.preview.backend = backend;
    }

    let (provider, index): (Arc<dyn VideoDeviceProvider>, usize) = match config.preview.backend {
        PreviewBackend::V4l2 => {
            let index = match config.preview.device_index {
                Some(index) => index,
                None => match utils::auto_detect_device() {
                    Some(found) => {
                        config.preview.format = found.format;
                        found.index
                    }
                    None => {
                        warn!("No capture device detected, falling back to /dev/video0");
                        0
                    }
                },
            };
            (Arc::new(V4l2Provider::new(&config.preview)), index)
        }
        PreviewBackend::Pattern => (
            Arc::new(PatternProvider::moving(
                config.preview.width,
                config.preview.height,
            )),
            0,
        ),
    };
    info!("Preview camera: {:?} device {}", config.preview.backend, index);

    // Vendor bindings plug in behind `CameraSdk`; the simulated SDK is the
    // only implementation shipped.
    let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(
        config.main.simulated_frame_interval_ms,
    )));

    let stage = if args.no_stage {
        None
    } else {
        match StageClient::connect(&config.stage) {
            Ok(stage) => Some(stage),
            Err(e) => {
                warn!("Stage unavailable: {}", e);
                None
            }
        }
    };

    let bind = config.server.bind.clone();
    let mut app = App::new(config, provider, index, sdk);
    if let Some(stage) = stage {
        app = app.with_stage(stage);
    }
    let app = Arc::new(app);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("binding {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, stream::create_router(app.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || app.shutdown()).await?;
    info!("Slidescan shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
