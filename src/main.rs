mod api;
mod events;
mod frame;
mod reader;
mod tag;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::reader::Reader;
use crate::transport::{Channel, Counters};

struct Config {
    listen_addr: String,
    device: String,
    reader_addr: Option<String>,
    keep_awake: bool,
    country: String,
    library: String,
}

impl Config {
    fn from_env() -> Config {
        let var = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        Config {
            listen_addr: var("BRIDGE_ADDR", "0.0.0.0:1667"),
            device: var("READER_DEVICE", "/dev/ttyUSB0"),
            reader_addr: std::env::var("READER_ADDR").ok().filter(|a| !a.is_empty()),
            keep_awake: var("KEEP_AWAKE", "true") != "false",
            country: var("COUNTRY_CODE", "NO"),
            library: var("LIBRARY_CODE", "02030000"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development); in production the environment
    // comes from the service manager.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feig_bridge=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env();
    let counters = Arc::new(Counters::default());

    let mut channel = match &config.reader_addr {
        Some(addr) => {
            info!("connecting to reader at {addr}");
            Channel::open_tcp(addr, counters.clone()).await?
        }
        None => {
            info!("opening reader serial device {}", config.device);
            Channel::open_serial(&config.device, counters.clone())?
        }
    };
    let reader_info = channel.init().await.context("reader initialization")?;
    info!(
        swrev = format_args!("{:04X}", reader_info.swrev),
        usb = reader_info.usb,
        "reader ready"
    );

    let reader = Reader::new(
        Box::new(channel),
        reader_info,
        counters,
        config.keep_awake,
        config.country,
        config.library,
    );
    let scan_loop = tokio::spawn(reader.clone().run());

    let app = api::router()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(api::AppState {
            reader: reader.clone(),
        });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("bridge listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scan_loop.abort();
    reader.close().await;
    info!("bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
