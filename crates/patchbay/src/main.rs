//! Patchbay Server
//!
//! Device hub that routes messages between plugins attached over serial
//! ports and HTTP webhooks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use patchbay::config::HubConfig;
use patchbay::http::{create_router, ApiState, HttpTransport};
use patchbay::logging;
use patchbay::serial::{spawn_scanner, SerialTransport};
use patchbay_core::{Dispatcher, Hub};

/// Patchbay Device Hub
#[derive(Parser, Debug)]
#[command(name = "patchbay")]
#[command(about = "Patchbay device hub", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./patchbay.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen port
    #[arg(long)]
    port: Option<u16>,

    /// Don't scan for serial ports
    #[arg(long)]
    no_serial: bool,

    /// Don't start the HTTP transport
    #[arg(long)]
    no_http: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut HubConfig) {
        if let Some(host) = &self.host {
            config.http.host = host.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if self.no_serial {
            config.serial.enabled = false;
        }
        if self.no_http {
            config.http.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HubConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init(&config.logging)?;
    info!("Starting Patchbay v{}", env!("CARGO_PKG_VERSION"));

    let hub = Hub::new(config.hub_settings());
    let mut dispatcher = Dispatcher::new();

    let serial = config.serial.enabled.then(|| {
        let transport = SerialTransport::new(
            hub.inbound(),
            config.serial.write_queue,
            config.serial.baud_rate,
        );
        dispatcher.insert(Arc::new(transport.clone()));
        transport
    });

    if config.http.enabled {
        let transport =
            HttpTransport::new(config.http.callback_path.clone(), config.http.request_timeout())?;
        dispatcher.insert(Arc::new(transport));
    }

    if serial.is_none() && !config.http.enabled {
        warn!("Both transports are disabled; no plugin can connect");
    }

    let handle = hub.start(dispatcher);

    let (scanner_tx, scanner_rx) = watch::channel(false);
    let scanner = serial
        .clone()
        .map(|transport| spawn_scanner(transport, config.serial.scan_config(), scanner_rx));

    if config.http.enabled {
        let app = create_router(ApiState::from_hub(&handle));
        let listener = TcpListener::bind(config.http.bind_address()).await?;

        info!("Server listening on http://{}", listener.local_addr()?);
        info!("Webhook endpoint: POST /webhook");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    let _ = scanner_tx.send(true);
    if let Some(scanner) = scanner {
        if let Err(e) = scanner.await {
            error!("Serial scanner panicked: {}", e);
        }
    }
    if let Some(serial) = serial {
        serial.detach_all();
    }
    handle.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
