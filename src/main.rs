pub mod iriswire;

use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::sync::Arc;

use tokio::runtime::Builder;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::iriswire::common::ErrorKind;
use crate::iriswire::config::{IrisMode, Settings};
use crate::iriswire::iris::MemoryEngine;
use crate::iriswire::server::{HostServices, Server};

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_IRIS: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    // optional config file path as the first argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = match Settings::load(config_path.as_deref()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("iriswire: {}", e);
            exit(EXIT_CONFIG);
        }
    };

    let level = Level::from_str(&settings.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let connector: Arc<dyn crate::iriswire::iris::IrisConnector> = match settings.iris.mode {
        IrisMode::Memory => {
            info!("using the in-memory engine, data will not be persisted");
            MemoryEngine::new()
        }
        IrisMode::External => {
            // the external IRIS connector is supplied by an embedding host
            // linking this crate as a library; the standalone binary can
            // only verify reachability and report the gap
            error!(
                host = %settings.iris.host,
                port = settings.iris.port,
                "external IRIS mode requires an embedding host to provide the connector"
            );
            exit(EXIT_IRIS);
        }
    };

    let tokio = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("could not create tokio runtime");

    let code = tokio.block_on(async move {
        let server = match Server::new(settings, connector, HostServices::default()) {
            Ok(server) => server,
            Err(e) => {
                error!(%e, "could not start server");
                return match e.kind() {
                    ErrorKind::IOError(_) => EXIT_BIND,
                    _ => EXIT_CONFIG,
                };
            }
        };
        let shutdown = server.shutdown_handle();
        let mut serve = tokio::spawn(server.run());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                let _ = shutdown.send(true);
                let _ = (&mut serve).await;
                EXIT_INTERRUPTED
            }
            result = &mut serve => match result {
                Ok(Ok(())) => 0,
                _ => EXIT_BIND,
            },
        }
    });
    exit(code);
}
