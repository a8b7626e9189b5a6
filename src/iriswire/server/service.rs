use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::iriswire::auth::{AuthConfig, SecurityContextFactory, TokenExchanger};
use crate::iriswire::config::Settings;
use crate::iriswire::iris::{Bridge, IrisConnector};
use crate::iriswire::pg::{ClientConn, ConnContext};
use crate::iriswire::server::listener::Listener;
use crate::iriswire::server::registry::CancelRegistry;
use crate::iriswire::server::transport::build_tls_acceptor;
use crate::iriswire::sql::{Translator, VectorOptimizer};
use crate::iriswire::Result;

/// The TCP acceptor: spawns one ClientConn per socket, owns the cancel
/// registry, and drives graceful shutdown.
pub struct Server {
    ctx: ConnContext,
    listener: Listener,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Host-injected collaborators for the auth modes that need them.
#[derive(Default)]
pub struct HostServices {
    pub oauth_exchanger: Option<Arc<dyn TokenExchanger>>,
    pub gssapi: Option<Arc<dyn SecurityContextFactory>>,
}

impl Server {
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn IrisConnector>,
        services: HostServices,
    ) -> Result<Server> {
        let tls = match &settings.tls {
            Some(tls_settings) => Some(build_tls_acceptor(tls_settings)?),
            None => None,
        };
        let auth = Arc::new(AuthConfig::from_settings(
            &settings.auth,
            services.oauth_exchanger,
            services.gssapi,
        )?);
        let bridge = Arc::new(Bridge::new(connector, settings.iris.pool_size));
        let translator = Arc::new(Translator::new(
            settings.translation.policy,
            settings.translation.cache_size,
        ));
        let listener = Listener::new(settings.listen_address())?;
        info!(address = %listener.address, auth_mode = %settings.auth.mode,
              tls = tls.is_some(), "server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Server {
            ctx: ConnContext {
                settings,
                translator,
                optimizer: Arc::new(VectorOptimizer::new()),
                auth,
                bridge,
                registry: Arc::new(CancelRegistry::new()),
                tls,
            },
            listener,
            next_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The port actually bound, for configs that use port 0.
    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// A handle that stops the accept loop and tells connections to wind
    /// down when triggered.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Accept until shutdown is signalled. Spawns one task per connection.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let sock = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                sock = self.listener.accept() => sock,
            };
            let Some(sock) = sock else {
                warn!("listener closed");
                return Ok(());
            };
            if let Err(e) = sock.set_nodelay(true) {
                debug!(%e, "could not set TCP_NODELAY");
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let ctx = self.ctx.clone();
            let conn_shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = ClientConn::run(id, sock, ctx, conn_shutdown).await {
                    debug!(id, %e, "connection task finished with error");
                }
            });
        }
    }
}
