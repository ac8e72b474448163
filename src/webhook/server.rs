//! Webhook server

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::admission::AdmissionHandler;
use super::router::{MetricsState, metrics_router, webhook_router};
use crate::config::Config;
use crate::metrics::MetricsExporter;
use crate::namespace_cache::{KubeNamespaceSource, NamespacePolicyCache};
use crate::tls::{self, CaInjector, CertificateSource, CertificateStore, CertificateWatcher};
use crate::{Error, Result};

/// The admission webhook process: certificate watcher, metrics server and
/// the TLS webhook listener.
pub struct WebhookServer {
    config: Config,
}

impl WebhookServer {
    /// Create a server from validated configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Fails if no valid certificate becomes active within the startup
    /// timeout, if the Kubernetes client cannot be built, or if a listener
    /// cannot bind.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let webhook_addr = socket_addr(&config.server.host, config.server.port)?;

        let (shutdown_tx, _) = broadcast::channel(1);

        let store = Arc::new(CertificateStore::new());
        let source: Arc<dyn CertificateSource> =
            Arc::from(tls::source::from_config(&config.tls.source).await?);
        let watcher = CertificateWatcher::new(
            source,
            Arc::clone(&store),
            config.tls.poll_interval,
            config.tls.debounce,
        );
        tokio::spawn(watcher.run(shutdown_tx.subscribe()));

        // probes must answer while the certificate is still pending
        if config.metrics.enabled {
            let exporter = MetricsExporter::install()?;
            let state = MetricsState {
                exporter: Some(exporter),
                store: Arc::clone(&store),
            };
            let addr = socket_addr(&config.metrics.host, config.metrics.port)?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, path = %config.metrics.path, "Serving metrics server");
            let app = metrics_router(state, &config.metrics.path);
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    error!(error = %e, "Metrics server failed");
                }
            });
        }

        let bundle = store.wait_active(config.tls.startup_timeout).await?;
        info!(
            generation = bundle.generation(),
            fingerprint = %bundle.fingerprint(),
            "Serving certificate ready"
        );

        let client = Client::try_default().await?;

        if config.ca_injection.enabled {
            let injector =
                CaInjector::new(client.clone(), &config.ca_injection.webhook_configuration);
            tokio::spawn(injector.run(Arc::clone(&store), shutdown_tx.subscribe()));
        }

        let cache = Arc::new(NamespacePolicyCache::new(
            Arc::new(KubeNamespaceSource::new(client)),
            config.policy.namespace_label_key.clone(),
            config.policy.namespace_label_value.clone(),
            config.namespace_cache.ttl,
        ));
        let handler = Arc::new(AdmissionHandler::new(
            cache,
            config.policy.affinity_policy(),
            config.policy.failure_policy,
            config.server.admission_deadline,
        ));
        let app = webhook_router(
            handler,
            &config.server.webhook_path,
            config.server.max_body_size,
        );

        let server_config = tls::server_config(Arc::clone(&store))?;
        let rustls_config = RustlsConfig::from_config(Arc::new(server_config));

        let handle = Handle::new();
        {
            let handle = handle.clone();
            let shutdown_tx = shutdown_tx.clone();
            let grace = config.server.shutdown_timeout;
            tokio::spawn(async move {
                shutdown_signal(shutdown_tx).await;
                handle.graceful_shutdown(Some(grace));
            });
        }

        info!(
            addr = %webhook_addr,
            path = %config.server.webhook_path,
            worker_pool = %config.policy.worker_pool,
            "Serving admission webhook"
        );
        axum_server::bind_rustls(webhook_addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| Error::Tls(format!("webhook server: {e}")))?;

        // listener closed without a signal
        let _ = shutdown_tx.send(());
        info!("Webhook server stopped");
        Ok(())
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    Ok(SocketAddr::new(
        host.parse()
            .map_err(|e| Error::Config(format!("Invalid host '{host}': {e}")))?,
        port,
    ))
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
pub async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
