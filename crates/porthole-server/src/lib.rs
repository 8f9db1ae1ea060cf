pub mod proxy;
pub mod tls;
pub mod tunnel;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use porthole_core::recycle;
use porthole_core::registry::Registry;

type Result<T> = color_eyre::Result<T>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Tunnel service listen address (registration + tunnel streams).
    pub tunnel_addr: SocketAddr,
    /// Public HTTP ingress listen address.
    pub http_addr: SocketAddr,
    /// PEM certificate chain; together with `key_file`, serves the tunnel
    /// service over TLS.
    pub cert_file: Option<PathBuf>,
    /// PEM private key for `cert_file`.
    pub key_file: Option<PathBuf>,
}

/// A bound but not yet running tunnel server. Listen ports are final
/// after [`TunnelServer::bind`], including any bound as port 0.
pub struct TunnelServer {
    registry: Arc<Registry>,
    candidates: mpsc::Receiver<String>,
    tunnel_listener: TcpListener,
    http_listener: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let tls = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => Some(tls::acceptor(cert, key)?),
            (None, None) => None,
            _ => color_eyre::eyre::bail!("TLS requires both a certificate and a key file"),
        };

        let tunnel_listener = TcpListener::bind(config.tunnel_addr).await?;
        let http_listener = TcpListener::bind(config.http_addr).await?;

        let public_port = http_listener.local_addr()?.port();
        let (registry, candidates) = Registry::new(public_port);

        Ok(Self {
            registry,
            candidates,
            tunnel_listener,
            http_listener,
            tls,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn tunnel_addr(&self) -> Result<SocketAddr> {
        Ok(self.tunnel_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the recycler, the tunnel service and the public ingress until
    /// one of them fails or the shutdown token fires.
    pub async fn serve(self) -> Result<()> {
        let TunnelServer {
            registry,
            candidates,
            tunnel_listener,
            http_listener,
            tls,
            shutdown,
        } = self;

        tokio::spawn(recycle::run(registry.clone(), candidates));

        let tunnel_router = tunnel::router(registry.clone());
        let ingress_router = proxy::router(registry);

        info!(
            addr = %tunnel_listener.local_addr()?,
            tls = tls.is_some(),
            "tunnel service listening"
        );
        info!(addr = %http_listener.local_addr()?, "http ingress listening");

        // stopping is abrupt: once the token fires the listeners go away
        // and in-flight requests die with the process
        let tunnel_shutdown = shutdown.clone();
        let tunnel_service = async move {
            match tls {
                Some(acceptor) => {
                    tls::serve(tunnel_listener, acceptor, tunnel_router, tunnel_shutdown).await
                }
                None => {
                    tokio::select! {
                        _ = tunnel_shutdown.cancelled() => Ok(()),
                        served = axum::serve(tunnel_listener, tunnel_router).into_future() => {
                            served?;
                            Ok(())
                        }
                    }
                }
            }
        };

        let ingress = async move {
            tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                served = axum::serve(http_listener, ingress_router).into_future() => {
                    served?;
                    Ok(())
                }
            }
        };

        tokio::try_join!(tunnel_service, ingress)?;
        Ok(())
    }
}

/// Cancel the token on the first termination signal. Listeners stop as
/// soon as the token fires; in-flight requests are not drained.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, stopping listeners");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("could not watch SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
