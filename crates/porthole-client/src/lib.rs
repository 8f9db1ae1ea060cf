//! Client side of the tunnel: registers a domain, keeps a pool of
//! pre-opened tunnels to the server, and reverse-proxies dispatched
//! requests to a local target origin.

pub mod forward;
pub mod listener;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use porthole_core::bridge::{self, run_bridge, AcceptSignal, PacketSink, PacketSource};
use porthole_core::pool::MAX_WAITING;
use porthole_core::protocol::{
    RegisterRequest, RegisterResponse, HOST_HEADER, REGISTER_PATH, TOKEN_HEADER, TUNNEL_PATH,
    VERSION_HEADER,
};
use porthole_core::version::VERSION;
use porthole_core::{Result, TunnelError};

use crate::forward::Forwarder;
use crate::listener::TunnelListener;

/// Deadline on the registration call.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host, e.g. `porthole.example`.
    pub server: String,
    /// Server tunnel service port.
    pub server_port: u16,
    /// Domain to register.
    pub domain: String,
    /// CA certificate bundle to verify the server; system roots when
    /// absent.
    pub cert_file: Option<PathBuf>,
    /// Connect without transport security.
    pub insecure: bool,
}

/// A registered client, ready to open tunnels.
pub struct Client {
    config: ClientConfig,
    token: String,
    full_domain: String,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Client {
    /// Register `config.domain` at the server, with a 3-second deadline.
    pub async fn dial(config: ClientConfig) -> Result<Self> {
        let scheme = if config.insecure { "http" } else { "https" };
        let url = format!(
            "{scheme}://{}:{}{REGISTER_PATH}",
            config.server, config.server_port
        );

        let mut builder = reqwest::Client::builder();
        if let Some(path) = &config.cert_file {
            let pem = std::fs::read(path)
                .map_err(|e| TunnelError::Config(format!("could not read {}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TunnelError::Config(format!("certificates invalid: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| TunnelError::Config(e.to_string()))?;

        info!(domain = %config.domain, "registering");
        let resp = http
            .post(&url)
            .timeout(REGISTER_TIMEOUT)
            .header(VERSION_HEADER, VERSION)
            .json(&RegisterRequest {
                domain: config.domain.clone(),
            })
            .send()
            .await
            .map_err(|e| {
                TunnelError::Transport(format!("could not register {}: {e}", config.domain))
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(TunnelError::NameTaken(config.domain.clone()));
        }
        if !status.is_success() {
            return Err(TunnelError::Transport(format!(
                "could not register {}: server answered {status}",
                config.domain
            )));
        }

        let reg: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| TunnelError::Transport(format!("invalid register response: {e}")))?;
        info!(full_domain = %reg.full_domain, "registered");

        let tls = if config.insecure {
            None
        } else {
            Some(Arc::new(tls_config(config.cert_file.as_deref())?))
        };

        Ok(Self {
            config,
            token: reg.token,
            full_domain: reg.full_domain,
            tls,
        })
    }

    /// The domain as reachable through the server's public ingress,
    /// including a port when the ingress is not on 80.
    pub fn full_domain(&self) -> &str {
        &self.full_domain
    }

    /// Open the worker pool and reverse-proxy every dispatched request to
    /// `target`. Returns the first fatal tunnel error.
    pub async fn serve_proxy(self, target: &str) -> Result<()> {
        if target.is_empty() {
            return Err(TunnelError::Config("target not specified".into()));
        }
        let target = target
            .parse()
            .map_err(|e| TunnelError::Config(format!("target url invalid {target}: {e}")))?;
        self.serve(Forwarder::new(target)?).await
    }

    /// Open the worker pool and serve every dispatched request with
    /// `forwarder`.
    pub async fn serve(self, forwarder: Forwarder) -> Result<()> {
        // capacity 1: a bridge parks on its first-packet delivery until
        // the accept loop picks the tunnel up
        let (conn_tx, conn_rx) = mpsc::channel(1);

        let ws_scheme = if self.config.insecure { "ws" } else { "wss" };
        let tunneler = Arc::new(Tunneler {
            ws_url: format!(
                "{ws_scheme}://{}:{}{TUNNEL_PATH}",
                self.config.server, self.config.server_port
            ),
            domain: self.config.domain.clone(),
            token: self.token.clone(),
            tls: self.tls.clone(),
            conns: conn_tx,
        });

        let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(MAX_WAITING);
        for _ in 0..MAX_WAITING {
            tokio::spawn(worker(tunneler.clone(), err_tx.clone()));
        }

        let shutdown = CancellationToken::new();
        let listener = TunnelListener::new(conn_rx, shutdown.clone());
        info!(domain = %self.full_domain, "serving on http://{}/", self.full_domain);

        tokio::select! {
            res = accept_loop(listener, forwarder) => res,
            Some(err) = err_rx.recv() => {
                shutdown.cancel();
                Err(err)
            }
        }
    }
}

async fn accept_loop(mut listener: TunnelListener, forwarder: Forwarder) -> Result<()> {
    loop {
        let conn = listener.accept().await?;
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.serve_connection(conn).await {
                debug!("proxy connection ended: {e}");
            }
        });
    }
}

struct Tunneler {
    ws_url: String,
    domain: String,
    token: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    conns: mpsc::Sender<DuplexStream>,
}

/// One worker keeps one tunnel open at a time, reopening after each
/// termination. Connect failures and transport errors are surfaced on the
/// shared channel and end the worker; a pipe fault is local to the tunnel
/// it happened on, so the worker just opens the next one.
async fn worker(tunneler: Arc<Tunneler>, errors: mpsc::Sender<TunnelError>) {
    loop {
        match create_tunnel(&tunneler).await {
            Ok(()) => {}
            Err(TunnelError::Pipe(e)) => debug!("tunnel pipe failed: {e}"),
            Err(e) => {
                let _ = errors.send(e).await;
                return;
            }
        }
    }
}

/// Open one tunnel stream and bridge it until it terminates. `Ok` means
/// the stream ended cleanly after serving (or never receiving) a request.
async fn create_tunnel(tunneler: &Tunneler) -> Result<()> {
    debug!("create tunnel");
    let mut request = tunneler
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::Config(format!("server url invalid: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        HOST_HEADER,
        tunneler
            .domain
            .parse()
            .map_err(|_| TunnelError::Config(format!("domain invalid {}", tunneler.domain)))?,
    );
    headers.insert(
        TOKEN_HEADER,
        tunneler
            .token
            .parse()
            .map_err(|_| TunnelError::Unauthenticated)?,
    );

    let connector = tunneler.tls.clone().map(Connector::Rustls);
    let (socket, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(tunnel_open_error)?;

    let (p1, p2) = bridge::pipe();
    let (sink, stream) = socket.split();
    let mut tx = WsSink(sink);
    let mut rx = WsStream(stream);

    let accept = AcceptSignal::new(tunneler.conns.clone(), p2);
    let res = run_bridge(p1, &mut tx, &mut rx, Some(accept)).await;
    let _ = tx.0.close().await;
    debug!("tunnel closed");
    res
}

fn tunnel_open_error(e: tungstenite::Error) -> TunnelError {
    match e {
        tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TunnelError::Unauthenticated
        }
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::TOO_MANY_REQUESTS =>
        {
            TunnelError::Capacity(MAX_WAITING)
        }
        e => TunnelError::Transport(format!("could not create tunnel: {e}")),
    }
}

/// Trust roots for the tunnel connection: the given CA bundle, or the
/// system roots.
fn tls_config(cert_file: Option<&std::path::Path>) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    match cert_file {
        Some(path) => {
            let mut reader = BufReader::new(File::open(path).map_err(|e| {
                TunnelError::Config(format!("could not read {}: {e}", path.display()))
            })?);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| TunnelError::Config(format!("certificates invalid: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| TunnelError::Config(format!("certificates invalid: {e}")))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                // tolerate the occasional unparsable system certificate
                let _ = roots.add(cert);
            }
        }
    }
    if roots.is_empty() {
        return Err(TunnelError::Config(
            "no trusted root certificates".into(),
        ));
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

struct WsSink(SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>);

impl PacketSink for WsSink {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.0
            .send(Message::Binary(data))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }
}

struct WsStream(SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>);

impl PacketSource for WsStream {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.0.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
            }
        }
    }
}
