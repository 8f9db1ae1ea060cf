//! Local reverse proxy: serves HTTP on each dispatched virtual connection
//! and forwards every request to the single configured target origin.

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::DuplexStream;

use porthole_core::{Result, TunnelError};

#[derive(Clone)]
pub struct Forwarder {
    client: HyperClient<HttpConnector, Incoming>,
    target: Uri,
}

impl Forwarder {
    pub fn new(target: Uri) -> Result<Self> {
        if target.scheme_str() != Some("http") || target.authority().is_none() {
            return Err(TunnelError::Config(format!("target url invalid {target}")));
        }
        Ok(Self {
            client: HyperClient::builder(TokioExecutor::new()).build_http(),
            target,
        })
    }

    /// Serve HTTP/1.1 on one virtual connection until the peer closes it.
    pub async fn serve_connection(&self, conn: DuplexStream) -> Result<()> {
        let forwarder = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let forwarder = forwarder.clone();
            async move { forwarder.forward(req).await }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .await
            .map_err(|e| TunnelError::Transport(format!("could not serve reverse proxy: {e}")))
    }

    /// Rewrite the request onto the target origin, keeping the inbound
    /// `Host` header and path, and relay it.
    async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Incoming>, TunnelError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());

        let prefix = self.target.path().trim_end_matches('/');
        let uri: Uri = format!(
            "http://{}{prefix}{path_and_query}",
            self.target
                .authority()
                .map(|authority| authority.as_str())
                .unwrap_or_default()
        )
        .parse()
        .map_err(|e| TunnelError::Config(format!("target url invalid: {e}")))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;

        for name in &[
            hyper::header::CONNECTION,
            hyper::header::PROXY_AUTHENTICATE,
            hyper::header::PROXY_AUTHORIZATION,
            hyper::header::TE,
            hyper::header::TRAILER,
            hyper::header::TRANSFER_ENCODING,
        ] {
            parts.headers.remove(name);
        }
        parts.headers.remove("keep-alive");

        self.client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| TunnelError::Transport(format!("could not reach target: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_targets_without_scheme_or_authority() {
        assert!(Forwarder::new(Uri::from_static("localhost:8080")).is_err());
        assert!(Forwarder::new(Uri::from_static("/just/a/path")).is_err());
        assert!(Forwarder::new(Uri::from_static("https://localhost:8080")).is_err());
        assert!(Forwarder::new(Uri::from_static("http://localhost:8080")).is_ok());
    }
}
