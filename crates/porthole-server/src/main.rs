use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::bail;

use porthole_server::{spawn_signal_handler, ServerConfig, TunnelServer};

#[derive(Parser)]
#[command(
    name = "porthole-server",
    version,
    about = "Public-ingress HTTP reverse tunnel server"
)]
struct Args {
    /// Tunnel service listen address
    #[arg(long, default_value = "0.0.0.0:49776")]
    listen: SocketAddr,

    /// HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:80")]
    http: SocketAddr,

    /// Server certificate file (PEM); with --key, serves the tunnel
    /// service over TLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Server certificate key file (PEM)
    #[arg(long)]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    // several TLS stacks in the dependency graph; pick one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "porthole_server=info,porthole_core=info,tower_http=info".into()
            }),
        )
        .init();

    let args = Args::parse();
    if args.cert.is_some() != args.key.is_some() {
        bail!("--cert and --key must be provided together");
    }

    let server = TunnelServer::bind(ServerConfig {
        tunnel_addr: args.listen,
        http_addr: args.http,
        cert_file: args.cert,
        key_file: args.key,
    })
    .await?;

    spawn_signal_handler(server.shutdown_token());
    server.serve().await
}
