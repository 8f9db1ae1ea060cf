use std::path::PathBuf;

use clap::Parser;

use porthole_client::{Client, ClientConfig};
use porthole_core::protocol::DEFAULT_TUNNEL_PORT;

#[derive(Parser)]
#[command(
    name = "porthole",
    version,
    about = "Expose a local HTTP service through a porthole tunnel server"
)]
struct Args {
    /// Domain you would like to use, e.g. myapp.porthole.example
    #[arg(long)]
    domain: String,

    /// Server address, e.g. porthole.example
    #[arg(long)]
    server: String,

    /// Server tunnel service port
    #[arg(long, default_value_t = DEFAULT_TUNNEL_PORT)]
    server_port: u16,

    /// Forward target, e.g. http://localhost:8080
    #[arg(long)]
    target: String,

    /// CA certificate file to verify the server (default: system roots)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Allow connections to the server without transport security
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    // several TLS stacks in the dependency graph; pick one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "porthole=info,porthole_client=info,porthole_core=info".into()
            }),
        )
        .init();

    let args = Args::parse();
    let client = Client::dial(ClientConfig {
        server: args.server,
        server_port: args.server_port,
        domain: args.domain,
        cert_file: args.cert,
        insecure: args.insecure,
    })
    .await?;

    client.serve_proxy(&args.target).await?;
    Ok(())
}
