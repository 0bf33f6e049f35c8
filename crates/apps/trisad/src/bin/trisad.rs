use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use trisa_node::{logging, NodeConfig, NodeError, Server};

#[derive(Parser, Debug)]
#[command(name = "trisad", version, about = "TRISA compliance node")]
struct Args {
    /// TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Listen address, overrides `bind_addr`.
    #[arg(long, short = 'a')]
    addr: Option<String>,
    /// PEM bundle with the node certificate chain and private key.
    #[arg(long)]
    certs: Option<PathBuf>,
    /// PEM bundle of trusted issuers.
    #[arg(long)]
    pool: Option<PathBuf>,
    /// Report MAINTENANCE from the status endpoint.
    #[arg(long)]
    maintenance: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("trisad: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), NodeError> {
    let mut config = match args.config {
        Some(path) => NodeConfig::from_path(path)?,
        None => NodeConfig::default(),
    };
    if let Some(addr) = args.addr {
        config.bind_addr = addr;
    }
    if let Some(certs) = args.certs {
        config.server_certs = certs;
    }
    if let Some(pool) = args.pool {
        config.server_cert_pool = pool;
    }
    config.maintenance |= args.maintenance;
    config.validate()?;

    logging::init(config.log_filter()?, config.console_log)?;
    let server = Arc::new(Server::new(config)?);
    server.serve().await
}
