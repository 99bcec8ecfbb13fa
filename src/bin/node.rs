use clap::{crate_version, Parser};

use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use smpcnet::config::SmpcConfig;
use smpcnet::node::{ComputeNode, NodeServer};
use smpcnet::repository::dao;
use smpcnet::tls::TlsContext;
use smpcnet::transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "smpc-node")]
#[command(version = crate_version!())]
#[command(
    about = "SMPC compute party",
    long_about = "Runs one compute party of the summation network. The party listens on base_port + party-id, sums the shares the coordinator sends it and reports the partial sum back. Shares sent for the store-then-compute flow are kept in memory by default, or in a sled database when --db-path is set. Set tls.enabled in conf.toml to require mutual TLS; the party then loads Party_<letter>_cert.pem, Party_<letter>_key.pem and ca_cert.pem from tls.cert_dir."
)]
struct Opt {
    /// Party id, starting at 1.
    #[clap(long, short)]
    party_id: u32,

    /// Directory holding conf.toml; created with defaults if missing.
    #[clap(long, short, default_value = ".smpc")]
    config_dir: String,

    /// use embedded database for persistence
    /// otherwise use memory database
    #[clap(long, short)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();
    let config = SmpcConfig::new(&opt.config_dir)?;
    debug!("Using config: {:?}", config);

    let node = ComputeNode::new(opt.party_id)?;
    let transport = if config.tls.enabled {
        let files = config.tls_files(node.name());
        Transport::tls(TlsContext::load(&files, &config.tls.server_name)?)
    } else {
        Transport::plain()
    };
    let store = dao(opt.db_path.as_deref().or(config.db_path.as_deref()))?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            ctrl_c.cancel();
        }
    });

    let addr = config.party_listen_addr(opt.party_id)?;
    let server = Arc::new(NodeServer::new(
        node,
        store,
        config.coordinator,
        transport,
        config.retry_policy(),
        shutdown,
    ));
    let listener = server.serve(addr).await?;
    listener.join().await?;
    Ok(())
}
