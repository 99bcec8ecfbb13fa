use clap::{crate_version, Parser};

use num_bigint::BigUint;
use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use smpcnet::config::SmpcConfig;
use smpcnet::coordinator::{computation_id, Coordinator, CoordinatorParams, DistributionMode};
use smpcnet::tls::TlsContext;
use smpcnet::transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "smpc-controller")]
#[command(version = crate_version!())]
#[command(
    about = "SMPC coordinator - sums private inputs across compute parties",
    long_about = "Shares each secret among the compute parties with Shamir's Secret Sharing, waits for a threshold of parties to report their local sums and reconstructs the total. No party ever sees an input. Parties that are not up yet are retried every retry_delay_ms until they answer. In stored mode shares are stored on every party before any party is asked to compute."
)]
struct Opt {
    /// Secrets to sum, in decimal.
    #[clap(required = true)]
    secrets: Vec<BigUint>,

    /// Number of parties; overrides conf.toml.
    #[clap(long, short)]
    parties: Option<usize>,

    /// Share threshold; overrides conf.toml.
    #[clap(long, short)]
    threshold: Option<usize>,

    /// Computation id; a random one is generated if omitted.
    #[clap(long)]
    computation_id: Option<String>,

    #[clap(long, short, value_enum)]
    mode: Option<DistributionMode>,

    /// Directory holding conf.toml; created with defaults if missing.
    #[clap(long, short, default_value = ".smpc")]
    config_dir: String,

    /// Clear the computation on every party once the result is known.
    #[clap(long, short)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();
    let mut config = SmpcConfig::new(&opt.config_dir)?;
    if let Some(parties) = opt.parties {
        config.parties = parties;
    }
    if let Some(threshold) = opt.threshold {
        config.threshold = threshold;
    }
    if let Some(mode) = opt.mode {
        config.mode = mode;
    }
    debug!("Using config: {:?}", config);

    let transport = if config.tls.enabled {
        let files = config.tls_files("Controller");
        Transport::tls(TlsContext::load(&files, &config.tls.server_name)?)
    } else {
        Transport::plain()
    };

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            ctrl_c.cancel();
        }
    });

    let coordinator = Arc::new(Coordinator::new(
        CoordinatorParams {
            threshold: config.threshold,
            parties: config.party_endpoints()?,
            prime: config.prime()?,
            mode: config.mode,
            retry: config.retry_policy(),
        },
        transport,
        shutdown.clone(),
    )?);
    let listener = coordinator.start_listener(config.coordinator).await?;

    let id = opt.computation_id.unwrap_or_else(computation_id);
    let result = coordinator.run(&id, &opt.secrets).await?;
    println!("Computation {id}: sum = {result}");

    if opt.reset {
        coordinator.reset(&id).await?;
    }

    shutdown.cancel();
    listener.join().await?;
    Ok(())
}
