use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::{DistributionMode, PartyEndpoint};
use crate::error::{Error, Result};
use crate::share::Party;
use crate::tls::TlsFiles;
use crate::transport::RetryPolicy;

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE: &str = "conf.toml";

/// The 256-bit prime 2^255 - 19, used when no prime is configured.
pub fn default_prime() -> BigUint {
    (BigUint::one() << 255u32) - BigUint::from(19u32)
}

/// Mutual-TLS settings shared by the coordinator and every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Directory holding `<name>_cert.pem`, `<name>_key.pem` and `ca_cert.pem`.
    pub cert_dir: PathBuf,
    /// Name every peer certificate is verified against.
    pub server_name: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            enabled: false,
            cert_dir: PathBuf::from("certs"),
            server_name: "localhost".to_string(),
        }
    }
}

/// Deployment settings for a coordinator and its compute nodes.
///
/// Values come from `<dir>/conf.toml`, overridden by `SMPC_*` environment variables. Nested keys
/// use a double underscore, e.g. `SMPC_TLS__ENABLED=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmpcConfig {
    /// Address the coordinator listens on for partial sums.
    pub coordinator: SocketAddr,
    pub parties: usize,
    pub threshold: usize,
    /// Party `i` listens on `base_port + i`.
    pub base_port: u16,
    /// Host the coordinator dials to reach the parties.
    pub party_host: IpAddr,
    /// Host a node binds to.
    pub listen_host: IpAddr,
    /// Field prime in decimal. Defaults to 2^255 - 19.
    pub prime: Option<String>,
    pub mode: DistributionMode,
    pub retry_delay_ms: u64,
    /// `None` retries until shutdown.
    pub max_attempts: Option<usize>,
    /// Sled database for stored shares; in-memory when unset.
    pub db_path: Option<String>,
    pub tls: TlsSettings,
}

impl Default for SmpcConfig {
    fn default() -> Self {
        SmpcConfig {
            coordinator: SocketAddr::from(([127, 0, 0, 1], 9000)),
            parties: 3,
            threshold: 2,
            base_port: 8000,
            party_host: IpAddr::from([127, 0, 0, 1]),
            listen_host: IpAddr::from([0, 0, 0, 0]),
            prime: None,
            mode: DistributionMode::Stateless,
            retry_delay_ms: 1000,
            max_attempts: None,
            db_path: None,
            tls: TlsSettings::default(),
        }
    }
}

impl SmpcConfig {
    /// Loads the configuration from `dir`, writing a default `conf.toml` there first if none
    /// exists.
    ///
    /// # Arguments
    ///
    /// * `dir` - The configuration directory, created if missing.
    ///
    /// # Returns
    ///
    /// The merged configuration, or `Error::Config` if the file or an environment override
    /// cannot be parsed.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = SmpcConfig::new(".smpc")?;
    /// let endpoints = config.party_endpoints()?;
    /// ```
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        }

        let conf_file = dir.join(CONFIG_FILE);
        if !conf_file.exists() {
            let toml = toml::to_string_pretty(&SmpcConfig::default())
                .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
            fs::write(&conf_file, toml).map_err(|err| ConfigError::Foreign(Box::new(err)))?;
            debug!("📝 Wrote default config to {:?}", conf_file);
        }

        debug!("📝 Loaded config at path: {:?}", conf_file);
        let settings = Config::builder()
            .add_source(File::from(conf_file))
            // Eg.. `SMPC_THRESHOLD=3 ./target/smpc-controller` would set the `threshold` key
            .add_source(
                Environment::with_prefix("SMPC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parses the configured prime, falling back to [`default_prime`].
    pub fn prime(&self) -> Result<BigUint> {
        match &self.prime {
            Some(decimal) => decimal
                .trim()
                .parse::<BigUint>()
                .map_err(|err| Error::Validation(format!("invalid prime {decimal:?}: {err}"))),
            None => Ok(default_prime()),
        }
    }

    /// Address node `party_id` listens on.
    pub fn party_listen_addr(&self, party_id: u32) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.listen_host, self.party_port(party_id)?))
    }

    /// Where the coordinator reaches parties `1..=parties`.
    pub fn party_endpoints(&self) -> Result<Vec<PartyEndpoint>> {
        (1..=self.parties as u32)
            .map(|id| {
                Ok(PartyEndpoint {
                    party: Party::new(id),
                    addr: SocketAddr::new(self.party_host, self.party_port(id)?),
                })
            })
            .collect()
    }

    pub fn tls_files(&self, name: &str) -> TlsFiles {
        TlsFiles::in_dir(&self.tls.cert_dir, name)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(self.retry_delay_ms),
            max_attempts: self.max_attempts,
        }
    }

    fn party_port(&self, party_id: u32) -> Result<u16> {
        u16::try_from(party_id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "party {party_id} has no port above base port {}",
                    self.base_port
                ))
            })
    }
}
