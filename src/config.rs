use crate::fabric::FabricConfig;
use crate::oob::{Role, DEFAULT_PORT};
use crate::progress::PollPolicy;
use std::time::Duration;

pub const ENV_PORT: &str = "RDM_OOB_PORT";
pub const ENV_TIMEOUT_MS: &str = "RDM_OOB_TIMEOUT_MS";
pub const ENV_PROVIDER: &str = "RDM_OOB_PROVIDER";

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Settings for one run of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Local address to listen on, and to reach the fabric endpoint at.
    pub src_addr: Option<String>,
    /// The peer to connect to. Its presence makes this side the connector.
    pub dst_addr: Option<String>,
    pub port: u16,
    /// Pause after connecting, before the first control message.
    pub settle_delay: Duration,
    pub poll: PollPolicy,
    pub fabric: FabricConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            src_addr: None,
            dst_addr: None,
            port: DEFAULT_PORT,
            settle_delay: Duration::from_secs(1),
            poll: PollPolicy::default(),
            fabric: FabricConfig::default(),
        }
    }
}

impl Config {
    #[inline]
    pub fn role(&self) -> Role {
        Role::from_destination(self.dst_addr.as_deref())
    }

    /// Overrides settings from the `RDM_OOB_*` variables `lookup` knows about.
    ///
    /// A timeout of 0 means waits are unbounded.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_PORT) {
            self.port = parse(ENV_PORT, value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            let ms: u64 = parse(ENV_TIMEOUT_MS, value)?;
            self.poll.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(value) = lookup(ENV_PROVIDER) {
            if value.is_empty() {
                return Err(ConfigError {
                    var: ENV_PROVIDER,
                    value,
                });
            }
            self.fabric.provider = value;
        }
        Ok(())
    }

    /// [`Config::apply_env`] against the process environment.
    pub fn with_env(self) -> Result<Config, ConfigError> {
        let mut config = self;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { var, value })
}
