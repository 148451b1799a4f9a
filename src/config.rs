use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::backend::{
    IP_RANGE_KEY, NETWORK_KEY, NETWORK_PREFIX_KEY, OptionMap, STATIC_ADDRESS_KEY,
};
use crate::error::{Error, Result};
use crate::mac::MacAddress;
use crate::options::DhcpOption;
use crate::range::AddressRangeCollection;

fn default_offer_timeout_seconds() -> u32 {
    60
}

fn default_sweep_interval_seconds() -> Option<u64> {
    Some(300)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identifier (option 54) and `siaddr` of every reply.
    pub server_ip: Ipv4Addr,
    /// Linux only: bind the socket to this device (`SO_BINDTODEVICE`).
    #[serde(default)]
    pub listen_interface: Option<String>,
    /// Windows only: send through this interface (`IP_UNICAST_IF`).
    #[serde(default)]
    pub interface_index: Option<u32>,
    pub leases_file: PathBuf,
    pub lease_duration_seconds: u32,
    #[serde(default = "default_offer_timeout_seconds")]
    pub offer_timeout_seconds: u32,
    /// `null` disables the periodic expiry sweep.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: Option<u64>,
    /// Option providers, queried in order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    StaticTable {
        #[serde(default)]
        defaults: OptionMap,
        #[serde(default)]
        hosts: BTreeMap<MacAddress, OptionMap>,
    },
    Directory {
        path: PathBuf,
    },
    Noop,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = [
            (IP_RANGE_KEY, "192.168.1.100-192.168.1.200"),
            ("subnet_mask", "255.255.255.0"),
            ("router", "192.168.1.1"),
            ("domain_name_server", "8.8.8.8 8.8.4.4"),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            listen_interface: None,
            interface_index: None,
            leases_file: PathBuf::from("leases.json"),
            lease_duration_seconds: 86400,
            offer_timeout_seconds: default_offer_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            backends: vec![BackendConfig::StaticTable {
                defaults,
                hosts: BTreeMap::new(),
            }],
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_seconds == 0 {
            return Err(Error::Config(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::Config(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.offer_timeout_seconds >= self.lease_duration_seconds {
            return Err(Error::Config(
                "offer_timeout_seconds must be less than lease_duration_seconds".to_string(),
            ));
        }

        if self.sweep_interval_seconds == Some(0) {
            return Err(Error::Config(
                "sweep_interval_seconds must be greater than 0 (use null to disable)".to_string(),
            ));
        }

        for backend in &self.backends {
            let BackendConfig::StaticTable { defaults, hosts } = backend else {
                continue;
            };

            self.validate_options(defaults)
                .map_err(|error| Error::Config(format!("static_table defaults: {}", error)))?;
            for (mac, options) in hosts {
                self.validate_options(options)
                    .map_err(|error| Error::Config(format!("static_table host {}: {}", mac, error)))?;
            }
        }

        Ok(())
    }

    fn validate_options(&self, options: &OptionMap) -> Result<()> {
        for (name, value) in options {
            match name.as_str() {
                IP_RANGE_KEY => {
                    let pool = AddressRangeCollection::parse(value)?;
                    if pool.contains(self.server_ip) {
                        return Err(Error::Config(format!(
                            "server_ip {} must not be within ip_range {}",
                            self.server_ip, pool
                        )));
                    }
                }
                STATIC_ADDRESS_KEY => {
                    value.trim().parse::<Ipv4Addr>().map_err(|_| {
                        Error::Config(format!("invalid {} {:?}", STATIC_ADDRESS_KEY, value))
                    })?;
                }
                NETWORK_KEY | NETWORK_PREFIX_KEY => {}
                _ => {
                    DhcpOption::from_named(name, value)?;
                }
            }
        }
        Ok(())
    }
}
