//! Per-client option providers.
//!
//! A provider answers one question: which DHCP options should this MAC get?
//! Providers are chained in configured order. Each one sees the options
//! merged so far and may return more; later answers overwrite earlier ones
//! key by key.
//!
//! Besides plain DHCP option names, a few keys steer the handler instead of
//! ending up on the wire:
//!
//! - `yiaddr`: a fixed address for the client (static assignment)
//! - `ip_range`: the pool to allocate from
//! - `network`, `network_prefix`: pool hints that are recognized but unsupported

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::mac::MacAddress;

/// Option name → textual value.
pub type OptionMap = BTreeMap<String, String>;

/// Fixed address for the client.
pub const STATIC_ADDRESS_KEY: &str = "yiaddr";
/// Allocation pool in range text form.
pub const IP_RANGE_KEY: &str = "ip_range";
pub const NETWORK_KEY: &str = "network";
pub const NETWORK_PREFIX_KEY: &str = "network_prefix";
pub const SUBNET_MASK_KEY: &str = "subnet_mask";

/// A source of per-MAC option overrides.
#[async_trait]
pub trait OptionProvider: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns options for `mac`, or `None` for "no opinion".
    ///
    /// `accumulated` holds everything merged from earlier providers.
    async fn query_options(
        &self,
        mac: &MacAddress,
        accumulated: &OptionMap,
    ) -> Result<Option<OptionMap>>;
}

/// Fixed options from the configuration file.
///
/// Every client gets `defaults`; a client listed in `hosts` additionally gets
/// its own entries, which win over the defaults.
#[derive(Debug, Clone, Default)]
pub struct StaticTableProvider {
    defaults: OptionMap,
    hosts: BTreeMap<MacAddress, OptionMap>,
}

impl StaticTableProvider {
    pub fn new(defaults: OptionMap, hosts: BTreeMap<MacAddress, OptionMap>) -> Self {
        Self { defaults, hosts }
    }
}

#[async_trait]
impl OptionProvider for StaticTableProvider {
    fn name(&self) -> &str {
        "static_table"
    }

    async fn query_options(
        &self,
        mac: &MacAddress,
        _accumulated: &OptionMap,
    ) -> Result<Option<OptionMap>> {
        let mut options = self.defaults.clone();
        if let Some(host) = self.hosts.get(mac) {
            options.extend(host.iter().map(|(name, value)| (name.clone(), value.clone())));
        }
        Ok((!options.is_empty()).then_some(options))
    }
}

/// Options read from a directory of `name: value` files.
///
/// `default.conf` applies to everyone, then `<mac>.conf` (lowercase,
/// colon- or dash-separated) applies to one client. Files are re-read on
/// every query, so edits take effect without a restart.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    path: PathBuf,
}

impl DirectoryProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_optional(path: &Path) -> Result<Option<OptionMap>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                trace!("Reading options from {}", path.display());
                parse_option_lines(&content).map(Some).map_err(|error| match error {
                    Error::Config(message) => {
                        Error::Config(format!("{}: {}", path.display(), message))
                    }
                    other => other,
                })
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl OptionProvider for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    async fn query_options(
        &self,
        mac: &MacAddress,
        _accumulated: &OptionMap,
    ) -> Result<Option<OptionMap>> {
        let mut options = Self::read_optional(&self.path.join("default.conf"))
            .await?
            .unwrap_or_default();

        let colon = mac.to_string();
        let host = match Self::read_optional(&self.path.join(format!("{colon}.conf"))).await? {
            Some(host) => Some(host),
            None => {
                let dashed = colon.replace(':', "-");
                Self::read_optional(&self.path.join(format!("{dashed}.conf"))).await?
            }
        };
        if let Some(host) = host {
            options.extend(host);
        }

        Ok((!options.is_empty()).then_some(options))
    }
}

/// Never has an opinion. Useful as a placeholder in configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

#[async_trait]
impl OptionProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    async fn query_options(
        &self,
        _mac: &MacAddress,
        _accumulated: &OptionMap,
    ) -> Result<Option<OptionMap>> {
        Ok(None)
    }
}

/// Parses the `name: value` option file format.
///
/// Blank lines and lines starting with `#` are skipped. A name given more
/// than once has its values joined with a single space.
pub fn parse_option_lines(content: &str) -> Result<OptionMap> {
    let mut options = OptionMap::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::Config(format!("line {}: expected 'name: value'", index + 1))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config(format!("line {}: missing option name", index + 1)));
        }

        let value = value.trim();
        options
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push(' ');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Ok(options)
}

/// Ordered list of providers, merged last-writer-wins.
#[derive(Debug, Default)]
pub struct BackendChain {
    providers: Vec<Box<dyn OptionProvider>>,
}

impl BackendChain {
    pub fn new(providers: Vec<Box<dyn OptionProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(configs: &[BackendConfig]) -> Self {
        let providers = configs
            .iter()
            .map(|config| -> Box<dyn OptionProvider> {
                match config {
                    BackendConfig::StaticTable { defaults, hosts } => Box::new(
                        StaticTableProvider::new(defaults.clone(), hosts.clone()),
                    ),
                    BackendConfig::Directory { path } => Box::new(DirectoryProvider::new(path)),
                    BackendConfig::Noop => Box::new(NoopProvider),
                }
            })
            .collect();
        Self::new(providers)
    }

    /// Queries every provider in order and merges their answers.
    ///
    /// # Errors
    ///
    /// The first provider failure aborts the query.
    pub async fn query(&self, mac: &MacAddress) -> Result<OptionMap> {
        let mut merged = OptionMap::new();

        for provider in &self.providers {
            match provider.query_options(mac, &merged).await? {
                Some(options) if !options.is_empty() => {
                    debug!(
                        "Backend {} supplied {} option(s) for {}",
                        provider.name(),
                        options.len(),
                        mac
                    );
                    merged.extend(options);
                }
                _ => {}
            }
        }

        Ok(merged)
    }
}
