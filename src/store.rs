//! Durable lease storage.
//!
//! The store keeps two indexes, MAC → lease and IP → MAC, and persists the
//! full lease table as a JSON snapshot on every mutation. A snapshot is
//! written to a sibling temp file, synced, and renamed over the previous one,
//! so a crash leaves either the old or the new table on disk.
//!
//! Mutations are all-or-nothing: the next table is built on a copy, written
//! out, and only then swapped in. A failed write leaves memory untouched.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseState};
use crate::mac::MacAddress;

/// On-disk format of the lease file.
#[derive(Debug, Default, Deserialize)]
struct LeaseFile {
    #[serde(default)]
    leases: Vec<Lease>,
}

#[derive(Serialize)]
struct LeaseFileRef<'a> {
    leases: Vec<&'a Lease>,
}

/// Both indexes, always updated together.
#[derive(Debug, Clone, Default)]
struct Tables {
    by_mac: HashMap<MacAddress, Lease>,
    by_ip: HashMap<Ipv4Addr, MacAddress>,
}

impl Tables {
    /// Inserts `lease`, dropping this MAC's previous address and evicting any
    /// other MAC that held the same address. Returns the evicted lease.
    fn insert(&mut self, lease: Lease) -> Option<Lease> {
        if let Some(previous) = self.by_mac.get(&lease.mac)
            && previous.ip != lease.ip
        {
            self.by_ip.remove(&previous.ip);
        }

        let evicted = match self.by_ip.get(&lease.ip).copied() {
            Some(holder) if holder != lease.mac => self.by_mac.remove(&holder),
            _ => None,
        };

        self.by_ip.insert(lease.ip, lease.mac);
        self.by_mac.insert(lease.mac, lease);
        evicted
    }

    fn remove(&mut self, mac: &MacAddress) -> Option<Lease> {
        let lease = self.by_mac.remove(mac)?;
        self.by_ip.remove(&lease.ip);
        Some(lease)
    }
}

/// MAC- and IP-indexed lease table backed by a JSON file.
#[derive(Debug)]
pub struct LeaseStore {
    path: PathBuf,
    tables: Tables,
}

impl LeaseStore {
    /// Opens the store at `path`, loading existing leases if the file exists.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreIo`] if the file exists but cannot be read
    /// - [`Error::Json`] if it cannot be parsed
    /// - [`Error::StoreConsistency`] if it lists a MAC or an IP twice
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<LeaseFile>(&content)?,
            Err(error) if error.kind() == ErrorKind::NotFound => LeaseFile::default(),
            Err(source) => return Err(Error::StoreIo { path, source }),
        };

        let mut tables = Tables::default();
        for lease in file.leases {
            if tables.by_mac.contains_key(&lease.mac) {
                return Err(Error::StoreConsistency(format!(
                    "{} appears twice in {}",
                    lease.mac,
                    path.display()
                )));
            }
            if let Some(holder) = tables.by_ip.get(&lease.ip) {
                return Err(Error::StoreConsistency(format!(
                    "{} is recorded for both {} and {} in {}",
                    lease.ip,
                    holder,
                    lease.mac,
                    path.display()
                )));
            }
            tables.insert(lease);
        }

        debug!("Loaded {} lease(s) from {}", tables.by_mac.len(), path.display());

        Ok(Self { path, tables })
    }

    pub fn get_by_mac(&self, mac: &MacAddress) -> Option<&Lease> {
        self.tables.by_mac.get(mac)
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<&Lease> {
        self.tables
            .by_ip
            .get(&ip)
            .and_then(|mac| self.tables.by_mac.get(mac))
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.tables.by_mac.values()
    }

    pub fn len(&self) -> usize {
        self.tables.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.by_mac.is_empty()
    }

    /// Inserts or replaces the lease for `lease.mac`.
    ///
    /// A different MAC holding the same address is evicted, unless its lease
    /// is BOUND and unexpired.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreConsistency`] if the address is held by another MAC's
    ///   active BOUND lease
    /// - [`Error::StoreIo`] if the snapshot cannot be written
    pub async fn put(&mut self, lease: Lease) -> Result<()> {
        let now = Utc::now();
        if let Some(holder) = self.get_by_ip(lease.ip)
            && holder.mac != lease.mac
            && holder.state == LeaseState::Bound
            && !holder.is_expired_at(now)
        {
            return Err(Error::StoreConsistency(format!(
                "{} cannot take {}: bound to {}",
                lease.mac, lease.ip, holder.mac
            )));
        }

        self.force_put(lease).await.map(|_| ())
    }

    /// Inserts or replaces the lease for `lease.mac`, evicting whichever MAC
    /// holds the same address. Returns the evicted lease.
    pub async fn force_put(&mut self, lease: Lease) -> Result<Option<Lease>> {
        let mut next = self.tables.clone();
        let evicted = next.insert(lease);
        self.commit(next).await?;
        Ok(evicted)
    }

    /// Removes the lease held by `mac`. A missing lease is not an error.
    pub async fn delete_by_mac(&mut self, mac: &MacAddress) -> Result<Option<Lease>> {
        if !self.tables.by_mac.contains_key(mac) {
            return Ok(None);
        }

        let mut next = self.tables.clone();
        let removed = next.remove(mac);
        self.commit(next).await?;
        Ok(removed)
    }

    /// Removes several leases in one transaction.
    pub async fn delete_many(&mut self, macs: &[MacAddress]) -> Result<Vec<Lease>> {
        let mut next = self.tables.clone();
        let removed: Vec<Lease> = macs.iter().filter_map(|mac| next.remove(mac)).collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        self.commit(next).await?;
        Ok(removed)
    }

    async fn commit(&mut self, next: Tables) -> Result<()> {
        persist(&self.path, &next).await?;
        self.tables = next;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

async fn persist(path: &Path, tables: &Tables) -> Result<()> {
    let mut leases: Vec<&Lease> = tables.by_mac.values().collect();
    leases.sort_by_key(|lease| lease.ip);
    let content = serde_json::to_vec_pretty(&LeaseFileRef { leases })?;

    let store_error = |source: std::io::Error| Error::StoreIo {
        path: path.to_path_buf(),
        source,
    };

    let tmp_path = temp_path(path);
    let written = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(error) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(store_error(error));
    }

    sync_parent(path).await.map_err(store_error)
}

/// Flushes the directory entry so the rename survives a crash.
#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
