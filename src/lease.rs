//! Lease records and the allocation engine.
//!
//! [`LeaseAllocator`] decides which address a client gets and drives the
//! OFFERED → BOUND → (released) lifecycle on top of the durable
//! [`LeaseStore`]. It owns no pool of its own: every call receives the
//! client's [`AddressRangeCollection`], which is derived per request from
//! backend options.
//!
//! # Allocation order
//!
//! 1. A static assignment for the MAC, regardless of pool membership
//! 2. The MAC's existing unexpired lease, if still inside the pool
//! 3. The client's requested address, if inside the pool and available
//! 4. The lowest available address in the pool
//!
//! An address is available to a MAC when nobody holds it, the MAC itself
//! holds it, or the holder's lease has expired.

use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mac::MacAddress;
use crate::range::{AddressRange, AddressRangeCollection};
use crate::store::LeaseStore;

/// Where a lease is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Reserved for the client after a DISCOVER, awaiting its REQUEST.
    Offered,
    /// Confirmed by a REQUEST/ACK exchange.
    Bound,
    /// Given back by the client. Only seen on values returned from
    /// [`LeaseAllocator::release`]; the store never holds a released lease.
    Released,
}

/// A binding of one MAC to one IPv4 address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub state: LeaseState,
    pub offered_at: DateTime<Utc>,
    /// `None` for static assignments, which never expire.
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub static_binding: bool,
}

impl Lease {
    /// A fresh OFFERED lease that lapses after `offer_ttl_seconds`.
    pub fn offered(mac: MacAddress, ip: Ipv4Addr, offer_ttl_seconds: u32, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            ip,
            state: LeaseState::Offered,
            offered_at: now,
            expires_at: Some(now + TimeDelta::seconds(i64::from(offer_ttl_seconds))),
            static_binding: false,
        }
    }

    /// A static BOUND lease with no expiry.
    pub fn fixed(mac: MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            ip,
            state: LeaseState::Bound,
            offered_at: now,
            expires_at: None,
            static_binding: true,
        }
    }

    /// Moves the lease to BOUND for `lease_time_seconds` from `now`.
    ///
    /// Static leases stay BOUND with no expiry.
    pub fn bind(mut self, lease_time_seconds: u32, now: DateTime<Utc>) -> Self {
        self.state = LeaseState::Bound;
        if !self.static_binding {
            self.expires_at = Some(now + TimeDelta::seconds(i64::from(lease_time_seconds)));
        }
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Returns true if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Seconds left before expiry, clamped at zero. `None` means never.
    pub fn remaining_seconds(&self) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - Utc::now()).num_seconds().max(0))
    }
}

/// Address allocation and lease lifecycle on top of a [`LeaseStore`].
///
/// Not internally synchronized. The server drives it from a single task, so
/// each operation runs to completion before the next begins.
#[derive(Debug)]
pub struct LeaseAllocator {
    store: LeaseStore,
    offer_ttl_seconds: u32,
}

impl LeaseAllocator {
    pub fn new(store: LeaseStore, offer_ttl_seconds: u32) -> Self {
        Self {
            store,
            offer_ttl_seconds,
        }
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    fn is_available(&self, ip: Ipv4Addr, mac: &MacAddress, now: DateTime<Utc>) -> bool {
        match self.store.get_by_ip(ip) {
            None => true,
            Some(lease) => lease.mac == *mac || lease.is_expired_at(now),
        }
    }

    /// Picks an address for `mac` from `pool` and records it as OFFERED.
    ///
    /// A static lease short-circuits: its address is returned as-is, even
    /// outside `pool`, and the lease stays BOUND.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] if no address in `pool` is available
    /// - [`Error::StoreIo`] if the offer cannot be persisted
    pub async fn allocate(
        &mut self,
        pool: &AddressRangeCollection,
        mac: &MacAddress,
        requested_ip: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let now = Utc::now();

        if let Some(lease) = self.store.get_by_mac(mac) {
            if lease.static_binding {
                return Ok(lease.ip);
            }
            if !lease.is_expired_at(now) && pool.contains(lease.ip) {
                let ip = lease.ip;
                return self.offer(mac, ip, now).await;
            }
        }

        if let Some(ip) = requested_ip
            && pool.contains(ip)
            && self.is_available(ip, mac, now)
        {
            return self.offer(mac, ip, now).await;
        }

        let mut candidate = pool.ranges().first().map(AddressRange::start);
        while let Some(ip) = candidate {
            if self.is_available(ip, mac, now) {
                return self.offer(mac, ip, now).await;
            }
            candidate = pool.first_address_after(ip);
        }
        Err(Error::PoolExhausted)
    }

    async fn offer(&mut self, mac: &MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> Result<Ipv4Addr> {
        self.store
            .put(Lease::offered(*mac, ip, self.offer_ttl_seconds, now))
            .await?;
        debug!("Offered {} to {}", ip, mac);
        Ok(ip)
    }

    /// Records a static assignment of `ip` to `mac`.
    ///
    /// Any other MAC holding `ip` loses its lease, active or not. Repeating
    /// an assignment that is already on record writes nothing.
    pub async fn reallocate_static(&mut self, ip: Ipv4Addr, mac: &MacAddress) -> Result<()> {
        let now = Utc::now();

        if let Some(lease) = self.store.get_by_mac(mac)
            && lease.static_binding
            && lease.ip == ip
        {
            return Ok(());
        }

        if let Some(holder) = self.store.get_by_ip(ip)
            && holder.mac != *mac
            && !holder.is_expired_at(now)
        {
            warn!(
                "Static assignment of {} to {} overrides lease held by {}",
                ip, mac, holder.mac
            );
        }

        self.store.force_put(Lease::fixed(*mac, ip, now)).await?;
        debug!("Static assignment {} -> {}", mac, ip);
        Ok(())
    }

    /// Confirms that `ip` is `mac`'s and marks the lease BOUND for
    /// `lease_time_seconds`.
    ///
    /// Expiry is not checked: a lapsed offer is still confirmed as long as no
    /// one else has taken the address in the meantime.
    ///
    /// # Errors
    ///
    /// - [`Error::LeaseMismatch`] if `ip` has no lease or belongs to another MAC
    /// - [`Error::StoreIo`] if the binding cannot be persisted
    pub async fn confirm(
        &mut self,
        ip: Ipv4Addr,
        mac: &MacAddress,
        lease_time_seconds: u32,
    ) -> Result<Lease> {
        let lease = match self.store.get_by_ip(ip) {
            Some(lease) if lease.mac == *mac => lease.clone(),
            other => {
                return Err(Error::LeaseMismatch {
                    ip,
                    mac: *mac,
                    holder: other.map(|lease| lease.mac),
                });
            }
        };

        let bound = lease.bind(lease_time_seconds, Utc::now());
        self.store.put(bound.clone()).await?;
        Ok(bound)
    }

    /// Whether the store's record for `ip` names `mac`. Expiry is ignored.
    pub fn was_last_leased_to(&self, ip: Ipv4Addr, mac: &MacAddress) -> bool {
        self.store
            .get_by_ip(ip)
            .is_some_and(|lease| lease.mac == *mac)
    }

    /// Drops whatever lease `mac` holds. Releasing nothing is not an error.
    pub async fn release(&mut self, mac: &MacAddress) -> Result<Option<Lease>> {
        let released = self.store.delete_by_mac(mac).await?;
        Ok(released.map(|mut lease| {
            lease.state = LeaseState::Released;
            lease
        }))
    }

    pub fn current_lease(&self, mac: &MacAddress) -> Option<&Lease> {
        self.store.get_by_mac(mac)
    }

    /// Deletes every expired dynamic lease. Returns how many were removed.
    pub async fn sweep_expired(&mut self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<MacAddress> = self
            .store
            .leases()
            .filter(|lease| !lease.static_binding && lease.is_expired_at(now))
            .map(|lease| lease.mac)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let removed = self.store.delete_many(&expired).await?;
        Ok(removed.len())
    }
}
