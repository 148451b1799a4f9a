//! Per-message DHCP state machine.
//!
//! [`ProtocolHandler`] turns one parsed request into at most one reply. It
//! holds no per-client state of its own: everything it knows about a client
//! lives in the [`LeaseAllocator`]'s store, and every option it hands out
//! comes from the [`BackendChain`].

use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendChain, IP_RANGE_KEY, NETWORK_KEY, NETWORK_PREFIX_KEY, OptionMap, STATIC_ADDRESS_KEY,
    SUBNET_MASK_KEY,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{LeaseAllocator, LeaseState};
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::range::AddressRangeCollection;
use crate::store::LeaseStore;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const MIN_LEASE_SECONDS: u32 = 60;

/// An encoded-ready reply and where to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub destination: SocketAddrV4,
}

/// Backend answer for one client, split into what drives allocation and
/// what goes on the wire.
#[derive(Debug)]
struct ClientOptions {
    static_address: Option<Ipv4Addr>,
    ip_range: Option<String>,
    network: Option<String>,
    network_prefix: Option<String>,
    has_subnet_mask: bool,
    reply_options: Vec<DhcpOption>,
}

impl ClientOptions {
    fn split(mut merged: OptionMap) -> Result<Self> {
        let static_address = merged
            .remove(STATIC_ADDRESS_KEY)
            .map(|value| {
                value.trim().parse::<Ipv4Addr>().map_err(|_| {
                    Error::Config(format!("invalid {} {:?}", STATIC_ADDRESS_KEY, value))
                })
            })
            .transpose()?;

        let mut client = Self {
            static_address,
            ip_range: merged.remove(IP_RANGE_KEY),
            network: merged.remove(NETWORK_KEY),
            network_prefix: merged.remove(NETWORK_PREFIX_KEY),
            has_subnet_mask: merged.contains_key(SUBNET_MASK_KEY),
            reply_options: Vec::with_capacity(merged.len()),
        };

        for (name, value) in &merged {
            client
                .reply_options
                .push(DhcpOption::from_named(name, value)?);
        }

        Ok(client)
    }

    /// The allocation pool for this client.
    fn pool(&self) -> Result<AddressRangeCollection> {
        if let Some(spec) = &self.ip_range {
            return AddressRangeCollection::parse(spec);
        }
        if let Some(network) = &self.network {
            return Err(Error::Config(format!(
                "deriving a pool from network {} is not supported, set ip_range",
                network
            )));
        }
        if self.has_subnet_mask && self.network_prefix.is_some() {
            return Err(Error::Config(
                "deriving a pool from subnet_mask and network_prefix is not supported, set ip_range"
                    .to_string(),
            ));
        }
        Err(Error::Config("cannot determine network for client".to_string()))
    }
}

/// Options 51, 58 and 59 for a lease of `seconds`.
fn lease_time_options(seconds: u32) -> [DhcpOption; 3] {
    let rebinding = u64::from(seconds) * 7 / 8;
    [
        DhcpOption::LeaseTime(seconds),
        DhcpOption::RenewalTime(seconds / 2),
        DhcpOption::RebindingTime(rebinding as u32),
    ]
}

/// OFFERs are always broadcast. ACKs and NAKs go to the relay when there is
/// one, otherwise they are broadcast too.
fn reply_destination(request: &DhcpPacket, message_type: MessageType) -> SocketAddrV4 {
    if message_type != MessageType::Offer && request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(request.giaddr, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    }
}

/// The address a REQUEST is about: `ciaddr` for renewals, then option 50,
/// then `yiaddr`.
fn resolve_requested_ip(request: &DhcpPacket) -> Option<Ipv4Addr> {
    let nonzero = |ip: Ipv4Addr| (ip != Ipv4Addr::UNSPECIFIED).then_some(ip);

    nonzero(request.ciaddr)
        .or_else(|| request.requested_ip())
        .or_else(|| nonzero(request.yiaddr))
}

#[derive(Debug)]
pub struct ProtocolHandler {
    allocator: LeaseAllocator,
    backends: BackendChain,
    server_ip: Ipv4Addr,
    lease_duration_seconds: u32,
}

impl ProtocolHandler {
    pub fn new(
        allocator: LeaseAllocator,
        backends: BackendChain,
        server_ip: Ipv4Addr,
        lease_duration_seconds: u32,
    ) -> Self {
        Self {
            allocator,
            backends,
            server_ip,
            lease_duration_seconds,
        }
    }

    /// Opens the lease file and builds the backend chain described by
    /// `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = LeaseStore::open(&config.leases_file).await?;
        let allocator = LeaseAllocator::new(store, config.offer_timeout_seconds);
        let backends = BackendChain::from_config(&config.backends);

        Ok(Self::new(
            allocator,
            backends,
            config.server_ip,
            config.lease_duration_seconds,
        ))
    }

    pub fn allocator(&self) -> &LeaseAllocator {
        &self.allocator
    }

    pub async fn sweep_expired(&mut self) -> Result<usize> {
        self.allocator.sweep_expired().await
    }

    /// Processes one request. Failures are logged and yield no reply.
    pub async fn handle(&mut self, request: &DhcpPacket) -> Option<Reply> {
        match self.process(request).await {
            Ok(reply) => reply,
            Err(error) => {
                let client = request
                    .client_mac()
                    .map(|mac| mac.to_string())
                    .unwrap_or_else(|_| "unknown client".to_string());
                let message_type = request
                    .message_type()
                    .map(|message_type| message_type.to_string())
                    .unwrap_or_else(|| "packet".to_string());

                match &error {
                    Error::StoreIo { .. } | Error::StoreConsistency(_) => {
                        error!("Dropping {} from {}: {}", message_type, client, error);
                    }
                    Error::InvalidPacket(_) => {
                        debug!("Dropping {} from {}: {}", message_type, client, error);
                    }
                    _ => {
                        warn!("Dropping {} from {}: {}", message_type, client, error);
                    }
                }
                None
            }
        }
    }

    async fn process(&mut self, request: &DhcpPacket) -> Result<Option<Reply>> {
        if request.op != BOOTREQUEST {
            return Err(Error::InvalidPacket(format!(
                "Expected BOOTREQUEST, got op {}",
                request.op
            )));
        }

        let mac = request.client_mac()?;
        let message_type = request.message_type().ok_or_else(|| {
            Error::InvalidPacket("Missing DHCP message type (BOOTP is not served)".to_string())
        })?;

        info!("{} from {}", message_type, mac);

        match message_type {
            MessageType::Discover => self.handle_discover(request, mac).await.map(Some),
            MessageType::Request => self.handle_request(request, mac).await,
            MessageType::Decline | MessageType::Release => {
                self.handle_release(mac, message_type).await?;
                Ok(None)
            }
            MessageType::Inform => self.handle_inform(request, mac).await,
            MessageType::Offer | MessageType::Ack | MessageType::Nak => {
                debug!("Ignoring {} from {}", message_type, mac);
                Ok(None)
            }
        }
    }

    async fn client_options(&self, mac: &MacAddress) -> Result<ClientOptions> {
        let merged = self.backends.query(mac).await?;
        ClientOptions::split(merged)
    }

    async fn handle_discover(&mut self, request: &DhcpPacket, mac: MacAddress) -> Result<Reply> {
        let client = self.client_options(&mac).await?;

        let offered_ip = match client.static_address {
            Some(ip) => {
                self.allocator.reallocate_static(ip, &mac).await?;
                ip
            }
            None => {
                let pool = client.pool()?;
                self.allocator
                    .allocate(&pool, &mac, request.requested_ip())
                    .await?
            }
        };

        let mut options = lease_time_options(self.lease_duration_seconds).to_vec();
        options.extend(client.reply_options);

        info!("OFFER {} to {}", offered_ip, mac);

        Ok(self.reply(request, MessageType::Offer, offered_ip, options))
    }

    async fn handle_request(
        &mut self,
        request: &DhcpPacket,
        mac: MacAddress,
    ) -> Result<Option<Reply>> {
        if let Some(server_id) = request.server_identifier()
            && server_id != self.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            self.withdraw_offer(&mac).await?;
            return Ok(None);
        }

        let requested_ip = resolve_requested_ip(request)
            .ok_or_else(|| Error::InvalidPacket("No IP address in REQUEST".to_string()))?;

        if !self.allocator.was_last_leased_to(requested_ip, &mac) {
            let reason = format!("{} was not offered to this client", requested_ip);
            return Ok(Some(self.nak(request, &mac, &reason)));
        }

        let client = self.client_options(&mac).await?;
        let lease_time = self.negotiate_lease_time(request);

        let lease = match self.allocator.confirm(requested_ip, &mac, lease_time).await {
            Ok(lease) => lease,
            Err(error @ Error::LeaseMismatch { .. }) => {
                return Ok(Some(self.nak(request, &mac, &error.to_string())));
            }
            Err(error) => return Err(error),
        };

        let mut options = lease_time_options(lease_time).to_vec();
        options.extend(client.reply_options);

        match lease.remaining_seconds() {
            Some(remaining) => info!(
                "ACK {} to {} (lease: {} seconds)",
                lease.ip, mac, remaining
            ),
            None => info!("ACK {} to {} (static)", lease.ip, mac),
        }

        Ok(Some(self.reply(request, MessageType::Ack, lease.ip, options)))
    }

    /// Puts back an address the client was offered but chose not to take.
    async fn withdraw_offer(&mut self, mac: &MacAddress) -> Result<()> {
        let offered = self
            .allocator
            .current_lease(mac)
            .filter(|lease| lease.state == LeaseState::Offered)
            .map(|lease| lease.ip);

        if let Some(ip) = offered {
            self.allocator.release(mac).await?;
            debug!("Withdrew offer of {} to {}", ip, mac);
        }
        Ok(())
    }

    fn negotiate_lease_time(&self, request: &DhcpPacket) -> u32 {
        let max_lease = self.lease_duration_seconds;
        match request.requested_lease_time() {
            Some(requested) => requested.clamp(MIN_LEASE_SECONDS.min(max_lease), max_lease),
            None => max_lease,
        }
    }

    async fn handle_release(&mut self, mac: MacAddress, message_type: MessageType) -> Result<()> {
        match self.allocator.release(&mac).await? {
            Some(lease) => info!("{} from {} freed {}", message_type, mac, lease.ip),
            None => debug!("{} from {} with no lease on record", message_type, mac),
        }
        Ok(())
    }

    async fn handle_inform(
        &mut self,
        request: &DhcpPacket,
        mac: MacAddress,
    ) -> Result<Option<Reply>> {
        let Some(ip) = self
            .allocator
            .current_lease(&mac)
            .filter(|lease| !lease.is_expired())
            .map(|lease| lease.ip)
        else {
            debug!("INFORM from {} without an active lease", mac);
            return Ok(None);
        };

        let client = self.client_options(&mac).await?;

        info!("INFORM response {} to {}", ip, mac);

        Ok(Some(self.reply(
            request,
            MessageType::Ack,
            ip,
            client.reply_options,
        )))
    }

    fn nak(&self, request: &DhcpPacket, mac: &MacAddress, reason: &str) -> Reply {
        warn!("NAK to {}: {}", mac, reason);
        self.reply(request, MessageType::Nak, Ipv4Addr::UNSPECIFIED, Vec::new())
    }

    fn reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        mut options: Vec<DhcpOption>,
    ) -> Reply {
        if let Some(relay_info) = request.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        Reply {
            packet: DhcpPacket::create_reply(request, message_type, your_ip, self.server_ip, options),
            destination: reply_destination(request, message_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticTableProvider;
    use crate::options::OptionCode;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LEASE_SECONDS: u32 = 3600;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last])
    }

    fn options(pairs: &[(&str, &str)]) -> OptionMap {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    async fn create_test_handler(
        dir: &TempDir,
        defaults: &[(&str, &str)],
        hosts: BTreeMap<MacAddress, OptionMap>,
    ) -> ProtocolHandler {
        let store = LeaseStore::open(dir.path().join("leases.json"))
            .await
            .unwrap();
        let allocator = LeaseAllocator::new(store, 60);
        let backends = BackendChain::new(vec![Box::new(StaticTableProvider::new(
            options(defaults),
            hosts,
        ))]);
        ProtocolHandler::new(allocator, backends, SERVER_IP, LEASE_SECONDS)
    }

    async fn default_handler(dir: &TempDir) -> ProtocolHandler {
        create_test_handler(
            dir,
            &[
                ("ip_range", "10.0.0.10-10.0.0.12"),
                ("subnet_mask", "255.255.255.0"),
                ("router", "10.0.0.1"),
            ],
            BTreeMap::new(),
        )
        .await
    }

    fn discover(client: MacAddress) -> DhcpPacket {
        DhcpPacket::request(MessageType::Discover, client, 0x1234)
    }

    fn request_for(client: MacAddress, ip: Ipv4Addr) -> DhcpPacket {
        DhcpPacket::request(MessageType::Request, client, 0x1234)
            .with_option(DhcpOption::RequestedIpAddress(ip))
            .with_option(DhcpOption::ServerIdentifier(SERVER_IP))
    }

    #[test]
    fn test_renewal_time_calculations() {
        let [lease, renewal, rebinding] = lease_time_options(86400);
        assert_eq!(lease, DhcpOption::LeaseTime(86400));
        assert_eq!(renewal, DhcpOption::RenewalTime(43200));
        assert_eq!(rebinding, DhcpOption::RebindingTime(75600));

        let [_, _, rebinding] = lease_time_options(u32::MAX);
        assert_eq!(
            rebinding,
            DhcpOption::RebindingTime((u64::from(u32::MAX) * 7 / 8) as u32)
        );
    }

    #[test]
    fn test_resolve_requested_ip_order() {
        let client = mac(1);
        let mut packet = DhcpPacket::request(MessageType::Request, client, 1);
        assert_eq!(resolve_requested_ip(&packet), None);

        packet.yiaddr = Ipv4Addr::new(10, 0, 0, 3);
        assert_eq!(resolve_requested_ip(&packet), Some(Ipv4Addr::new(10, 0, 0, 3)));

        packet = packet.with_option(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(resolve_requested_ip(&packet), Some(Ipv4Addr::new(10, 0, 0, 2)));

        packet.ciaddr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(resolve_requested_ip(&packet), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[tokio::test]
    async fn test_handle_discover_allocates_ip() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let reply = handler.handle(&discover(mac(1))).await.unwrap();

        assert_eq!(reply.packet.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(reply.packet.siaddr, SERVER_IP);
        assert_eq!(reply.packet.server_identifier(), Some(SERVER_IP));
        assert_eq!(reply.packet.requested_lease_time(), Some(LEASE_SECONDS));
        assert_eq!(
            reply.packet.option(OptionCode::SubnetMask as u8),
            Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert_eq!(
            reply.packet.option(OptionCode::Router as u8),
            Some(&DhcpOption::Router(vec![Ipv4Addr::new(10, 0, 0, 1)]))
        );
        assert!(reply.packet.option(OptionCode::RenewalTime as u8).is_some());
        assert!(reply.packet.option(OptionCode::RebindingTime as u8).is_some());
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );

        let lease = handler.allocator().current_lease(&mac(1)).unwrap();
        assert_eq!(lease.state, LeaseState::Offered);
    }

    #[tokio::test]
    async fn test_handle_discover_with_requested_ip() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let packet = discover(mac(1))
            .with_option(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 12)));
        let reply = handler.handle(&packet).await.unwrap();
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::new(10, 0, 0, 12));

        let packet = discover(mac(2))
            .with_option(DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 0, 1)));
        let reply = handler.handle(&packet).await.unwrap();
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[tokio::test]
    async fn test_discover_without_pool_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut handler =
            create_test_handler(&dir, &[("router", "10.0.0.1")], BTreeMap::new()).await;
        assert!(handler.handle(&discover(mac(1))).await.is_none());

        let dir = TempDir::new().unwrap();
        let mut handler =
            create_test_handler(&dir, &[("network", "10.0.0.0")], BTreeMap::new()).await;
        assert!(handler.handle(&discover(mac(1))).await.is_none());

        let dir = TempDir::new().unwrap();
        let mut handler = create_test_handler(
            &dir,
            &[("subnet_mask", "255.255.255.0"), ("network_prefix", "10.0.0")],
            BTreeMap::new(),
        )
        .await;
        assert!(handler.handle(&discover(mac(1))).await.is_none());
        assert!(handler.allocator().store().is_empty());
    }

    #[test]
    fn test_split_removes_pool_keys() {
        let client = ClientOptions::split(options(&[
            ("ip_range", "10.0.0.10-10.0.0.12"),
            ("network", "10.0.0.0"),
            ("network_prefix", "10.0.0"),
            ("subnet_mask", "255.255.255.0"),
            ("yiaddr", "10.0.0.50"),
            ("domain_name", "example.org"),
        ]))
        .unwrap();

        assert_eq!(client.static_address, Some(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(client.has_subnet_mask);
        assert_eq!(
            client.reply_options,
            vec![
                DhcpOption::DomainName("example.org".to_string()),
                DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            ]
        );
        assert_eq!(client.pool().unwrap().len(), 3);

        assert!(matches!(
            ClientOptions::split(options(&[("colour", "blue")])),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_request_creates_lease() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        let reply = handler
            .handle(&request_for(client, offer.packet.yiaddr))
            .await
            .unwrap();

        assert_eq!(reply.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.packet.yiaddr, offer.packet.yiaddr);
        assert_eq!(reply.packet.requested_lease_time(), Some(LEASE_SECONDS));

        let lease = handler.allocator().current_lease(&client).unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
        assert!(lease.remaining_seconds().unwrap() > i64::from(LEASE_SECONDS) - 10);
    }

    #[tokio::test]
    async fn test_requested_lease_time_is_clamped() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        let short = request_for(client, offer.packet.yiaddr).with_option(DhcpOption::LeaseTime(5));
        let reply = handler.handle(&short).await.unwrap();
        assert_eq!(reply.packet.requested_lease_time(), Some(MIN_LEASE_SECONDS));

        let long = request_for(client, offer.packet.yiaddr)
            .with_option(DhcpOption::LeaseTime(LEASE_SECONDS * 10));
        let reply = handler.handle(&long).await.unwrap();
        assert_eq!(reply.packet.requested_lease_time(), Some(LEASE_SECONDS));
    }

    #[tokio::test]
    async fn test_handle_request_with_ciaddr() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        handler
            .handle(&request_for(client, offer.packet.yiaddr))
            .await
            .unwrap();

        let mut renewal = DhcpPacket::request(MessageType::Request, client, 0x5678);
        renewal.ciaddr = offer.packet.yiaddr;
        let reply = handler.handle(&renewal).await.unwrap();

        assert_eq!(reply.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.packet.yiaddr, offer.packet.yiaddr);
    }

    #[tokio::test]
    async fn test_request_for_unknown_address_is_nakked() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let reply = handler
            .handle(&request_for(mac(1), Ipv4Addr::new(10, 0, 0, 11)))
            .await
            .unwrap();

        assert_eq!(reply.packet.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.packet.server_identifier(), Some(SERVER_IP));
        assert!(reply.packet.requested_lease_time().is_none());
    }

    #[tokio::test]
    async fn test_request_for_other_clients_address_is_nakked() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let offer = handler.handle(&discover(mac(1))).await.unwrap();
        let reply = handler
            .handle(&request_for(mac(2), offer.packet.yiaddr))
            .await
            .unwrap();

        assert_eq!(reply.packet.message_type(), Some(MessageType::Nak));
        let lease = handler.allocator().current_lease(&mac(1)).unwrap();
        assert_eq!(lease.ip, offer.packet.yiaddr);
    }

    #[tokio::test]
    async fn test_handle_request_different_server() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        let elsewhere = DhcpPacket::request(MessageType::Request, client, 0x1234)
            .with_option(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 200)))
            .with_option(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 254)));

        assert!(handler.handle(&elsewhere).await.is_none());
        assert!(handler.allocator().current_lease(&client).is_none());

        let other = handler.handle(&discover(mac(2))).await.unwrap();
        assert_eq!(other.packet.yiaddr, offer.packet.yiaddr);
    }

    #[tokio::test]
    async fn test_request_for_other_server_keeps_bound_lease() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        handler
            .handle(&request_for(client, offer.packet.yiaddr))
            .await
            .unwrap();

        let elsewhere = DhcpPacket::request(MessageType::Request, client, 0x1234)
            .with_option(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 254)));
        assert!(handler.handle(&elsewhere).await.is_none());

        let lease = handler.allocator().current_lease(&client).unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
    }

    #[tokio::test]
    async fn test_static_address_from_backend() {
        let dir = TempDir::new().unwrap();
        let client = mac(9);
        let static_ip = Ipv4Addr::new(192, 168, 50, 5);
        let hosts = BTreeMap::from([(client, options(&[("yiaddr", "192.168.50.5")]))]);
        let mut handler = create_test_handler(
            &dir,
            &[("ip_range", "10.0.0.10-10.0.0.12")],
            hosts,
        )
        .await;

        let offer = handler.handle(&discover(client)).await.unwrap();
        assert_eq!(offer.packet.yiaddr, static_ip);

        let ack = handler
            .handle(&request_for(client, static_ip))
            .await
            .unwrap();
        assert_eq!(ack.packet.message_type(), Some(MessageType::Ack));

        let lease = handler.allocator().current_lease(&client).unwrap();
        assert!(lease.static_binding);
        assert_eq!(lease.expires_at, None);
    }

    #[tokio::test]
    async fn test_handle_release() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        handler
            .handle(&request_for(client, offer.packet.yiaddr))
            .await
            .unwrap();

        let mut release = DhcpPacket::request(MessageType::Release, client, 0x9999);
        release.ciaddr = offer.packet.yiaddr;
        assert!(handler.handle(&release).await.is_none());
        assert!(handler.allocator().current_lease(&client).is_none());

        // Releasing twice is harmless.
        assert!(handler.handle(&release).await.is_none());
    }

    #[tokio::test]
    async fn test_handle_decline() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let offer = handler.handle(&discover(client)).await.unwrap();
        let decline = DhcpPacket::request(MessageType::Decline, client, 0x1234)
            .with_option(DhcpOption::RequestedIpAddress(offer.packet.yiaddr));

        assert!(handler.handle(&decline).await.is_none());
        assert!(handler.allocator().current_lease(&client).is_none());
    }

    #[tokio::test]
    async fn test_handle_inform() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);

        let inform = DhcpPacket::request(MessageType::Inform, client, 0x4321);
        assert!(handler.handle(&inform).await.is_none());

        let offer = handler.handle(&discover(client)).await.unwrap();
        handler
            .handle(&request_for(client, offer.packet.yiaddr))
            .await
            .unwrap();

        let reply = handler.handle(&inform).await.unwrap();
        assert_eq!(reply.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.packet.yiaddr, offer.packet.yiaddr);
        assert!(reply.packet.requested_lease_time().is_none());
        assert!(reply.packet.option(OptionCode::Router as u8).is_some());
    }

    #[tokio::test]
    async fn test_relayed_offer_is_broadcast_and_ack_goes_to_relay() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;
        let client = mac(1);
        let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);

        let relay = Ipv4Addr::new(10, 0, 5, 1);
        let info = vec![1, 4, 0xde, 0xad, 0xbe, 0xef];
        let mut packet =
            discover(client).with_option(DhcpOption::RelayAgentInfo(info.clone()));
        packet.giaddr = relay;

        let offer = handler.handle(&packet).await.unwrap();
        assert_eq!(offer.destination, broadcast);
        assert_eq!(offer.packet.giaddr, relay);
        assert_eq!(offer.packet.relay_agent_info(), Some(info.as_slice()));

        let mut request = request_for(client, offer.packet.yiaddr)
            .with_option(DhcpOption::RelayAgentInfo(info.clone()));
        request.giaddr = relay;
        let ack = handler.handle(&request).await.unwrap();
        assert_eq!(ack.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.destination, SocketAddrV4::new(relay, DHCP_CLIENT_PORT));
        assert_eq!(ack.packet.relay_agent_info(), Some(info.as_slice()));

        let mut inform = DhcpPacket::request(MessageType::Inform, client, 0x4321);
        inform.giaddr = relay;
        let inform_ack = handler.handle(&inform).await.unwrap();
        assert_eq!(inform_ack.destination, SocketAddrV4::new(relay, DHCP_CLIENT_PORT));

        let mut nak_request = request_for(mac(2), Ipv4Addr::new(10, 0, 0, 12));
        nak_request.giaddr = relay;
        let nak = handler.handle(&nak_request).await.unwrap();
        assert_eq!(nak.packet.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.destination, SocketAddrV4::new(relay, DHCP_CLIENT_PORT));

        let unrelayed = handler.handle(&request_for(client, offer.packet.yiaddr)).await.unwrap();
        assert_eq!(unrelayed.destination, broadcast);
    }

    #[tokio::test]
    async fn test_backend_options_ignore_parameter_request_list() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let packet = discover(mac(1))
            .with_option(DhcpOption::ParameterRequestList(vec![OptionCode::Router as u8]));
        let reply = handler.handle(&packet).await.unwrap();

        let codes: Vec<u8> = reply.packet.options.iter().map(DhcpOption::code).collect();
        assert!(codes.contains(&(OptionCode::Router as u8)));
        assert!(codes.contains(&(OptionCode::MessageType as u8)));
        assert!(codes.contains(&(OptionCode::ServerIdentifier as u8)));
        assert!(codes.contains(&(OptionCode::LeaseTime as u8)));
        assert!(codes.contains(&(OptionCode::SubnetMask as u8)));
    }

    #[tokio::test]
    async fn test_store_failure_drops_message_and_recovers() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        std::fs::create_dir(&state).unwrap();

        let store = LeaseStore::open(state.join("leases.json")).await.unwrap();
        let backends = BackendChain::new(vec![Box::new(StaticTableProvider::new(
            options(&[("ip_range", "10.0.0.10-10.0.0.12")]),
            BTreeMap::new(),
        ))]);
        let mut handler =
            ProtocolHandler::new(LeaseAllocator::new(store, 60), backends, SERVER_IP, LEASE_SECONDS);

        std::fs::remove_dir_all(&state).unwrap();
        assert!(handler.handle(&discover(mac(1))).await.is_none());
        assert!(handler.allocator().store().is_empty());
        assert!(!state.join("leases.json").exists());

        std::fs::create_dir(&state).unwrap();
        let reply = handler.handle(&discover(mac(1))).await.unwrap();
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(handler.allocator().store().len(), 1);

        let reopened = LeaseStore::open(state.join("leases.json")).await.unwrap();
        assert_eq!(reopened.get_by_mac(&mac(1)).map(|lease| lease.ip), Some(reply.packet.yiaddr));
    }

    #[tokio::test]
    async fn test_handle_packet_rejects_bootreply() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        let mut packet = discover(mac(1));
        packet.op = crate::packet::BOOTREPLY;
        assert!(handler.handle(&packet).await.is_none());

        let mut bootp = discover(mac(1));
        bootp.options.clear();
        assert!(handler.handle(&bootp).await.is_none());

        let mut token_ring = discover(mac(1));
        token_ring.htype = 6;
        assert!(handler.handle(&token_ring).await.is_none());

        assert!(handler.allocator().store().is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let dir = TempDir::new().unwrap();
        let mut handler = default_handler(&dir).await;

        for last in 1..=3 {
            assert!(handler.handle(&discover(mac(last))).await.is_some());
        }
        assert!(handler.handle(&discover(mac(4))).await.is_none());
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            leases_file: dir.path().join("leases.json"),
            ..Default::default()
        };

        let mut handler = ProtocolHandler::from_config(&config).await.unwrap();
        let reply = handler.handle(&discover(mac(1))).await.unwrap();
        assert_eq!(reply.packet.yiaddr, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(reply.packet.server_identifier(), Some(config.server_ip));
    }
}
