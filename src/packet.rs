//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A packet is a fixed 236-byte BOOTP header, the magic cookie
//! 99.130.83.99, and a list of options:
//!
//! ```text
//! offset  size  field
//!      0     1  op      (1 = BOOTREQUEST, 2 = BOOTREPLY)
//!      1     1  htype   (1 = Ethernet)
//!      2     1  hlen    (6 for Ethernet)
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags   (bit 15 = broadcast)
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  magic cookie
//!    240     …  options
//! ```
//!
//! `sname` and `file` are not interpreted; the server answers boot file
//! questions through options 66 and 67 instead.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType, OptionCode};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CIADDR_OFFSET: usize = 12;
const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
/// `sname` plus `file`, always sent zeroed.
const SERVER_FIELDS_SIZE: usize = 64 + 128;
const MAGIC_COOKIE_OFFSET: usize = 236;
const OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Minimum DHCP packet size per RFC 2131 §2, for BOOTP relay compatibility.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Initial capacity for the encode buffer; the minimum datagram every host
/// must accept (RFC 791).
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Maximum hop count before dropping the packet (relay loop protection).
const MAX_HOPS: u8 = 16;

/// Broadcast bit in `flags`.
const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// A parsed DHCP packet, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client address, set by clients that already hold a lease.
    pub ciaddr: Ipv4Addr,
    /// "Your" address: the address being assigned.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; zero when the client is on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_SIZE],
    pub options: Vec<DhcpOption>,
}

fn read_ipv4(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

impl DhcpPacket {
    /// Builds an Ethernet client request with a message type option.
    ///
    /// Mostly useful for tests and tooling; the server only parses requests.
    pub fn request(message_type: MessageType, mac: MacAddress, xid: u32) -> Self {
        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr[..6].copy_from_slice(&mac.octets());

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: BROADCAST_FLAG,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }

    /// Appends an option.
    pub fn with_option(mut self, option: DhcpOption) -> Self {
        self.options.push(option);
        self
    }

    /// Parses a DHCP packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - the packet is shorter than 240 bytes
    /// - the magic cookie is wrong
    /// - the hop count exceeds 16
    /// - an Ethernet packet has `hlen` other than 6
    /// - an option is truncated or malformed
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                OPTIONS_OFFSET
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let [op, htype, hlen, hops] = [data[0], data[1], data[2], data[3]];

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE]);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_ipv4(data, CIADDR_OFFSET),
            yiaddr: read_ipv4(data, CIADDR_OFFSET + 4),
            siaddr: read_ipv4(data, CIADDR_OFFSET + 8),
            giaddr: read_ipv4(data, CIADDR_OFFSET + 12),
            chaddr,
            options: parse_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    /// Encodes the packet, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&addr.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.resize(packet.len() + SERVER_FIELDS_SIZE, 0);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        packet
    }

    /// Returns the first option with the given code.
    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|option| option.code() == code)
    }

    /// Returns the DHCP message type (Option 53), `None` for plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    /// Returns the requested IP address (Option 50) if present.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients send it in REQUEST to say whose offer they accept.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the requested lease time (Option 51) if present.
    pub fn requested_lease_time(&self) -> Option<u32> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// Returns the relay agent information (Option 82) if present.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    /// The client's Ethernet address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for non-Ethernet hardware.
    pub fn client_mac(&self) -> Result<MacAddress> {
        if self.htype != HTYPE_ETHERNET || self.hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Unsupported hardware type {} (hlen {})",
                self.htype, self.hlen
            )));
        }
        MacAddress::from_chaddr(&self.chaddr)
    }

    /// Builds a fresh reply to `request`.
    ///
    /// The message type (53) and server identifier (54) are placed first,
    /// followed by `options`. `xid`, `flags`, `giaddr`, `chaddr`, `htype` and
    /// `hlen` are copied from the request.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = Vec::with_capacity(options.len() + 2);
        all_options.push(DhcpOption::MessageType(message_type));
        all_options.push(DhcpOption::ServerIdentifier(server_ip));
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: all_options,
        }
    }
}

fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options = Vec::new();
    let mut rest = data;

    while let Some((&code, tail)) = rest.split_first() {
        if code == OptionCode::Pad as u8 {
            rest = tail;
            continue;
        }
        if code == OptionCode::End as u8 {
            break;
        }

        let (&length, tail) = tail
            .split_first()
            .ok_or_else(|| Error::InvalidPacket("Option length missing".to_string()))?;
        let length = usize::from(length);
        if tail.len() < length {
            return Err(Error::InvalidPacket(format!(
                "Option {} data truncated: {} of {} bytes",
                code,
                tail.len(),
                length
            )));
        }

        let (value, tail) = tail.split_at(length);
        options.push(DhcpOption::parse(code, value)?);
        rest = tail;
    }

    Ok(options)
}
