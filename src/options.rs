//! DHCP options as defined in RFC 2132.
//!
//! Each option is a code byte, a length byte and up to 255 bytes of data.
//! This module parses and encodes the options the server reads or writes,
//! and converts the textual `name → value` pairs supplied by backends into
//! typed options. Unknown codes are kept as [`DhcpOption::Unknown`].
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Maximum number of IPv4 addresses in one list option.
///
/// The length byte caps option data at 255 bytes, so 63 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Maximum option payload length.
const MAX_OPTION_LENGTH: usize = 255;

/// DHCP option codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DomainNameServer = 6,
    HostName = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    NtpServers = 42,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    TftpServerName = 66,
    BootfileName = 67,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DomainNameServer,
            12 => Self::HostName,
            15 => Self::DomainName,
            26 => Self::InterfaceMtu,
            28 => Self::BroadcastAddress,
            42 => Self::NtpServers,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            58 => Self::RenewalTime,
            59 => Self::RebindingTime,
            66 => Self::TftpServerName,
            67 => Self::BootfileName,
            82 => Self::RelayAgentInfo,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// DHCP message types (Option 53), RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => return Err(other),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        })
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// Default gateway first.
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    InterfaceMtu(u16),
    BroadcastAddress(Ipv4Addr),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    /// T1 in seconds.
    RenewalTime(u32),
    /// T2 in seconds.
    RebindingTime(u32),
    TftpServerName(String),
    BootfileName(String),
    /// Opaque relay agent data, echoed back to the relay.
    RelayAgentInfo(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn parse_ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_ipv4_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!(
            "Invalid {} length: {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn parse_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DomainNameServer(_) => OptionCode::DomainNameServer,
            Self::HostName(_) => OptionCode::HostName,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::NtpServers(_) => OptionCode::NtpServers,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::TftpServerName(_) => OptionCode::TftpServerName,
            Self::BootfileName(_) => OptionCode::BootfileName,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses an option from its code and data bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length does not fit the
    /// option, or for Pad/End, which carry no data.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let code = match OptionCode::try_from(code) {
            Ok(code) => code,
            Err(unknown) => return Ok(Self::Unknown(unknown, data.to_vec())),
        };

        Ok(match code {
            OptionCode::SubnetMask => Self::SubnetMask(parse_ipv4(data, "subnet mask")?),
            OptionCode::Router => Self::Router(parse_ipv4_list(data, "router")?),
            OptionCode::DomainNameServer => {
                Self::DomainNameServer(parse_ipv4_list(data, "DNS server")?)
            }
            OptionCode::HostName => Self::HostName(parse_text(data)),
            OptionCode::DomainName => Self::DomainName(parse_text(data)),
            OptionCode::InterfaceMtu => {
                let bytes: [u8; 2] = data
                    .try_into()
                    .map_err(|_| Error::InvalidPacket("Invalid MTU length".to_string()))?;
                Self::InterfaceMtu(u16::from_be_bytes(bytes))
            }
            OptionCode::BroadcastAddress => {
                Self::BroadcastAddress(parse_ipv4(data, "broadcast address")?)
            }
            OptionCode::NtpServers => Self::NtpServers(parse_ipv4_list(data, "NTP server")?),
            OptionCode::RequestedIpAddress => {
                Self::RequestedIpAddress(parse_ipv4(data, "requested IP address")?)
            }
            OptionCode::LeaseTime => Self::LeaseTime(parse_u32(data, "lease time")?),
            OptionCode::MessageType => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            OptionCode::ServerIdentifier => {
                Self::ServerIdentifier(parse_ipv4(data, "server identifier")?)
            }
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::RenewalTime => Self::RenewalTime(parse_u32(data, "renewal time")?),
            OptionCode::RebindingTime => Self::RebindingTime(parse_u32(data, "rebinding time")?),
            OptionCode::TftpServerName => Self::TftpServerName(parse_text(data)),
            OptionCode::BootfileName => Self::BootfileName(parse_text(data)),
            OptionCode::RelayAgentInfo => Self::RelayAgentInfo(data.to_vec()),
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
        })
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DomainNameServer(addrs) | Self::NtpServers(addrs) => addrs
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(|addr| addr.octets())
                .collect(),
            Self::HostName(text)
            | Self::DomainName(text)
            | Self::TftpServerName(text)
            | Self::BootfileName(text) => text.as_bytes().to_vec(),
            Self::InterfaceMtu(mtu) => mtu.to_be_bytes().to_vec(),
            Self::LeaseTime(seconds) | Self::RenewalTime(seconds) | Self::RebindingTime(seconds) => {
                seconds.to_be_bytes().to_vec()
            }
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::ParameterRequestList(data)
            | Self::RelayAgentInfo(data)
            | Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Encodes the option as code, length and data.
    ///
    /// Data longer than 255 bytes is truncated.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = self.payload();
        payload.truncate(MAX_OPTION_LENGTH);

        let mut encoded = Vec::with_capacity(payload.len() + 2);
        encoded.push(self.code());
        encoded.push(payload.len() as u8);
        encoded.extend_from_slice(&payload);
        encoded
    }

    /// Builds an option from a backend-supplied name and textual value.
    ///
    /// | name | code | value |
    /// |---|---|---|
    /// | `subnet_mask` | 1 | address |
    /// | `router` | 3 | addresses |
    /// | `domain_name_server`, `dns_server` | 6 | addresses |
    /// | `host_name` | 12 | text |
    /// | `domain_name` | 15 | text |
    /// | `interface_mtu` | 26 | integer |
    /// | `broadcast_address` | 28 | address |
    /// | `ntp_servers` | 42 | addresses |
    /// | `tftp_server_name` | 66 | text |
    /// | `bootfile_name` | 67 | text |
    ///
    /// Address lists are separated by commas or whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown name or a malformed value.
    pub fn from_named(name: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        Ok(match name {
            "subnet_mask" => Self::SubnetMask(named_ipv4(name, value)?),
            "router" => Self::Router(named_ipv4_list(name, value)?),
            "domain_name_server" | "dns_server" => {
                Self::DomainNameServer(named_ipv4_list(name, value)?)
            }
            "host_name" => Self::HostName(named_text(name, value)?),
            "domain_name" => Self::DomainName(named_text(name, value)?),
            "interface_mtu" => Self::InterfaceMtu(value.parse().map_err(|_| {
                Error::Config(format!("Option {}: invalid MTU {:?}", name, value))
            })?),
            "broadcast_address" => Self::BroadcastAddress(named_ipv4(name, value)?),
            "ntp_servers" => Self::NtpServers(named_ipv4_list(name, value)?),
            "tftp_server_name" => Self::TftpServerName(named_text(name, value)?),
            "bootfile_name" => Self::BootfileName(named_text(name, value)?),
            _ => return Err(Error::Config(format!("Unknown option name: {}", name))),
        })
    }
}

fn named_ipv4(name: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("Option {}: invalid address {:?}", name, value)))
}

fn named_ipv4_list(name: &str, value: &str) -> Result<Vec<Ipv4Addr>> {
    let addrs = value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| named_ipv4(name, part))
        .collect::<Result<Vec<_>>>()?;

    if addrs.is_empty() || addrs.len() > MAX_ADDRESSES_PER_OPTION {
        return Err(Error::Config(format!(
            "Option {}: expected 1 to {} addresses, got {}",
            name,
            MAX_ADDRESSES_PER_OPTION,
            addrs.len()
        )));
    }
    Ok(addrs)
}

fn named_text(name: &str, value: &str) -> Result<String> {
    if value.is_empty() || value.len() > MAX_OPTION_LENGTH {
        return Err(Error::Config(format!(
            "Option {}: text must be 1 to {} bytes",
            name, MAX_OPTION_LENGTH
        )));
    }
    Ok(value.to_string())
}
