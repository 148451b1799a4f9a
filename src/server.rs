use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{DHCP_SERVER_PORT, ProtocolHandler};
use crate::packet::DhcpPacket;

const RECV_BUFFER_SIZE: usize = 1500;

/// The receive loop. Owns the socket and the only [`ProtocolHandler`], so
/// requests and sweeps run one at a time.
pub struct DhcpServer {
    handler: ProtocolHandler,
    socket: UdpSocket,
    sweep_interval: Option<Duration>,
}

impl DhcpServer {
    pub async fn new(config: Config) -> Result<Self> {
        let handler = ProtocolHandler::from_config(&config).await?;
        let socket = Self::create_socket(&config)?;

        info!(
            "DHCP server starting on {}:{}",
            config.server_ip, DHCP_SERVER_PORT
        );
        info!(
            "{} lease(s) loaded from {}",
            handler.allocator().store().len(),
            config.leases_file.display()
        );

        Ok(Self::with_socket(
            handler,
            socket,
            config.sweep_interval_seconds.map(Duration::from_secs),
        ))
    }

    fn with_socket(
        handler: ProtocolHandler,
        socket: UdpSocket,
        sweep_interval: Option<Duration>,
    ) -> Self {
        Self {
            handler,
            socket,
            sweep_interval,
        }
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.listen_interface {
            #[cfg(target_os = "linux")]
            {
                socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
                    Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
                })?;
                info!("Listening on interface {}", interface);
            }
            #[cfg(not(target_os = "linux"))]
            {
                warn!(
                    "listen_interface ({}) is only supported on Linux and will be ignored",
                    interface
                );
            }
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        if let Some(interface_index) = config.interface_index {
            #[cfg(windows)]
            {
                use std::os::windows::io::AsRawSocket;
                let raw_socket = socket.as_raw_socket();

                let result = set_interface_index(raw_socket, interface_index);
                if let Err(error) = result {
                    warn!(
                        "Failed to set interface index {}: {}",
                        interface_index, error
                    );
                }
            }
            #[cfg(not(windows))]
            {
                warn!(
                    "interface_index ({}) is only supported on Windows and will be ignored",
                    interface_index
                );
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    /// Serves requests until the task is dropped.
    pub async fn run(&mut self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let mut sweep = self.sweep_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!("DHCP server ready and listening");

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => self.process_datagram(&buffer[..size], source).await,
                    Err(error) => error!("Error receiving packet: {}", error),
                },
                _ = next_sweep(&mut sweep) => self.sweep().await,
            }
        }
    }

    async fn process_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let request = match DhcpPacket::parse(data) {
            Ok(request) => request,
            Err(error) => {
                debug!("Ignoring packet from {}: {}", source, error);
                return;
            }
        };

        let Some(reply) = self.handler.handle(&request).await else {
            return;
        };

        let encoded = reply.packet.encode();
        if let Err(error) = self.socket.send_to(&encoded, reply.destination).await {
            warn!(
                "Failed to send reply for {} to {}: {}",
                source, reply.destination, error
            );
        }
    }

    async fn sweep(&mut self) {
        match self.handler.sweep_expired().await {
            Ok(0) => debug!("Lease sweep found nothing to reclaim"),
            Ok(count) => info!("Reclaimed {} expired lease(s)", count),
            Err(error) => error!("Lease sweep failed: {}", error),
        }
    }

    pub fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }
}

/// Waits for the next sweep tick, or forever when sweeping is disabled.
async fn next_sweep(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(windows)]
fn set_interface_index(raw_socket: std::os::windows::io::RawSocket, index: u32) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_UNICAST_IF: i32 = 31;

    let index_bytes = index.to_be_bytes();
    let result = unsafe {
        setsockopt(
            raw_socket as SOCKET,
            IPPROTO_IP,
            IP_UNICAST_IF,
            index_bytes.as_ptr(),
            std::mem::size_of::<u32>() as i32,
        )
    };

    if result != 0 {
        return Err(Error::Socket(format!(
            "setsockopt IP_UNICAST_IF failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
