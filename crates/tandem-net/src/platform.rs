//! Socket setup shared by hosts and joiners.
//!
//! Meeting traffic is many small pose frames per second, so Nagle is off.
//! A meeting can also sit idle for a long time while people talk, and
//! keepalive is what notices a headset that walked out of Wi-Fi range.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Default TCP port for meetings.
pub const DEFAULT_PORT: u16 = 21213;

/// Socket options for meeting connections.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Send pose frames immediately. Default: true.
    pub tcp_nodelay: bool,
    /// Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Default: 10s.
    pub keepalive_interval: Duration,
    /// Unanswered probes before the connection is dropped (Linux and
    /// Windows only). Default: 3.
    pub keepalive_retries: u32,
    /// Let a host that just stopped start hosting again on the same port.
    /// Default: true except on Windows, where it allows port stealing.
    pub reuse_addr: bool,
    /// Default: 10.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 10,
        }
    }
}

impl SocketConfig {
    fn keepalive(&self) -> TcpKeepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive_idle)
            .with_interval(self.keepalive_interval);
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(self.keepalive_retries);
        keepalive
    }
}

/// Apply `config` to a freshly connected or accepted stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if config.keepalive_enabled {
        SockRef::from(stream).set_tcp_keepalive(&config.keepalive())?;
    }
    Ok(())
}

/// Bind the host's listening socket. IPv6 addresses also accept IPv4
/// participants.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(config.reuse_addr)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    TcpListener::from_std(socket.into())
}

/// Every IPv4 interface on `port`, where a host listens by default.
pub fn ipv4_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}
