//! Turning a user-typed host into a socket address.

use std::io;
use std::net::{IpAddr, SocketAddr};

/// `host` or `host:port` as typed by the user, with the port filled in
/// when missing. Bare IPv6 addresses need no brackets.
pub fn join_target(address: &str, default_port: u16) -> String {
    let address = address.trim();
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{default_port}"),
    }
}

/// Resolve `address` to the first socket address it names.
pub async fn resolve(address: &str, default_port: u16) -> io::Result<SocketAddr> {
    let target = join_target(address, default_port);
    tokio::net::lookup_host(&target).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{address} did not resolve to any address"),
        )
    })
}
