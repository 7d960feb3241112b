use std::{
    borrow::Cow,
    net::{IpAddr, SocketAddr},
};

/// Normalize a bind/listen address.
///
/// Configs and handler requests commonly use the shorthand `":PORT"` to mean
/// "bind on all interfaces". Tokio bind APIs do not accept `":PORT"`, so we
/// normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split `"host:port"` (or `"[v6]:port"`) into its parts.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let addr = normalize_bind_addr(addr);
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port))
}

/// Build a socket address from a literal IP host and port.
pub fn socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Resolve `addr` to a single socket address, using DNS when it is not a literal.
pub async fn resolve_socket_addr(addr: &str) -> std::io::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve {addr:?}"),
        )
    })
}
