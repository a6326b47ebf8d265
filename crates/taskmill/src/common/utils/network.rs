/// Name under which this machine is advertised to other components.
pub fn get_hostname(preferred: Option<String>) -> String {
    preferred.unwrap_or_else(|| {
        gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|name| name.to_string_lossy().into_owned())
    })
}

/// Returns true if `host` names this machine.
pub fn is_local_host(host: &str, advertised: &str) -> bool {
    host == advertised || matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Finds a TCP port that is currently free on all interfaces.
///
/// The port is released before returning, so another process may grab it in between.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::{get_hostname, is_local_host};

    #[test]
    fn preferred_hostname_wins() {
        assert_eq!(get_hostname(Some("node-1".to_string())), "node-1");
    }

    #[test]
    fn local_host_detection() {
        assert!(is_local_host("node-1", "node-1"));
        assert!(is_local_host("127.0.0.1", "node-1"));
        assert!(!is_local_host("node-2", "node-1"));
    }
}
