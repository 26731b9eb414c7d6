//! Endpoint URI resolution.
//!
//! Picks the network interface matching the configured subnet prefix and a
//! free port from the configured range, and renders the transport URI the
//! RPC fabric should listen on. Shared-memory protocols short-circuit to a
//! pid-based address since they never leave the node.
//!
//! Port probing is spread across the node-local subgroup: each rank starts
//! at a different offset in the range and steps by the node-local size, so
//! co-located ranks rarely collide. Probe sockets are closed before this
//! function returns; only the fabric binds the port for real.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use crate::comm::ProcessGroup;
use crate::config::ShuffleConfig;
use crate::error::{ShuffleError, ShuffleResult};

/// Resolve the transport endpoint URI for this rank.
pub fn prepare_uri(cfg: &ShuffleConfig, group: &Arc<dyn ProcessGroup>) -> ShuffleResult<String> {
    let rank = group.rank();

    if cfg.proto.contains("sm") {
        if rank == 0 {
            tracing::warn!(
                "using {}\n>>> may only be used in single-node tests!!!",
                cfg.proto
            );
            tracing::info!("using port range [{},{}]", cfg.min_port, cfg.max_port);
        }
        return Ok(format!(
            "{}://{}:{}",
            cfg.proto,
            std::process::id(),
            cfg.min_port
        ));
    }

    if rank == 0 {
        if cfg.proto.contains("tcp") {
            tracing::warn!("using {}", cfg.proto);
        } else {
            tracing::info!("using {}", cfg.proto);
        }
        if cfg.subnet == "127.0.0.1" {
            tracing::warn!("using subnet {}*", cfg.subnet);
        } else {
            tracing::info!("using subnet {}*", cfg.subnet);
        }
        tracing::info!("using port range [{},{}]", cfg.min_port, cfg.max_port);
    }

    let ip = find_subnet_ip(&cfg.subnet)?;

    // spread the probe across co-located ranks
    let local = group.split_node_local();
    let local_rank = local.rank() as u32;
    let local_size = (local.size() as u32).max(1);

    let range = (cfg.max_port - cfg.min_port) as u32 + 1;
    let start = cfg.min_port as u32 + (local_rank % range);

    let mut port: u16 = 0;
    let mut probe = start;
    while probe <= cfg.max_port as u32 {
        if TcpListener::bind((Ipv4Addr::UNSPECIFIED, probe as u16)).is_ok() {
            port = probe as u16;
            break;
        }
        probe += local_size;
    }

    if port == 0 {
        tracing::warn!(
            "no free ports available within the specified range\n>>> auto detecting ports ..."
        );
        // ephemeral fallback, read the assigned port back
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|_| ShuffleError::NoFreePorts(cfg.min_port, cfg.max_port))?;
        port = listener
            .local_addr()
            .map_err(|_| ShuffleError::NoFreePorts(cfg.min_port, cfg.max_port))?
            .port();
    }

    if port == 0 {
        return Err(ShuffleError::NoFreePorts(cfg.min_port, cfg.max_port));
    }

    let uri = format!("{}://{}:{}", cfg.proto, ip, port);
    tracing::debug!("[hg] using {} (rank {})", uri, rank);

    Ok(uri)
}

/// Enumerate IPv4 interfaces and return the first address whose textual
/// form starts with the subnet prefix.
fn find_subnet_ip(subnet: &str) -> ShuffleResult<String> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs allocates the list, freeifaddrs releases it; we
    // only dereference pointers while the list is alive.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(ShuffleError::Io(std::io::Error::last_os_error()));
        }

        let mut found = None;
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null()
                && (*ifa.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
            {
                let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                let text = ip.to_string();
                if text.starts_with(subnet) {
                    found = Some(text);
                    break;
                }
                tracing::trace!("[ip] skip {}", text);
            }
            cur = ifa.ifa_next;
        }

        libc::freeifaddrs(ifap);

        found.ok_or_else(|| ShuffleError::NoIpAddr(subnet.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;

    #[test]
    fn test_loopback_interface_is_found() {
        let ip = find_subnet_ip("127.").unwrap();
        assert!(ip.starts_with("127."));
    }

    #[test]
    fn test_wrong_subnet_is_an_error() {
        // TEST-NET-1 prefix should not exist on any interface
        match find_subnet_ip("192.0.2.") {
            Err(ShuffleError::NoIpAddr(s)) => assert_eq!(s, "192.0.2."),
            other => panic!("expected NoIpAddr, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_uri_single_rank() {
        let mut cfg = ShuffleConfig::default();
        cfg.subnet = "127.".to_string();
        let group: Arc<dyn ProcessGroup> =
            LocalCluster::new(1).into_iter().next().unwrap();
        let uri = prepare_uri(&cfg, &group).unwrap();
        assert!(uri.starts_with(&format!("{}://127.", cfg.proto)));
    }

    #[test]
    fn test_prepare_uri_sm_proto() {
        let mut cfg = ShuffleConfig::default();
        cfg.proto = "na+sm".to_string();
        let group: Arc<dyn ProcessGroup> =
            LocalCluster::new(1).into_iter().next().unwrap();
        let uri = prepare_uri(&cfg, &group).unwrap();
        assert_eq!(
            uri,
            format!("na+sm://{}:{}", std::process::id(), cfg.min_port)
        );
    }
}
