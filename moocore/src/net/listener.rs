//! The listen sockets: one per address family, non-blocking, with the
//! per-family outcome recorded for reporting.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::TcpListener;

use crate::shared::{StartupError, EXIT_BIND, EXIT_SOCKET};

/// The result of an attempt to bind on a port: per-address-family
/// outcomes plus the open listeners.
pub struct BindResult {
    /// Number of address families we tried to bind for.
    pub af_count: usize,
    /// Number of address families we successfully bound for.
    pub af_success_count: usize,
    /// Human-readable message for each family.
    pub af_msg: Vec<String>,
    pub listeners: Vec<TcpListener>,
    /// Human-readable conclusion.
    pub conclusion: String,
}

/// Bind a listener per address family on `port`. Succeeds if at least
/// one family binds; the per-family messages record the rest.
pub fn bind_port(port: u16) -> Result<BindResult, StartupError> {
    let attempts: [(&str, SocketAddr); 2] = [
        ("IPv4", SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        ("IPv6", SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
    ];

    let mut af_msg = Vec::new();
    let mut listeners = Vec::new();
    let mut last_error_kind = None;

    for (family, addr) in attempts.iter() {
        match TcpListener::bind(*addr) {
            Ok(listener) => {
                af_msg.push(format!("Listening on {} port {}.", family, port));
                listeners.push(listener);
            }
            Err(err) => {
                last_error_kind = Some(err.kind());
                af_msg.push(format!(
                    "Could not bind on {} port {}: {}.",
                    family, port, err
                ));
            }
        }
    }

    let af_count = attempts.len();
    let af_success_count = listeners.len();

    if listeners.is_empty() {
        let code = match last_error_kind {
            Some(std::io::ErrorKind::AddrInUse)
            | Some(std::io::ErrorKind::AddrNotAvailable)
            | Some(std::io::ErrorKind::PermissionDenied) => EXIT_BIND,
            _ => EXIT_SOCKET,
        };
        return Err(StartupError::new(
            code,
            format!(
                "{}\nCould not bind on any address family.",
                af_msg.join("\n")
            ),
        ));
    }

    let conclusion = format!(
        "Bound to port {} for {} of {} address families.",
        port, af_success_count, af_count
    );

    Ok(BindResult {
        af_count,
        af_success_count,
        af_msg,
        listeners,
        conclusion,
    })
}
