use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{TcpSocket, UdpSocket};
use tokio::time;
use tracing::{debug, trace};

use crate::error::ScanError;
use crate::inspector::ServiceInspector;
use crate::ports::service_name;
use crate::types::{PortResult, Protocol};

/// Outcome of the reachability step, before any identification.
#[derive(Debug)]
enum Reach {
    Open,
    Unreachable,
    SocketError(io::Error),
}

/// Probe one `(ip, port, protocol)` tuple.
///
/// - reachable: `Some(Open)` with service name and best-effort product
/// - refused, unreachable or timed out: `None`
/// - any other socket failure: `Some(Invalid)` carrying the error text
///
/// Every socket is owned by this call and dropped on return, whichever path is taken.
pub async fn probe_port(
    ip: Ipv4Addr,
    port: u16,
    protocol: Protocol,
    timeout: Duration,
    inspector: &dyn ServiceInspector,
) -> Option<PortResult> {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    let reach = match protocol {
        Protocol::Tcp => tcp_reach(addr, timeout).await,
        Protocol::Udp => udp_reach(addr, timeout).await,
    };

    match reach {
        Reach::Unreachable => None,
        Reach::SocketError(e) => {
            debug!(%addr, %protocol, error = %e, "probe socket error");
            Some(PortResult::invalid(
                port,
                protocol,
                service_name(port, protocol),
                ScanError::ProbeSocket(e).to_string(),
            ))
        }
        Reach::Open => {
            let product = match inspector.product(ip, port, protocol).await {
                Ok(p) => p.unwrap_or_default(),
                Err(e) => {
                    debug!(%addr, %protocol, error = %e, "product detection failed");
                    String::new()
                }
            };
            trace!(%addr, %protocol, product = %product, "port open");
            Some(PortResult::open(
                port,
                protocol,
                service_name(port, protocol),
                product,
            ))
        }
    }
}

async fn tcp_reach(addr: SocketAddr, timeout: Duration) -> Reach {
    let socket = match TcpSocket::new_v4() {
        Ok(s) => s,
        Err(e) => return Reach::SocketError(e),
    };
    match time::timeout(timeout, socket.connect(addr)).await {
        // The stream is dropped right away; identification runs on its own connection.
        Ok(Ok(_stream)) => Reach::Open,
        Ok(Err(e)) if is_unreachable(&e) => Reach::Unreachable,
        Ok(Err(e)) => Reach::SocketError(e),
        Err(_) => Reach::Unreachable,
    }
}

/// A port counts as open only when a datagram comes back; silent ports are dropped.
async fn udp_reach(addr: SocketAddr, timeout: Duration) -> Reach {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(s) => s,
        Err(e) => return Reach::SocketError(e),
    };
    // Connecting lets the kernel hand ICMP port-unreachable back to this socket.
    if let Err(e) = socket.connect(addr).await {
        return Reach::SocketError(e);
    }
    if let Err(e) = socket.send(&[0u8]).await {
        if is_unreachable(&e) {
            return Reach::Unreachable;
        }
        return Reach::SocketError(e);
    }

    let mut buf = [0u8; 512];
    match time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Reach::Open,
        Ok(Err(e)) if is_unreachable(&e) => Reach::Unreachable,
        Ok(Err(e)) => Reach::SocketError(e),
        Err(_) => Reach::Unreachable,
    }
}

/// Errors that mean "nothing is listening there", as opposed to a local failure.
fn is_unreachable(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut => true,
        _ => is_unreachable_errno(e),
    }
}

#[cfg(unix)]
fn is_unreachable_errno(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) | Some(libc::EHOSTDOWN)
    )
}

#[cfg(not(unix))]
fn is_unreachable_errno(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::PortState;
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    struct FixedProduct(Option<&'static str>);

    #[async_trait]
    impl ServiceInspector for FixedProduct {
        async fn product(&self, _ip: Ipv4Addr, _port: u16, _p: Protocol) -> Result<Option<String>> {
            match self.0 {
                Some(p) => Ok(Some(p.to_string())),
                None => Err(ScanError::Inspector("boom".into())),
            }
        }

        async fn os_match(&self, _ip: Ipv4Addr) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn open_tcp_port_is_reported_with_product() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let res = probe_port(
            Ipv4Addr::LOCALHOST,
            port,
            Protocol::Tcp,
            Duration::from_secs(1),
            &FixedProduct(Some("TestServer 1.0")),
        )
        .await
        .expect("open port reported");
        assert_eq!(res.port, port);
        assert_eq!(res.state, PortState::Open);
        assert_eq!(res.product, "TestServer 1.0");
        assert_eq!(res.error, None);
    }

    #[tokio::test]
    async fn inspector_failure_leaves_product_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let res = probe_port(
            Ipv4Addr::LOCALHOST,
            port,
            Protocol::Tcp,
            Duration::from_secs(1),
            &FixedProduct(None),
        )
        .await
        .unwrap();
        assert_eq!(res.state, PortState::Open);
        assert_eq!(res.product, "");
    }

    #[tokio::test]
    async fn closed_tcp_port_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let res = probe_port(
            Ipv4Addr::LOCALHOST,
            port,
            Protocol::Tcp,
            Duration::from_secs(1),
            &FixedProduct(Some("x")),
        )
        .await;
        assert_eq!(res, None);
    }

    #[tokio::test]
    async fn answering_udp_port_is_open() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            if let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(b"pong", peer).await;
            }
        });

        let res = probe_port(
            Ipv4Addr::LOCALHOST,
            port,
            Protocol::Udp,
            Duration::from_secs(1),
            &FixedProduct(Some("")),
        )
        .await
        .expect("udp reply seen");
        assert_eq!(res.protocol, Protocol::Udp);
        assert_eq!(res.state, PortState::Open);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn local_socket_error_is_reported_as_invalid() {
        // Connecting a UDP socket to broadcast without SO_BROADCAST fails with EACCES.
        let res = probe_port(
            Ipv4Addr::BROADCAST,
            9,
            Protocol::Udp,
            Duration::from_millis(200),
            &FixedProduct(Some("never asked")),
        )
        .await
        .expect("socket error surfaces as a result");
        assert_eq!(res.state, PortState::Invalid);
        assert_eq!(res.service, "discard");
        assert_eq!(res.product, "");
        assert!(res.error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[test]
    fn refused_counts_as_unreachable() {
        let e = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(is_unreachable(&e));
        let e = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert!(!is_unreachable(&e));
    }
}
