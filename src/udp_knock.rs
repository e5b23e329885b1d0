//! Best-effort UDP "knock" (SPEC_FULL.md SUPPLEMENTED FEATURES, spec.md
//! §4.G filters), grounded on `original_source/src/UdpKnock.cxx`: some
//! server operators gate the TCP login port behind a firewall rule that
//! opens after seeing a UDP datagram carrying the login packet.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::debug;

/// Sends `account_login` as a single UDP datagram to `target`. Failure is
/// logged and swallowed — this is a best-effort nicety, never load-bearing
/// for the TCP login that follows.
pub async fn send(target: SocketAddr, account_login: &[u8]) {
    let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "udp knock: bind failed");
            return;
        }
    };

    if let Err(e) = socket.send_to(account_login, target).await {
        debug!(error = %e, "udp knock: send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[tokio::test]
    async fn sends_payload_verbatim() {
        let receiver = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        send(addr, b"hello").await;

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
