//! Minimal SOCKS4 client for outbound upstream connections (SPEC_FULL.md
//! SUPPLEMENTED FEATURES), grounded on `original_source/src/ProxySocks.cxx`.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CMD_CONNECT: u8 = 0x01;
const VERSION: u8 = 0x04;
const REPLY_GRANTED: u8 = 0x5A;

/// Opens a TCP connection to `proxy`, then asks it (via SOCKS4, no
/// authentication) to connect on to `target`. Returns the proxied stream.
pub async fn connect(proxy: SocketAddr, target: SocketAddrV4) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .with_context(|| format!("connecting to socks4 proxy {proxy}"))?;

    let mut request = Vec::with_capacity(9);
    request.push(VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&target.port().to_be_bytes());
    request.extend_from_slice(&target.ip().octets());
    request.push(0); // empty USERID, NUL-terminated

    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;

    if reply[0] != 0 {
        bail!("socks4 proxy sent malformed reply (version byte {})", reply[0]);
    }
    if reply[1] != REPLY_GRANTED {
        bail!("socks4 proxy rejected connect, status 0x{:02x}", reply[1]);
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_succeeds_on_granted_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 9];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(req[0], VERSION);
            assert_eq!(req[1], CMD_CONNECT);
            sock.write_all(&[0, REPLY_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2593);
        connect(proxy_addr, target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_errors_on_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 9];
            sock.read_exact(&mut req).await.unwrap();
            sock.write_all(&[0, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2593);
        assert!(connect(proxy_addr, target).await.is_err());
        server.await.unwrap();
    }
}
