//! TCP streams with Nagle disabled and keep-alive enabled.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};

use super::{Connection, Listener};
use crate::error::TransportError;

pub const LOOPBACK: &str = "127.0.0.1";

fn socket_for(addr: &SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

async fn resolve(address: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    if address.trim().is_empty() {
        return Err(TransportError::InvalidAddress("empty address".to_string()));
    }
    let addrs: Vec<SocketAddr> = lookup_host((address, port))
        .await
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", address, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(addrs)
}

/// Connect within `timeout`, trying each resolved address in turn.
pub async fn connect(
    address: &str,
    port: u16,
    timeout: Duration,
) -> Result<Connection, TransportError> {
    let target = format!("{}:{}", address, port);
    let addrs = resolve(address, port).await?;

    let attempt = async {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address");
        for addr in &addrs {
            let result = match socket_for(addr) {
                Ok(socket) => socket.connect(*addr).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    };

    let stream = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout(target.clone()))?
        .map_err(|source| TransportError::Unreachable {
            addr: target.clone(),
            source,
        })?;

    log::info!("Connected to {}", target);
    Ok(Connection::new(stream, target))
}

/// Listening TCP socket.
pub struct TcpServer {
    listener: TcpListener,
    port: u16,
}

impl TcpServer {
    pub async fn bind(address: &str, port: u16) -> Result<Self, TransportError> {
        let addr = resolve(address, port).await?[0];
        let socket = socket_for(&addr)?;
        let in_use = |e: io::Error| match e.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddressInUse(port),
            _ => TransportError::Listen(e),
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr).map_err(in_use)?;
        let listener = socket.listen(1024).map_err(in_use)?;
        let port = listener.local_addr()?.port();
        log::info!("Listening on {}:{}", address, port);
        Ok(Self { listener, port })
    }

    /// Bound port; differs from the requested one when binding port 0.
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl Listener for TcpServer {
    async fn accept(&mut self) -> Result<Connection, TransportError> {
        let (stream, peer): (TcpStream, SocketAddr) = self.listener.accept().await?;
        // keep-alive is inherited from the listening socket
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream, peer.to_string()))
    }

    fn local_description(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp://{}", addr),
            Err(_) => format!("tcp://*:{}", self.port),
        }
    }
}
