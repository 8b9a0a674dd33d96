/// Outbound connection establishment

use hostlink_common::NetworkLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Unix,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Unix => f.write_str("unix"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// A freshly connected stream, before it is handed off
#[derive(Debug)]
pub enum Connected {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connected {
    /// Connects `location`, bounding every attempt by `limit`.
    pub async fn open(location: &NetworkLocation, limit: Duration) -> io::Result<Self> {
        match location {
            NetworkLocation::Unix(path) => {
                let stream = bounded(limit, UnixStream::connect(path)).await?;
                Ok(Connected::Unix(stream))
            }
            NetworkLocation::Tcp(addr) => Self::tcp(*addr, limit).await,
            NetworkLocation::Hostname(host, port) => {
                let addrs: Vec<SocketAddr> =
                    bounded(limit, tokio::net::lookup_host((host.as_str(), *port)))
                        .await?
                        .collect();
                Self::first_of(&addrs, limit).await
            }
        }
    }

    pub async fn tcp(addr: SocketAddr, limit: Duration) -> io::Result<Self> {
        let stream = bounded(limit, TcpStream::connect(addr)).await?;
        Ok(Connected::Tcp(stream))
    }

    /// Tries each address in order and returns the first that accepts.
    pub async fn first_of(addrs: &[SocketAddr], limit: Duration) -> io::Result<Self> {
        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "name resolved to no addresses");
        for addr in addrs {
            match Self::tcp(*addr, limit).await {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn transport(&self) -> Transport {
        match self {
            Connected::Unix(_) => Transport::Unix,
            Connected::Tcp(_) => Transport::Tcp,
        }
    }

    /// Human-readable remote end
    pub fn peer(&self) -> String {
        match self {
            Connected::Unix(stream) => stream
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| format!("unix:{}", p.display())))
                .unwrap_or_else(|| "unix:(unnamed)".to_string()),
            Connected::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:(unknown)".to_string()),
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Connected::Unix(stream) => stream.write_all(bytes).await,
            Connected::Tcp(stream) => stream.write_all(bytes).await,
        }
    }

    /// Detaches the descriptor from the runtime. The socket is switched back
    /// to blocking mode, the default an application expects from `connect`.
    pub fn into_owned_fd(self) -> io::Result<OwnedFd> {
        match self {
            Connected::Unix(stream) => {
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                Ok(OwnedFd::from(stream))
            }
            Connected::Tcp(stream) => {
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                Ok(OwnedFd::from(stream))
            }
        }
    }
}

async fn bounded<T, F>(limit: Duration, future: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {:?}", limit),
        )),
    }
}
