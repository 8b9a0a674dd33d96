/// Application-side client for the broker
///
/// `BrokerClient` speaks the control protocol over one channel. Calls are
/// sequential, matching the broker's one-request-at-a-time sessions; use a
/// second client when one channel is parked in `await_handoff`.
///
/// `DonationListener` is the receiving end of a local SNI backend.

use crate::broker::{Donation, Request, Response, Transport};
use crate::credentials::RuntimeCertificate;
use crate::handoff::{ConnectionMeta, HandoffOutcome, HandoffToken};
use crate::transfer::FdChannel;
use hostlink_common::error::Result;
use hostlink_common::{BrokerError, Destination, DialOptions};
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::debug;

/// A connected socket handed over by `dial`
#[derive(Debug)]
pub struct DialedSocket {
    pub socket: OwnedFd,
    pub peer: String,
    pub transport: Transport,
    pub credential: Option<RuntimeCertificate>,
}

impl DialedSocket {
    /// Converts into a tokio TCP stream. Fails for Unix transports.
    pub fn into_tcp(self) -> Result<tokio::net::TcpStream> {
        if self.transport != Transport::Tcp {
            return Err(BrokerError::invalid("socket is not a TCP connection"));
        }
        let stream = std::net::TcpStream::from(self.socket);
        stream.set_nonblocking(true)?;
        Ok(tokio::net::TcpStream::from_std(stream)?)
    }

    /// Converts into a tokio Unix stream. Fails for TCP transports.
    pub fn into_unix(self) -> Result<tokio::net::UnixStream> {
        if self.transport != Transport::Unix {
            return Err(BrokerError::invalid("socket is not a Unix connection"));
        }
        let stream = std::os::unix::net::UnixStream::from(self.socket);
        stream.set_nonblocking(true)?;
        Ok(tokio::net::UnixStream::from_std(stream)?)
    }
}

pub struct BrokerClient {
    channel: FdChannel,
}

impl BrokerClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let channel = FdChannel::connect(path).await?;
        Ok(Self { channel })
    }

    /// Wraps an already bound channel, e.g. one end of a launcher socketpair.
    pub fn from_channel(channel: FdChannel) -> Self {
        Self { channel }
    }

    /// Returns the broker's protocol version.
    pub async fn ping(&mut self) -> Result<u32> {
        match self.call(&Request::Ping, &[]).await? {
            (Response::Pong { version }, _) => Ok(version),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn dial(
        &mut self,
        destination: Destination,
        options: DialOptions,
    ) -> Result<DialedSocket> {
        let request = Request::Dial {
            destination,
            options,
        };
        match self.call(&request, &[]).await? {
            (
                Response::Dialed {
                    peer,
                    transport,
                    credential,
                },
                fds,
            ) => {
                let socket = single(fds)?;
                debug!("Dialed {} over {}", peer, transport);
                Ok(DialedSocket {
                    socket,
                    peer,
                    transport,
                    credential,
                })
            }
            (other, _) => Err(unexpected(&other)),
        }
    }

    /// Offers live connections for adoption. The caller keeps its copies
    /// until `await_handoff` reports `Committed`.
    pub async fn offer_handoff(
        &mut self,
        connections: Vec<(ConnectionMeta, BorrowedFd<'_>)>,
    ) -> Result<HandoffToken> {
        let (metas, fds): (Vec<ConnectionMeta>, Vec<BorrowedFd<'_>>) =
            connections.into_iter().unzip();
        let request = Request::OfferHandoff { connections: metas };
        match self.call(&request, &fds).await? {
            (Response::HandoffOffered { token }, _) => Ok(token),
            (other, _) => Err(unexpected(&other)),
        }
    }

    /// Blocks until the offer is adopted, aborted or expires.
    pub async fn await_handoff(&mut self, token: &HandoffToken) -> Result<HandoffOutcome> {
        let request = Request::AwaitHandoff {
            token: token.clone(),
        };
        match self.call(&request, &[]).await? {
            (Response::HandoffOutcome { outcome, .. }, _) => Ok(outcome),
            (other, _) => Err(unexpected(&other)),
        }
    }

    /// Takes over the connections offered under `token` and acknowledges
    /// receipt, which commits the handoff.
    pub async fn adopt(&mut self, token: &HandoffToken) -> Result<Vec<(ConnectionMeta, OwnedFd)>> {
        let request = Request::Adopt {
            token: token.clone(),
        };
        let (connections, fds) = match self.call(&request, &[]).await? {
            (Response::Adopted { connections, .. }, fds) => (connections, fds),
            (other, _) => return Err(unexpected(&other)),
        };

        if connections.len() != fds.len() {
            return Err(BrokerError::transport(format!(
                "adoption describes {} connections but carries {} descriptors",
                connections.len(),
                fds.len()
            )));
        }

        let ack = Request::AckAdoption {
            token: token.clone(),
        };
        match self.call(&ack, &[]).await? {
            (Response::Acknowledged { .. }, _) => {}
            (other, _) => return Err(unexpected(&other)),
        }

        Ok(connections.into_iter().zip(fds).collect())
    }

    async fn call(
        &mut self,
        request: &Request,
        fds: &[BorrowedFd<'_>],
    ) -> Result<(Response, Vec<OwnedFd>)> {
        self.channel.send_with_fds(request, fds).await?;
        match self.channel.recv::<Response>().await? {
            Some((Response::Failed(failure), _)) => Err(BrokerError::Remote(failure)),
            Some(frame) => Ok(frame),
            None => Err(BrokerError::transport("broker closed the control channel")),
        }
    }
}

fn single(fds: Vec<OwnedFd>) -> Result<OwnedFd> {
    let count = fds.len();
    let mut fds = fds.into_iter();
    match (fds.next(), count) {
        (Some(fd), 1) => Ok(fd),
        _ => Err(BrokerError::transport(format!(
            "expected one descriptor, received {}",
            count
        ))),
    }
}

fn unexpected(response: &Response) -> BrokerError {
    BrokerError::transport(format!("unexpected response: {:?}", response))
}

/// A client connection donated by the SNI multiplexor
#[derive(Debug)]
pub struct DonatedConnection {
    pub session_id: u64,
    pub server_name: String,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,

    /// Bytes the client already sent; process these before reading `stream`
    pub preamble: Vec<u8>,

    pub stream: tokio::net::TcpStream,
}

/// Accepts donations on a local backend path
pub struct DonationListener {
    listener: UnixListener,
    path: PathBuf,
}

impl DonationListener {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next donated connection.
    pub async fn accept(&self) -> Result<DonatedConnection> {
        let (stream, _) = self.listener.accept().await?;
        let mut channel = FdChannel::new(stream);

        let (donation, fds) = channel
            .recv::<Donation>()
            .await?
            .ok_or_else(|| BrokerError::transport("donation channel closed"))?;
        let socket = single(fds)?;

        let stream = std::net::TcpStream::from(socket);
        stream.set_nonblocking(true)?;

        Ok(DonatedConnection {
            session_id: donation.session_id,
            server_name: donation.server_name,
            peer_addr: donation.peer_addr,
            local_addr: donation.local_addr,
            preamble: donation.preamble,
            stream: tokio::net::TcpStream::from_std(stream)?,
        })
    }
}
