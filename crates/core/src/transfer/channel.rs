/// Framed control channel that can carry file descriptors
///
/// Descriptors attached to a frame are sent as `SCM_RIGHTS` on the first
/// `sendmsg` of that frame, so they always arrive no later than the frame's
/// first byte. The receiver tags each descriptor with the stream offset it
/// arrived at, hands a frame only the descriptors that arrived inside its
/// bytes, and closes any beyond the count the header announces.

use super::{FrameHeader, TransferError};
use hostlink_common::config::protocol::{FRAME_HEADER_LEN, MAX_FDS_PER_FRAME};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Descriptors held for frames not yet complete
const MAX_PENDING_FDS: usize = 2 * MAX_FDS_PER_FRAME;

/// A received descriptor and the stream offset of the byte it came with
#[derive(Debug)]
struct PendingFd {
    offset: u64,
    fd: OwnedFd,
}

pub struct FdChannel {
    stream: UnixStream,
    read_buf: Vec<u8>,
    /// Stream offset of `read_buf[0]`
    consumed: u64,
    pending_fds: VecDeque<PendingFd>,
}

impl FdChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            consumed: 0,
            pending_fds: VecDeque::new(),
        }
    }

    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }

    /// Adopts a blocking std stream, e.g. one end of a launcher-made pair.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// A connected pair, for launchers and tests.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Unix credentials of the process on the other end.
    pub fn peer_uid(&self) -> io::Result<u32> {
        Ok(self.stream.peer_cred()?.uid())
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransferError> {
        self.send_with_fds(message, &[]).await
    }

    /// Sends one frame. The caller still owns `fds` and should drop its
    /// copies once this returns `Ok`.
    pub async fn send_with_fds<T: Serialize>(
        &mut self,
        message: &T,
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), TransferError> {
        let body = bincode::serialize(message).map_err(|e| TransferError::Encode(e.to_string()))?;
        let header = FrameHeader::new(body.len(), fds.len())?;

        let mut frame = Vec::with_capacity(header.frame_len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&body);

        if fds.is_empty() {
            self.stream.write_all(&frame).await?;
        } else {
            let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
            let sock = self.stream.as_raw_fd();
            let sent = self
                .stream
                .async_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(&frame)];
                    let cmsgs = [ControlMessage::ScmRights(&raw)];
                    sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
                        .map_err(io::Error::from)
                })
                .await?;

            if sent < frame.len() {
                self.stream.write_all(&frame[sent..]).await?;
            }
        }

        debug!(
            "Sent frame: {} bytes, {} descriptors",
            header.body_len, header.fd_count
        );
        Ok(())
    }

    /// Receives the next frame. `Ok(None)` on a clean close between frames.
    ///
    /// `TransferError::Decode` means the frame was consumed but its body did
    /// not parse; the channel stays in sync and the next `recv` reads the
    /// following frame. Any other error leaves the channel unusable.
    pub async fn recv<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<(T, Vec<OwnedFd>)>, TransferError> {
        loop {
            if let Some(header) = FrameHeader::decode(&self.read_buf)? {
                if self.read_buf.len() >= header.frame_len() {
                    return self.take_frame(header).map(Some);
                }
            }

            if self.fill().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransferError::UnexpectedEof);
            }
        }
    }

    fn take_frame<T: DeserializeOwned>(
        &mut self,
        header: FrameHeader,
    ) -> Result<(T, Vec<OwnedFd>), TransferError> {
        let frame_end = self.consumed + header.frame_len() as u64;
        let mut fds = Vec::new();
        while let Some(pending) = self.pending_fds.front() {
            if pending.offset >= frame_end {
                break;
            }
            if let Some(pending) = self.pending_fds.pop_front() {
                fds.push(pending.fd);
            }
        }

        if fds.len() < header.fd_count {
            return Err(TransferError::MissingDescriptors {
                expected: header.fd_count,
                received: fds.len(),
            });
        }
        if fds.len() > header.fd_count {
            warn!(
                "Frame announced {} descriptors but carried {}; closing the rest",
                header.fd_count,
                fds.len()
            );
            fds.truncate(header.fd_count);
        }

        let frame: Vec<u8> = self.read_buf.drain(..header.frame_len()).collect();
        self.consumed = frame_end;

        // Descriptors of an undecodable frame are closed with `fds`.
        let message = bincode::deserialize(&frame[FRAME_HEADER_LEN..])
            .map_err(|e| TransferError::Decode(e.to_string()))?;

        debug!(
            "Received frame: {} bytes, {} descriptors",
            header.body_len, header.fd_count
        );
        Ok((message, fds))
    }

    /// One `recvmsg`; returns the number of bytes read.
    async fn fill(&mut self) -> Result<usize, TransferError> {
        let sock = self.stream.as_raw_fd();
        let mut chunk = [0u8; READ_CHUNK];

        let (bytes, fds, truncated) = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
                let msg = recvmsg::<()>(
                    sock,
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut fds = Vec::new();
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        // SAFETY: the kernel just installed these descriptors
                        // in our table and nothing else refers to them.
                        fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                }
                Ok((msg.bytes, fds, msg.flags.contains(MsgFlags::MSG_CTRUNC)))
            })
            .await?;

        // Descriptors that did arrive are closed when `fds` drops.
        if truncated {
            return Err(TransferError::Truncated);
        }

        if bytes == 0 {
            return Ok(0);
        }

        self.read_buf.extend_from_slice(&chunk[..bytes]);
        // The kernel stops a read right after the segment carrying
        // descriptors, so they belong to the frame holding the last byte.
        let offset = self.consumed + self.read_buf.len() as u64 - 1;
        self.pending_fds
            .extend(fds.into_iter().map(|fd| PendingFd { offset, fd }));
        if self.pending_fds.len() > MAX_PENDING_FDS {
            return Err(TransferError::TooManyDescriptors(self.pending_fds.len()));
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for FdChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdChannel")
            .field("fd", &self.stream.as_raw_fd())
            .field("buffered", &self.read_buf.len())
            .field("pending_fds", &self.pending_fds.len())
            .finish()
    }
}
