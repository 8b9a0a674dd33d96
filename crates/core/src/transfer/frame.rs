use super::TransferError;
use hostlink_common::config::protocol::{FRAME_HEADER_LEN, MAX_FDS_PER_FRAME, MAX_FRAME_SIZE};

/// Fixed-size prefix of every control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: usize,
    pub fd_count: usize,
}

impl FrameHeader {
    pub fn new(body_len: usize, fd_count: usize) -> Result<Self, TransferError> {
        let header = Self { body_len, fd_count };
        header.check()?;
        Ok(header)
    }

    fn check(&self) -> Result<(), TransferError> {
        if self.body_len > MAX_FRAME_SIZE {
            return Err(TransferError::FrameTooLarge(self.body_len));
        }
        if self.fd_count > MAX_FDS_PER_FRAME {
            return Err(TransferError::TooManyDescriptors(self.fd_count));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[..4].copy_from_slice(&(self.body_len as u32).to_le_bytes());
        buf[4] = self.fd_count as u8;
        buf
    }

    /// Parses a header from the front of `buf`; `Ok(None)` when fewer than
    /// `FRAME_HEADER_LEN` bytes are buffered.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, TransferError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let header = Self {
            body_len,
            fd_count: buf[4] as usize,
        };
        header.check()?;
        Ok(Some(header))
    }

    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len
    }
}
