/// TLS ClientHello server-name extraction
///
/// A pure function over whatever bytes have been buffered so far. It never
/// needs keys, never allocates more than the handshake it is reassembling,
/// and tolerates a ClientHello split across any number of TLS records and
/// socket reads.

use std::fmt;

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const MAX_RECORD_LEN: usize = 1 << 14;
const MAX_SERVER_NAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleParse {
    /// Need more bytes
    Incomplete,
    /// Lowercased, without a trailing dot
    Parsed(String),
    Malformed(MalformedReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// The first byte is not a TLS handshake record
    NotHandshake,
    /// A non-handshake record arrived before the ClientHello was complete
    UnexpectedRecord,
    UnsupportedVersion,
    NotClientHello,
    BadLength,
    Truncated,
    DuplicateExtension,
    NoServerName,
    MultipleServerNames,
    InvalidServerName,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            MalformedReason::NotHandshake => "not a TLS handshake",
            MalformedReason::UnexpectedRecord => "unexpected record type",
            MalformedReason::UnsupportedVersion => "unsupported record version",
            MalformedReason::NotClientHello => "first handshake message is not a ClientHello",
            MalformedReason::BadLength => "inconsistent length field",
            MalformedReason::Truncated => "field runs past the end of the message",
            MalformedReason::DuplicateExtension => "duplicate server_name extension",
            MalformedReason::NoServerName => "no server name",
            MalformedReason::MultipleServerNames => "more than one host name",
            MalformedReason::InvalidServerName => "invalid host name",
        };
        f.write_str(reason)
    }
}

/// Looks for the SNI host name in the buffered start of a connection.
pub fn parse_server_name(buf: &[u8]) -> PreambleParse {
    match buf.first() {
        None => return PreambleParse::Incomplete,
        Some(&first) if first != CONTENT_HANDSHAKE => {
            return PreambleParse::Malformed(MalformedReason::NotHandshake)
        }
        Some(_) => {}
    }

    let mut handshake = Vec::new();
    let mut pos = 0;

    loop {
        let Some(header) = buf.get(pos..pos + RECORD_HEADER_LEN) else {
            return PreambleParse::Incomplete;
        };
        if header[0] != CONTENT_HANDSHAKE {
            return PreambleParse::Malformed(MalformedReason::UnexpectedRecord);
        }
        if header[1] != 3 {
            return PreambleParse::Malformed(MalformedReason::UnsupportedVersion);
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return PreambleParse::Malformed(MalformedReason::BadLength);
        }

        let start = pos + RECORD_HEADER_LEN;
        let available = buf.len().saturating_sub(start).min(record_len);
        handshake.extend_from_slice(&buf[start..start + available]);

        if let Some(result) = complete_client_hello(&handshake) {
            return result;
        }
        if available < record_len {
            return PreambleParse::Incomplete;
        }
        pos = start + record_len;
    }
}

/// `None` until the reassembled handshake message is complete.
fn complete_client_hello(handshake: &[u8]) -> Option<PreambleParse> {
    let &msg_type = handshake.first()?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Some(PreambleParse::Malformed(MalformedReason::NotClientHello));
    }
    if handshake.len() < HANDSHAKE_HEADER_LEN {
        return None;
    }
    let body_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let body = handshake.get(HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + body_len)?;

    Some(match client_hello_server_name(body) {
        Ok(name) => PreambleParse::Parsed(name),
        Err(reason) => PreambleParse::Malformed(reason),
    })
}

fn client_hello_server_name(body: &[u8]) -> Result<String, MalformedReason> {
    let mut r = Reader::new(body);

    let version = r.u16()?;
    if version >> 8 != 3 {
        return Err(MalformedReason::UnsupportedVersion);
    }
    r.bytes(32)?; // random

    let session_id_len = r.u8()? as usize;
    if session_id_len > 32 {
        return Err(MalformedReason::BadLength);
    }
    r.bytes(session_id_len)?;

    let suites_len = r.u16()? as usize;
    if suites_len == 0 || suites_len % 2 != 0 {
        return Err(MalformedReason::BadLength);
    }
    r.bytes(suites_len)?;

    let compression_len = r.u8()? as usize;
    if compression_len == 0 {
        return Err(MalformedReason::BadLength);
    }
    r.bytes(compression_len)?;

    if r.is_empty() {
        return Err(MalformedReason::NoServerName);
    }

    let extensions_len = r.u16()? as usize;
    let mut extensions = Reader::new(r.bytes(extensions_len)?);
    if !r.is_empty() {
        return Err(MalformedReason::BadLength);
    }

    let mut server_name = None;
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let data = extensions.bytes(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            if server_name.is_some() {
                return Err(MalformedReason::DuplicateExtension);
            }
            server_name = Some(server_name_extension(data)?);
        }
    }

    server_name.ok_or(MalformedReason::NoServerName)
}

fn server_name_extension(data: &[u8]) -> Result<String, MalformedReason> {
    let mut r = Reader::new(data);
    let list_len = r.u16()? as usize;
    if list_len != r.remaining() {
        return Err(MalformedReason::BadLength);
    }

    let mut host_names = Vec::new();
    while !r.is_empty() {
        let name_type = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = r.bytes(name_len)?;
        if name_type == NAME_TYPE_HOST {
            host_names.push(name);
        }
    }

    match host_names.as_slice() {
        [] => Err(MalformedReason::NoServerName),
        [name] => normalize_server_name(name),
        _ => Err(MalformedReason::MultipleServerNames),
    }
}

fn normalize_server_name(raw: &[u8]) -> Result<String, MalformedReason> {
    let name = std::str::from_utf8(raw).map_err(|_| MalformedReason::InvalidServerName)?;
    let name = name.strip_suffix('.').unwrap_or(name);

    if name.is_empty() || name.len() > MAX_SERVER_NAME_LEN {
        return Err(MalformedReason::InvalidServerName);
    }
    let valid_labels = name.split('.').all(|label| {
        !label.is_empty()
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });
    if !valid_labels {
        return Err(MalformedReason::InvalidServerName);
    }

    Ok(name.to_ascii_lowercase())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], MalformedReason> {
        let end = self.pos.checked_add(n).ok_or(MalformedReason::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(MalformedReason::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MalformedReason> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MalformedReason> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
