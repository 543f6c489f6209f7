//! Frame encoding and decoding for the Parley wire protocol.
//!
//! Every string on the wire is a big-endian `u16` byte length followed by
//! UTF-8 bytes. Two protocol generations coexist:
//!
//! - **Framed**: a bare token (`MSG`, `FILE`) followed by separate string
//!   fields and, for files, a big-endian `u64` length and the raw bytes.
//! - **Legacy**: a single colon-delimited string (`MSG:<peer>:<text>`,
//!   `FILE:<peer>:<name>:<length>`) followed by raw bytes for files. This is a
//!   compatibility shim for older peers; new senders should use `Framed`.
//!
//! `INGRESE_NOMBRE` and `LISTA:<names>` are shared by both generations.
//! Decoding tries the framed tokens first and falls back to colon splitting.

use crate::error::{Error, Result};
use crate::{DEFAULT_MAX_PAYLOAD, NAME_REQUEST};
use tokio::io::{AsyncRead, AsyncReadExt};

const TOKEN_TEXT: &str = "MSG";
const TOKEN_FILE: &str = "FILE";
const LEGACY_TEXT_PREFIX: &str = "MSG:";
const LEGACY_FILE_PREFIX: &str = "FILE:";
const ROSTER_PREFIX: &str = "LISTA:";

/// Read granularity for stream frame payloads.
const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Which protocol generation a frame was (or should be) encoded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Colon-delimited single-string headers
    #[default]
    Legacy,
    /// Separate length-prefixed fields
    Framed,
}

/// One complete protocol message
///
/// `peer` is the target when a peer sends to the relay and the original
/// sender when the relay forwards to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Relay asks the peer for its display name
    NameRequest,
    /// Text message
    Text {
        /// Target or sender name
        peer: String,
        /// Message body
        text: String,
    },
    /// File transfer
    File {
        /// Target or sender name
        peer: String,
        /// File name as chosen by the sender
        name: String,
        /// Exact file contents
        data: Vec<u8>,
    },
    /// Names of every registered session
    Roster(Vec<String>),
}

impl Frame {
    /// Get the frame type name
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::NameRequest => "NameRequest",
            Frame::Text { .. } => "Text",
            Frame::File { .. } => "File",
            Frame::Roster(_) => "Roster",
        }
    }
}

/// Append a length-prefixed UTF-8 string to `buf`.
///
/// # Errors
///
/// Returns [`Error::StringTooLong`] if `s` exceeds `u16::MAX` bytes.
pub fn write_utf(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| Error::StringTooLong(s.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Read one length-prefixed UTF-8 string.
///
/// # Errors
///
/// Returns an I/O error on end-of-stream and a protocol violation on
/// invalid UTF-8.
pub async fn read_utf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await?;
    let mut bytes = vec![0u8; usize::from(len)];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| Error::violation("string is not valid UTF-8"))
}

/// Encode a frame into a single contiguous buffer.
///
/// Callers write the returned buffer under the session write lock so a frame
/// is never interleaved with another.
///
/// # Errors
///
/// Returns [`Error::StringTooLong`] if any string field does not fit.
pub fn encode_frame(frame: &Frame, dialect: Dialect) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match (frame, dialect) {
        (Frame::NameRequest, _) => write_utf(&mut buf, NAME_REQUEST)?,
        (Frame::Roster(names), _) => {
            write_utf(&mut buf, &format!("{ROSTER_PREFIX}{}", names.join(",")))?;
        }
        (Frame::Text { peer, text }, Dialect::Framed) => {
            write_utf(&mut buf, TOKEN_TEXT)?;
            write_utf(&mut buf, peer)?;
            write_utf(&mut buf, text)?;
        }
        (Frame::Text { peer, text }, Dialect::Legacy) => {
            write_utf(&mut buf, &format!("{LEGACY_TEXT_PREFIX}{peer}:{text}"))?;
        }
        (Frame::File { peer, name, data }, Dialect::Framed) => {
            buf.reserve(data.len() + 64);
            write_utf(&mut buf, TOKEN_FILE)?;
            write_utf(&mut buf, peer)?;
            write_utf(&mut buf, name)?;
            buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
            buf.extend_from_slice(data);
        }
        (Frame::File { peer, name, data }, Dialect::Legacy) => {
            buf.reserve(data.len() + 64);
            write_utf(
                &mut buf,
                &format!("{LEGACY_FILE_PREFIX}{peer}:{name}:{}", data.len()),
            )?;
            buf.extend_from_slice(data);
        }
    }
    Ok(buf)
}

/// Split a legacy text body (`<peer>:<text>`, prefix already removed).
///
/// Only the first colon separates fields, so the text may contain colons.
///
/// # Errors
///
/// Returns a protocol violation if the separator is missing.
pub fn parse_legacy_text(body: &str) -> Result<(String, String)> {
    let (peer, text) = body
        .split_once(':')
        .ok_or_else(|| Error::violation(format!("malformed legacy text frame: {body}")))?;
    Ok((peer.to_string(), text.to_string()))
}

/// Split a legacy file header body (`<peer>:<name>:<length>`, prefix removed).
///
/// The peer ends at the first colon and the length starts after the last, so
/// file names may contain colons.
///
/// # Errors
///
/// Returns a protocol violation if a field is missing or the length is not a
/// non-negative integer.
pub fn parse_legacy_file(body: &str) -> Result<(String, String, u64)> {
    let malformed = || Error::violation(format!("malformed legacy file header: {body}"));
    let (peer, rest) = body.split_once(':').ok_or_else(malformed)?;
    let (name, len) = rest.rsplit_once(':').ok_or_else(malformed)?;
    let len = len.trim().parse::<u64>().map_err(|_| malformed())?;
    Ok((peer.to_string(), name.to_string(), len))
}

fn parse_roster(body: &str) -> Vec<String> {
    body.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    inner: R,
    max_payload: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default payload ceiling
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    /// Create a reader with a custom payload ceiling
    pub fn with_max_payload(inner: R, max_payload: u64) -> Self {
        Self { inner, max_payload }
    }

    /// Read one raw string (used for the handshake name reply).
    ///
    /// # Errors
    ///
    /// See [`read_utf`].
    pub async fn read_string(&mut self) -> Result<String> {
        read_utf(&mut self.inner).await
    }

    /// Read the next complete frame and the generation it was encoded in.
    ///
    /// # Errors
    ///
    /// - I/O errors (including end-of-stream) when the connection is gone
    /// - [`Error::TruncatedTransfer`] if a stream frame ends early
    /// - [`Error::PayloadTooLarge`] if a stream frame exceeds the ceiling
    /// - [`Error::ProtocolViolation`] on unknown tokens or malformed headers
    pub async fn read_frame(&mut self) -> Result<(Frame, Dialect)> {
        let token = read_utf(&mut self.inner).await?;

        match token.as_str() {
            NAME_REQUEST => Ok((Frame::NameRequest, Dialect::Legacy)),
            TOKEN_TEXT => {
                let peer = read_utf(&mut self.inner).await?;
                let text = read_utf(&mut self.inner).await?;
                Ok((Frame::Text { peer, text }, Dialect::Framed))
            }
            TOKEN_FILE => {
                let peer = read_utf(&mut self.inner).await?;
                let name = read_utf(&mut self.inner).await?;
                let len = self.inner.read_u64().await?;
                let data = self.read_payload(len).await?;
                Ok((Frame::File { peer, name, data }, Dialect::Framed))
            }
            _ => self.read_legacy(&token).await,
        }
    }

    async fn read_legacy(&mut self, token: &str) -> Result<(Frame, Dialect)> {
        if let Some(body) = token.strip_prefix(LEGACY_TEXT_PREFIX) {
            let (peer, text) = parse_legacy_text(body)?;
            return Ok((Frame::Text { peer, text }, Dialect::Legacy));
        }
        if let Some(body) = token.strip_prefix(LEGACY_FILE_PREFIX) {
            let (peer, name, len) = parse_legacy_file(body)?;
            let data = self.read_payload(len).await?;
            return Ok((Frame::File { peer, name, data }, Dialect::Legacy));
        }
        if let Some(body) = token.strip_prefix(ROSTER_PREFIX) {
            return Ok((Frame::Roster(parse_roster(body)), Dialect::Legacy));
        }
        Err(Error::violation(format!("unexpected token: {token}")))
    }

    /// Consume exactly `len` payload bytes, looping over partial reads.
    async fn read_payload(&mut self, len: u64) -> Result<Vec<u8>> {
        if len > self.max_payload {
            return Err(Error::PayloadTooLarge {
                declared: len,
                limit: self.max_payload,
            });
        }

        let capacity = usize::try_from(len).unwrap_or(usize::MAX).min(1 << 20);
        let mut data = Vec::with_capacity(capacity);
        let mut chunk = vec![0u8; PAYLOAD_CHUNK];

        while (data.len() as u64) < len {
            let remaining = len - data.len() as u64;
            let want = remaining.min(PAYLOAD_CHUNK as u64) as usize;
            let n = self.inner.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(Error::TruncatedTransfer {
                    expected: len,
                    received: data.len() as u64,
                });
            }
            data.extend_from_slice(&chunk[..n]);
        }

        Ok(data)
    }
}
