//! Deterministic byte layout for resume tokens.
//!
//! Every token starts with its format byte so a decoder can dispatch before
//! touching anything else. Fixed-width fields are big endian and variable
//! strings use an order-preserving escape, so within one format the encoded
//! bytes sort exactly like the tokens they carry.

use super::{DocumentKey, ResumeToken, TieBreakers, TokenFormatVersion, TokenKind};
use crate::oplog::LogicalTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;
const ORIGIN_ABSENT: u8 = 0;
const ORIGIN_PRESENT: u8 = 1;

/// Failure modes surfaced while decoding a token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed resume token: {reason}")]
    Malformed { reason: String },
    #[error("unsupported resume token version {found} (newest understood is {max_supported})")]
    UnsupportedVersion { found: u8, max_supported: u8 },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Encodes a token. Identical tokens always produce identical bytes.
pub fn encode(token: &ResumeToken) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.push(token.version().as_byte());
    out.extend_from_slice(&token.timestamp().secs.to_be_bytes());
    out.extend_from_slice(&token.timestamp().inc.to_be_bytes());
    out.push(token.kind().rank());
    out.extend_from_slice(&token.txn_op_index().to_be_bytes());
    if let Some(tie_breakers) = token.tie_breakers() {
        if token.version().carries_origin() {
            match &tie_breakers.origin {
                Some(origin) => {
                    out.push(ORIGIN_PRESENT);
                    write_escaped(&mut out, origin.as_bytes());
                }
                None => out.push(ORIGIN_ABSENT),
            }
        }
        write_escaped(&mut out, tie_breakers.document_key.as_bytes());
    }
    out
}

/// Decodes a token, refusing formats newer than `max_version`.
pub fn decode(bytes: &[u8], max_version: TokenFormatVersion) -> Result<ResumeToken, DecodeError> {
    let mut reader = Reader::new(bytes);
    let version_byte = reader
        .u8()
        .map_err(|_| DecodeError::malformed("empty token"))?;
    let version = match TokenFormatVersion::from_byte(version_byte) {
        Some(version) if version <= max_version => version,
        _ => {
            return Err(DecodeError::UnsupportedVersion {
                found: version_byte,
                max_supported: max_version.as_byte(),
            })
        }
    };
    let secs = reader.u32()?;
    let inc = reader.u32()?;
    let timestamp = LogicalTime::new(secs, inc);
    let kind_byte = reader.u8()?;
    let kind = TokenKind::from_rank(kind_byte)
        .ok_or_else(|| DecodeError::malformed(format!("unknown token kind {kind_byte}")))?;
    let txn_op_index = reader.u32()?;

    let token = match kind {
        TokenKind::HighWaterMark => {
            if txn_op_index != 0 {
                return Err(DecodeError::malformed(format!(
                    "high-water-mark token with txn_op_index {txn_op_index}"
                )));
            }
            ResumeToken::high_water_mark(version, timestamp)
        }
        TokenKind::Event => {
            let origin = if version.carries_origin() {
                match reader.u8()? {
                    ORIGIN_ABSENT => None,
                    ORIGIN_PRESENT => Some(
                        String::from_utf8(reader.escaped()?)
                            .map_err(|_| DecodeError::malformed("origin is not utf-8"))?,
                    ),
                    other => {
                        return Err(DecodeError::malformed(format!("bad origin flag {other}")))
                    }
                }
            } else {
                None
            };
            let document_key = DocumentKey::new(reader.escaped()?);
            ResumeToken::event(
                version,
                timestamp,
                txn_op_index,
                TieBreakers::new(origin, document_key),
            )
            .map_err(|err| DecodeError::malformed(err.to_string()))?
        }
    };

    if !reader.is_empty() {
        return Err(DecodeError::malformed(format!(
            "{} trailing bytes",
            reader.remaining()
        )));
    }
    Ok(token)
}

/// Lower-case hex rendering of the encoded token.
pub fn to_hex(token: &ResumeToken) -> String {
    hex::encode(encode(token))
}

/// Parses a hex string produced by [`to_hex`] and decodes it.
pub fn from_hex(data: &str, max_version: TokenFormatVersion) -> Result<ResumeToken, DecodeError> {
    let bytes = hex::decode(data)
        .map_err(|err| DecodeError::malformed(format!("invalid hex token: {err}")))?;
    decode(&bytes, max_version)
}

fn write_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        out.push(byte);
        if byte == ESCAPE {
            out.push(ESCAPED_NUL);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

/// Opaque wire wrapper carried in requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedResumeToken {
    #[serde(rename = "_data")]
    pub data: String,
}

impl EncodedResumeToken {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    pub fn from_token(token: &ResumeToken) -> Self {
        Self {
            data: to_hex(token),
        }
    }

    /// Decodes the wrapped token for a process that understands `max_version`.
    pub fn decode(&self, max_version: TokenFormatVersion) -> Result<ResumeToken, DecodeError> {
        from_hex(&self.data, max_version)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(DecodeError::malformed(format!(
                "truncated at offset {}",
                self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn escaped(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        loop {
            let byte = self.u8()?;
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            match self.u8()? {
                ESCAPED_NUL => out.push(ESCAPE),
                TERMINATOR => return Ok(out),
                other => {
                    return Err(DecodeError::malformed(format!(
                        "invalid escape sequence 0x00 0x{other:02x}"
                    )))
                }
            }
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
