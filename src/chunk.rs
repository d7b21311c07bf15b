//! Wire codec for the extended chunked-transfer body shared by client and server.
//!
//! Each chunk is a standard HTTP/1.1 chunk (`<hex-len>\r\n<payload>\r\n`) except
//! that the hex-length field is followed by `;`-delimited `key=value` metadata
//! describing which logical stream the payload belongs to. A size-0 chunk with
//! no metadata ends the body, exactly like a normal chunked trailer.

use std::io::{self, Read, Write};

use crate::errors::ProtocolError;

/// One parsed chunk header. `len` is the payload length in bytes (not the hex
/// text); metadata fields default to their empty/false values when the key is
/// absent from the header line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    pub len: usize,
    pub id: String,
    pub in_: String,
    pub out_: String,
    pub is_absent: bool,
    pub is_empty: bool,
    pub is_tar: bool,
}

const KNOWN_KEYS: &[&str] = &["id", "in", "out", "is_absent", "is_empty", "is_tar"];

fn valid_key(k: &str) -> bool {
    let b = k.as_bytes();
    if b.len() < 2 {
        return false;
    }
    if !(b[0] as char).is_ascii_lowercase() || !(b[b.len() - 1] as char).is_ascii_lowercase() {
        return false;
    }
    b[1..b.len() - 1]
        .iter()
        .all(|c| (*c as char).is_ascii_lowercase() || *c == b'_')
}

fn valid_value(v: &str) -> bool {
    v.bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.'))
}

impl ChunkHeader {
    pub fn new(id: impl Into<String>) -> Self {
        ChunkHeader {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Render the header line (without the trailing `\r\n`). Fields are
    /// emitted in sorted key order (`id, in, is_absent, is_empty, is_tar,
    /// out`).
    pub fn format(&self) -> String {
        let mut out = format!("{:x}", self.len);
        if !self.id.is_empty() {
            out.push_str(&format!(";id={}", self.id));
        }
        if !self.in_.is_empty() {
            out.push_str(&format!(";in={}", self.in_));
        }
        if self.is_absent {
            out.push_str(";is_absent=true");
        }
        if self.is_empty {
            out.push_str(";is_empty=true");
        }
        if self.is_tar {
            out.push_str(";is_tar=true");
        }
        if !self.out_.is_empty() {
            out.push_str(&format!(";out={}", self.out_));
        }
        out
    }

    /// Parse a header line already stripped of its trailing `\r\n`.
    pub fn parse(line: &str) -> Result<ChunkHeader, ProtocolError> {
        let mut parts = line.split(';');
        let len_hex = parts.next().unwrap_or("");
        let len = usize::from_str_radix(len_hex, 16)
            .map_err(|_| ProtocolError::Malformed(format!("bad chunk length: {len_hex}")))?;

        let mut header = ChunkHeader {
            len,
            ..Default::default()
        };
        for kv in parts {
            if kv.is_empty() {
                continue;
            }
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| ProtocolError::Malformed(format!("bad key=value pair: {kv}")))?;
            if !valid_key(k) || !valid_value(v) {
                return Err(ProtocolError::Malformed(format!("bad key=value pair: {kv}")));
            }
            // Unknown keys are explicitly dropped rather than silently accepted.
            if !KNOWN_KEYS.contains(&k) {
                continue;
            }
            match k {
                "id" => header.id = v.to_string(),
                "in" => header.in_ = v.to_string(),
                "out" => header.out_ = v.to_string(),
                "is_absent" => header.is_absent = v.eq_ignore_ascii_case("true"),
                "is_empty" => header.is_empty = v.eq_ignore_ascii_case("true"),
                "is_tar" => header.is_tar = v.eq_ignore_ascii_case("true"),
                _ => unreachable!(),
            }
        }
        Ok(header)
    }
}

fn read_line<R: Read>(r: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte)?;
        if n == 0 {
            return if buf.is_empty() { Ok(None) } else { Ok(Some(String::from_utf8_lossy(&buf).into_owned())) };
        }
        if byte[0] == b'\n' {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        buf.push(byte[0]);
    }
}

/// Read one chunk: header line, payload, trailing CRLF. Returns `None` at the
/// terminal zero-length chunk (mirrors the caller's loop-until-done idiom).
pub fn read_chunk<R: Read>(r: &mut R) -> Result<Option<(ChunkHeader, Vec<u8>)>, ProtocolError> {
    let line = match read_line(r)? {
        Some(l) => l,
        None => return Ok(None),
    };
    let header = ChunkHeader::parse(&line)?;
    if header.len == 0 {
        // Drain the trailer's blank line(s), if any, same as a standard chunked body.
        let _ = read_line(r)?;
        return Ok(None);
    }
    let mut payload = vec![0u8; header.len];
    r.read_exact(&mut payload)?;
    let mut crlf = [0u8; 2];
    r.read_exact(&mut crlf)?;
    Ok(Some((header, payload)))
}

/// Write one chunk: header line, payload, trailing CRLF. `header.len` is
/// overwritten with `payload.len()` before framing — callers only need to
/// set the metadata fields, same as `SendChunk` deriving the wire length
/// from the data it was actually handed.
pub fn write_chunk<W: Write>(w: &mut W, header: &ChunkHeader, payload: &[u8]) -> io::Result<()> {
    let mut header = header.clone();
    header.len = payload.len();
    write!(w, "{}\r\n", header.format())?;
    w.write_all(payload)?;
    w.write_all(b"\r\n")?;
    Ok(())
}

/// Write the terminal zero-length chunk that ends the body.
pub fn write_final_chunk<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(b"0\r\n\r\n")
}
