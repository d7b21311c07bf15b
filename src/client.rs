//! Client driver: turns an impersonated tool invocation into one HTTP/1.1
//! chunked request and dispatches the chunked response to stdout, stderr,
//! the exit buffer, and any requested output files/directories.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use crate::chunk::{self, ChunkHeader};
use crate::errors::{GrammarError, ProtocolError};
use crate::grammar::{self, Param, ParamKind};
use crate::tar_bridge::{self, TarExtractor};

const MAX_READ: usize = 8192;

/// Sentinel exit code returned to the OS when the server's response never
/// carried an `exit` chunk.
pub const NO_EXIT_CHUNK_SENTINEL: i32 = 111;

#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Grammar(GrammarError),
    Protocol(ProtocolError),
    Usage(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}
impl From<GrammarError> for ClientError {
    fn from(e: GrammarError) -> Self {
        ClientError::Grammar(e)
    }
}
impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "{e}"),
            ClientError::Grammar(e) => write!(f, "{}", crate::errors::display_for_grammar_error(e)),
            ClientError::Protocol(e) => write!(f, "{}", crate::errors::display_for_protocol_error(e)),
            ClientError::Usage(s) => write!(f, "{s}"),
        }
    }
}

/// `host`, `port`, `path` parsed out of a `http://host:port/path` URL.
/// Deliberately simple-minded — no query strings, no TLS (a trusted-network
/// transport is assumed; TLS and auth are a front proxy's job).
fn parse_url(url: &str) -> Result<(String, u16, String), ClientError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| ClientError::Usage(format!("unsupported URL scheme: {url}")))?;
    let slash = rest.find('/').unwrap_or(rest.len());
    let (host_port, path) = rest.split_at(slash);
    let path = if path.is_empty() { "/" } else { path };
    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| ClientError::Usage(format!("bad port in URL: {url}")))?,
        ),
        None => (host_port.to_string(), 8084),
    };
    Ok((host, port, path.to_string()))
}

enum InputPlan {
    Absent,
    Empty,
    File(PathBuf),
    Dir(PathBuf),
}

fn classify_input(path: &str) -> InputPlan {
    let p = Path::new(path);
    match std::fs::metadata(p) {
        Err(_) => InputPlan::Absent,
        Ok(meta) if meta.is_dir() => InputPlan::Dir(p.to_path_buf()),
        Ok(meta) if meta.len() == 0 => InputPlan::Empty,
        Ok(_) => InputPlan::File(p.to_path_buf()),
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Write the outbound body for every parameter the grammar produced. Returns
/// the map from output-placeholder index to the local path the caller gave,
/// used later to dispatch the response.
fn send_params<W: Write>(w: &mut W, params: &[Param]) -> Result<std::collections::HashMap<usize, String>, ClientError> {
    let mut out_targets = std::collections::HashMap::new();

    for p in params {
        match p.kind {
            ParamKind::Scalar => {
                let header = ChunkHeader {
                    id: format!("a{}", p.index),
                    ..Default::default()
                };
                chunk::write_chunk(w, &header, p.text.as_bytes())?;
            }
            ParamKind::InputFile => {
                let base = basename(&p.text);
                match classify_input(&p.text) {
                    InputPlan::Absent => {
                        let header = ChunkHeader {
                            id: format!("i{}", p.index),
                            in_: base,
                            is_absent: true,
                            ..Default::default()
                        };
                        chunk::write_chunk(w, &header, b"-")?;
                    }
                    InputPlan::Empty => {
                        let header = ChunkHeader {
                            id: format!("i{}", p.index),
                            in_: base,
                            is_empty: true,
                            ..Default::default()
                        };
                        chunk::write_chunk(w, &header, b"-")?;
                    }
                    InputPlan::File(path) => {
                        let mut f = BufReader::new(File::open(&path)?);
                        let mut buf = [0u8; MAX_READ];
                        loop {
                            let n = f.read(&mut buf)?;
                            if n == 0 {
                                break;
                            }
                            let header = ChunkHeader {
                                id: format!("i{}", p.index),
                                in_: base.clone(),
                                ..Default::default()
                            };
                            chunk::write_chunk(w, &header, &buf[..n])?;
                        }
                    }
                    InputPlan::Dir(path) => {
                        let template = ChunkHeader {
                            id: format!("i{}", p.index),
                            in_: base.clone(),
                            is_tar: true,
                            ..Default::default()
                        };
                        let sink = tar_bridge::ChunkedTarSink::new(&mut *w, template);
                        let arcname = format!("{base}/");
                        let mut sink = sink;
                        tar_bridge::send_dir_as_tar(&mut sink, &path, &arcname)?;
                    }
                }
            }
            ParamKind::OutputFile => {
                out_targets.insert(p.index, p.text.clone());
                let is_dir = Path::new(&p.text).is_dir();
                let exists = Path::new(&p.text).exists();
                let header = if is_dir {
                    ChunkHeader {
                        id: format!("o{}", p.index),
                        out_: ".".to_string(),
                        is_tar: true,
                        ..Default::default()
                    }
                } else if !exists {
                    ChunkHeader {
                        id: format!("o{}", p.index),
                        is_absent: true,
                        ..Default::default()
                    }
                } else {
                    ChunkHeader {
                        id: format!("o{}", p.index),
                        out_: basename(&p.text),
                        ..Default::default()
                    }
                };
                chunk::write_chunk(w, &header, b"-")?;
            }
        }
    }
    chunk::write_final_chunk(w)?;
    w.flush()?;
    Ok(out_targets)
}

enum OutSink {
    File(File),
    Tar(TarExtractor),
}

/// Read the chunked response and dispatch each chunk to stdout, stderr, the
/// exit buffer, or the matching output sink. Returns the parsed exit code,
/// or `None` if the response never carried an `exit` chunk.
fn read_response<R: Read>(
    r: &mut R,
    out_targets: &std::collections::HashMap<usize, String>,
) -> Result<Option<i32>, ClientError> {
    let mut sinks: std::collections::HashMap<usize, OutSink> = std::collections::HashMap::new();
    let mut exit_buf = String::new();
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    while let Some((header, payload)) = chunk::read_chunk(r)? {
        if header.id == "1" {
            if !(header.is_absent || header.is_empty) {
                stdout.write_all(&payload)?;
                stdout.flush()?;
            }
            continue;
        }
        if header.id == "2" {
            if !(header.is_absent || header.is_empty) {
                stderr.write_all(&payload)?;
                stderr.flush()?;
            }
            continue;
        }
        if header.id == "exit" {
            if !(header.is_absent || header.is_empty) {
                exit_buf.push_str(&String::from_utf8_lossy(&payload));
            }
            continue;
        }
        if let Some(idx_str) = header.id.strip_prefix('o') {
            let idx: usize = idx_str
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("bad output id: {}", header.id)))?;
            if header.is_absent || header.is_empty {
                continue;
            }
            let local = out_targets
                .get(&idx)
                .ok_or_else(|| ProtocolError::Malformed(format!("unexpected output id: {}", header.id)))?;

            if header.is_tar {
                let entry = sinks.entry(idx).or_insert_with(|| {
                    OutSink::Tar(TarExtractor::spawn(PathBuf::from(local)))
                });
                match entry {
                    OutSink::Tar(extractor) => extractor.push(payload),
                    OutSink::File(_) => {
                        return Err(ProtocolError::TarError(format!(
                            "expected a tar, not a plain file, for {}",
                            header.id
                        ))
                        .into())
                    }
                }
            } else {
                let entry = match sinks.entry(idx) {
                    std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                    std::collections::hash_map::Entry::Vacant(v) => {
                        v.insert(OutSink::File(File::create(local)?))
                    }
                };
                match entry {
                    OutSink::File(f) => f.write_all(&payload)?,
                    OutSink::Tar(_) => {
                        return Err(ProtocolError::Malformed(format!(
                            "expected a plain file, not a tar, for {}",
                            header.id
                        ))
                        .into())
                    }
                }
            }
            continue;
        }
        // Unknown stream id on the response: ignore its payload, matching
        // the codec's "unknown keys/ids are dropped" posture.
    }

    for (_, sink) in sinks {
        if let OutSink::Tar(extractor) = sink {
            extractor.finish()?;
        }
    }

    if exit_buf.trim().is_empty() {
        Ok(None)
    } else {
        exit_buf
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| ProtocolError::Malformed(format!("bad exit code: {exit_buf}")).into())
    }
}

/// Run one request/response cycle for `tool argv_rest` against `url`.
/// Returns the server-reported exit code, or `None` if the response never
/// carried an `exit` chunk.
pub fn call(tool: &str, args: &[String], url: &str) -> Result<Option<i32>, ClientError> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(tool.to_string());
    argv.extend(args.iter().cloned());
    let params = grammar::parse_full(&argv)?;
    let (host, port, path) = parse_url(url)?;

    let mut stream = TcpStream::connect((host.as_str(), port))?;
    let request_line = format!("POST {path} HTTP/1.1\r\n");
    let headers = format!(
        concat!(
            "Host: {host}\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Transfer-Encoding: chunked\r\n",
            "Content-Encoding: UTF-8\r\n",
            "Connection: close\r\n",
            "\r\n",
        ),
        host = host,
    );
    stream.write_all(request_line.as_bytes())?;
    stream.write_all(headers.as_bytes())?;

    let out_targets = send_params(&mut stream, &params)?;

    let mut reader = BufReader::new(stream);
    skip_http_response_headers(&mut reader)?;
    read_response(&mut reader, &out_targets)
}

/// Consume the status line and header block of the HTTP response, stopping
/// right at the start of the chunked body. Rejects anything other than 200.
fn skip_http_response_headers<R: Read>(r: &mut R) -> Result<(), ClientError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut status_line = String::new();
    let mut first = true;
    loop {
        line.clear();
        loop {
            let n = r.read(&mut byte)?;
            if n == 0 {
                return Err(ProtocolError::Malformed("connection closed before headers".into()).into());
            }
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        if first {
            status_line = text.clone();
            first = false;
        }
        if text.is_empty() {
            break;
        }
    }
    if !status_line.contains("200") {
        return Err(ProtocolError::Malformed(format!("unexpected status line: {status_line}")).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_defaults_port_and_path() {
        let (h, p, path) = parse_url("http://lab-host").unwrap();
        assert_eq!(h, "lab-host");
        assert_eq!(p, 8084);
        assert_eq!(path, "/");
    }

    #[test]
    fn parse_url_with_port_and_path() {
        let (h, p, path) = parse_url("http://lab-host:9000/exec").unwrap();
        assert_eq!(h, "lab-host");
        assert_eq!(p, 9000);
        assert_eq!(path, "/exec");
    }

    #[test]
    fn parse_url_rejects_non_http() {
        assert!(parse_url("unix:///tmp/sock").is_err());
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(basename("plain.txt"), "plain.txt");
    }
}
