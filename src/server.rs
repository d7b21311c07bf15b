//! Server request handler: accepts connections, answers `GET /healthz`,
//! rejects other GETs, and runs the six-phase POST pipeline (read, validate,
//! respond, execute, return outputs, cleanup) for everything else.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::{self, ChunkHeader};
use crate::errors::ProtocolError;
use crate::grammar::{self, ParamKind};
use crate::subprocess_io::{self, LoopOutcome};
use crate::tar_bridge::{self, TarExtractor};
use crate::tempfs::TempFs;

pub struct ServerConfig {
    pub verbose: bool,
    /// Mirrors `$IDEVICE_PATH`: an optional directory prefix prepended to
    /// the subprocess's own argv[0] before exec.
    pub idevice_path: Option<String>,
}

/// Bind and serve forever, one thread per accepted connection.
pub fn serve(bind: &str, cfg: ServerConfig) -> io::Result<()> {
    let listener = TcpListener::bind(bind)?;
    tracing::info!(addr = %bind, "relay-server listening");
    let cfg = Arc::new(cfg);
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let cfg = Arc::clone(&cfg);
        std::thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            if let Err(e) = handle_connection(stream, &cfg) {
                tracing::warn!(peer = %peer, error = %e, "connection handling failed");
            }
        });
    }
    Ok(())
}

enum InputSink {
    File(File),
    Tar(TarExtractor),
}

struct ServerParam {
    index: usize,
    kind: ParamKind,
    /// Scalar text, or the local staged path for input/output files.
    value: String,
    is_absent: bool,
    sink: Option<InputSink>,
    out_dn: Option<PathBuf>,
    out_is_tar_hint: bool,
}

fn read_line<R: Read>(r: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte)?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

struct Request {
    method: String,
    path: String,
}

fn read_request_head<R: Read>(r: &mut R) -> io::Result<Request> {
    let line = read_line(r)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("/").to_string();
    loop {
        let header_line = read_line(r)?;
        if header_line.is_empty() {
            break;
        }
    }
    Ok(Request { method, path })
}

fn write_plain_response<W: Write>(w: &mut W, status: &str, body: &[u8]) -> io::Result<()> {
    write!(
        w,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    w.write_all(body)?;
    w.flush()
}

fn handle_connection(mut stream: TcpStream, cfg: &ServerConfig) -> io::Result<()> {
    let req = read_request_head(&mut stream)?;
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/healthz") => write_plain_response(&mut stream, "200 OK", b"ok\n"),
        ("GET", _) => write_plain_response(&mut stream, "405 Method Not Allowed", b"method not allowed\n"),
        ("POST", _) => process_post(stream, cfg),
        _ => write_plain_response(&mut stream, "405 Method Not Allowed", b"method not allowed\n"),
    }
}

fn split_stream_id(id: &str) -> Option<(char, usize)> {
    let mut chars = id.chars();
    let prefix = chars.next()?;
    if !matches!(prefix, 'a' | 'i' | 'o') {
        return None;
    }
    let idx: usize = chars.as_str().parse().ok()?;
    Some((prefix, idx))
}

/// Flush/join a parameter's open input sink: a plain file just needs
/// `flush`, but a tar extractor's worker thread must be joined with
/// `finish` so extraction is complete before the staging directory it
/// wrote into is ever read again.
fn finish_sink(sink: InputSink) -> Result<(), ProtocolError> {
    match sink {
        InputSink::File(mut f) => Ok(f.flush()?),
        InputSink::Tar(extractor) => extractor.finish(),
    }
}

/// Phase 1: read the request body into an ordered parameter list,
/// materialising input files under per-argument staging directories.
fn read_params(
    stream: &mut TcpStream,
    tempfs: &mut TempFs,
) -> Result<Vec<ServerParam>, ProtocolError> {
    let mut params: Vec<ServerParam> = Vec::new();

    while let Some((header, payload)) = chunk::read_chunk(stream)? {
        let (prefix, idx) = split_stream_id(&header.id)
            .ok_or_else(|| ProtocolError::Malformed(format!("bad stream id: {}", header.id)))?;

        match params.last().map(|p| p.index) {
            None if idx != 0 => {
                return Err(ProtocolError::OutOfOrder {
                    expected: 0,
                    got: idx as u64,
                })
            }
            Some(last) if idx != last && idx != last + 1 => {
                return Err(ProtocolError::OutOfOrder {
                    expected: last as u64,
                    got: idx as u64,
                })
            }
            _ => {}
        }

        if idx == params.len() {
            // Moving to a new index: the previous parameter has seen its
            // last chunk, so close its sink now rather than leaving a tar
            // extractor worker running past this point.
            if let Some(prev) = params.last_mut() {
                if let Some(sink) = prev.sink.take() {
                    finish_sink(sink)?;
                }
            }
            params.push(ServerParam {
                index: idx,
                kind: ParamKind::Scalar,
                value: String::new(),
                is_absent: false,
                sink: None,
                out_dn: None,
                out_is_tar_hint: false,
            });
        }

        match prefix {
            'a' => {
                let p = &mut params[idx];
                p.kind = ParamKind::Scalar;
                p.value.push_str(&String::from_utf8_lossy(&payload));
            }
            'i' => {
                let already_started = params[idx].sink.is_some() || params[idx].is_absent;
                let p = &mut params[idx];
                p.kind = ParamKind::InputFile;
                if !already_started {
                    if header.is_absent {
                        p.is_absent = true;
                    } else {
                        let dir = tempfs.mkdir(&format!("in{idx}_"))?;
                        if header.is_tar {
                            let extractor = TarExtractor::spawn(dir.clone());
                            extractor.push(payload);
                            p.sink = Some(InputSink::Tar(extractor));
                            p.value = dir.display().to_string();
                        } else {
                            let target = tar_bridge::confine(&dir, Path::new(&header.in_))?;
                            let mut f = File::create(&target)?;
                            if !header.is_empty {
                                f.write_all(&payload)?;
                            }
                            p.sink = Some(InputSink::File(f));
                            p.value = target.display().to_string();
                        }
                    }
                } else {
                    match &mut p.sink {
                        Some(InputSink::File(f)) => f.write_all(&payload)?,
                        Some(InputSink::Tar(extractor)) => extractor.push(payload),
                        None => {
                            return Err(ProtocolError::Malformed(format!(
                                "continuation chunk for absent input {idx}"
                            )))
                        }
                    }
                }
            }
            'o' => {
                if !header.in_.is_empty() {
                    return Err(ProtocolError::Malformed(format!(
                        "output placeholder {idx} must not carry `in`"
                    )));
                }
                let p = &mut params[idx];
                p.kind = ParamKind::OutputFile;
                if p.out_dn.is_none() {
                    let dir = tempfs.mkdir(&format!("out{idx}_"))?;
                    p.out_is_tar_hint = header.is_tar;
                    p.value = dir.display().to_string();
                    p.out_dn = Some(dir);
                }
            }
            _ => unreachable!(),
        }
    }

    if let Some(last) = params.last_mut() {
        if let Some(sink) = last.sink.take() {
            finish_sink(sink)?;
        }
    }

    Ok(params)
}

/// Phase 2: re-run the grammar on the reconstructed scalar values and assert
/// the classification the server independently derives matches what the
/// client's chunks claimed for every position.
fn validate_params(params: &[ServerParam]) -> Result<(), ProtocolError> {
    let values: Vec<String> = params.iter().map(|p| p.value.clone()).collect();
    let reparsed = grammar::parse_full(&values)
        .map_err(|e| ProtocolError::Malformed(crate::errors::display_for_grammar_error(&e)))?;
    if reparsed.len() != params.len() {
        return Err(ProtocolError::Malformed(
            "parameter count mismatch on revalidation".to_string(),
        ));
    }
    for (want, got) in reparsed.iter().zip(params.iter()) {
        if want.kind != got.kind {
            return Err(ProtocolError::Malformed(format!(
                "parameter {} classification mismatch",
                got.index
            )));
        }
    }
    Ok(())
}

fn process_post(mut stream: TcpStream, cfg: &ServerConfig) -> io::Result<()> {
    let start = Instant::now();
    let mut tempfs = TempFs::new();

    let params = match read_params(&mut stream, &mut tempfs) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %crate::errors::display_for_protocol_error(&e), "bad request");
            return write_plain_response(&mut stream, "400 Bad Request", b"bad request\n");
        }
    };

    if let Err(e) = validate_params(&params) {
        tracing::warn!(error = %crate::errors::display_for_protocol_error(&e), "forbidden");
        return write_plain_response(&mut stream, "403 Forbidden", b"forbidden\n");
    }

    if cfg.verbose {
        if let Some(tool) = params.first() {
            tracing::debug!(tool = %tool.value, param_count = params.len(), "request validated");
        }
    }

    // Phase 3: commit to a 200 response; no HTTP error code can be sent
    // after this point.
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\n\
Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
    )?;
    stream.flush()?;

    let req_ms = start.elapsed().as_millis();

    // Phase 4: execute.
    let mut argv: Vec<String> = params.iter().map(|p| p.value.clone()).collect();
    if let Some(prefix) = &cfg.idevice_path {
        if let Some(first) = argv.first_mut() {
            *first = format!("{}/{}", prefix, first);
        }
    }
    let program = argv.remove(0);

    let exec_start = Instant::now();
    let spawned = Command::new(&program)
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let outcome = match spawned {
        Ok(child) => {
            let client_fd = stream.as_raw_fd();
            match subprocess_io::forward(child, &mut stream, client_fd) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(error = %e, "subprocess forwarding failed");
                    LoopOutcome::Exited(1)
                }
            }
        }
        Err(e) => {
            let _ = subprocess_io::write_spawn_failure(&mut stream, &e);
            LoopOutcome::Exited(e.raw_os_error().unwrap_or(1))
        }
    };
    let cmd_ms = exec_start.elapsed().as_millis();

    // Phase 5: return output files, unless the client already disconnected.
    if matches!(outcome, LoopOutcome::Exited(_)) {
        for p in &params {
            if let Some(dir) = &p.out_dn {
                if let Err(e) = write_output_param(&mut stream, p.index, dir, p.out_is_tar_hint) {
                    tracing::warn!(error = %e, index = p.index, "failed writing output param");
                    break;
                }
            }
        }
        let _ = chunk::write_final_chunk(&mut stream);
    }

    let total_ms = start.elapsed().as_millis();
    if matches!(outcome, LoopOutcome::Exited(0)) {
        tracing::debug!(req_ms, cmd_ms, total_ms, "request completed");
    } else {
        tracing::info!(req_ms, cmd_ms, total_ms, "request completed");
    }

    // Phase 6: tempfs's Drop recursively removes the request root here,
    // regardless of which branch above was taken.
    Ok(())
}

fn write_output_param<W: Write>(
    w: &mut W,
    index: usize,
    dir: &Path,
    is_tar_hint: bool,
) -> io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    let id = format!("o{index}");

    if entries.is_empty() {
        let header = ChunkHeader {
            id,
            is_absent: true,
            ..Default::default()
        };
        return chunk::write_chunk(w, &header, b"-");
    }

    let single_regular_file = !is_tar_hint
        && entries.len() == 1
        && entries[0].file_type().map(|t| t.is_file()).unwrap_or(false);

    if single_regular_file {
        let path = entries[0].path();
        let name = entries[0].file_name().to_string_lossy().into_owned();
        let mut f = File::open(&path)?;
        let len = f.metadata()?.len();
        if len == 0 {
            let header = ChunkHeader {
                id,
                out_: name,
                is_empty: true,
                ..Default::default()
            };
            return chunk::write_chunk(w, &header, b"-");
        }
        let mut buf = [0u8; 8192];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let header = ChunkHeader {
                id: id.clone(),
                out_: name.clone(),
                ..Default::default()
            };
            chunk::write_chunk(w, &header, &buf[..n])?;
        }
        Ok(())
    } else {
        let template = ChunkHeader {
            id,
            is_tar: true,
            ..Default::default()
        };
        let mut sink = tar_bridge::ChunkedTarSink::new(w, template);
        tar_bridge::send_dir_as_tar(&mut sink, dir, ".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_stream_id_parses_prefix_and_index() {
        assert_eq!(split_stream_id("a0"), Some(('a', 0)));
        assert_eq!(split_stream_id("i12"), Some(('i', 12)));
        assert_eq!(split_stream_id("o3"), Some(('o', 3)));
        assert_eq!(split_stream_id("1"), None);
        assert_eq!(split_stream_id("exit"), None);
    }
}
