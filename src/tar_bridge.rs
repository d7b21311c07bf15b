//! Directory transfer bridge: stream a gzip tar over the chunked body in
//! either direction without ever materializing the archive on disk.
//!
//! Outbound (`ChunkedTarSink`) wraps a `Write` so that every buffer handed to
//! it by `tar::Builder`/`flate2::GzEncoder` becomes one `is_tar=true` chunk.
//! Inbound (`TarExtractor`) runs the blocking `tar::Archive` reader on a
//! worker thread fed through a bounded queue, so the connection-handling
//! thread can keep pushing payload bytes in without blocking on extraction.

use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::chunk::{self, ChunkHeader};
use crate::errors::ProtocolError;

/// Join a tar-entry-relative path onto `root`, rejecting anything that would
/// escape it (`..` components, absolute paths). This is the single
/// path-confinement check both the outbound sender and inbound extractor
/// rely on.
pub fn confine(root: &Path, entry: &Path) -> Result<PathBuf, ProtocolError> {
    let mut joined = root.to_path_buf();
    for comp in entry.components() {
        match comp {
            Component::Normal(c) => joined.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::PathEscape(entry.display().to_string()));
            }
        }
    }
    if joined != root && !joined.starts_with(root) {
        return Err(ProtocolError::PathEscape(entry.display().to_string()));
    }
    Ok(joined)
}

/// `Write` adapter that turns every write into one outbound chunk carrying a
/// fixed header template (same `id`/`out`/`is_tar` metadata on every chunk of
/// one tar stream).
pub struct ChunkedTarSink<W: Write> {
    inner: W,
    template: ChunkHeader,
}

impl<W: Write> ChunkedTarSink<W> {
    pub fn new(inner: W, template: ChunkHeader) -> Self {
        ChunkedTarSink { inner, template }
    }
}

impl<W: Write> Write for ChunkedTarSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        chunk::write_chunk(&mut self.inner, &self.template, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Build a `tar.gz` stream from `src_dir` and write it through `sink` as a
/// sequence of chunks, then flush. `arcname_root` is the path prefix entries
/// are stored under inside the archive (`"."` for output directories,
/// `basename + "/"` for input directories).
pub fn send_dir_as_tar<W: Write>(
    sink: W,
    src_dir: &Path,
    arcname_root: &str,
) -> io::Result<()> {
    let gz = GzEncoder::new(sink, Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.append_dir_all(arcname_root, src_dir)?;
    let gz = builder.into_inner()?;
    gz.finish()?;
    Ok(())
}

/// Bounded SPSC byte queue used to hand inbound tar bytes from the connection
/// reader thread to the extractor worker thread without blocking either side
/// on disk I/O.
struct QueueState {
    chunks: std::collections::VecDeque<Vec<u8>>,
    closed: bool,
}

pub struct TarPipe {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl TarPipe {
    fn new(capacity: usize) -> Arc<TarPipe> {
        Arc::new(TarPipe {
            state: Mutex::new(QueueState {
                chunks: std::collections::VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    fn push(&self, data: Vec<u8>) {
        let mut guard = self.state.lock().unwrap();
        while guard.chunks.len() >= self.capacity && !guard.closed {
            guard = self.not_full.wait(guard).unwrap();
        }
        if guard.closed {
            return;
        }
        guard.chunks.push_back(data);
        self.not_empty.notify_one();
    }

    fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// `Read` view over a `TarPipe`, used by the worker thread running
/// `tar::Archive`.
struct PipeReader {
    pipe: Arc<TarPipe>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let mut guard = self.pipe.state.lock().unwrap();
            loop {
                if let Some(chunk) = guard.chunks.pop_front() {
                    self.pipe.not_full.notify_one();
                    drop(guard);
                    self.current = chunk;
                    self.pos = 0;
                    break;
                }
                if guard.closed {
                    return Ok(0);
                }
                guard = self.pipe.not_empty.wait(guard).unwrap();
            }
        }
    }
}

/// Drives extraction of an inbound tar stream into `dest_dir` on a worker
/// thread. Feed payload bytes with `push`; call `finish` once the inbound
/// stream's final chunk has been seen to join the worker and surface any
/// extraction error (including path-confinement violations).
pub struct TarExtractor {
    pipe: Arc<TarPipe>,
    worker: Option<JoinHandle<Result<(), ProtocolError>>>,
}

impl TarExtractor {
    pub fn spawn(dest_dir: PathBuf) -> TarExtractor {
        let pipe = TarPipe::new(32);
        let worker_pipe = Arc::clone(&pipe);
        let worker = std::thread::spawn(move || -> Result<(), ProtocolError> {
            let reader = PipeReader {
                pipe: worker_pipe,
                current: Vec::new(),
                pos: 0,
            };
            let gz = GzDecoder::new(reader);
            let mut archive = tar::Archive::new(gz);
            let entries = archive
                .entries()
                .map_err(|e| ProtocolError::TarError(e.to_string()))?;
            for entry in entries {
                let mut entry = entry.map_err(|e| ProtocolError::TarError(e.to_string()))?;
                let entry_path = entry
                    .path()
                    .map_err(|e| ProtocolError::TarError(e.to_string()))?
                    .into_owned();
                let target = confine(&dest_dir, &entry_path)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(ProtocolError::from)?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| ProtocolError::TarError(e.to_string()))?;
            }
            Ok(())
        });
        TarExtractor {
            pipe,
            worker: Some(worker),
        }
    }

    pub fn push(&self, data: Vec<u8>) {
        self.pipe.push(data);
    }

    /// Signal end-of-stream and join the worker, surfacing its result.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        self.pipe.close();
        match self.worker.take() {
            Some(h) => h.join().unwrap_or_else(|_| {
                Err(ProtocolError::TarError("extractor thread panicked".into()))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for TarExtractor {
    fn drop(&mut self) {
        self.pipe.close();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confine_rejects_parent_dir_escape() {
        let root = Path::new("/tmp/root");
        assert!(confine(root, Path::new("../../etc/passwd")).is_err());
    }

    #[test]
    fn confine_rejects_absolute_path() {
        let root = Path::new("/tmp/root");
        assert!(confine(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn confine_accepts_nested_relative_path() {
        let root = Path::new("/tmp/root");
        let joined = confine(root, Path::new("sub/dir/file.txt")).unwrap();
        assert_eq!(joined, PathBuf::from("/tmp/root/sub/dir/file.txt"));
    }

    #[test]
    fn round_trip_send_and_extract_dir() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let mut bytes = Vec::new();
        {
            let gz = GzEncoder::new(&mut bytes, Compression::default());
            let mut builder = tar::Builder::new(gz);
            builder.append_dir_all(".", src.path()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        let extractor = TarExtractor::spawn(dest.path().to_path_buf());
        extractor.push(bytes);
        extractor.finish().unwrap();

        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(
            std::fs::read(dest.path().join("sub/b.txt")).unwrap(),
            b"world"
        );
    }
}
