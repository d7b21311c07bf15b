//! Readiness-multiplexed forwarding of one spawned subprocess's stdout and
//! stderr into outbound chunks, while watching the inbound request socket
//! for an early client disconnect, built on `nix::poll`.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Child;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::chunk::{self, ChunkHeader};

const MAX_READ: usize = 8192;
const POLL_TIMEOUT_MS: u16 = 2000;

/// How the forwarding loop ended.
pub enum LoopOutcome {
    /// The child exited; carries its exit status (or a placeholder when the
    /// exit status is unavailable, e.g. terminated by a signal).
    Exited(i32),
    /// The client closed the connection before the child finished; the
    /// child has already been killed and reaped.
    ClientDisconnected,
}

struct PipeState {
    read: Option<std::process::ChildStdout>,
    fd: RawFd,
    open: bool,
}

struct ErrState {
    read: Option<std::process::ChildStderr>,
    fd: RawFd,
    open: bool,
}

/// Drive the forwarding loop for one spawned child. `out` is the HTTP
/// response body writer; `client_fd` is the raw fd of the request socket,
/// polled for readability as the disconnect signal (a readable POST body
/// whose request is already fully read can only mean EOF/close).
pub fn forward<W: Write>(mut child: Child, out: &mut W, client_fd: RawFd) -> io::Result<LoopOutcome> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut out_state = PipeState {
        fd: stdout.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1),
        read: stdout,
        open: true,
    };
    let mut err_state = ErrState {
        fd: stderr.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1),
        read: stderr,
        open: true,
    };

    loop {
        let mut fds: Vec<PollFd> = Vec::with_capacity(3);
        if out_state.open {
            fds.push(PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(out_state.fd) },
                PollFlags::POLLIN,
            ));
        }
        if err_state.open {
            fds.push(PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(err_state.fd) },
                PollFlags::POLLIN,
            ));
        }
        fds.push(PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(client_fd) },
            PollFlags::POLLIN,
        ));
        let client_slot = fds.len() - 1;

        let _ = poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS))?;

        if fds[client_slot]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN) || r.contains(PollFlags::POLLHUP))
            .unwrap_or(false)
        {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(LoopOutcome::ClientDisconnected);
        }

        let mut read_out = 0usize;
        let mut read_err = 0usize;
        let mut slot = 0usize;

        if out_state.open {
            let ready = fds[slot]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false);
            slot += 1;
            if ready {
                let mut buf = [0u8; MAX_READ];
                let n = out_state.read.as_mut().unwrap().read(&mut buf)?;
                read_out = n;
                if n == 0 {
                    out_state.open = false;
                } else {
                    let header = ChunkHeader {
                        id: "1".to_string(),
                        ..Default::default()
                    };
                    chunk::write_chunk(out, &header, &buf[..n])?;
                    out.flush()?;
                }
            }
        }

        if err_state.open {
            let ready = fds[slot]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false);
            if ready {
                let mut buf = [0u8; MAX_READ];
                let n = err_state.read.as_mut().unwrap().read(&mut buf)?;
                read_err = n;
                if n == 0 {
                    err_state.open = false;
                } else {
                    let header = ChunkHeader {
                        id: "2".to_string(),
                        ..Default::default()
                    };
                    chunk::write_chunk(out, &header, &buf[..n])?;
                    out.flush()?;
                }
            }
        }

        if let Some(status) = child.try_wait()? {
            if read_out == 0 && read_err == 0 {
                let code = status.code().unwrap_or(-1);
                let header = ChunkHeader {
                    id: "exit".to_string(),
                    ..Default::default()
                };
                chunk::write_chunk(out, &header, code.to_string().as_bytes())?;
                out.flush()?;
                return Ok(LoopOutcome::Exited(code));
            }
        }
    }
}

/// Write the spawn-failure chunks emitted when `Command::spawn` itself
/// fails: the error message on stderr, then an exit chunk carrying the
/// errno (or 1 if unavailable).
pub fn write_spawn_failure<W: Write>(out: &mut W, err: &io::Error) -> io::Result<()> {
    let msg = err.to_string();
    let header = ChunkHeader {
        id: "2".to_string(),
        ..Default::default()
    };
    chunk::write_chunk(out, &header, msg.as_bytes())?;
    let code = err.raw_os_error().unwrap_or(1);
    let header = ChunkHeader {
        id: "exit".to_string(),
        ..Default::default()
    };
    chunk::write_chunk(out, &header, code.to_string().as_bytes())?;
    out.flush()
}
