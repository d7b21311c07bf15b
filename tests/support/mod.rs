//! Shared test scaffolding: spawn `relay-server`'s listener in-process on
//! an ephemeral port and hand back its address, driving it over a raw
//! `TcpStream` the same way the end-to-end tests in this crate do.

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use lab_device_relay::server::{self, ServerConfig};

/// Bind an ephemeral port, hand it to `relay_device_relay::server::serve`
/// on a background thread, and return the address once bound.
pub fn spawn_server() -> String {
    // Reserve a free port by binding then dropping, to avoid a fixed
    // port colliding across parallel test binaries.
    let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let addr = probe.local_addr().expect("local_addr");
    drop(probe);
    let bind_addr = addr.to_string();

    let cfg = ServerConfig {
        verbose: false,
        idevice_path: None,
    };
    let spawn_addr = bind_addr.clone();
    thread::spawn(move || {
        let _ = server::serve(&spawn_addr, cfg);
    });

    // Give the listener a moment to bind before the first connection.
    thread::sleep(Duration::from_millis(100));
    bind_addr
}

/// Write an executable shell script named `name` into `dir` with the given
/// body, returning `dir` so callers can prepend it onto `PATH`.
pub fn write_mock_tool(dir: &std::path::Path, name: &str, body: &str) {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).expect("create mock tool");
    writeln!(f, "#!/bin/sh\n{body}").expect("write mock tool");
    drop(f);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

/// Prepend `dir` onto the current process's `PATH` so subprocesses spawned
/// by an in-process `relay-server` (itself running on a background thread
/// within this test binary) can find a mock tool.
pub fn prepend_path(dir: &std::path::Path) {
    let existing = std::env::var("PATH").unwrap_or_default();
    let new_path = format!("{}:{}", dir.display(), existing);
    std::env::set_var("PATH", new_path);
}
