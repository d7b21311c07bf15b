//! End-to-end scenarios driven over a raw `TcpStream` against an
//! in-process `relay-server`, using a tiny mock `adb` shell script placed
//! on `PATH` the way the server's subprocess-spawn phase expects to find
//! the real tool.

mod support;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use lab_device_relay::chunk::{self, ChunkHeader};
use lab_device_relay::grammar::{self, ParamKind};

/// Send every parameter the grammar produced for `argv`, treating
/// `inputs`/`outputs` (by index) as file/dir paths on the local
/// filesystem -- a minimal stand-in for `relay-client`'s `send_params`
/// used only to exercise the wire protocol in these tests.
fn drive_request(
    addr: &str,
    argv: &[&str],
    outputs: &HashMap<usize, std::path::PathBuf>,
) -> (Option<i32>, String, String) {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    let params = grammar::parse_full(&argv).expect("grammar accepts scenario argv");

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
        .unwrap();

    for p in &params {
        match p.kind {
            ParamKind::Scalar => {
                let header = ChunkHeader {
                    id: format!("a{}", p.index),
                    ..Default::default()
                };
                chunk::write_chunk(&mut stream, &header, p.text.as_bytes()).unwrap();
            }
            ParamKind::InputFile => {
                let path = Path::new(&p.text);
                let base = path.file_name().unwrap().to_string_lossy().into_owned();
                if path.is_dir() {
                    let template = ChunkHeader {
                        id: format!("i{}", p.index),
                        in_: base.clone(),
                        is_tar: true,
                        ..Default::default()
                    };
                    let sink = lab_device_relay::tar_bridge::ChunkedTarSink::new(&mut stream, template);
                    let mut sink = sink;
                    lab_device_relay::tar_bridge::send_dir_as_tar(&mut sink, path, &format!("{base}/"))
                        .unwrap();
                } else {
                    let bytes = fs::read(path).unwrap_or_default();
                    if bytes.is_empty() {
                        let header = ChunkHeader {
                            id: format!("i{}", p.index),
                            in_: base,
                            is_empty: true,
                            ..Default::default()
                        };
                        chunk::write_chunk(&mut stream, &header, b"-").unwrap();
                    } else {
                        let header = ChunkHeader {
                            id: format!("i{}", p.index),
                            in_: base,
                            ..Default::default()
                        };
                        chunk::write_chunk(&mut stream, &header, &bytes).unwrap();
                    }
                }
            }
            ParamKind::OutputFile => {
                // These scenarios always target a local path that doesn't
                // exist yet; `outputs` only tells this harness where to
                // write the bytes the server streams back.
                let header = ChunkHeader {
                    id: format!("o{}", p.index),
                    is_absent: true,
                    ..Default::default()
                };
                chunk::write_chunk(&mut stream, &header, b"-").unwrap();
            }
        }
    }
    chunk::write_final_chunk(&mut stream).unwrap();
    stream.flush().unwrap();

    // Skip the HTTP status line + header block.
    let mut reader = std::io::BufReader::new(stream);
    let mut status_line = String::new();
    loop {
        let mut line = String::new();
        read_line(&mut reader, &mut line);
        if status_line.is_empty() {
            status_line = line.clone();
        }
        if line.trim().is_empty() {
            break;
        }
    }
    assert!(status_line.starts_with("HTTP/1.1 200"), "status: {status_line}");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit: Option<i32> = None;

    while let Some((header, payload)) = chunk::read_chunk(&mut reader).unwrap() {
        match header.id.as_str() {
            "1" if !(header.is_absent || header.is_empty) => stdout.extend_from_slice(&payload),
            "2" if !(header.is_absent || header.is_empty) => stderr.extend_from_slice(&payload),
            "exit" if !(header.is_absent || header.is_empty) => {
                exit = String::from_utf8_lossy(&payload).trim().parse::<i32>().ok();
            }
            id if id.starts_with('o') => {
                if header.is_absent || header.is_empty {
                    continue;
                }
                let idx: usize = id[1..].parse().unwrap();
                if let Some(target) = outputs.get(&idx) {
                    let mut f = fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(target)
                        .unwrap();
                    f.write_all(&payload).unwrap();
                }
            }
            _ => {}
        }
    }

    (
        exit,
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

fn read_line<R: Read>(r: &mut R, out: &mut String) {
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte).unwrap_or(0) == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            out.push(byte[0] as char);
        }
    }
}

#[test]
fn stdout_passthrough_and_zero_exit() {
    let dir = tempfile::tempdir().unwrap();
    support::write_mock_tool(dir.path(), "adb", "printf '*mock*List of devices.\\n'; exit 0");
    support::prepend_path(dir.path());
    let addr = support::spawn_server();

    let (exit, stdout, _stderr) = drive_request(&addr, &["adb", "devices"], &HashMap::new());
    assert_eq!(exit, Some(0));
    assert_eq!(stdout, "*mock*List of devices.\n");
}

#[test]
fn nonzero_exit_with_no_stdout() {
    let dir = tempfile::tempdir().unwrap();
    support::write_mock_tool(dir.path(), "adb", "exit 2");
    support::prepend_path(dir.path());
    let addr = support::spawn_server();

    let (exit, stdout, _stderr) =
        drive_request(&addr, &["adb", "uninstall", "no_such_pkg"], &HashMap::new());
    assert_eq!(exit, Some(2));
    assert_eq!(stdout, "");
}

#[test]
fn push_single_file_lands_on_server_side() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("seen.txt");
    support::write_mock_tool(
        dir.path(),
        "adb",
        &format!(
            "cp \"$2\" {} ; printf 'ok\\n'",
            marker.display()
        ),
    );
    support::prepend_path(dir.path());
    let addr = support::spawn_server();

    let local = dir.path().join("push_me.txt");
    fs::write(&local, b"push_me").unwrap();

    let (exit, stdout, _stderr) = drive_request(
        &addr,
        &["adb", "push", local.to_str().unwrap(), "to_dev"],
        &HashMap::new(),
    );
    assert_eq!(exit, Some(0));
    assert_eq!(stdout, "ok\n");
    assert_eq!(fs::read(&marker).unwrap(), b"push_me");
}

#[test]
fn pull_to_nonexistent_path_materializes_locally() {
    let dir = tempfile::tempdir().unwrap();
    // $3 is the staging directory for the output placeholder; the server
    // streams back whatever single regular file ends up inside it.
    support::write_mock_tool(
        dir.path(),
        "adb",
        "printf 'pull_me' > \"$3/pulled\" ; printf 'ok\\n'",
    );
    support::prepend_path(dir.path());
    let addr = support::spawn_server();

    let target = dir.path().join("pulled.txt");
    assert!(!target.exists());
    let mut outputs = HashMap::new();
    outputs.insert(3, target.clone());

    let (exit, stdout, _stderr) =
        drive_request(&addr, &["adb", "pull", "from_dev", target.to_str().unwrap()], &outputs);
    assert_eq!(exit, Some(0));
    assert_eq!(stdout, "ok\n");
    assert_eq!(fs::read(&target).unwrap(), b"pull_me");
}
