//! `GET /healthz`, `GET /`, and a malformed `POST /` each get the
//! documented status/body.

mod support;

use std::io::{Read, Write};
use std::net::TcpStream;

fn read_all(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok();
    String::from_utf8_lossy(&buf).into_owned()
}

#[test]
fn healthz_returns_ok() {
    let addr = support::spawn_server();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let resp = read_all(&mut stream);
    assert!(resp.starts_with("HTTP/1.1 200"), "resp: {resp}");
    assert!(resp.ends_with("ok\n"), "resp: {resp}");
}

#[test]
fn bare_get_is_method_not_allowed() {
    let addr = support::spawn_server();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let resp = read_all(&mut stream);
    assert!(resp.starts_with("HTTP/1.1 405"), "resp: {resp}");
}

#[test]
fn malformed_first_chunk_is_bad_request() {
    let addr = support::spawn_server();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    // Not hex, no trailing CRLF discipline honored -> parse error.
    stream.write_all(b"zz;id=a0\r\nbogus\r\n").unwrap();
    let resp = read_all(&mut stream);
    assert!(resp.starts_with("HTTP/1.1 400"), "resp: {resp}");
}
