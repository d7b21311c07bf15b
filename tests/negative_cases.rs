//! Negative-path properties: unknown argv is rejected client-side before
//! any network I/O, and an illegal tar entry name is rejected with no
//! file ever created outside the staging directory.

use lab_device_relay::client::{self, ClientError};
use lab_device_relay::tar_bridge::TarExtractor;

#[test]
fn unknown_subcommand_is_rejected_before_any_network_io() {
    // Port 1 is reserved/unroutable; if the client attempted a connection
    // it would hang or fail with an I/O error, not a grammar error. A
    // grammar error here proves argv was rejected before `TcpStream::connect`.
    let result = client::call("adb", &["blah".to_string()], "http://127.0.0.1:1");
    assert!(matches!(result, Err(ClientError::Grammar(_))));
}

#[test]
fn missing_url_scheme_is_a_usage_error() {
    let result = client::call("adb", &["devices".to_string()], "unix:///tmp/sock");
    assert!(matches!(result, Err(ClientError::Usage(_))));
}

#[test]
fn illegal_tar_entry_escapes_are_rejected_without_partial_extraction() {
    let dest = tempfile::tempdir().unwrap();

    // Build a tar.gz containing one entry whose name tries to escape the
    // destination directory, matching the attacker-chosen-name property.
    let mut bytes = Vec::new();
    {
        let gz = flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape", &b"evil"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    let extractor = TarExtractor::spawn(dest.path().to_path_buf());
    extractor.push(bytes);
    let result = extractor.finish();
    assert!(result.is_err(), "escaping tar entry must be rejected");

    assert!(!dest.path().parent().unwrap().join("escape").exists());
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0, "no file left behind");
}
