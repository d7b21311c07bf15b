//! `relay-client`: installed under (symlinked/copied to) each impersonated
//! tool name (`adb`, `idevice_id`, `ideviceinfo`, ...). Dispatches by
//! `argv[0]`'s basename, packages the call into one chunked HTTP request,
//! and mirrors the server's stdout/stderr/exit code back to this process.

use std::env;
use std::path::Path;
use std::process::ExitCode;

use lab_device_relay::client;
use lab_device_relay::errors::{
    display_for_grammar_error, display_for_protocol_error, exit_code_for_grammar_error,
    exit_code_for_protocol_error,
};

/// Env var carrying the relay server's base URL, overridable by `--url`
/// when this binary is invoked under its own name.
const URL_ENV: &str = "LAB_DEVICE_PROXY_URL";

/// Exit code for client-side validation/usage failures caught before any
/// network I/O (bad device id, unknown command, missing URL).
const USAGE_EXIT: u8 = 2;

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

/// Split argv into `(tool, tool_args, url_override)`. When invoked under
/// its own name, an optional leading `--url URL` pair is consumed and the
/// first remaining token names the impersonated tool; otherwise the tool
/// is argv[0]'s basename and every remaining token is passed straight
/// through.
fn resolve_invocation(argv: &[String]) -> Result<(String, Vec<String>, Option<String>), String> {
    let self_name = basename(&argv[0]);
    let own_name = self_name.contains("relay-client") || self_name.contains("relay_client");

    if !own_name {
        return Ok((self_name.to_string(), argv[1..].to_vec(), None));
    }

    let mut rest = argv[1..].to_vec();
    let mut url_override = None;
    if rest.first().map(|s| s.as_str()) == Some("--url") {
        if rest.len() < 2 {
            return Err("--url requires a value".to_string());
        }
        url_override = Some(rest[1].clone());
        rest.drain(0..2);
    }
    let tool = rest
        .first()
        .cloned()
        .ok_or_else(|| "usage: relay-client [--url URL] <tool> [args...]".to_string())?;
    Ok((tool, rest[1..].to_vec(), url_override))
}

fn main() -> ExitCode {
    let argv: Vec<String> = env::args().collect();
    if argv.is_empty() {
        eprintln!("relay-client: error: empty argv");
        return ExitCode::from(USAGE_EXIT);
    }

    let (tool, args, url_override) = match resolve_invocation(&argv) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("relay-client: error: {msg}");
            return ExitCode::from(USAGE_EXIT);
        }
    };

    let url = match url_override.or_else(|| env::var(URL_ENV).ok()) {
        Some(u) => u,
        None => {
            eprintln!(
                "relay-client: error: no server URL; set {URL_ENV} or pass --url (relay-client invocation only)"
            );
            return ExitCode::from(USAGE_EXIT);
        }
    };

    match client::call(&tool, &args, &url) {
        Ok(Some(code)) => {
            let code = code.rem_euclid(256) as u8;
            ExitCode::from(code)
        }
        Ok(None) => {
            eprintln!("relay-client: warning: server response carried no exit chunk");
            ExitCode::from(client::NO_EXIT_CHUNK_SENTINEL as u8)
        }
        Err(client::ClientError::Grammar(e)) => {
            eprintln!("relay-client: error: {}", display_for_grammar_error(&e));
            ExitCode::from(exit_code_for_grammar_error(&e))
        }
        Err(client::ClientError::Usage(msg)) => {
            eprintln!("relay-client: error: {msg}");
            ExitCode::from(USAGE_EXIT)
        }
        Err(client::ClientError::Protocol(e)) => {
            eprintln!("relay-client: error: {}", display_for_protocol_error(&e));
            ExitCode::from(exit_code_for_protocol_error(&e))
        }
        Err(client::ClientError::Io(e)) => {
            eprintln!("relay-client: error: {e}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn symlinked_name_dispatches_directly() {
        let (tool, args, url) = resolve_invocation(&v(&["/usr/local/bin/adb", "devices"])).unwrap();
        assert_eq!(tool, "adb");
        assert_eq!(args, vec!["devices".to_string()]);
        assert!(url.is_none());
    }

    #[test]
    fn own_name_consumes_url_then_tool() {
        let (tool, args, url) = resolve_invocation(&v(&[
            "relay-client",
            "--url",
            "http://lab:8084",
            "adb",
            "devices",
        ]))
        .unwrap();
        assert_eq!(tool, "adb");
        assert_eq!(args, vec!["devices".to_string()]);
        assert_eq!(url.as_deref(), Some("http://lab:8084"));
    }

    #[test]
    fn own_name_without_url_still_dispatches() {
        let (tool, args, url) =
            resolve_invocation(&v(&["relay-client", "idevice_id", "-l"])).unwrap();
        assert_eq!(tool, "idevice_id");
        assert_eq!(args, vec!["-l".to_string()]);
        assert!(url.is_none());
    }

    #[test]
    fn own_name_with_no_tool_is_usage_error() {
        assert!(resolve_invocation(&v(&["relay-client"])).is_err());
    }
}
