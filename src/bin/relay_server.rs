//! `relay-server`: the long-running listener on the lab machine that holds
//! the physical device. Answers `GET /healthz` and runs the six-phase POST
//! pipeline (read, validate, respond, execute, return outputs, cleanup)
//! for every chunked exec request.

use std::env;
use std::process::ExitCode;

use clap::Parser;
use lab_device_relay::server::{self, ServerConfig};

/// Env var mirrored into the subprocess's argv[0] as an optional directory
/// prefix, e.g. `IDEVICE_PATH=/opt/libimobiledevice/bin` rewrites `adb` to
/// `/opt/libimobiledevice/bin/adb` before exec.
const IDEVICE_PATH_ENV: &str = "IDEVICE_PATH";

#[derive(Parser, Debug)]
#[command(
    name = "relay-server",
    version,
    about = "Listen for relay-client requests and execute the named device tool locally."
)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short = 'p', long, default_value_t = 8084)]
    port: u16,

    /// Address to bind; combined with --port unless it already carries one.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Print per-request diagnostics at debug level (in addition to info/warn).
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let bind_addr = if cli.bind.contains(':') {
        cli.bind.clone()
    } else {
        format!("{}:{}", cli.bind, cli.port)
    };

    let cfg = ServerConfig {
        verbose: cli.verbose,
        idevice_path: env::var(IDEVICE_PATH_ENV).ok(),
    };

    match server::serve(&bind_addr, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, addr = %bind_addr, "relay-server failed to listen");
            ExitCode::FAILURE
        }
    }
}
