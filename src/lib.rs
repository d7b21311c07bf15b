//! Lab device remote-execution relay: library crate shared by the
//! `relay-client` and `relay-server` binaries.
//!
//! Architecture
//! - `chunk`: wire codec for the extended chunked-transfer body (one header
//!   line per chunk, `key=value` metadata identifying the logical stream).
//! - `tar_bridge`: adapters that let a tar archiver/extractor treat a
//!   chunked stream as an ordinary byte sink/source, plus the shared
//!   path-confinement check.
//! - `grammar`: the allow-listed `adb`/`idevice*` argument grammar. Both
//!   binaries parse against this single rule set (`grammar::parse_full`).
//! - `client`: `relay-client`'s request/response driver.
//! - `server`: `relay-server`'s six-phase POST handler plus `GET /healthz`.
//! - `subprocess_io`: the readiness-multiplexed stdout/stderr forwarding
//!   loop shared by the server's execute phase.
//! - `tempfs`: per-request staging directory tree with guaranteed cleanup.
//! - `errors`: `ProtocolError`/`GrammarError` plus their HTTP-status and
//!   display mappings.
//!
//! Non-goals: transport security, session reuse, resumable transfers,
//! multi-device multiplexing, tools outside the allow-list.

pub mod chunk;
pub mod client;
pub mod errors;
pub mod grammar;
pub mod server;
pub mod subprocess_io;
pub mod tar_bridge;
pub mod tempfs;
