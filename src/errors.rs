//! Error enums for the two failure domains this crate cross-checks against
//! each other at the protocol boundary: malformed/out-of-order wire data
//! (`ProtocolError`) and allow-list rejections (`GrammarError`). Each comes
//! with an HTTP-status mapping for the server side and a display helper for
//! the client's stderr-message side.

/// Errors raised while parsing or validating chunk headers off the wire.
#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    /// A chunk header line failed the key/value grammar or length syntax.
    Malformed(String),
    /// Two chunk headers for the same stream id arrived out of order.
    OutOfOrder { expected: u64, got: u64 },
    /// A path carried by a chunk header (`in`/`out`) escaped its staging directory.
    PathEscape(String),
    /// A tar stream was announced (`is_tar`) but the extraction target rejected it.
    TarError(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// 1 as an internal process exit code when the client hits one of these
/// locally; on the wire, a `ProtocolError` surfaced during request-body
/// reading maps to HTTP 400 (malformed input) while one surfaced during
/// grammar revalidation maps to HTTP 403 (see `server::process_post`,
/// which picks the status per phase rather than per error variant).
pub fn exit_code_for_protocol_error(_e: &ProtocolError) -> u8 {
    1
}

pub fn display_for_protocol_error(e: &ProtocolError) -> String {
    match e {
        ProtocolError::Io(ioe) => ioe.to_string(),
        ProtocolError::Malformed(s) => format!("malformed chunk header: {s}"),
        ProtocolError::OutOfOrder { expected, got } => {
            format!("out-of-order chunk index: expected {expected} or {expected}+1, got {got}")
        }
        ProtocolError::PathEscape(p) => format!("path escapes staging directory: {p}"),
        ProtocolError::TarError(s) => format!("tar stream error: {s}"),
    }
}

/// Errors raised while resolving argv against the allow-listed command grammar.
#[derive(Debug)]
pub enum GrammarError {
    /// The impersonated tool name or subcommand is not on the allow-list.
    UnknownTool(String),
    /// A required positional or flag parameter was missing.
    MissingParameter(String),
    /// A value did not match its declared type (int/enum/device-id).
    InvalidValue { parameter: String, value: String },
    /// More positional arguments were supplied than the grammar declares.
    TooManyArguments,
}

/// A grammar rejection maps to HTTP 403 on the server (request rejected
/// before spawning anything) and to exit code 2 on the client (argv
/// failed to parse before any network I/O).
pub fn exit_code_for_grammar_error(_e: &GrammarError) -> u8 {
    2
}

pub fn display_for_grammar_error(e: &GrammarError) -> String {
    match e {
        GrammarError::UnknownTool(t) => format!("tool not in allow-list: {t}"),
        GrammarError::MissingParameter(p) => format!("missing required parameter: {p}"),
        GrammarError::InvalidValue { parameter, value } => {
            format!("invalid value for {parameter}: {value}")
        }
        GrammarError::TooManyArguments => "too many positional arguments".to_string(),
    }
}
