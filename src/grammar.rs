//! Allow-list argument grammar for every impersonated `adb`/`idevice*` tool.
//!
//! Both the client (classifying its own argv before opening a connection)
//! and the server (re-validating the scalar values it reconstructed from
//! chunks) call into the same [`parse`] entry point, so there is exactly one
//! rule set to keep in sync: anything the client's argv parse rejects, the
//! server's re-parse also rejects.

use crate::errors::GrammarError;

/// How one positional slot in the flat parameter list was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A literal scalar token: a flag (`-r`), a bare value, or a `-Dx=y` pair.
    Scalar,
    InputFile,
    OutputFile,
}

/// One entry of the flat, ordered parameter list the grammar produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub index: usize,
    pub text: String,
    pub kind: ParamKind,
}

fn is_android_serial(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| c.is_whitespace())
}

fn is_ios_udid(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit() && !(b as char).is_ascii_uppercase())
}

/// Cursor over argv tokens following the impersonated tool name, used by
/// every per-tool sub-parser below.
struct Cursor<'a> {
    tokens: &'a [String],
    pos: usize,
    out: Vec<Param>,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [String]) -> Self {
        Cursor {
            tokens,
            pos: 0,
            out: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn take_scalar(&mut self) -> Option<String> {
        let t = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        Some(t)
    }

    fn push(&mut self, text: impl Into<String>, kind: ParamKind) {
        let index = self.out.len();
        self.out.push(Param {
            index,
            text: text.into(),
            kind,
        });
    }

    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn err_extra(&self) -> GrammarError {
        GrammarError::TooManyArguments
    }
}

/// Consume zero or more tokens from `flags` that match exactly, in any
/// order, recording each as a scalar parameter. Also folds the `-D x=y`
/// two-token form into a single normalised `-Dx=y` scalar.
fn take_known_flags(cur: &mut Cursor, flags: &[&str], allow_d: bool) {
    loop {
        match cur.peek() {
            Some(tok) if flags.contains(&tok) => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            Some("-D") if allow_d => {
                cur.take_scalar();
                if let Some(kv) = cur.take_scalar() {
                    cur.push(format!("-D{kv}"), ParamKind::Scalar);
                } else {
                    cur.push("-D", ParamKind::Scalar);
                }
            }
            Some(tok) if allow_d && tok.starts_with("-D") && tok.len() > 2 => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            _ => break,
        }
    }
}

fn require_device_udid(cur: &mut Cursor) -> Result<(), GrammarError> {
    match cur.peek() {
        Some("-u") => {
            cur.take_scalar();
            let v = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("-u UDID".into()))?;
            if !is_ios_udid(&v) {
                return Err(GrammarError::InvalidValue {
                    parameter: "-u".into(),
                    value: v,
                });
            }
            cur.push("-u", ParamKind::Scalar);
            cur.push(v, ParamKind::Scalar);
        }
        _ => {}
    }
    Ok(())
}

/// Parse the full argv the client would exec (tool name included as
/// argv[0]), producing the flat parameter list transmitted on the wire.
/// `params[0]` is always the scalar tool name itself — the server needs it
/// back verbatim to rebuild the subprocess's own argv[0].
pub fn parse_full(argv: &[String]) -> Result<Vec<Param>, GrammarError> {
    let tool = argv
        .first()
        .ok_or_else(|| GrammarError::MissingParameter("tool name".into()))?;
    let rest = parse(tool, &argv[1..])?;
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(Param {
        index: 0,
        text: tool.clone(),
        kind: ParamKind::Scalar,
    });
    for p in rest {
        out.push(Param {
            index: p.index + 1,
            text: p.text,
            kind: p.kind,
        });
    }
    Ok(out)
}

/// Parse argv for the impersonated tool `tool` (basename, e.g. `"adb"`,
/// `"idevicefs"`). `args` excludes the tool name itself.
pub fn parse(tool: &str, args: &[String]) -> Result<Vec<Param>, GrammarError> {
    match tool {
        "adb" => parse_adb(args),
        "idevice-app-runner" | "idevice_app_runner" => parse_idevice_app_runner(args),
        "idevice_id" => parse_idevice_id(args),
        "idevicedate" => parse_idevicedate(args),
        "idevicediagnostics" => parse_idevicediagnostics(args),
        "ideviceimagemounter" => parse_ideviceimagemounter(args),
        "ideviceinfo" => parse_ideviceinfo(args),
        "ideviceinstaller" => parse_ideviceinstaller(args),
        "idevicefs" => parse_idevicefs(args),
        "idevicescreenshot" => parse_idevicescreenshot(args),
        "idevicesyslog" => parse_idevicesyslog(args),
        other => Err(GrammarError::UnknownTool(other.to_string())),
    }
}

fn parse_adb(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);

    if cur.peek() == Some("-s") {
        cur.take_scalar();
        let serial = cur
            .take_scalar()
            .ok_or_else(|| GrammarError::MissingParameter("-s ANDROID_SERIAL".into()))?;
        if !is_android_serial(&serial) {
            return Err(GrammarError::InvalidValue {
                parameter: "-s".into(),
                value: serial,
            });
        }
        cur.push("-s", ParamKind::Scalar);
        cur.push(serial, ParamKind::Scalar);
    }

    let sub = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("adb subcommand".into()))?;
    cur.push(sub.clone(), ParamKind::Scalar);

    match sub.as_str() {
        "connect" => {
            let host = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("host".into()))?;
            cur.push(host, ParamKind::Scalar);
        }
        "devices" => {
            take_known_flags(&mut cur, &["-l"], false);
        }
        "install" => {
            take_known_flags(&mut cur, &["-r", "-s"], false);
            let file = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("apk file".into()))?;
            cur.push(file, ParamKind::InputFile);
        }
        "logcat" => {
            loop {
                match cur.peek() {
                    Some(tok)
                        if matches!(tok, "-B" | "-c" | "-d" | "-g" | "-h" | "-s")
                            || (tok.len() >= 2
                                && tok.starts_with('-')
                                && matches!(
                                    &tok[..2],
                                    "-b" | "-f" | "-n" | "-r" | "-t" | "-v"
                                )) =>
                    {
                        let t = cur.take_scalar().unwrap();
                        cur.push(t, ParamKind::Scalar);
                    }
                    _ => break,
                }
            }
            while let Some(t) = cur.take_scalar() {
                cur.push(t, ParamKind::Scalar);
            }
        }
        "pull" => {
            let remote = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("remote".into()))?;
            cur.push(remote, ParamKind::Scalar);
            let local = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("local".into()))?;
            cur.push(local, ParamKind::OutputFile);
        }
        "push" => {
            let local = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("local".into()))?;
            cur.push(local, ParamKind::InputFile);
            let remote = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("remote".into()))?;
            cur.push(remote, ParamKind::Scalar);
        }
        "root" | "wait-for-device" | "help" => {}
        "shell" => {
            let arg0 = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("arg0".into()))?;
            cur.push(arg0, ParamKind::Scalar);
            while let Some(t) = cur.take_scalar() {
                cur.push(t, ParamKind::Scalar);
            }
        }
        "uninstall" => {
            take_known_flags(&mut cur, &["-k"], false);
            let pkg = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("package".into()))?;
            cur.push(pkg, ParamKind::Scalar);
        }
        _ => return Err(GrammarError::UnknownTool(format!("adb {sub}"))),
    }

    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevice_app_runner(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-h"], false);
    require_device_udid(&mut cur)?;
    take_known_flags(&mut cur, &[], true);
    if matches!(cur.peek(), Some("-s") | Some("--start")) {
        let t = cur.take_scalar().unwrap();
        cur.push(t, ParamKind::Scalar);
        let v = cur
            .take_scalar()
            .ok_or_else(|| GrammarError::MissingParameter("--start bundle id".into()))?;
        cur.push(v, ParamKind::Scalar);
    }
    if cur.peek() == Some("--args") {
        cur.take_scalar();
        cur.push("--args", ParamKind::Scalar);
        while let Some(t) = cur.take_scalar() {
            cur.push(t, ParamKind::Scalar);
        }
    }
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevice_id(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h", "-l"], false);
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevicedate(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h"], false);
    require_device_udid(&mut cur)?;
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

const DIAGNOSTICS_ENUM: &[&str] = &["diagnostics"];
const DIAGNOSTICS_SOURCE_ENUM: &[&str] = &["All", "WiFi"];

fn parse_idevicediagnostics(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-h"], false);
    require_device_udid(&mut cur)?;
    let op = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("diagnostics operation".into()))?;
    if !DIAGNOSTICS_ENUM.contains(&op.as_str()) {
        return Err(GrammarError::InvalidValue {
            parameter: "operation".into(),
            value: op,
        });
    }
    cur.push(op, ParamKind::Scalar);
    let source = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("diagnostics source".into()))?;
    if !DIAGNOSTICS_SOURCE_ENUM.contains(&source.as_str()) {
        return Err(GrammarError::InvalidValue {
            parameter: "source".into(),
            value: source,
        });
    }
    cur.push(source, ParamKind::Scalar);
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_ideviceimagemounter(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h", "-l"], false);
    require_device_udid(&mut cur)?;
    let image = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("image".into()))?;
    cur.push(image, ParamKind::InputFile);
    let sig = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("signature".into()))?;
    cur.push(sig, ParamKind::InputFile);
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_ideviceinfo(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    loop {
        match cur.peek() {
            Some("-d") | Some("-h") | Some("-s") | Some("-x") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            Some(tok) if tok.starts_with("-k") || tok.starts_with("-q") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            Some("-u") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
                let v = cur
                    .take_scalar()
                    .ok_or_else(|| GrammarError::MissingParameter("-u UDID".into()))?;
                if !is_ios_udid(&v) {
                    return Err(GrammarError::InvalidValue {
                        parameter: "-u".into(),
                        value: v,
                    });
                }
                cur.push(v, ParamKind::Scalar);
            }
            _ => break,
        }
    }
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_ideviceinstaller(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    loop {
        match cur.peek() {
            Some("-d") | Some("-h") | Some("-l") | Some("--list") | Some("--list-apps") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            Some(tok) if tok.starts_with("-o") || tok.starts_with("-U") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
            }
            Some("-u") => {
                let t = cur.take_scalar().unwrap();
                cur.push(t, ParamKind::Scalar);
                let v = cur
                    .take_scalar()
                    .ok_or_else(|| GrammarError::MissingParameter("-u UDID".into()))?;
                if !is_ios_udid(&v) {
                    return Err(GrammarError::InvalidValue {
                        parameter: "-u".into(),
                        value: v,
                    });
                }
                cur.push(v, ParamKind::Scalar);
            }
            Some("-i") => {
                cur.take_scalar();
                let v = cur
                    .take_scalar()
                    .ok_or_else(|| GrammarError::MissingParameter("-i package".into()))?;
                cur.push(v, ParamKind::InputFile);
            }
            _ => break,
        }
    }
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevicefs(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h"], false);
    require_device_udid(&mut cur)?;
    let sub = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("idevicefs subcommand".into()))?;
    cur.push(sub.clone(), ParamKind::Scalar);
    match sub.as_str() {
        "help" => {}
        "ls" => {
            take_known_flags(&mut cur, &["-F", "-R", "-l"], false);
            if let Some(remote) = cur.take_scalar() {
                cur.push(remote, ParamKind::Scalar);
            }
        }
        "pull" => {
            let remote = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("remote".into()))?;
            cur.push(remote, ParamKind::Scalar);
            let local = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("local".into()))?;
            cur.push(local, ParamKind::OutputFile);
        }
        "push" => {
            let local = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("local".into()))?;
            cur.push(local, ParamKind::InputFile);
            if let Some(remote) = cur.take_scalar() {
                cur.push(remote, ParamKind::Scalar);
            }
        }
        "rm" => {
            take_known_flags(&mut cur, &["-d", "-f", "-R"], false);
            let remote = cur
                .take_scalar()
                .ok_or_else(|| GrammarError::MissingParameter("remote".into()))?;
            cur.push(remote, ParamKind::Scalar);
        }
        _ => return Err(GrammarError::UnknownTool(format!("idevicefs {sub}"))),
    }
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevicescreenshot(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h"], false);
    require_device_udid(&mut cur)?;
    let local = cur
        .take_scalar()
        .ok_or_else(|| GrammarError::MissingParameter("local".into()))?;
    cur.push(local, ParamKind::OutputFile);
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}

fn parse_idevicesyslog(args: &[String]) -> Result<Vec<Param>, GrammarError> {
    let mut cur = Cursor::new(args);
    take_known_flags(&mut cur, &["-d", "-h"], false);
    require_device_udid(&mut cur)?;
    if !cur.end() {
        return Err(cur.err_extra());
    }
    Ok(cur.out)
}
