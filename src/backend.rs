use std::env;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};

pub const TOOL: &str = "keepassxc-cli";
const FLATPAK: &str = "flatpak";
const FLATPAK_APP: &str = "org.keepassxc.KeePassXC";

/// Literal prompt the tool emits before reading the password.
const PROMPT_BANNER: &str = "Enter password to unlock";

/// One keepassxc-cli invocation's worth of work.
#[derive(Debug)]
pub enum Op {
    /// The whole entry, protected values revealed.
    Show { key: String },
    /// A single attribute of an entry.
    Attribute { key: String, attribute: String },
    /// Recursive listing, optionally flattened or rooted at a group.
    List { group: Option<String>, flatten: bool },
    /// Attachment bytes to stdout.
    Export { key: String, attachment: String },
}

impl Op {
    fn argv(&self, db: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        match self {
            Op::Show { key } => {
                argv.push("show".into());
                argv.push("-s".into());
                argv.push(db.into());
                argv.push(key.into());
            }
            Op::Attribute { key, attribute } => {
                argv.push("show".into());
                argv.push("-s".into());
                argv.push("-a".into());
                argv.push(attribute.into());
                argv.push(db.into());
                argv.push(key.into());
            }
            Op::List { group, flatten } => {
                argv.push("ls".into());
                argv.push("-R".into());
                if *flatten {
                    argv.push("-f".into());
                }
                argv.push(db.into());
                if let Some(group) = group {
                    argv.push(group.into());
                }
            }
            Op::Export { key, attachment } => {
                argv.push("attachment-export".into());
                argv.push("--stdout".into());
                argv.push(db.into());
                argv.push(key.into());
                argv.push(attachment.into());
            }
        }
        argv
    }

    fn key(&self) -> &str {
        match self {
            Op::Show { key }
            | Op::Attribute { key, .. }
            | Op::Export { key, .. } => key,
            Op::List { group, .. } => group.as_deref().unwrap_or(""),
        }
    }
}

/// Captured result of a successful invocation.
#[derive(Debug)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl Output {
    /// stdout as text, prompt banner stripped, no trailing newline.
    pub fn text(&self) -> String {
        let text = strip_banner(&String::from_utf8_lossy(&self.stdout));
        text.trim_end_matches('\n').to_string()
    }
}

pub struct Backend {
    program: PathBuf,
    prefix: Vec<String>,
}

impl Backend {
    /// Probe for a directly installed keepassxc-cli, else for a flatpak
    /// KeePassXC to run it out of.
    pub fn locate() -> Result<Self> {
        if let Some(program) = find_in_path(TOOL) {
            debug!("using {:?}", program);
            return Ok(Backend {
                program,
                prefix: Vec::new(),
            });
        }
        if let Some(flatpak) = find_in_path(FLATPAK) {
            debug!("{TOOL} not on PATH, using the {FLATPAK_APP} flatpak");
            return Ok(Backend {
                program: flatpak,
                prefix: vec![
                    "run".to_string(),
                    format!("--command={TOOL}"),
                    FLATPAK_APP.to_string(),
                ],
            });
        }
        Err(Error::BackendMissing)
    }

    pub fn with_program(program: PathBuf) -> Self {
        Backend {
            program,
            prefix: Vec::new(),
        }
    }

    /// Run one operation against the database, feeding the unlock password
    /// over the piped transcript. The password never appears in argv.
    pub fn run(&self, db: &Path, op: &Op, password: &SecretString) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix)
            .args(op.argv(db))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("spawning {:?}", cmd);

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::BackendMissing
            } else {
                Error::from(err)
            }
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("child stdin was not captured".to_string()))?;
        let fed = stdin
            .write_all(password.expose_secret().as_bytes())
            .and_then(|()| stdin.write_all(b"\n"));
        // a child that died before reading the password still gets classified below
        if let Err(err) = fed {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(err.into());
            }
        }
        drop(stdin);

        let raw = child.wait_with_output()?;
        let stderr = strip_banner(&String::from_utf8_lossy(&raw.stderr));
        classify(raw.status.success(), &stderr, db, op)?;

        Ok(Output {
            stdout: raw.stdout,
            stderr,
        })
    }
}

/// The tool has no structured output mode, so failures are recognized from
/// its diagnostics here and nowhere else.
fn classify(success: bool, stderr: &str, db: &Path, op: &Op) -> Result<()> {
    if stderr.contains("Invalid credentials") {
        return Err(Error::InvalidCredentials(db.to_path_buf()));
    }
    if stderr.contains("Could not find entry") {
        return Err(Error::EntryNotFound(op.key().to_string()));
    }
    if stderr.contains("Could not find attachment") {
        let attachment = match op {
            Op::Export { attachment, .. } => attachment.clone(),
            _ => String::new(),
        };
        return Err(Error::AttachmentNotFound {
            entry: op.key().to_string(),
            attachment,
        });
    }
    if !success {
        return Err(Error::Backend(stderr.trim().to_string()));
    }
    Ok(())
}

/// Drop the password prompt from captured output. The tool does not end
/// the prompt with a newline, so whatever it printed next shares the line
/// and has to survive the strip.
fn strip_banner(text: &str) -> String {
    let mut kept = Vec::new();
    for line in text.lines() {
        match line.find(PROMPT_BANNER) {
            Some(idx) => {
                let after = match line[idx..].find(": ") {
                    Some(colon) => &line[idx + colon + 2..],
                    None => "",
                };
                let rest = format!("{}{}", &line[..idx], after);
                if !rest.trim().is_empty() {
                    kept.push(rest);
                }
            }
            None => kept.push(line.to_string()),
        }
    }
    kept.join("\n")
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
