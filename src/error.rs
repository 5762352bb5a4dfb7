use std::path::PathBuf;

use thiserror::Error;

/// Exit codes of the `kpx` binary. These are a documented contract for
/// scripts wrapping the tool, not free-form shell statuses.
pub mod exit {
    /// No subcommand given, bad arguments, or an aborted confirmation.
    pub const USAGE: i32 = 1;
    /// The subcommand is not known.
    pub const UNKNOWN_COMMAND: i32 = 2;
    /// No database path configured, or the profile is missing/unusable.
    pub const MISSING_DATABASE: i32 = 3;
    /// The configured database file does not exist.
    pub const DATABASE_NOT_FOUND: i32 = 4;
    /// No password source available, or the database rejected the password.
    pub const CREDENTIALS: i32 = 5;
    /// `extract` called without both an entry key and an attachment name.
    pub const MISSING_ATTACHMENT_ARGS: i32 = 6;
    /// Neither `keepassxc-cli` nor a flatpak KeePassXC could be located.
    pub const BACKEND_MISSING: i32 = 7;
    /// The entry or attachment does not exist in the database.
    pub const NOT_FOUND: i32 = 8;
    /// The external tool failed in an unclassified way.
    pub const BACKEND: i32 = 9;
    /// Internal fault (I/O or a programming error).
    pub const INTERNAL: i32 = 70;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("operation aborted")]
    Aborted,

    #[error("no database configured, pass --db, set KEEPASSX_CLI__DB or use a profile")]
    MissingDatabase,

    #[error("database file does not exist: {}", .0.display())]
    DatabaseNotFound(PathBuf),

    #[error("profile `{0}` not found")]
    ProfileNotFound(String),

    #[error("profile `{0}` already exists")]
    ProfileAlreadyExists(String),

    #[error("profile `{0}` has no database path")]
    IncompleteProfile(String),

    #[error("no password available and prompting is disabled")]
    NoPassword,

    #[error("invalid credentials for {}", .0.display())]
    InvalidCredentials(PathBuf),

    #[error("could not find entry `{0}`")]
    EntryNotFound(String),

    #[error("could not find attachment `{attachment}` on entry `{entry}`")]
    AttachmentNotFound { entry: String, attachment: String },

    #[error("extract needs an entry key and an attachment name")]
    MissingAttachmentArgs,

    #[error("keepassxc-cli not found, install it or the KeePassXC flatpak")]
    BackendMissing,

    #[error("keepassxc-cli failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) | Error::Aborted => exit::USAGE,
            Error::MissingDatabase
            | Error::ProfileNotFound(_)
            | Error::ProfileAlreadyExists(_)
            | Error::IncompleteProfile(_) => exit::MISSING_DATABASE,
            Error::DatabaseNotFound(_) => exit::DATABASE_NOT_FOUND,
            Error::NoPassword | Error::InvalidCredentials(_) => exit::CREDENTIALS,
            Error::EntryNotFound(_) | Error::AttachmentNotFound { .. } => exit::NOT_FOUND,
            Error::MissingAttachmentArgs => exit::MISSING_ATTACHMENT_ARGS,
            Error::BackendMissing => exit::BACKEND_MISSING,
            Error::Backend(_) => exit::BACKEND,
            Error::Io(_) | Error::Internal(_) => exit::INTERNAL,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(Error::MissingDatabase.exit_code(), 3);
        assert_eq!(Error::DatabaseNotFound("x.kdbx".into()).exit_code(), 4);
        assert_eq!(Error::NoPassword.exit_code(), 5);
        assert_eq!(Error::InvalidCredentials("x.kdbx".into()).exit_code(), 5);
        assert_eq!(Error::MissingAttachmentArgs.exit_code(), 6);
        assert_eq!(Error::BackendMissing.exit_code(), 7);
        assert_eq!(Error::EntryNotFound("a".into()).exit_code(), 8);
        assert_eq!(Error::Backend("boom".into()).exit_code(), 9);
    }
}
