use std::env;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use secrecy::SecretString;

pub const ENV_PROFILE: &str = "KEEPASSX_CLI__PROFILE";
pub const ENV_KEY: &str = "KEEPASSX_CLI__KEY";
pub const ENV_DB: &str = "KEEPASSX_CLI__DB";
pub const ENV_PASS: &str = "KEEPASSX_CLI__PASS";
pub const ENV_CONF: &str = "KEEPASSX_CLI__CONF";
pub const ENV_KEYRING: &str = "KEEPASSX_CLI__KEYRING";
pub const ENV_NO_PROMPT: &str = "KEEPASSX_CLI__NO_PROMPT";

/// Command line interface to a keepass database through keepassxc-cli.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Use a named profile
    #[arg(short, long, global = true, env = ENV_PROFILE)]
    pub profile: Option<String>,

    /// Entry key, used when no positional KEY is given
    #[arg(short, long, global = true, env = ENV_KEY)]
    pub key: Option<String>,

    /// Path to the .kdbx database file
    #[arg(short, long, global = true, env = ENV_DB)]
    pub db: Option<PathBuf>,

    /// Database password (prefer the keyring or the prompt)
    #[arg(long, global = true, env = ENV_PASS, hide_env_values = true)]
    pub pass: Option<String>,

    /// Look up stored profile passwords in the system keyring
    #[arg(long, global = true, env = ENV_KEYRING, value_name = "BOOL")]
    pub keyring: Option<bool>,

    /// Allow prompting for a missing password
    #[arg(long, global = true, value_name = "BOOL")]
    pub prompt: Option<bool>,

    /// Skip confirmation prompts
    #[arg(short, long, global = true)]
    pub force: bool,

    /// Increase log verbosity, repeatable
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the password of an entry
    Get { query: Vec<String> },

    /// Print a whole entry
    Show { query: Vec<String> },

    /// List all entries, optionally filtered by a substring
    Dump { query: Vec<String> },

    /// List entries as a tree, optionally rooted at a group
    Tree { query: Vec<String> },

    /// Write an entry attachment to stdout
    Extract { query: Vec<String> },

    /// Print shell exports pinning a profile for the calling session
    Shell { name: Option<String> },

    /// Print the resolved configuration
    Info,

    /// Manage profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    /// List profiles
    Ls,

    /// Create a profile
    Add {
        name: String,
        database: Option<PathBuf>,
    },

    /// Store a new password for a profile
    Password { name: String },

    /// Delete a profile
    Rm { name: String },

    /// Print a profile file, password masked
    Show { name: String },

    /// Open a profile file in the editor
    Edit { name: String },
}

/// Immutable per-invocation configuration folded out of flags and
/// environment once, then passed by reference everywhere.
#[derive(Debug)]
pub struct Config {
    pub profile: Option<String>,
    pub key: Option<String>,
    pub db: Option<PathBuf>,
    pub pass: Option<SecretString>,
    pub use_keyring: bool,
    pub no_prompt: bool,
    pub force: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        // --prompt wins over the environment; the env var only fills the gap.
        let no_prompt = match cli.prompt {
            Some(prompt) => !prompt,
            None => env_flag(ENV_NO_PROMPT),
        };

        Config {
            profile: cli.profile.clone(),
            key: cli.key.clone(),
            db: cli.db.clone(),
            pass: cli.pass.clone().map(SecretString::from),
            use_keyring: cli.keyring.unwrap_or(true),
            no_prompt,
            force: cli.force,
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty() && v != "false" && v != "0",
        Err(_) => false,
    }
}
