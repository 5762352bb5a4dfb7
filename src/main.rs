use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::{debug, info, warn, LevelFilter};
use secrecy::{ExposeSecret, SecretString};

use kpx::backend::{Backend, Op};
use kpx::cli::{Cli, Command, Config, ProfileCommand, ENV_DB, ENV_PROFILE};
use kpx::error::{exit, Error, Result};
use kpx::keyring::{SecretSource, SecretTool};
use kpx::profile::{ProfileStore, KEY_PASS};
use kpx::prompt::{Prompter, TermPrompter};
use kpx::resolve::{parse_extract_query, parse_query, resolve_session};

const PASSWORD_MASK: &str = "********";

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = err.print();
                    process::exit(0);
                }
                ErrorKind::InvalidSubcommand => exit::UNKNOWN_COMMAND,
                _ => exit::USAGE,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    init_logging(cli.verbose);

    let cfg = Config::from_cli(&cli);
    let Some(command) = cli.command else {
        let _ = Cli::command().print_help();
        eprintln!("\nno command provided");
        process::exit(exit::USAGE);
    };
    debug!("configuration: {:?}", cfg);

    if let Err(err) = run(command, &cfg) {
        eprintln!("kpx: {err}");
        process::exit(err.exit_code());
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(command: Command, cfg: &Config) -> Result<()> {
    let store = ProfileStore::open()?;
    let keyring = SecretTool::locate();
    let prompter = TermPrompter;

    match command {
        Command::Get { query } => cmd_entry(&store, &keyring, &prompter, cfg, &query, true),
        Command::Show { query } => cmd_entry(&store, &keyring, &prompter, cfg, &query, false),
        Command::Dump { query } => cmd_dump(&store, &keyring, &prompter, cfg, &query),
        Command::Tree { query } => cmd_tree(&store, &keyring, &prompter, cfg, &query),
        Command::Extract { query } => cmd_extract(&store, &keyring, &prompter, cfg, &query),
        Command::Shell { name } => cmd_shell(&store, cfg, name),
        Command::Info => cmd_info(&store, cfg),
        Command::Profile { command } => match command {
            ProfileCommand::Ls => cmd_profile_ls(&store),
            ProfileCommand::Add { name, database } => {
                cmd_profile_add(&store, &keyring, &prompter, cfg, &name, database)
            }
            ProfileCommand::Password { name } => {
                cmd_profile_password(&store, &keyring, &prompter, cfg, &name)
            }
            ProfileCommand::Rm { name } => cmd_profile_rm(&store, &keyring, &prompter, cfg, &name),
            ProfileCommand::Show { name } => cmd_profile_show(&store, &name),
            ProfileCommand::Edit { name } => cmd_profile_edit(&store, &name),
        },
    }
}

/// `get` and `show`: one entry, either its password attribute or the whole
/// record.
fn cmd_entry(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    tokens: &[String],
    password_only: bool,
) -> Result<()> {
    let query = parse_query(store, cfg, tokens);
    if query.key.is_empty() {
        return Err(Error::Usage("an entry key is required".to_string()));
    }

    let session = resolve_session(store, keyring, prompter, cfg, query.profile.as_deref())?;
    let op = if password_only {
        Op::Attribute {
            key: query.key,
            attribute: "Password".to_string(),
        }
    } else {
        Op::Show { key: query.key }
    };

    let output = Backend::locate()?.run(&session.db, &op, &session.password)?;
    println!("{}", output.text());
    Ok(())
}

/// `dump`: every entry as a flat path, optionally filtered.
fn cmd_dump(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    tokens: &[String],
) -> Result<()> {
    let query = parse_query(store, cfg, tokens);
    let session = resolve_session(store, keyring, prompter, cfg, query.profile.as_deref())?;

    let op = Op::List {
        group: None,
        flatten: true,
    };
    let output = Backend::locate()?.run(&session.db, &op, &session.password)?;

    let pattern = query.key.to_lowercase();
    for line in output.text().lines() {
        if line.trim().is_empty() {
            continue;
        }
        if pattern.is_empty() || line.to_lowercase().contains(&pattern) {
            println!("{line}");
        }
    }
    Ok(())
}

/// `tree`: the hierarchical listing, blank lines removed.
fn cmd_tree(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    tokens: &[String],
) -> Result<()> {
    let query = parse_query(store, cfg, tokens);
    let session = resolve_session(store, keyring, prompter, cfg, query.profile.as_deref())?;

    let op = Op::List {
        group: (!query.key.is_empty()).then(|| query.key.clone()),
        flatten: false,
    };
    let output = Backend::locate()?.run(&session.db, &op, &session.password)?;

    for line in output.text().lines() {
        if !line.trim().is_empty() {
            println!("{line}");
        }
    }
    Ok(())
}

/// `extract`: attachment bytes to stdout, nothing on failure.
fn cmd_extract(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    tokens: &[String],
) -> Result<()> {
    let (query, attachment) = parse_extract_query(store, cfg, tokens)?;
    let session = resolve_session(store, keyring, prompter, cfg, query.profile.as_deref())?;

    let op = Op::Export {
        key: query.key,
        attachment,
    };
    let output = Backend::locate()?.run(&session.db, &op, &session.password)?;

    io::stdout().write_all(&output.stdout)?;
    Ok(())
}

/// `shell`: sourceable exports pinning a profile.
fn cmd_shell(store: &ProfileStore, cfg: &Config, profile: Option<String>) -> Result<()> {
    let name = profile
        .or_else(|| cfg.profile.clone())
        .ok_or_else(|| Error::Usage("a profile name is required".to_string()))?;
    let profile = store.load(&name)?;

    println!("# eval \"$(kpx shell {name})\"");
    println!("export {ENV_PROFILE}={}", sh_quote(&name));
    if let Some(db) = &profile.db {
        println!("export {ENV_DB}={}", sh_quote(&db.display().to_string()));
    }
    Ok(())
}

/// `info`: the resolved configuration, password masked.
fn cmd_info(store: &ProfileStore, cfg: &Config) -> Result<()> {
    let profile = match &cfg.profile {
        Some(name) => Some(store.load(name)?),
        None => None,
    };
    let db = cfg
        .db
        .clone()
        .or_else(|| profile.as_ref().and_then(|p| p.db.clone()));
    let has_password =
        cfg.pass.is_some() || profile.as_ref().is_some_and(|p| p.pass.is_some());

    println!("config dir : {}", store.dir().display());
    println!("profile    : {}", cfg.profile.as_deref().unwrap_or("(none)"));
    println!(
        "database   : {}",
        db.map(|db| db.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!(
        "password   : {}",
        if has_password { PASSWORD_MASK } else { "(none)" }
    );
    println!("keyring    : {}", cfg.use_keyring);
    println!("prompting  : {}", !cfg.no_prompt);
    Ok(())
}

fn cmd_profile_ls(store: &ProfileStore) -> Result<()> {
    for name in store.list()? {
        println!("{name}");
    }
    Ok(())
}

fn cmd_profile_add(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    name: &str,
    db: Option<PathBuf>,
) -> Result<()> {
    if store.exists(name) {
        return Err(Error::ProfileAlreadyExists(name.to_string()));
    }

    let db = match db {
        Some(db) => Some(db),
        None if cfg.no_prompt => None,
        None => prompter
            .line(&format!("Database for `{name}`"), "/path/to/db.kdbx")
            .ok()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .map(PathBuf::from),
    };
    store.create(name, db.as_deref())?;

    let pass = match &cfg.pass {
        Some(pass) => Some(pass.clone()),
        None if cfg.no_prompt => None,
        None => prompter.password(&format!("Password for `{name}`")).ok(),
    };
    let pass = pass.filter(|pass| !pass.expose_secret().is_empty());

    match pass {
        Some(pass) => store_password(store, keyring, cfg, name, &pass)?,
        // no password and no database either, leave nothing behind
        None if db.is_none() => {
            store.remove(name)?;
            return Err(Error::Usage(format!(
                "profile `{name}` needs a database path or a password"
            )));
        }
        None => info!("no password stored for `{name}`, it will be prompted for"),
    }

    println!("profile `{name}` created");
    Ok(())
}

fn cmd_profile_password(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    name: &str,
) -> Result<()> {
    if !store.exists(name) {
        return Err(Error::ProfileNotFound(name.to_string()));
    }

    let pass = match &cfg.pass {
        Some(pass) => pass.clone(),
        None if cfg.no_prompt => return Err(Error::NoPassword),
        None => prompter.password(&format!(
            "New password for `{name}` (empty to always prompt)"
        ))?,
    };

    if pass.expose_secret().is_empty() {
        store.update_password(name, "", "always prompt")?;
        if let Err(err) = keyring.clear(name) {
            debug!("keyring clear failed: {err}");
        }
        println!("profile `{name}` will prompt for its password");
    } else {
        store_password(store, keyring, cfg, name, &pass)?;
        println!("password for `{name}` updated");
    }
    Ok(())
}

/// Put the password where the configuration says it belongs: the keyring
/// when enabled and working, the profile file otherwise.
fn store_password(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    cfg: &Config,
    name: &str,
    pass: &SecretString,
) -> Result<()> {
    if cfg.use_keyring {
        match keyring.set(name, pass) {
            Ok(()) => {
                return store.update_password(name, "", "password kept in the system keyring")
            }
            Err(err) => {
                warn!("keyring store failed, keeping the password in the profile file: {err}")
            }
        }
    }
    store.update_password(name, pass.expose_secret(), "stored in clear text")
}

fn cmd_profile_rm(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    name: &str,
) -> Result<()> {
    if !store.exists(name) {
        return Err(Error::ProfileNotFound(name.to_string()));
    }
    if !cfg.force && !prompter.confirm(&format!("Delete profile `{name}`?"))? {
        return Err(Error::Aborted);
    }

    store.remove(name)?;
    if let Err(err) = keyring.clear(name) {
        debug!("keyring clear failed: {err}");
    }
    println!("profile `{name}` removed");
    Ok(())
}

fn cmd_profile_show(store: &ProfileStore, name: &str) -> Result<()> {
    for line in store.raw(name)?.lines() {
        match line.split_once('=') {
            Some((KEY_PASS, value)) if !value.is_empty() => {
                println!("{KEY_PASS}={PASSWORD_MASK}")
            }
            _ => println!("{line}"),
        }
    }
    Ok(())
}

fn cmd_profile_edit(store: &ProfileStore, name: &str) -> Result<()> {
    if !store.exists(name) {
        return Err(Error::ProfileNotFound(name.to_string()));
    }
    let editor = env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let status = process::Command::new(&editor)
        .arg(store.path(name))
        .status()?;
    if !status.success() {
        return Err(Error::Backend(format!("{editor} exited with {status}")));
    }
    Ok(())
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    struct NoKeyring;

    impl SecretSource for NoKeyring {
        fn get(&self, _profile: &str) -> Result<Option<SecretString>> {
            Ok(None)
        }

        fn set(&self, _profile: &str, _secret: &SecretString) -> Result<()> {
            Err(Error::Backend("no keyring".to_string()))
        }

        fn clear(&self, _profile: &str) -> Result<()> {
            Ok(())
        }
    }

    struct MemKeyring {
        secret: RefCell<Option<String>>,
    }

    impl SecretSource for MemKeyring {
        fn get(&self, _profile: &str) -> Result<Option<SecretString>> {
            Ok(self.secret.borrow().clone().map(SecretString::from))
        }

        fn set(&self, _profile: &str, secret: &SecretString) -> Result<()> {
            *self.secret.borrow_mut() = Some(secret.expose_secret().to_string());
            Ok(())
        }

        fn clear(&self, _profile: &str) -> Result<()> {
            *self.secret.borrow_mut() = None;
            Ok(())
        }
    }

    struct ScriptedPrompter {
        password: Option<&'static str>,
        confirmed: bool,
    }

    impl Prompter for ScriptedPrompter {
        fn password(&self, _title: &str) -> Result<SecretString> {
            self.password
                .map(|p| SecretString::from(p.to_string()))
                .ok_or(Error::NoPassword)
        }

        fn line(&self, _title: &str, _placeholder: &str) -> Result<String> {
            Err(Error::NoPassword)
        }

        fn confirm(&self, _title: &str) -> Result<bool> {
            Ok(self.confirmed)
        }
    }

    fn cfg() -> Config {
        Config {
            profile: None,
            key: None,
            db: None,
            pass: None,
            use_keyring: false,
            no_prompt: false,
            force: false,
        }
    }

    #[test]
    fn sh_quote_wraps_and_escapes() {
        assert_eq!(sh_quote("demo"), "'demo'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn add_with_prompted_password_stores_db_and_pass() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        let prompter = ScriptedPrompter {
            password: Some("x"),
            confirmed: true,
        };

        cmd_profile_add(
            &store,
            &NoKeyring,
            &prompter,
            &cfg(),
            "demo",
            Some(PathBuf::from("/tmp/test.kdbx")),
        )
        .unwrap();

        let raw = store.raw("demo").unwrap();
        assert!(raw.contains("KC_DB=/tmp/test.kdbx"));
        assert!(raw.contains("KC_PASS=x"));
    }

    #[test]
    fn add_aborted_with_nothing_leaves_no_profile() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        let prompter = ScriptedPrompter {
            password: None,
            confirmed: true,
        };

        let err =
            cmd_profile_add(&store, &NoKeyring, &prompter, &cfg(), "demo", None).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert!(!store.exists("demo"));
    }

    #[test]
    fn add_without_password_keeps_the_profile_when_db_is_known() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        let prompter = ScriptedPrompter {
            password: None,
            confirmed: true,
        };

        cmd_profile_add(
            &store,
            &NoKeyring,
            &prompter,
            &cfg(),
            "demo",
            Some(PathBuf::from("/tmp/test.kdbx")),
        )
        .unwrap();

        let profile = store.load("demo").unwrap();
        assert!(profile.pass.is_none());
    }

    #[test]
    fn keyring_storage_keeps_the_password_out_of_the_file() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        let keyring = MemKeyring {
            secret: RefCell::new(None),
        };
        let prompter = ScriptedPrompter {
            password: Some("hunter2"),
            confirmed: true,
        };
        let mut cfg = cfg();
        cfg.use_keyring = true;

        cmd_profile_add(
            &store,
            &keyring,
            &prompter,
            &cfg,
            "demo",
            Some(PathBuf::from("/tmp/test.kdbx")),
        )
        .unwrap();

        assert_eq!(keyring.secret.borrow().as_deref(), Some("hunter2"));
        let profile = store.load("demo").unwrap();
        assert!(profile.pass.is_none());
    }

    #[test]
    fn empty_password_update_clears_the_keyring() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        store
            .create("demo", Some(std::path::Path::new("/tmp/test.kdbx")))
            .unwrap();
        let keyring = MemKeyring {
            secret: RefCell::new(Some("old".to_string())),
        };
        let prompter = ScriptedPrompter {
            password: Some(""),
            confirmed: true,
        };
        let mut cfg = cfg();
        cfg.use_keyring = true;

        cmd_profile_password(&store, &keyring, &prompter, &cfg, "demo").unwrap();

        assert!(keyring.secret.borrow().is_none());
        assert!(store.load("demo").unwrap().pass.is_none());
    }

    #[test]
    fn rm_without_force_needs_an_affirmative_answer() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        store.create("demo", None).unwrap();

        let declining = ScriptedPrompter {
            password: None,
            confirmed: false,
        };
        let err = cmd_profile_rm(&store, &NoKeyring, &declining, &cfg(), "demo").unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert!(store.exists("demo"));

        let mut forced = cfg();
        forced.force = true;
        cmd_profile_rm(&store, &NoKeyring, &declining, &forced, "demo").unwrap();
        assert!(!store.exists("demo"));
    }
}
