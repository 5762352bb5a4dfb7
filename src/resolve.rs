use std::path::PathBuf;

use log::debug;
use secrecy::SecretString;

use crate::cli::Config;
use crate::error::{Error, Result};
use crate::keyring::SecretSource;
use crate::profile::{Profile, ProfileStore};
use crate::prompt::Prompter;

/// Everything one invocation needs to talk to the backend. Built once,
/// never persisted.
#[derive(Debug)]
pub struct Session {
    pub profile: Option<String>,
    pub db: PathBuf,
    pub password: SecretString,
}

/// A parsed `[PROFILE] KEY...` request.
#[derive(Debug, PartialEq)]
pub struct Query {
    pub profile: Option<String>,
    pub key: String,
}

/// Collapse the ` / ` separator convention so `A / B / C` and `A/B/C`
/// address the same entry.
pub fn normalize_key(key: &str) -> String {
    let mut key = key.trim().to_string();
    while key.contains(" / ") {
        key = key.replace(" / ", "/");
    }
    key
}

/// Consume a leading profile selector from the token list: either a first
/// token naming an existing profile, or a `NAME__KEY` prefix. An explicit
/// `--profile` wins and leaves the tokens alone.
fn take_profile(store: &ProfileStore, cfg: &Config, tokens: &mut Vec<String>) -> Option<String> {
    if let Some(profile) = &cfg.profile {
        return Some(profile.clone());
    }
    let first = tokens.first()?.clone();

    if let Some((name, rest)) = first.split_once("__") {
        if store.exists(name) {
            if rest.is_empty() {
                tokens.remove(0);
            } else {
                tokens[0] = rest.to_string();
            }
            return Some(name.to_string());
        }
    }
    if store.exists(&first) {
        tokens.remove(0);
        return Some(first);
    }
    None
}

pub fn parse_query(store: &ProfileStore, cfg: &Config, tokens: &[String]) -> Query {
    let mut tokens = tokens.to_vec();
    let profile = take_profile(store, cfg, &mut tokens);

    let joined = tokens.join(" ");
    let key = if joined.trim().is_empty() {
        cfg.key.clone().unwrap_or_default()
    } else {
        joined
    };

    Query {
        profile,
        key: normalize_key(&key),
    }
}

/// The extract variant: the final token is the attachment name.
pub fn parse_extract_query(
    store: &ProfileStore,
    cfg: &Config,
    tokens: &[String],
) -> Result<(Query, String)> {
    let mut tokens = tokens.to_vec();
    let profile = take_profile(store, cfg, &mut tokens);

    let (key, attachment) = if tokens.len() >= 2 {
        let attachment = tokens.pop().unwrap_or_default();
        (tokens.join(" "), attachment)
    } else if let (1, Some(key)) = (tokens.len(), cfg.key.clone()) {
        (key, tokens.remove(0))
    } else {
        return Err(Error::MissingAttachmentArgs);
    };

    Ok((
        Query {
            profile,
            key: normalize_key(&key),
        },
        attachment,
    ))
}

/// Resolve the database and the unlock password for one invocation.
///
/// The database path is settled first; no password source is consulted for
/// a database that cannot possibly be opened.
pub fn resolve_session(
    store: &ProfileStore,
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    profile_name: Option<&str>,
) -> Result<Session> {
    let profile = match profile_name {
        Some(name) => Some(store.load(name)?),
        None => None,
    };

    let db = cfg
        .db
        .clone()
        .or_else(|| profile.as_ref().and_then(|p| p.db.clone()))
        .ok_or(Error::MissingDatabase)?;
    if !db.exists() {
        return Err(Error::DatabaseNotFound(db));
    }

    let password = resolve_password(keyring, prompter, cfg, profile.as_ref(), &db)?;

    Ok(Session {
        profile: profile.map(|p| p.name),
        db,
        password,
    })
}

fn resolve_password(
    keyring: &dyn SecretSource,
    prompter: &dyn Prompter,
    cfg: &Config,
    profile: Option<&Profile>,
    db: &std::path::Path,
) -> Result<SecretString> {
    if let Some(pass) = &cfg.pass {
        debug!("using the password given by flag or environment");
        return Ok(pass.clone());
    }

    if let Some(profile) = profile {
        if let Some(pass) = &profile.pass {
            debug!("using the password stored in profile `{}`", profile.name);
            return Ok(pass.clone());
        }
        if cfg.use_keyring {
            match keyring.get(&profile.name) {
                Ok(Some(secret)) => {
                    debug!("using the keyring secret for `{}`", profile.name);
                    return Ok(secret);
                }
                Ok(None) => debug!("no keyring secret for `{}`", profile.name),
                Err(err) => debug!("keyring lookup failed: {err}"),
            }
        }
    }

    if cfg.no_prompt {
        return Err(Error::NoPassword);
    }
    prompter.password(&format!("Password for {}", db.display()))
}
