use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use secrecy::SecretString;

use crate::cli::ENV_CONF;
use crate::error::{Error, Result};

const PROFILE_PREFIX: &str = "conf.";
const PROFILE_SUFFIX: &str = ".env";

pub const KEY_DB: &str = "KC_DB";
pub const KEY_PASS: &str = "KC_PASS";

/// A persisted `(database path, password-or-empty)` pair.
#[derive(Debug)]
pub struct Profile {
    pub name: String,
    pub db: Option<PathBuf>,
    pub pass: Option<SecretString>,
}

impl Profile {
    /// Database path of the profile, or an error if the file never got one.
    pub fn db(&self) -> Result<&Path> {
        self.db
            .as_deref()
            .ok_or_else(|| Error::IncompleteProfile(self.name.clone()))
    }
}

/// Profile files on disk, one `conf.<name>.env` per profile.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Open the store in `$KEEPASSX_CLI__CONF`, or `~/.config/kpx`,
    /// creating the directory if needed.
    pub fn open() -> Result<Self> {
        let dir = match env::var_os(ENV_CONF) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = home::home_dir()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| {
                        Error::Internal(anyhow::anyhow!("could not determine home directory"))
                    })?;
                home.join(".config").join("kpx")
            }
        };
        Ok(Self::at(dir))
    }

    pub fn at(dir: PathBuf) -> Self {
        ProfileStore { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{PROFILE_PREFIX}{name}{PROFILE_SUFFIX}"))
    }

    /// Profile names found on disk, sorted. Recomputed on every call.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name
                .strip_prefix(PROFILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(PROFILE_SUFFIX))
            {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<Profile> {
        let contents = self.raw(name)?;

        let mut db = None;
        let mut pass = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((KEY_DB, value)) if !value.is_empty() => db = Some(PathBuf::from(value)),
                Some((KEY_PASS, value)) if !value.is_empty() => {
                    pass = Some(SecretString::from(value.to_string()))
                }
                Some((KEY_DB | KEY_PASS, _)) => {}
                other => debug!("ignoring profile line {:?}", other.map(|(k, _)| k)),
            }
        }

        Ok(Profile {
            name: name.to_string(),
            db,
            pass,
        })
    }

    /// Raw file contents, for `profile show` and `profile edit`.
    pub fn raw(&self, name: &str) -> Result<String> {
        match fs::read_to_string(self.path(name)) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ProfileNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn create(&self, name: &str, db: Option<&Path>) -> Result<()> {
        if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::Usage(format!("invalid profile name `{name}`")));
        }
        if self.exists(name) {
            return Err(Error::ProfileAlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&self.dir)?;

        let mut contents = format!(
            "# kpx profile `{name}`\n\
             # {KEY_DB} is the path to the .kdbx database.\n\
             # {KEY_PASS} is the database password; empty or absent means prompt.\n"
        );
        if let Some(db) = db {
            contents.push_str(&format!("{KEY_DB}={}\n", db.display()));
        }

        debug!("creating profile file {:?}", self.path(name));
        fs::write(self.path(name), contents)?;
        Ok(())
    }

    /// Replace the password assignment. An empty password means
    /// "always prompt"; the stale assignment line is dropped either way.
    pub fn update_password(&self, name: &str, pass: &str, comment: &str) -> Result<()> {
        let contents = self.raw(name)?;

        let mut kept: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim_start().starts_with(KEY_PASS))
            .collect();
        while kept.last().is_some_and(|line| line.trim().is_empty()) {
            kept.pop();
        }

        let mut contents = kept.join("\n");
        contents.push_str(&format!("\n# {comment}\n{KEY_PASS}={pass}\n"));
        fs::write(self.path(name), contents)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ProfileNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempdir().unwrap();
        let store = ProfileStore::at(dir.path().to_path_buf());
        (dir, store)
    }

    #[test]
    fn create_then_exists_then_remove() {
        let (_dir, store) = store();
        store
            .create("demo", Some(Path::new("/tmp/test.kdbx")))
            .unwrap();
        assert!(store.exists("demo"));
        store.remove("demo").unwrap();
        assert!(!store.exists("demo"));
    }

    #[test]
    fn create_writes_db_path_and_header() {
        let (_dir, store) = store();
        store
            .create("demo", Some(Path::new("/tmp/test.kdbx")))
            .unwrap();

        let raw = store.raw("demo").unwrap();
        assert!(raw.starts_with('#'));
        assert!(raw.contains("KC_DB=/tmp/test.kdbx"));

        let profile = store.load("demo").unwrap();
        assert_eq!(profile.db.as_deref(), Some(Path::new("/tmp/test.kdbx")));
        assert!(profile.pass.is_none());
    }

    #[test]
    fn create_refuses_duplicates() {
        let (_dir, store) = store();
        store.create("demo", None).unwrap();
        assert!(matches!(
            store.create("demo", None),
            Err(Error::ProfileAlreadyExists(_))
        ));
    }

    #[test]
    fn load_missing_profile_fails() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("nope"),
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[test]
    fn update_password_replaces_previous_assignment() {
        let (_dir, store) = store();
        store
            .create("demo", Some(Path::new("/tmp/test.kdbx")))
            .unwrap();

        store.update_password("demo", "first", "stored").unwrap();
        store.update_password("demo", "second", "stored").unwrap();

        let raw = store.raw("demo").unwrap();
        assert_eq!(raw.matches("KC_PASS=").count(), 1);
        let profile = store.load("demo").unwrap();
        assert_eq!(profile.pass.unwrap().expose_secret(), "second");
        assert_eq!(profile.db.as_deref(), Some(Path::new("/tmp/test.kdbx")));
    }

    #[test]
    fn empty_password_means_no_password_field() {
        let (_dir, store) = store();
        store
            .create("demo", Some(Path::new("/tmp/test.kdbx")))
            .unwrap();
        store.update_password("demo", "secret", "stored").unwrap();
        store.update_password("demo", "", "cleared").unwrap();

        let profile = store.load("demo").unwrap();
        assert!(profile.pass.is_none());
    }

    #[test]
    fn list_is_sorted_and_only_profiles() {
        let (dir, store) = store();
        store.create("zeta", None).unwrap();
        store.create("alpha", None).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("conf..env"), "x").unwrap();

        assert_eq!(store.list().unwrap(), ["alpha", "zeta"]);
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        let store = ProfileStore::at(PathBuf::from("/nonexistent/kpx-test"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn incomplete_profile_has_no_db() {
        let (_dir, store) = store();
        store.create("demo", None).unwrap();
        let profile = store.load("demo").unwrap();
        assert!(matches!(profile.db(), Err(Error::IncompleteProfile(_))));
    }
}
