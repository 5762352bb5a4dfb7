use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::backend::find_in_path;
use crate::error::{Error, Result};

const HELPER: &str = "secret-tool";
const APPLICATION: &str = "keepassx-cli";

/// A secret store keyed by profile name, opaque beyond get/set/clear.
pub trait SecretSource {
    fn get(&self, profile: &str) -> Result<Option<SecretString>>;
    fn set(&self, profile: &str, secret: &SecretString) -> Result<()>;
    fn clear(&self, profile: &str) -> Result<()>;
}

/// The system keyring, reached through the `secret-tool` helper. A missing
/// helper degrades to "nothing stored" on lookups so that resolution falls
/// through to the prompt.
pub struct SecretTool {
    program: Option<PathBuf>,
}

impl SecretTool {
    pub fn locate() -> Self {
        let program = find_in_path(HELPER);
        if program.is_none() {
            debug!("{HELPER} not installed, keyring lookups will find nothing");
        }
        SecretTool { program }
    }

    pub fn with_program(program: PathBuf) -> Self {
        SecretTool {
            program: Some(program),
        }
    }
}

impl SecretSource for SecretTool {
    fn get(&self, profile: &str) -> Result<Option<SecretString>> {
        let Some(program) = &self.program else {
            return Ok(None);
        };
        let output = Command::new(program)
            .args(["lookup", "application", APPLICATION, "profile", profile])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            debug!("{HELPER} lookup for `{profile}` exited with {}", output.status);
            return Ok(None);
        }

        let secret = String::from_utf8_lossy(&output.stdout);
        let secret = secret.trim_end_matches('\n');
        if secret.is_empty() {
            return Ok(None);
        }
        Ok(Some(SecretString::from(secret.to_string())))
    }

    fn set(&self, profile: &str, secret: &SecretString) -> Result<()> {
        let Some(program) = &self.program else {
            return Err(Error::Backend(format!("{HELPER} is not installed")));
        };
        let mut child = Command::new(program)
            .args(["store", "--label"])
            .arg(format!("KeePass profile {profile}"))
            .args(["application", APPLICATION, "profile", profile])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(secret.expose_secret().as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Backend(format!("{HELPER} store exited with {status}")));
        }
        Ok(())
    }

    fn clear(&self, profile: &str) -> Result<()> {
        let Some(program) = &self.program else {
            return Ok(());
        };
        let status = Command::new(program)
            .args(["clear", "application", APPLICATION, "profile", profile])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        // clearing a secret that was never stored is not an error
        if !status.success() {
            debug!("{HELPER} clear for `{profile}` exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// A stand-in for secret-tool backed by a plain file.
    fn fake_helper(dir: &std::path::Path) -> PathBuf {
        let state = dir.join("state");
        let script = dir.join("secret-tool");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 case \"$1\" in\n\
                 lookup) cat '{state}' 2>/dev/null || exit 1 ;;\n\
                 store) cat > '{state}' ;;\n\
                 clear) rm -f '{state}' ;;\n\
                 esac\n",
                state = state.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn missing_helper_finds_nothing() {
        let tool = SecretTool { program: None };
        assert!(tool.get("demo").unwrap().is_none());
        assert!(tool.clear("demo").is_ok());
        assert!(tool.set("demo", &SecretString::from("x".to_string())).is_err());
    }

    #[test]
    fn set_get_clear_roundtrip() {
        let dir = tempdir().unwrap();
        let tool = SecretTool::with_program(fake_helper(dir.path()));

        assert!(tool.get("demo").unwrap().is_none());

        tool.set("demo", &SecretString::from("hunter2".to_string()))
            .unwrap();
        let secret = tool.get("demo").unwrap().unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");

        tool.clear("demo").unwrap();
        assert!(tool.get("demo").unwrap().is_none());
    }
}
