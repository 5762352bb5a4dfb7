use demand::{Confirm, Input};
use log::debug;
use secrecy::SecretString;

use crate::error::{Error, Result};

/// Interactive input, kept behind a trait so the resolver and the command
/// handlers can be driven by fakes in tests.
pub trait Prompter {
    /// Ask for a password with hidden input.
    fn password(&self, title: &str) -> Result<SecretString>;

    /// Ask for a line of plain input.
    fn line(&self, title: &str, placeholder: &str) -> Result<String>;

    /// Ask a yes/no question. A terminal that cannot be opened counts as
    /// a decline, so unattended runs never confirm anything.
    fn confirm(&self, title: &str) -> Result<bool>;
}

/// Prompts on the controlling terminal.
pub struct TermPrompter;

impl Prompter for TermPrompter {
    fn password(&self, title: &str) -> Result<SecretString> {
        let input = Input::new(title).placeholder("Password").password(true);
        match input.run() {
            Ok(value) => Ok(SecretString::from(value)),
            Err(err) => {
                debug!("password prompt failed: {err}");
                Err(Error::NoPassword)
            }
        }
    }

    fn line(&self, title: &str, placeholder: &str) -> Result<String> {
        Ok(Input::new(title).placeholder(placeholder).run()?)
    }

    fn confirm(&self, title: &str) -> Result<bool> {
        Ok(Confirm::new(title).run().unwrap_or(false))
    }
}
