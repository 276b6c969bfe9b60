use crate::config::ShellConfig;
use crate::jobs::JobTable;
use crate::relay::Relay;
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;

/// Shell variables set with `NAME=VALUE`.
///
/// These are separate from the process environment: a name that was never
/// assigned reads as the empty string even if the process has it exported.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    vars: HashMap<String, String>,
}

impl VariableStore {
    /// Value of `name`, or `""` when unset.
    pub fn get(&self, name: &str) -> &str {
        self.vars.get(name).map(String::as_str).unwrap_or("")
    }

    /// Set or override `name`. Last write wins.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            bail!("Variable definition failed: empty name");
        }
        self.vars.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    /// Parses `NAME=VALUE` and stores it.
    pub fn assign(&mut self, token: &str) -> Result<()> {
        match token.split_once('=') {
            Some((name, value)) => self.set(name, value),
            None => bail!("Variable definition failed: {token}"),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Whether `token` is a variable assignment rather than a command name.
pub fn is_assignment(token: &str) -> bool {
    token.contains('=') && !token.starts_with('-')
}

/// State of one interpreter session, owned by the main loop.
///
/// Builtins get `&mut Environment`; the job table and the relay live here so
/// that `ps` and the relay builtins see the same state as the loop.
pub struct Environment {
    /// Shell variables.
    pub vars: VariableStore,
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
    /// When set to true, the interactive loop stops after the current line.
    pub should_exit: bool,
    /// Background jobs of this session.
    pub jobs: JobTable,
    /// Chat relay server, when one is running.
    pub relay: Relay,
    pub config: ShellConfig,
}

impl Environment {
    pub fn new(config: ShellConfig) -> Self {
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars: VariableStore::default(),
            current_dir,
            should_exit: false,
            jobs: JobTable::new(config.job_capacity, config.max_display_len),
            relay: Relay::default(),
            config,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_set_and_get() {
        let mut vars = VariableStore::default();
        assert_eq!(vars.get("SOME_RANDOM_VAR_12345"), "");

        vars.set("KEY", "VALUE").unwrap();
        assert_eq!(vars.get("KEY"), "VALUE");

        vars.set("KEY", "OTHER").unwrap();
        assert_eq!(vars.get("KEY"), "OTHER");
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn test_store_ignores_process_env() {
        let vars = VariableStore::default();
        assert_eq!(vars.get("PATH"), "");
    }

    #[test]
    fn test_assign_splits_on_first_equal() {
        let mut vars = VariableStore::default();
        vars.assign("X=a=b").unwrap();
        assert_eq!(vars.get("X"), "a=b");

        vars.assign("EMPTY=").unwrap();
        assert_eq!(vars.get("EMPTY"), "");

        assert!(vars.assign("=oops").is_err());
    }

    #[test]
    fn test_is_assignment() {
        assert!(is_assignment("X=1"));
        assert!(!is_assignment("--opt=1"));
        assert!(!is_assignment("echo"));
    }
}
