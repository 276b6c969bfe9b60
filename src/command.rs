use crate::env::Environment;
use anyhow::Result;
use std::fs::File;
use std::io::{Cursor, IsTerminal, Read, StdinLock, Write};

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Readable input handed to a builtin.
///
/// Builtins that fall back to reading standard input (`cat`, `wc`) need to
/// know whether they would be reading from the user's terminal.
pub trait Stdin: Read {
    fn is_terminal(&self) -> bool;
}

impl Stdin for StdinLock<'_> {
    fn is_terminal(&self) -> bool {
        IsTerminal::is_terminal(self)
    }
}

impl Stdin for File {
    fn is_terminal(&self) -> bool {
        IsTerminal::is_terminal(self)
    }
}

impl<T: AsRef<[u8]>> Stdin for Cursor<T> {
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Object-safe trait for a builtin invocation whose arguments are parsed.
pub trait ExecutableCommand {
    /// Runs the command. An `Err` is a builtin failure; the caller prints it.
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

/// Handler stored in the builtin registry under one exact name.
pub trait CommandFactory {
    /// The name this handler answers to.
    fn name(&self) -> &'static str;

    /// Parses a full argument vector (command name included).
    ///
    /// Parse failures are not reported here; they come back as a command
    /// whose execution fails with the parser's message.
    fn create(&self, argv: &[String]) -> Box<dyn ExecutableCommand>;
}

/// Parses and runs `argv` with `factory`.
pub fn run_builtin(
    factory: &dyn CommandFactory,
    argv: &[String],
    stdin: &mut dyn Stdin,
    stdout: &mut dyn Write,
    env: &mut Environment,
) -> Result<ExitCode> {
    let code = factory.create(argv).execute(stdin, stdout, env);
    stdout.flush()?;
    code
}
