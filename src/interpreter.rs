use crate::builtin::Registry;
use crate::config::ShellConfig;
use crate::env::Environment;
use crate::error::PipelineError;
use crate::expand::expand_tokens;
use crate::lexer;
use crate::reaper::{AwaitingInput, Reaped, Reaper, install_interrupt_handler, take_interrupt};
use crate::supervisor::Supervisor;
use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, IsTerminal, Write};
use tracing::{debug, info, warn};

const EXIT: &str = "exit";

/// A line-oriented shell with pipelines and background jobs.
///
/// The interpreter owns the session [`Environment`], the builtin
/// [`Registry`] and the [`Reaper`] that reports finished background jobs.
/// Lines go through [`Interpreter::execute_line`]; [`Interpreter::repl`]
/// wraps that in the interactive loop.
///
/// Example
/// ```
/// use mysh::{Interpreter, ShellConfig};
/// let mut sh = Interpreter::new(ShellConfig::default());
/// sh.execute_line("GREETING=hello").unwrap();
/// assert_eq!(sh.env().vars.get("GREETING"), "hello");
/// ```
pub struct Interpreter {
    env: Environment,
    registry: Registry,
    reaper: Reaper,
}

impl Interpreter {
    pub fn new(config: ShellConfig) -> Self {
        let reaper = Reaper::new(config.job_capacity);
        Self {
            env: Environment::new(config),
            registry: Registry::default(),
            reaper,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Whether `exit` was run.
    pub fn should_exit(&self) -> bool {
        self.env.should_exit
    }

    /// Tokenizes, expands and dispatches one input line.
    ///
    /// Blank lines do nothing. Errors are returned for the caller to report;
    /// the interpreter stays usable afterwards.
    pub fn execute_line(&mut self, line: &str) -> Result<()> {
        let mut tokens = lexer::split_into_tokens(line);
        if tokens.is_empty() {
            return Ok(());
        }
        expand_tokens(&mut tokens, &self.env.vars, self.env.config.max_token_len);
        // `exit` ends the session whatever follows it, `&` and pipes included.
        if tokens[0] == EXIT {
            self.env.should_exit = true;
            return Ok(());
        }
        let background = lexer::strip_background(&mut tokens);
        if tokens.is_empty() {
            return Err(PipelineError::Empty.into());
        }
        debug!(?tokens, background, "dispatching line");

        // An interrupt delivered at the prompt must not mask this line's errors.
        take_interrupt();
        let supervisor = Supervisor::new(&self.registry, &self.reaper);
        if background {
            supervisor.launch_background(tokens, &mut self.env)?;
        } else {
            supervisor.run_foreground(tokens, &mut self.env)?;
        }
        Ok(())
    }

    /// Removes finished background jobs and announces each one.
    pub fn notify_completed(&mut self) {
        for Reaped { pid, status } in self.reaper.drain() {
            match self.env.jobs.remove_by_pid(pid) {
                Some(job) => {
                    info!(job = %job.id, %pid, ?status, "background job finished");
                    println!("[{}]+  Done {}", job.id, job.display_text);
                }
                None => debug!(%pid, "completion for an untracked process"),
            }
        }
        let _ = io::stdout().flush();
    }

    /// Runs the interactive loop until `exit` or end of input.
    pub fn repl(&mut self) -> Result<()> {
        install_interrupt_handler(&self.env.config.prompt)?;
        let mut source = LineSource::open()?;

        loop {
            self.notify_completed();
            let Some(line) = source.read_line(&self.env.config.prompt)? else {
                break;
            };
            // Jobs that ended while the loop waited for input are gone before
            // the line runs.
            self.notify_completed();
            if let Err(e) = self.execute_line(&line) {
                eprintln!("ERROR: {e:#}");
            }
            self.notify_completed();
            if self.should_exit() {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.env.relay.is_running() {
            match self.env.relay.stop() {
                Ok(()) => println!("Server stopped"),
                Err(e) => warn!(error = %e, "relay did not stop cleanly"),
            }
        }
        if !self.env.jobs.is_empty() {
            debug!(jobs = self.env.jobs.len(), "leaving background jobs running");
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}

/// Where input lines come from.
enum LineSource {
    /// A terminal, with line editing and history.
    Editor(DefaultEditor),
    /// A pipe or file; the prompt is still printed.
    Piped(io::Stdin),
}

impl LineSource {
    fn open() -> Result<Self> {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            Ok(Self::Editor(DefaultEditor::new()?))
        } else {
            Ok(Self::Piped(stdin))
        }
    }

    /// Next line, or `None` at end of input.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        match self {
            Self::Editor(rl) => loop {
                match rl.readline(prompt) {
                    Ok(line) => {
                        if !line.trim().is_empty() {
                            rl.add_history_entry(line.as_str())?;
                        }
                        return Ok(Some(line));
                    }
                    // Ctrl-C at the prompt: drop the line, prompt again.
                    Err(ReadlineError::Interrupted) => continue,
                    Err(ReadlineError::Eof) => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            },
            Self::Piped(stdin) => {
                print!("{prompt}");
                io::stdout().flush()?;
                let _idle = AwaitingInput::begin();
                let mut line = String::new();
                loop {
                    match stdin.read_line(&mut line) {
                        Ok(0) => return Ok(None),
                        Ok(_) => return Ok(Some(line)),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}
