//! Turning command lines into processes.
//!
//! A plain builtin runs inside the shell. Everything else gets forked
//! children: one per pipeline stage, wired through [`Channel`]s, each either
//! running its builtin in-process and exiting with its status, or replacing
//! its image with an external program. Background lines fork one lead
//! process that runs the whole line and is tracked in the job table.

use crate::builtin::Registry;
use crate::command::{ExitCode, Stdin, run_builtin};
use crate::env::{Environment, is_assignment};
use crate::error::ShellError;
use crate::external::{UNKNOWN_COMMAND_STATUS, exec_external, exit_code};
use crate::jobs::JobId;
use crate::pipeline::{Channel, Pipeline, Stage, allocate_channels, has_pipe, split_segments};
use crate::reaper::{Reaper, reset_child_signals, take_interrupt};
use anyhow::{Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, close, dup2, fork};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use tracing::{debug, info, warn};

/// Spawns and waits for the processes of command lines.
///
/// Borrows the builtin registry and the completion reaper from the
/// interpreter; session state comes in as `&mut Environment` per call.
pub struct Supervisor<'a> {
    registry: &'a Registry,
    reaper: &'a Reaper,
}

impl<'a> Supervisor<'a> {
    pub fn new(registry: &'a Registry, reaper: &'a Reaper) -> Self {
        Self { registry, reaper }
    }

    /// Runs an expanded command line and waits for all of its processes.
    pub fn run_foreground(&self, tokens: Vec<String>, env: &mut Environment) -> Result<ExitCode> {
        if has_pipe(&tokens) {
            let pipeline = Pipeline::build(tokens, self.registry)?;
            return self.run_pipeline(&pipeline, env, false);
        }
        self.run_single(tokens, env)
    }

    fn run_single(&self, argv: Vec<String>, env: &mut Environment) -> Result<ExitCode> {
        let Some(name) = argv.first().cloned() else {
            return Ok(0);
        };
        if let Some(handler) = self.registry.lookup(&name) {
            let stdin = io::stdin();
            let mut stdin = stdin.lock();
            let mut stdout = io::stdout().lock();
            return run_builtin(handler, &argv, &mut stdin, &mut stdout, env);
        }
        if is_assignment(&name) {
            env.vars.assign(&name)?;
            return Ok(0);
        }

        let stage = Stage::External { argv };
        let pid = spawn_stage(&stage, None, None, &[], env, false)?;
        let code = wait_for(pid)?;
        if take_interrupt() {
            return Ok(code);
        }
        if code == UNKNOWN_COMMAND_STATUS {
            return Err(ShellError::UnknownCommand(name).into());
        }
        Ok(code)
    }

    /// Spawns every stage left to right, then collects every child once.
    ///
    /// Only the first failing stage is reported.
    fn run_pipeline(&self, pipeline: &Pipeline<'_>, env: &mut Environment, background: bool) -> Result<ExitCode> {
        let channels = allocate_channels(pipeline.len().saturating_sub(1))?;

        let mut children = Vec::with_capacity(pipeline.len());
        let mut spawn_error = None;
        for (i, stage) in pipeline.stages.iter().enumerate() {
            let input = i.checked_sub(1).map(|prev| &channels[prev].read);
            let output = channels.get(i).map(|c| &c.write);
            match spawn_stage(stage, input, output, &channels, env, background) {
                Ok(pid) => children.push((pid, stage.name())),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }
        // The shell keeps no channel ends; readers must see EOF.
        drop(channels);

        let mut first_failure = None;
        for (pid, name) in children {
            let code = wait_for(pid).unwrap_or_else(|e| {
                warn!(%pid, error = %e, "lost pipeline stage");
                1
            });
            if code != 0 && first_failure.is_none() {
                first_failure = Some((name, code));
            }
        }

        if let Some(e) = spawn_error {
            return Err(e.into());
        }
        if take_interrupt() {
            return Ok(first_failure.map_or(0, |(_, code)| code));
        }
        match first_failure {
            None => Ok(0),
            Some((name, UNKNOWN_COMMAND_STATUS)) => Err(ShellError::UnknownCommand(name.to_owned()).into()),
            Some((name, _)) => Err(anyhow!("Command failed: {name}")),
        }
    }

    /// Forks the lead process of a background line and tracks it.
    ///
    /// A full job table refuses the line before anything is spawned, as does
    /// a malformed pipeline.
    pub fn launch_background(&self, tokens: Vec<String>, env: &mut Environment) -> Result<JobId> {
        if env.jobs.is_full() {
            return Err(ShellError::Capacity.into());
        }
        if has_pipe(&tokens) {
            split_segments(tokens.clone())?;
        }

        flush_std_streams();
        // SAFETY: the child only runs this shell's own code before exiting or exec'ing.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                reset_child_signals(true);
                let code = self.run_job(tokens, env);
                exit_child(code)
            }
            Ok(ForkResult::Parent { child }) => self.track(child, &tokens, env),
            Err(source) => Err(ShellError::Resource { what: "fork", source }.into()),
        }
    }

    fn track(&self, pid: Pid, tokens: &[String], env: &mut Environment) -> Result<JobId> {
        let job = match env.jobs.register(pid, tokens) {
            Ok(job) => job,
            Err(e) => {
                abandon(pid, env);
                return Err(e.into());
            }
        };
        let id = job.id;
        println!("[{}] {}", id, pid);
        let _ = io::stdout().flush();
        info!(job = %id, %pid, command = %job.display_text, "background job registered");
        if let Err(e) = self.reaper.watch(pid) {
            // Nothing would ever reap it.
            abandon(pid, env);
            return Err(anyhow::Error::from(e).context(format!("cannot watch background job {id}")));
        }
        Ok(id)
    }

    /// Body of a background lead process. Returns its exit status.
    fn run_job(&self, tokens: Vec<String>, env: &mut Environment) -> ExitCode {
        let result = if has_pipe(&tokens) {
            Pipeline::build(tokens, self.registry)
                .map_err(anyhow::Error::from)
                .and_then(|pipeline| self.run_pipeline(&pipeline, env, true))
        } else {
            match self.registry.lookup(&tokens[0]) {
                Some(handler) => run_builtin(handler, &tokens, &mut child_stdin(), &mut io::stdout().lock(), env),
                None if is_assignment(&tokens[0]) => env.vars.assign(&tokens[0]).map(|_| 0),
                None => exec_external(&tokens),
            }
        };
        result.unwrap_or_else(|e| {
            eprintln!("ERROR: {e:#}");
            1
        })
    }
}

/// Stops a background process the shell cannot track and forgets it.
///
/// Never leaves a process running untracked or a dead entry in the table.
fn abandon(pid: Pid, env: &mut Environment) {
    warn!(%pid, "abandoning background process");
    let _ = kill(pid, Signal::SIGTERM);
    let _ = wait_for(pid);
    env.jobs.remove_by_pid(pid);
}

/// Forks the process of one stage.
///
/// In the child: stdin comes from `input`, stdout goes to `output`, every
/// channel descriptor is closed, then the stage runs.
fn spawn_stage(
    stage: &Stage<'_>,
    input: Option<&OwnedFd>,
    output: Option<&OwnedFd>,
    channels: &[Channel],
    env: &mut Environment,
    background: bool,
) -> Result<Pid, ShellError> {
    flush_std_streams();
    // SAFETY: the child only runs this shell's own code before exiting or exec'ing.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!(pid = %child, command = stage.name(), "spawned stage");
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            reset_child_signals(background);
            if let Err(e) = wire_stage(input, output, channels) {
                eprintln!("ERROR: {e}");
                exit_child(1);
            }
            exit_child(run_stage(stage, env))
        }
        Err(source) => Err(ShellError::Resource { what: "fork", source }),
    }
}

fn wire_stage(input: Option<&OwnedFd>, output: Option<&OwnedFd>, channels: &[Channel]) -> Result<(), ShellError> {
    let redirect = |fd: &OwnedFd, target| {
        dup2(fd.as_raw_fd(), target).map_err(|source| ShellError::Resource { what: "dup2", source })
    };
    if let Some(fd) = input {
        redirect(fd, nix::libc::STDIN_FILENO)?;
    }
    if let Some(fd) = output {
        redirect(fd, nix::libc::STDOUT_FILENO)?;
    }
    // The owning Vec lives in the parent's copy of memory; the child exits
    // without running destructors, so closing the raw numbers is enough.
    for channel in channels {
        let _ = close(channel.read.as_raw_fd());
        let _ = close(channel.write.as_raw_fd());
    }
    Ok(())
}

fn run_stage(stage: &Stage<'_>, env: &mut Environment) -> ExitCode {
    match stage {
        Stage::Builtin { handler, argv } => {
            let mut stdout = io::stdout().lock();
            match run_builtin(*handler, argv, &mut child_stdin(), &mut stdout, env) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("ERROR: {e:#}");
                    1
                }
            }
        }
        Stage::External { argv } => exec_external(argv),
    }
}

/// Unbuffered standard input of a forked child.
///
/// The inherited `io::stdin()` buffer may hold bytes the shell read ahead
/// from its own input; a stage must read its descriptor directly.
fn child_stdin() -> ChildStdin {
    ChildStdin(io::stdin().as_fd().try_clone_to_owned().map(File::from))
}

struct ChildStdin(io::Result<File>);

impl Read for ChildStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            Ok(file) => file.read(buf),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl Stdin for ChildStdin {
    fn is_terminal(&self) -> bool {
        self.0.as_ref().is_ok_and(Stdin::is_terminal)
    }
}

/// Blocks until `pid` terminates and returns its exit code.
fn wait_for(pid: Pid) -> Result<ExitCode, ShellError> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(ShellError::Resource { what: "waitpid", source }),
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    debug!(%pid, code, "child terminated");
                    return Ok(code);
                }
            }
        }
    }
}

fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn exit_child(code: ExitCode) -> ! {
    flush_std_streams();
    std::process::exit(code)
}
