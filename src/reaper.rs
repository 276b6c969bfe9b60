//! Completion and interrupt notifications.
//!
//! Background jobs are reaped off the main loop: a waiter thread per job
//! blocks in `waitpid` on that job's pid only and posts a [`Reaped`] event
//! onto a bounded queue. The main loop drains the queue between commands and
//! performs every job table mutation itself. Foreground children are never
//! waited for here.
//!
//! Interrupts (SIGINT) are caught by a handler that only writes a newline,
//! plus the prompt when the shell is idle at it, so the shell survives and
//! a fresh prompt is shown.

use crate::command::ExitCode;
use crate::error::ShellError;
use crate::external::exit_code;
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::waitpid;
use nix::unistd::{Pid, write};
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

/// A background job's lead process has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    /// `None` when the status could not be collected.
    pub status: Option<ExitCode>,
}

/// Producer side of the completion queue plus the queue itself.
pub struct Reaper {
    tx: SyncSender<Reaped>,
    rx: Receiver<Reaped>,
}

impl Reaper {
    /// Queue holding up to `bound` undelivered completions.
    pub fn new(bound: usize) -> Self {
        let (tx, rx) = sync_channel(bound.max(1));
        Self { tx, rx }
    }

    /// Starts waiting for `pid` on a dedicated thread.
    pub fn watch(&self, pid: Pid) -> io::Result<()> {
        let tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("reaper-{pid}"))
            .spawn(move || {
                let status = loop {
                    match waitpid(pid, None) {
                        Err(Errno::EINTR) => continue,
                        Ok(status) => match exit_code(status) {
                            Some(code) => break Some(code),
                            None => continue,
                        },
                        Err(_) => break None,
                    }
                };
                // The loop may be gone at shutdown; nothing left to notify.
                let _ = tx.send(Reaped { pid, status });
            })?;
        Ok(())
    }

    /// Every completion queued so far, without blocking.
    pub fn drain(&self) -> Vec<Reaped> {
        self.rx.try_iter().collect()
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static AWAITING_INPUT: AtomicBool = AtomicBool::new(false);
static PROMPT: OnceLock<Box<[u8]>> = OnceLock::new();

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: fd 1 stays open for the life of the process.
    let stdout = unsafe { BorrowedFd::borrow_raw(nix::libc::STDOUT_FILENO) };
    let _ = write(stdout, b"\n");
    // A read blocked at the prompt resumes after the handler (SA_RESTART),
    // so the fresh prompt has to come from here.
    if AWAITING_INPUT.load(Ordering::SeqCst) {
        if let Some(prompt) = PROMPT.get() {
            let _ = write(stdout, prompt);
        }
    }
}

/// Installs the interrupt handler of the interactive shell.
///
/// `prompt` is re-displayed when the interrupt arrives while an
/// [`AwaitingInput`] guard is alive. `SA_RESTART` keeps a foreground
/// `waitpid` going across the interrupt.
pub fn install_interrupt_handler(prompt: &str) -> Result<(), ShellError> {
    let _ = PROMPT.set(prompt.as_bytes().into());
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and calls write(2).
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map(drop)
        .map_err(|source| ShellError::Resource {
            what: "sigaction",
            source,
        })
}

/// Marks the shell as blocked reading a line after printing its prompt.
pub struct AwaitingInput(());

impl AwaitingInput {
    pub fn begin() -> Self {
        AWAITING_INPUT.store(true, Ordering::SeqCst);
        AwaitingInput(())
    }
}

impl Drop for AwaitingInput {
    fn drop(&mut self) {
        AWAITING_INPUT.store(false, Ordering::SeqCst);
    }
}

/// Whether an interrupt arrived since the last call.
pub fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Signal dispositions of a freshly forked child.
///
/// Foreground children take the default SIGINT action so an interrupt stops
/// them; background jobs ignore it. SIGPIPE goes back to its default so a
/// builtin stage writing to a closed pipe stops like a program would.
pub fn reset_child_signals(background: bool) {
    let interrupt = if background {
        SigHandler::SigIgn
    } else {
        SigHandler::SigDfl
    };
    for (signal, handler) in [(Signal::SIGINT, interrupt), (Signal::SIGPIPE, SigHandler::SigDfl)] {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        // SAFETY: no handler code is installed.
        let _ = unsafe { sigaction(signal, &action) };
    }
}
