use crate::command::ExitCode;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::execvp;
use std::ffi::CString;

/// Exit status of a child whose program could not be executed.
pub const UNKNOWN_COMMAND_STATUS: ExitCode = 127;

/// Replaces the calling process image with the program named by `argv[0]`,
/// searched in `PATH`, with `argv` as its argument vector.
///
/// Must only be called in a forked child. Never returns: when the program
/// cannot be executed the child exits with [`UNKNOWN_COMMAND_STATUS`] and the
/// parent reports the unknown command.
pub fn exec_external(argv: &[String]) -> ! {
    // The Rust runtime ignores SIGPIPE and ignored dispositions survive exec.
    // SAFETY: restoring the default disposition installs no handler code.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    let args: Result<Vec<CString>, _> = argv.iter().map(|a| CString::new(a.as_bytes())).collect();
    if let Ok(args) = args {
        if let Some(program) = args.first() {
            let _ = execvp(program, &args);
        }
    }
    std::process::exit(UNKNOWN_COMMAND_STATUS)
}

/// Shell-style exit code of a terminated child, `None` if it has not terminated.
pub fn exit_code(status: WaitStatus) -> Option<ExitCode> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, core_dumped) => Some(terminated_by_signal(signal, core_dumped)),
        _ => None,
    }
}

fn terminated_by_signal(signal: Signal, core_dumped: bool) -> ExitCode {
    if core_dumped {
        255
    } else {
        128 + signal as i32
    }
}
