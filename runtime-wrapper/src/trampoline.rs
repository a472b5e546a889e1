//! Handoff to the real runtime.
//!
//! Nothing runs after [`hand_off`]: either the process image is replaced, or
//! the runtime runs as a child and its exit code becomes ours.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use crate::constants::EXIT_RUNTIME_UNKNOWN;
use crate::invocation::ResolvedRuntime;

/// The runtime command: its own basename as argv[0], our arguments verbatim,
/// our environment inherited.
pub fn command(runtime: &ResolvedRuntime, args: &[OsString]) -> Command {
    let mut cmd = Command::new(&runtime.path);
    cmd.arg0(runtime.argv0()).args(args);
    cmd
}

/// Replace this process with the runtime. Never returns.
pub fn hand_off(runtime: &ResolvedRuntime, args: Vec<OsString>) -> ! {
    tracing::info!(
        runtime = %runtime.path.display(),
        args = ?args,
        "Executing real runtime"
    );

    let err = command(runtime, &args).exec();
    tracing::warn!(error = %err, "Failed to exec runtime, running it as a child instead");

    std::process::exit(run_child(runtime, &args))
}

/// Run the runtime as a child with inherited stdio and return its exit code.
pub fn run_child(runtime: &ResolvedRuntime, args: &[OsString]) -> i32 {
    let status = command(runtime, args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(status) => match status.code() {
            Some(code) => code,
            None => {
                tracing::error!(%status, "Runtime terminated without an exit code");
                EXIT_RUNTIME_UNKNOWN
            }
        },
        Err(e) => {
            tracing::error!(error = %e, runtime = %runtime.path.display(), "Failed to run runtime");
            eprintln!(
                "sgs-runtime-wrapper: failed to run {}: {}",
                runtime.path.display(),
                e
            );
            EXIT_RUNTIME_UNKNOWN
        }
    }
}
