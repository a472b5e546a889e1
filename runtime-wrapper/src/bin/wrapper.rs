//! `sgs-runtime-wrapper` binary.
//!
//! Installed in place of runc (RuntimeClass `BinaryName`) or under the name
//! `nvidia-container-runtime`. The argument vector belongs to the real runtime
//! and is forwarded verbatim.

use std::process::ExitCode;

use sgs_runtime_wrapper::constants::EXIT_SETUP_FAILED;
use sgs_runtime_wrapper::{
    Invocation, Preparation, RuntimeLocator, Wrapper, WrapperConfig, WrapperMode, logging,
    trampoline,
};

fn main() -> ExitCode {
    let config = WrapperConfig::from_env();
    let target = logging::init(&config);
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }

    let invocation = Invocation::parse(std::env::args_os());
    let mode = WrapperMode::detect(invocation.argv0(), config.mode_override.as_deref());

    let span = tracing::info_span!(
        "invocation",
        %mode,
        create = invocation.is_create(),
        bundle = ?invocation.bundle(),
    );
    let entered = span.enter();

    tracing::debug!(?target, "Logging initialized");
    tracing::info!(args = ?invocation.args(), "Wrapper invoked");

    match Wrapper::new(&config).prepare(&invocation) {
        Ok(Preparation::Skipped(reason)) => {
            tracing::debug!(?reason, "Passing through unmodified");
        }
        Ok(Preparation::Rewritten(summary)) => {
            tracing::info!(
                root = %summary.new_root.display(),
                strategy = %summary.strategy,
                "Bundle prepared"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to prepare bundle; not starting the runtime");
            eprintln!("sgs-runtime-wrapper: {}", e);
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    }

    let runtime = RuntimeLocator::from_config(&config).resolve(mode);
    tracing::info!(
        runtime = %runtime.path.display(),
        source = ?runtime.source,
        "Resolved real runtime"
    );

    drop(entered);
    trampoline::hand_off(&runtime, invocation.into_args())
}
