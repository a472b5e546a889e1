//! Interception shim between containerd and the real OCI runtime.
//!
//! On `create`, a container that mounts a PVC at `/sgs-os-volume` gets its
//! root filesystem replaced by an overlay whose writable layer lives on that
//! volume. Every other invocation passes through untouched.

#[cfg(not(target_os = "linux"))]
compile_error!("sgs-runtime-wrapper only supports Linux");

pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod overlay;
pub mod rewrite;
pub mod trampoline;
pub mod validate;
pub mod wrapper;

pub use config::{RootfsStrategy, WrapperConfig};
pub use error::{WrapperError, WrapperResult};
pub use invocation::{Invocation, ResolvedRuntime, RuntimeLocator, WrapperMode};
pub use wrapper::{Preparation, RewriteSummary, SkipReason, Wrapper};
