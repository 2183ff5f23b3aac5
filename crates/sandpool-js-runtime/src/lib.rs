//! sandpool JavaScript runtime
//!
//! Script hosting for tenant workers. The orchestration layer only sees the
//! [`ScriptHost`] trait; [`DenoHost`] is the production implementation.
//!
//! # Architecture
//!
//! - Every execution runs in a fresh V8 isolate on a dedicated OS thread
//! - The isolate publishes an interrupter through [`InterruptTarget`] before
//!   tenant code starts, so a governor on another thread can terminate it
//! - Results come back as the stringified return value of the entry function

mod error;
mod host;
mod interrupt;
mod spawn;
mod worker;

pub use error::ScriptError;
pub use host::{ExecutionSignal, ScriptHost, ScriptRequest};
pub use interrupt::{InterruptTarget, ScriptInterrupt};
pub use spawn::DenoHost;

use std::sync::Once;

use deno_core::JsRuntime;

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Initialize the V8 platform. Call this before spawning any runtimes.
/// Safe to call multiple times - will only initialize once.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        JsRuntime::init_platform(None, false);
    });
}
