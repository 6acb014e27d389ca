//! trapdoor - in-process syscall interception.
//!
//! A seccomp filter traps chosen syscalls with SIGSYS. The handler reads the
//! call out of the interrupted context, asks a [`Policy`] what to do, runs
//! the call again with a sentinel tag the filter lets through (or refuses
//! it), and writes the result back so the caller sees an ordinary return.
//!
//! ```no_run
//! use trapdoor::{Engine, FilterRule, Observe};
//!
//! let engine = Engine::builder()
//!     .rule(FilterRule::openat())
//!     .policy(Observe::stderr())
//!     .install()?;
//! let _ = std::fs::read("/etc/hosts");
//! println!("{:?}", engine.stats());
//! # Ok::<(), trapdoor::Error>(())
//! ```
//!
//! Linux on x86_64 and aarch64 only.

pub mod arch;
pub mod arg;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod policy;
pub mod rawlog;
pub mod reissue;
pub mod seccomp;
pub mod trap;

pub use config::EngineConfig;
pub use context::{InterceptedCall, MachineContext};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use policy::{DenyPaths, Observe, PermitAll, Policy, PolicyChain, PolicyDecision, Redirect};
pub use seccomp::{
    CompiledFilter, Disposition, FilterRule, MismatchAction, Ruleset, DEFAULT_SENTINEL,
};
pub use trap::TrapStats;
