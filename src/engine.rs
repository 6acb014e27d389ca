//! Engine lifecycle: build a ruleset and policy, install once, tear down.
//!
//! Install order matters. The registration is published and the handler is
//! in place before the filter is attached, so the first trapped call
//! already finds something to dispatch to. A failure before the attach puts
//! the previous handler and registration back.

use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::policy::{PermitAll, Policy};
use crate::reissue::SentinelTable;
use crate::seccomp::{self, CompiledFilter, Disposition, FilterRule, Ruleset};
use crate::trap::{self, Registration, TrapStats};

pub struct EngineBuilder {
    ruleset: Ruleset,
    policy: Box<dyn Policy>,
}

impl EngineBuilder {
    /// Intercept a syscall. Rules are matched in the order added.
    pub fn rule(mut self, rule: FilterRule) -> Self {
        self.ruleset.rules.push(rule);
        self
    }

    /// Let a syscall through without trapping, whatever the default.
    pub fn allow(mut self, nr: u32) -> Self {
        self.ruleset.allow.push(nr);
        self
    }

    pub fn default(mut self, disposition: Disposition) -> Self {
        self.ruleset.default = disposition;
        self
    }

    pub fn policy(self, policy: impl Policy + 'static) -> Self {
        self.boxed_policy(Box::new(policy))
    }

    pub fn boxed_policy(mut self, policy: Box<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace rules, allow list, default and policy with the config's.
    pub fn from_config(self, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            ruleset: config.ruleset()?,
            policy: config.policy()?,
        })
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Compile without installing.
    pub fn compile(&self) -> Result<CompiledFilter> {
        seccomp::compile(&self.ruleset)
    }

    pub fn install(self) -> Result<Engine> {
        let filter = self.compile()?;

        let fresh = SentinelTable::from_rules(&self.ruleset.rules);
        let sentinels = match trap::active() {
            Some(prior) => prior.sentinels().merged(&fresh),
            None => fresh,
        };
        let (registration, prior) = trap::publish(Registration::new(
            sentinels,
            self.ruleset.default,
            self.policy,
        ));

        let old_action = match trap::register_handler() {
            Ok(action) => action,
            Err(e) => {
                trap::republish(registration, prior);
                return Err(e.into());
            }
        };

        if let Err(e) = seccomp::install(&filter) {
            if let Err(restore) = trap::restore_handler(&old_action) {
                error!(error = %restore, "failed to restore previous SIGSYS action");
            }
            trap::republish(registration, prior);
            return Err(e);
        }

        info!(
            rules = self.ruleset.rules.len(),
            allow = self.ruleset.allow.len(),
            default = ?self.ruleset.default,
            insns = filter.len(),
            stacked = prior.is_some(),
            "syscall interception installed"
        );

        Ok(Engine {
            registration,
            filter_len: filter.len(),
        })
    }

    /// [`install`](Self::install), aborting the process on failure.
    pub fn install_or_abort(self) -> Engine {
        match self.install() {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "failed to install syscall interception");
                std::process::abort();
            }
        }
    }
}

/// An installed filter and the registration its traps dispatch to.
///
/// The filter stays attached for the life of the thread (and everything it
/// spawns). Dropping the engine swaps in a passthrough registration, so
/// trapped calls keep completing unchanged.
pub struct Engine {
    registration: &'static Registration,
    filter_len: usize,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            ruleset: Ruleset::default(),
            policy: Box::new(PermitAll),
        }
    }

    pub fn stats(&self) -> TrapStats {
        self.registration.stats()
    }

    /// Instructions in the attached filter.
    pub fn filter_len(&self) -> usize {
        self.filter_len
    }

    /// Stop applying the policy. Returns the final counters.
    pub fn shutdown(self) -> TrapStats {
        self.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let stats = self.stats();
        if trap::replace_if_active(self.registration, self.registration.passthrough()) {
            info!(
                traps = stats.traps,
                reissued = stats.reissued,
                denied = stats.denied,
                "syscall interception now passthrough"
            );
        } else {
            debug!("engine superseded by a later install");
        }
    }
}
