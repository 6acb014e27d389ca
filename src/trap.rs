//! The process-wide SIGSYS handler and what it dispatches to.
//!
//! Exactly one handler is installed per process. It reads the active
//! [`Registration`] through an atomic pointer; installing a new engine
//! publishes a new registration and the previous one is simply no longer
//! consulted. Registrations are leaked: a handler running on another thread
//! may still hold a reference when the pointer moves on.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::arch;
use crate::context::MachineContext;
use crate::policy::{PermitAll, Policy, PolicyDecision};
use crate::reissue::{SentinelTable, SyscallFn};
use crate::seccomp::Disposition;

/// `si_code` the kernel sets for seccomp-delivered SIGSYS.
const SYS_SECCOMP: libc::c_int = 1;

/// Counters snapshot for one registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapStats {
    /// Handler invocations that acted on a call.
    pub traps: u64,
    /// Calls run again in the handler.
    pub reissued: u64,
    /// Calls answered with `-errno` without running.
    pub denied: u64,
    /// Traps for numbers no known rule covers.
    pub unrecognized: u64,
}

#[derive(Debug, Default)]
struct TrapCounters {
    traps: AtomicU64,
    reissued: AtomicU64,
    denied: AtomicU64,
    unrecognized: AtomicU64,
}

impl TrapCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TrapStats {
        TrapStats {
            traps: self.traps.load(Ordering::Relaxed),
            reissued: self.reissued.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
        }
    }
}

/// Everything the handler needs for one installed engine.
pub struct Registration {
    sentinels: SentinelTable,
    default: Disposition,
    policy: Box<dyn Policy>,
    stats: TrapCounters,
}

impl Registration {
    pub(crate) fn new(
        sentinels: SentinelTable,
        default: Disposition,
        policy: Box<dyn Policy>,
    ) -> Self {
        Self {
            sentinels,
            default,
            policy,
            stats: TrapCounters::default(),
        }
    }

    /// Same tags and default, every call permitted unchanged.
    pub(crate) fn passthrough(&self) -> Self {
        Self::new(self.sentinels.clone(), self.default, Box::new(PermitAll))
    }

    pub fn sentinels(&self) -> &SentinelTable {
        &self.sentinels
    }

    pub fn stats(&self) -> TrapStats {
        self.stats.snapshot()
    }
}

static ACTIVE: AtomicPtr<Registration> = AtomicPtr::new(ptr::null_mut());

/// The registration the handler currently dispatches to.
pub(crate) fn active() -> Option<&'static Registration> {
    unsafe { ACTIVE.load(Ordering::Acquire).as_ref() }
}

/// Make `reg` the active registration. Returns it and the one it replaced.
pub(crate) fn publish(reg: Registration) -> (&'static Registration, Option<&'static Registration>) {
    let leaked = Box::into_raw(Box::new(reg));
    let prior = ACTIVE.swap(leaked, Ordering::AcqRel);
    (unsafe { &*leaked }, unsafe { prior.as_ref() })
}

/// Put back `prior` after a failed install, if `current` is still active.
pub(crate) fn republish(current: &'static Registration, prior: Option<&'static Registration>) {
    let prior = prior.map_or(ptr::null_mut(), |p| p as *const Registration as *mut Registration);
    let _ = ACTIVE.compare_exchange(
        current as *const Registration as *mut Registration,
        prior,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

/// Publish `next` only if `current` is still the active registration.
pub(crate) fn replace_if_active(current: &'static Registration, next: Registration) -> bool {
    let next = Box::into_raw(Box::new(next));
    let swapped = ACTIVE
        .compare_exchange(
            current as *const Registration as *mut Registration,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    if !swapped {
        // Never published, so nothing else can see it.
        drop(unsafe { Box::from_raw(next) });
    }
    swapped
}

/// Handle one trapped call: decide, run or refuse, write the result back.
pub(crate) fn dispatch(reg: &Registration, ctx: &mut MachineContext<'_>, issue: SyscallFn) {
    TrapCounters::bump(&reg.stats.traps);
    let call = ctx.intercept();

    let result = if reg.sentinels.covers(call.nr) {
        match reg.policy.decide(&call) {
            PolicyDecision::Permit(args) => {
                TrapCounters::bump(&reg.stats.reissued);
                unsafe { reg.sentinels.issue(issue, call.nr, args) }
            }
            PolicyDecision::Deny(errno) => {
                TrapCounters::bump(&reg.stats.denied);
                -(errno as i64)
            }
        }
    } else {
        TrapCounters::bump(&reg.stats.unrecognized);
        match reg.default {
            Disposition::Allow => {
                TrapCounters::bump(&reg.stats.reissued);
                unsafe { reg.sentinels.issue(issue, call.nr, call.args) }
            }
            Disposition::Deny(errno) => {
                TrapCounters::bump(&reg.stats.denied);
                -(errno as i64)
            }
        }
    };

    ctx.inject(result);
}

extern "C" fn handle_sigsys(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    data: *mut libc::c_void,
) {
    let errno_slot = unsafe { libc::__errno_location() };
    let saved_errno = unsafe { *errno_slot };

    // kill(2)/tgkill(2) deliveries carry a different si_code
    let from_seccomp = unsafe { info.as_ref() }.is_some_and(|i| i.si_code == SYS_SECCOMP);
    if from_seccomp {
        if let Some(mut ctx) = unsafe { MachineContext::from_signal(data) } {
            match active() {
                Some(reg) => dispatch(reg, &mut ctx, arch::raw_syscall),
                None => ctx.inject(-(libc::ENOSYS as i64)),
            }
        }
    }

    unsafe { *errno_slot = saved_errno };
}

/// Install the SIGSYS handler (full mask while it runs) and unblock SIGSYS
/// in the calling thread. Returns the action it replaced.
pub(crate) fn register_handler() -> nix::Result<SigAction> {
    let action = SigAction::new(
        SigHandler::SigAction(handle_sigsys),
        SaFlags::SA_SIGINFO,
        SigSet::all(),
    );
    let prior = unsafe { signal::sigaction(Signal::SIGSYS, &action) }?;

    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGSYS);
    unblock.thread_unblock()?;
    Ok(prior)
}

pub(crate) fn restore_handler(prior: &SigAction) -> nix::Result<()> {
    unsafe { signal::sigaction(Signal::SIGSYS, prior) }.map(drop)
}
