//! Reissue protocol: run a trapped call again with its sentinel tags set.
//!
//! The filter lets a ruled syscall through only when its sentinel slot holds
//! the sentinel, so every syscall the handler makes for a ruled number must
//! be tagged here. Filters stack, and an earlier install may have ruled the
//! same number with a different slot, so the table accumulates across
//! installs and tagging writes every known slot for the number.

use tracing::warn;

use crate::arch::{self, MAX_ARGS};
use crate::seccomp::FilterRule;
use crate::trap;

/// Function that issues a raw syscall and returns the kernel result.
pub type SyscallFn = unsafe fn(u64, [u64; MAX_ARGS]) -> i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    pub nr: u32,
    pub slot: u8,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentinelTable {
    entries: Vec<Sentinel>,
}

impl SentinelTable {
    pub fn from_rules(rules: &[FilterRule]) -> Self {
        let mut table = Self::default();
        for rule in rules {
            table.insert(Sentinel {
                nr: rule.nr,
                slot: rule.slot,
                value: rule.sentinel,
            });
        }
        table
    }

    fn insert(&mut self, sentinel: Sentinel) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.nr == sentinel.nr && e.slot == sentinel.slot)
        {
            if existing.value != sentinel.value {
                warn!(
                    nr = sentinel.nr,
                    slot = sentinel.slot,
                    "conflicting sentinels for one slot; stacked filter will trap reissues"
                );
            }
            existing.value = sentinel.value;
        } else {
            self.entries.push(sentinel);
        }
    }

    /// Union of `self` (older filters) and `newer`; `newer` wins per slot.
    pub fn merged(&self, newer: &SentinelTable) -> Self {
        let mut table = self.clone();
        for sentinel in &newer.entries {
            table.insert(*sentinel);
        }
        table
    }

    pub fn covers(&self, nr: u64) -> bool {
        self.entries.iter().any(|e| u64::from(e.nr) == nr)
    }

    pub fn entries(&self) -> &[Sentinel] {
        &self.entries
    }

    /// Write every sentinel registered for `nr` into `args`.
    pub fn tag(&self, nr: u64, mut args: [u64; MAX_ARGS]) -> [u64; MAX_ARGS] {
        for e in self.entries.iter().filter(|e| u64::from(e.nr) == nr) {
            args[usize::from(e.slot)] = e.value;
        }
        args
    }

    /// Issue `nr` with its tags through `issue`.
    ///
    /// # Safety
    /// As for the syscall itself: pointer arguments must be valid for it.
    pub unsafe fn issue(&self, issue: SyscallFn, nr: u64, args: [u64; MAX_ARGS]) -> i64 {
        unsafe { issue(nr, self.tag(nr, args)) }
    }
}

/// Make a syscall from inside the handler or a policy, tagged against the
/// active registration so it cannot trap again.
///
/// # Safety
/// As for the syscall itself.
pub unsafe fn syscall(nr: u32, args: [u64; MAX_ARGS]) -> i64 {
    let nr = u64::from(nr);
    match trap::active() {
        Some(reg) => unsafe { reg.sentinels().issue(arch::raw_syscall, nr, args) },
        None => unsafe { arch::raw_syscall(nr, args) },
    }
}
