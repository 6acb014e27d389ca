//! seccomp-bpf filter compiler and installer.
//!
//! Turns an ordered [`Ruleset`] into a classic BPF program and attaches it
//! to the calling thread. Raw BPF instructions + prctl(PR_SET_SECCOMP). No
//! libseccomp.
//!
//! A rule traps its syscall unless the sentinel slot carries the sentinel
//! value; the trap handler reissues with the sentinel set, so the reissue
//! passes straight through.

use std::io;

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::arch::{self, nr, MAX_ARGS};
use crate::error::{Error, Result};

// BPF instruction encoding
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

// seccomp return actions
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

const SECCOMP_MODE_FILTER: libc::c_int = 2;

/// Kernel limit on filter length (BPF_MAXINSNS).
pub const BPF_MAXINSNS: usize = 4096;

// seccomp_data offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

// Instructions per construct, used to size the program up front.
const HEADER_LEN: usize = 4;
const RULE_LEN: usize = 7;
const ALLOW_LEN: usize = 2;
const FOOTER_LEN: usize = 1;

/// `ASCII "trapdoor"` read as a little-endian word. Pointers, flags, fds and
/// modes never take this value.
pub const DEFAULT_SENTINEL: u64 = u64::from_le_bytes(*b"trapdoor");

/// Spare slot for the openat preset: openat(2) takes four arguments.
pub const OPENAT_SENTINEL_SLOT: u8 = 4;

/// Syscalls the trap handler makes itself (return, path reads, log lines).
/// Always allowed under a fail-closed default.
pub const HANDLER_SYSCALLS: [u32; 5] = [
    nr::RT_SIGRETURN,
    nr::GETPID,
    nr::PROCESS_VM_READV,
    nr::READLINKAT,
    nr::WRITEV,
];

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const fn bpf_stmt(code: u16, k: u32) -> SockFilter {
    SockFilter { code, jt: 0, jf: 0, k }
}

const fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// What the kernel does with a ruled syscall whose sentinel is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    /// Deliver SIGSYS to the calling thread.
    Trap,
    /// Fail the call with this errno without running it.
    Errno(Errno),
    /// Kill the whole process.
    KillProcess,
}

impl MismatchAction {
    fn ret(self) -> u32 {
        match self {
            MismatchAction::Trap => SECCOMP_RET_TRAP,
            MismatchAction::Errno(e) => SECCOMP_RET_ERRNO | (e as u32 & SECCOMP_RET_DATA),
            MismatchAction::KillProcess => SECCOMP_RET_KILL_PROCESS,
        }
    }
}

/// Fate of syscalls that match no rule and no allow entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fail-open.
    Allow,
    /// Fail-closed: the call returns `-errno`.
    Deny(Errno),
}

impl Disposition {
    fn ret(self) -> u32 {
        match self {
            Disposition::Allow => SECCOMP_RET_ALLOW,
            Disposition::Deny(e) => SECCOMP_RET_ERRNO | (e as u32 & SECCOMP_RET_DATA),
        }
    }
}

/// One intercepted syscall and the tag that lets its reissue through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRule {
    pub nr: u32,
    pub slot: u8,
    pub sentinel: u64,
    pub on_mismatch: MismatchAction,
}

impl FilterRule {
    /// Trap `nr` unless argument `slot` equals [`DEFAULT_SENTINEL`].
    pub fn new(nr: u32, slot: u8) -> Self {
        Self {
            nr,
            slot,
            sentinel: DEFAULT_SENTINEL,
            on_mismatch: MismatchAction::Trap,
        }
    }

    /// The rule for openat(2), the call behind every file open on Linux.
    pub fn openat() -> Self {
        Self::new(nr::OPENAT, OPENAT_SENTINEL_SLOT)
    }

    pub fn sentinel(mut self, sentinel: u64) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn on_mismatch(mut self, action: MismatchAction) -> Self {
        self.on_mismatch = action;
        self
    }

    fn validate(&self) -> Result<()> {
        let reason = if usize::from(self.slot) >= MAX_ARGS {
            "sentinel slot must be 0..=5"
        } else if self.sentinel == 0 {
            "sentinel must not be zero"
        } else if self.nr == nr::RT_SIGRETURN {
            "rt_sigreturn cannot be intercepted"
        } else {
            return Ok(());
        };
        Err(Error::InvalidRule { nr: self.nr, reason })
    }
}

/// Ordered rules, plain allow entries and the default disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    pub rules: Vec<FilterRule>,
    pub allow: Vec<u32>,
    pub default: Disposition,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            allow: Vec::new(),
            default: Disposition::Allow,
        }
    }
}

/// Immutable BPF program ready to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    insns: Box<[SockFilter]>,
}

impl CompiledFilter {
    pub fn instructions(&self) -> &[SockFilter] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// Offsets of the low and high 32-bit halves of `args[slot]`.
fn arg_offsets(slot: u8) -> (u32, u32) {
    let base = OFFSET_ARGS + 8 * u32::from(slot);
    if cfg!(target_endian = "little") {
        (base, base + 4)
    } else {
        (base + 4, base)
    }
}

/// Compile a ruleset. Layout per rule (7 instructions, accumulator holds nr
/// on entry and on the not-this-syscall path):
///
/// ```text
/// jeq nr        ? next : skip rule
/// ld  arg_lo
/// jeq sent_lo   ? next : mismatch
/// ld  arg_hi
/// jeq sent_hi   ? next : mismatch
/// ret ALLOW
/// ret <mismatch action>
/// ```
pub fn compile(ruleset: &Ruleset) -> Result<CompiledFilter> {
    for rule in &ruleset.rules {
        rule.validate()?;
    }

    let mut allow = ruleset.allow.clone();
    if matches!(ruleset.default, Disposition::Deny(_)) {
        for nr in HANDLER_SYSCALLS {
            if !allow.contains(&nr) {
                allow.push(nr);
            }
        }
    }

    for (i, rule) in ruleset.rules.iter().enumerate() {
        if ruleset.rules[..i].iter().any(|r| r.nr == rule.nr) {
            warn!(nr = rule.nr, "duplicate rule is shadowed by an earlier one");
        }
        if ruleset.allow.contains(&rule.nr) {
            warn!(nr = rule.nr, "allow entry is shadowed by a rule");
        }
    }

    let len = HEADER_LEN + RULE_LEN * ruleset.rules.len() + ALLOW_LEN * allow.len() + FOOTER_LEN;
    if len > BPF_MAXINSNS {
        return Err(Error::FilterTooLarge {
            len,
            max: BPF_MAXINSNS,
        });
    }

    let default = ruleset.default.ret();
    let mut insns = Vec::with_capacity(len);

    // Load architecture; foreign-ABI calls get the default disposition
    insns.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    insns.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, arch::AUDIT_ARCH, 1, 0));
    insns.push(bpf_stmt(BPF_RET | BPF_K, default));
    // Load syscall number
    insns.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));

    for rule in &ruleset.rules {
        let (lo_off, hi_off) = arg_offsets(rule.slot);
        let lo = rule.sentinel as u32;
        let hi = (rule.sentinel >> 32) as u32;

        insns.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, rule.nr, 0, 6));
        insns.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, lo_off));
        insns.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, lo, 0, 3));
        insns.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, hi_off));
        insns.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, hi, 0, 1));
        insns.push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        insns.push(bpf_stmt(BPF_RET | BPF_K, rule.on_mismatch.ret()));
    }

    for nr in &allow {
        insns.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, *nr, 0, 1));
        insns.push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    insns.push(bpf_stmt(BPF_RET | BPF_K, default));
    debug_assert_eq!(insns.len(), len);

    debug!(
        rules = ruleset.rules.len(),
        allow = allow.len(),
        insns = insns.len(),
        "compiled seccomp filter"
    );

    Ok(CompiledFilter {
        insns: insns.into_boxed_slice(),
    })
}

/// Set no_new_privs on the calling thread. Required before an unprivileged
/// thread may attach a filter; it is never cleared again.
pub fn set_no_new_privs() -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(Error::NoNewPrivs(io::Error::last_os_error()));
    }
    Ok(())
}

/// Attach a compiled filter to the calling thread. Threads and children
/// created afterwards inherit it; existing threads do not.
pub fn install(filter: &CompiledFilter) -> Result<()> {
    set_no_new_privs()?;

    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.insns.as_ptr(),
    };

    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const SockFprog,
        )
    };
    if ret != 0 {
        return Err(Error::Attach(io::Error::last_os_error()));
    }
    Ok(())
}
