//! Per-architecture tables.
//!
//! Everything that depends on the target's register layout lives here: the
//! `ucontext_t` register slots used to read a trapped call and write its
//! result, the `AUDIT_ARCH_*` value the filter checks, and the raw syscall
//! instruction used for reissue. Syscall numbers and names come from
//! [`syscalls::Sysno`], which is generated per target.

use syscalls::Sysno;

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("trapdoor supports Linux on x86_64 and aarch64 only");

/// Number of syscall argument registers.
pub const MAX_ARGS: usize = 6;

/// `ucontext_t` register slots for one architecture.
#[derive(Debug, Clone, Copy)]
pub struct RegisterTable {
    pub nr: usize,
    pub args: [usize; MAX_ARGS],
    pub ret: usize,
}

#[cfg(target_arch = "x86_64")]
mod imp {
    use super::{RegisterTable, MAX_ARGS};

    // Indices into mcontext_t.gregs (sys/ucontext.h)
    const REG_R8: usize = 0;
    const REG_R9: usize = 1;
    const REG_R10: usize = 2;
    const REG_RDI: usize = 8;
    const REG_RSI: usize = 9;
    const REG_RDX: usize = 12;
    const REG_RAX: usize = 13;
    const REG_RIP: usize = 16;

    pub const AUDIT_ARCH: u32 = 0xc000_003e;

    // The kernel rolls rax back to orig_rax before delivering SIGSYS, so the
    // return slot holds the syscall number on entry to the handler.
    pub const REGISTERS: RegisterTable = RegisterTable {
        nr: REG_RAX,
        args: [REG_RDI, REG_RSI, REG_RDX, REG_R10, REG_R8, REG_R9],
        ret: REG_RAX,
    };

    /// rip already points past `syscall` when SIGSYS is delivered.
    pub const TRAP_PC_ADVANCE: u64 = 0;

    pub fn load(uc: &libc::ucontext_t, slot: usize) -> u64 {
        uc.uc_mcontext.gregs[slot] as u64
    }

    pub fn store(uc: &mut libc::ucontext_t, slot: usize, value: u64) {
        uc.uc_mcontext.gregs[slot] = value as i64;
    }

    pub fn pc(uc: &libc::ucontext_t) -> u64 {
        uc.uc_mcontext.gregs[REG_RIP] as u64
    }

    pub fn set_pc(uc: &mut libc::ucontext_t, pc: u64) {
        uc.uc_mcontext.gregs[REG_RIP] = pc as i64;
    }

    /// Issue a syscall with the `syscall` instruction. Returns the raw kernel
    /// result (`-errno` on failure); errno is not touched.
    ///
    /// # Safety
    /// The caller vouches for the arguments, exactly as for libc::syscall.
    #[inline]
    pub unsafe fn raw_syscall(nr: u64, args: [u64; MAX_ARGS]) -> i64 {
        let ret: i64;
        unsafe {
            core::arch::asm!(
                "syscall",
                inlateout("rax") nr as i64 => ret,
                in("rdi") args[0],
                in("rsi") args[1],
                in("rdx") args[2],
                in("r10") args[3],
                in("r8") args[4],
                in("r9") args[5],
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack),
            );
        }
        ret
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    use super::{RegisterTable, MAX_ARGS};

    pub const AUDIT_ARCH: u32 = 0xc000_00b7;

    // x0 is both the first argument and the return value. The kernel restores
    // orig_x0 before delivering SIGSYS, so all six arguments are intact.
    pub const REGISTERS: RegisterTable = RegisterTable {
        nr: 8,
        args: [0, 1, 2, 3, 4, 5],
        ret: 0,
    };

    /// pc already points past `svc #0` when SIGSYS is delivered.
    pub const TRAP_PC_ADVANCE: u64 = 0;

    pub fn load(uc: &libc::ucontext_t, slot: usize) -> u64 {
        uc.uc_mcontext.regs[slot]
    }

    pub fn store(uc: &mut libc::ucontext_t, slot: usize, value: u64) {
        uc.uc_mcontext.regs[slot] = value;
    }

    pub fn pc(uc: &libc::ucontext_t) -> u64 {
        uc.uc_mcontext.pc
    }

    pub fn set_pc(uc: &mut libc::ucontext_t, pc: u64) {
        uc.uc_mcontext.pc = pc;
    }

    /// Issue a syscall with `svc #0`. Returns the raw kernel result
    /// (`-errno` on failure); errno is not touched.
    ///
    /// # Safety
    /// The caller vouches for the arguments, exactly as for libc::syscall.
    #[inline]
    pub unsafe fn raw_syscall(nr: u64, args: [u64; MAX_ARGS]) -> i64 {
        let ret: i64;
        unsafe {
            core::arch::asm!(
                "svc 0",
                in("x8") nr,
                inlateout("x0") args[0] as i64 => ret,
                in("x1") args[1],
                in("x2") args[2],
                in("x3") args[3],
                in("x4") args[4],
                in("x5") args[5],
                options(nostack),
            );
        }
        ret
    }
}

pub use imp::{load, pc, raw_syscall, set_pc, store, AUDIT_ARCH, REGISTERS, TRAP_PC_ADVANCE};

/// Numbers the engine issues itself or treats specially.
pub mod nr {
    use syscalls::Sysno;

    pub const READ: u32 = Sysno::read as u32;
    pub const WRITE: u32 = Sysno::write as u32;
    pub const WRITEV: u32 = Sysno::writev as u32;
    pub const CLOSE: u32 = Sysno::close as u32;
    pub const GETPID: u32 = Sysno::getpid as u32;
    pub const EXECVE: u32 = Sysno::execve as u32;
    pub const OPENAT: u32 = Sysno::openat as u32;
    pub const UNLINKAT: u32 = Sysno::unlinkat as u32;
    pub const READLINKAT: u32 = Sysno::readlinkat as u32;
    pub const PROCESS_VM_READV: u32 = Sysno::process_vm_readv as u32;
    pub const RT_SIGRETURN: u32 = Sysno::rt_sigreturn as u32;
}

/// Look up a syscall number by its kernel name.
pub fn syscall_number(name: &str) -> Option<u32> {
    name.parse::<Sysno>().ok().map(|sysno| sysno as u32)
}

/// Kernel name of a syscall number.
pub fn syscall_name(nr: u32) -> Option<&'static str> {
    Sysno::new(nr as usize).map(|sysno| sysno.name())
}

/// Index of the argument holding the (first) path.
pub fn path_arg(nr: u32) -> Option<usize> {
    match Sysno::new(nr as usize)? {
        #[cfg(target_arch = "x86_64")]
        Sysno::open
        | Sysno::creat
        | Sysno::stat
        | Sysno::lstat
        | Sysno::access
        | Sysno::chmod
        | Sysno::mkdir
        | Sysno::rmdir
        | Sysno::unlink
        | Sysno::readlink => Some(0),
        Sysno::execve | Sysno::chdir | Sysno::truncate => Some(0),
        Sysno::openat
        | Sysno::mkdirat
        | Sysno::mknodat
        | Sysno::newfstatat
        | Sysno::unlinkat
        | Sysno::readlinkat
        | Sysno::faccessat
        | Sysno::faccessat2
        | Sysno::fchmodat
        | Sysno::fchownat
        | Sysno::linkat
        | Sysno::renameat2
        | Sysno::execveat
        | Sysno::statx => Some(1),
        _ => None,
    }
}

/// Index of the directory fd a relative path is resolved against.
pub fn dirfd_arg(nr: u32) -> Option<usize> {
    match Sysno::new(nr as usize)? {
        Sysno::openat
        | Sysno::mkdirat
        | Sysno::mknodat
        | Sysno::newfstatat
        | Sysno::unlinkat
        | Sysno::readlinkat
        | Sysno::faccessat
        | Sysno::faccessat2
        | Sysno::fchmodat
        | Sysno::fchownat
        | Sysno::linkat
        | Sysno::renameat2
        | Sysno::execveat
        | Sysno::statx => Some(0),
        _ => None,
    }
}
