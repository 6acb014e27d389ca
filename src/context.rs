//! Reading a trapped call out of the interrupted context and writing its
//! result back.

use std::fmt;

use crate::arch::{self, MAX_ARGS, REGISTERS, TRAP_PC_ADVANCE};

/// The interrupted thread's register snapshot, borrowed for one handler run.
pub struct MachineContext<'a> {
    uc: &'a mut libc::ucontext_t,
}

impl<'a> MachineContext<'a> {
    pub fn new(uc: &'a mut libc::ucontext_t) -> Self {
        Self { uc }
    }

    /// # Safety
    /// `data` must be the third argument of an `SA_SIGINFO` handler and the
    /// returned context must not outlive that handler invocation.
    pub unsafe fn from_signal(data: *mut libc::c_void) -> Option<Self> {
        unsafe { data.cast::<libc::ucontext_t>().as_mut() }.map(Self::new)
    }

    pub fn syscall_nr(&self) -> u64 {
        arch::load(&*self.uc, REGISTERS.nr)
    }

    pub fn arg(&self, index: usize) -> u64 {
        arch::load(&*self.uc, REGISTERS.args[index])
    }

    pub fn args(&self) -> [u64; MAX_ARGS] {
        std::array::from_fn(|i| self.arg(i))
    }

    pub fn return_value(&self) -> i64 {
        arch::load(&*self.uc, REGISTERS.ret) as i64
    }

    pub fn pc(&self) -> u64 {
        arch::pc(&*self.uc)
    }

    /// Materialize the trapped call.
    pub fn intercept(&self) -> InterceptedCall {
        InterceptedCall {
            nr: self.syscall_nr(),
            args: self.args(),
        }
    }

    /// Make the interrupted syscall instruction appear to have returned
    /// `result`.
    pub fn inject(&mut self, result: i64) {
        arch::store(&mut *self.uc, REGISTERS.ret, result as u64);
        if TRAP_PC_ADVANCE != 0 {
            let pc = arch::pc(&*self.uc).wrapping_add(TRAP_PC_ADVANCE);
            arch::set_pc(&mut *self.uc, pc);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_register(&mut self, slot: usize, value: u64) {
        arch::store(&mut *self.uc, slot, value);
    }
}

/// One trapped syscall: its number and raw argument words. What a word
/// means is up to the policy looking at it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InterceptedCall {
    pub nr: u64,
    pub args: [u64; MAX_ARGS],
}

impl InterceptedCall {
    pub fn new(nr: u32, args: [u64; MAX_ARGS]) -> Self {
        Self {
            nr: u64::from(nr),
            args,
        }
    }

    /// Syscall number, if it fits the kernel's 32-bit `seccomp_data.nr`.
    pub fn number(&self) -> Option<u32> {
        u32::try_from(self.nr).ok()
    }

    pub fn name(&self) -> Option<&'static str> {
        self.number().and_then(arch::syscall_name)
    }

    /// Index of the argument holding a path, for path-taking syscalls.
    pub fn path_index(&self) -> Option<usize> {
        self.number().and_then(arch::path_arg)
    }

    /// Directory fd the path is relative to, for `*at` syscalls.
    pub fn dirfd(&self) -> Option<i32> {
        self.number()
            .and_then(arch::dirfd_arg)
            .map(|i| self.args[i] as i32)
    }
}

impl fmt::Debug for InterceptedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedCall")
            .field("nr", &self.nr)
            .field("name", &self.name())
            .field("args", &format_args!("{:#x?}", self.args))
            .finish()
    }
}
