//! Typed views of raw argument words.
//!
//! A trapped call hands the policy bare `u64`s. The readers here copy what a
//! word points at into fixed stack buffers, so a policy can look at a path
//! without allocating and without faulting on a bad pointer.

use std::fmt;

use arrayvec::{ArrayString, ArrayVec};

use crate::arch::nr;
use crate::reissue;

pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// NUL-terminated string copied out of the caller's memory, terminator
/// stripped.
pub struct CStrArg<const CAP: usize> {
    bytes: ArrayVec<u8, CAP>,
}

/// A path argument.
pub type PathArg = CStrArg<PATH_MAX>;

impl<const CAP: usize> CStrArg<CAP> {
    /// Copy the string at `addr`. `None` for a null or unreadable pointer
    /// and for strings with no terminator within `CAP` bytes.
    pub fn read(addr: u64) -> Option<Self> {
        if addr == 0 {
            return None;
        }
        let mut buf = ArrayVec::<u8, CAP>::new();
        let len = match copy_from_self(addr, buf.as_mut_ptr(), CAP) {
            SelfRead::Copied(n) => n,
            SelfRead::Fault => return None,
            SelfRead::Unsupported => read_direct(addr, buf.as_mut_ptr(), CAP),
        };
        unsafe { buf.set_len(len) };

        let nul = buf.iter().position(|&b| b == 0)?;
        buf.truncate(nul);
        Some(Self { bytes: buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_absolute(&self) -> bool {
        self.bytes.first() == Some(&b'/')
    }
}

impl<const CAP: usize> fmt::Debug for CStrArg<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))
    }
}

enum SelfRead {
    Copied(usize),
    Fault,
    Unsupported,
}

/// process_vm_readv(2) on our own pid: reads up to the first unmapped page
/// instead of faulting.
fn copy_from_self(addr: u64, dst: *mut u8, len: usize) -> SelfRead {
    let local = libc::iovec {
        iov_base: dst.cast(),
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: len,
    };
    let pid = unsafe { reissue::syscall(nr::GETPID, [0; 6]) };
    let ret = unsafe {
        reissue::syscall(
            nr::PROCESS_VM_READV,
            [
                pid as u64,
                &local as *const libc::iovec as u64,
                1,
                &remote as *const libc::iovec as u64,
                1,
                0,
            ],
        )
    };
    match ret {
        n if n >= 0 => SelfRead::Copied(n as usize),
        n if n == -(libc::EFAULT as i64) => SelfRead::Fault,
        // ENOSYS, a filtered-out call, or a failed getpid
        _ => SelfRead::Unsupported,
    }
}

/// Byte-by-byte copy up to and including the terminator. Used only where
/// process_vm_readv is filtered out; a wild pointer faults here.
fn read_direct(addr: u64, dst: *mut u8, cap: usize) -> usize {
    let src = addr as *const u8;
    for i in 0..cap {
        let b = unsafe { src.add(i).read_volatile() };
        unsafe { dst.add(i).write(b) };
        if b == 0 {
            return i + 1;
        }
    }
    cap
}

/// Absolute form of `path` as the kernel would see it from `dirfd`. The
/// result is not normalized. Uses readlinkat on /proc/thread-self, which is
/// async-signal-safe where getcwd is not.
pub fn resolve_at(dirfd: i32, path: &[u8], out: &mut ArrayVec<u8, PATH_MAX>) -> bool {
    out.clear();
    if path.first() == Some(&b'/') {
        return out.try_extend_from_slice(path).is_ok();
    }

    let mut link = ArrayString::<48>::new();
    let formatted = if dirfd == libc::AT_FDCWD {
        link.try_push_str("/proc/thread-self/cwd\0").is_ok()
    } else {
        use std::fmt::Write as _;
        write!(link, "/proc/thread-self/fd/{dirfd}\0").is_ok()
    };
    if !formatted {
        return false;
    }

    let n = unsafe {
        reissue::syscall(
            nr::READLINKAT,
            [
                libc::AT_FDCWD as u64,
                link.as_ptr() as u64,
                out.as_mut_ptr() as u64,
                PATH_MAX as u64,
                0,
                0,
            ],
        )
    };
    let Some(len) = link_len(n) else {
        return false;
    };
    unsafe { out.set_len(len) };

    out.try_push(b'/').is_ok() && out.try_extend_from_slice(path).is_ok()
}

/// Length of a readlinkat result that fit in a `PATH_MAX` buffer. A
/// result that fills the buffer may have been truncated.
fn link_len(ret: i64) -> Option<usize> {
    (ret > 0 && (ret as usize) < PATH_MAX).then_some(ret as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    #[test]
    fn reads_string_from_own_memory() {
        let s = CString::new("/etc/hosts").unwrap();
        let arg = PathArg::read(s.as_ptr() as u64).unwrap();
        assert_eq!(arg.as_bytes(), b"/etc/hosts");
        assert!(arg.is_absolute());
    }

    #[test]
    fn null_pointer_is_none() {
        assert!(PathArg::read(0).is_none());
    }

    #[test]
    fn unterminated_within_capacity_is_none() {
        let s = CString::new("abcdefgh").unwrap();
        assert!(CStrArg::<4>::read(s.as_ptr() as u64).is_none());
        assert_eq!(
            CStrArg::<9>::read(s.as_ptr() as u64).unwrap().as_bytes(),
            b"abcdefgh"
        );
    }

    #[test]
    fn unmapped_pointer_is_none() {
        // page zero is never mapped
        assert!(PathArg::read(8).is_none());
    }

    #[test]
    fn full_buffer_link_counts_as_truncated() {
        assert_eq!(link_len(1), Some(1));
        assert_eq!(link_len(PATH_MAX as i64 - 1), Some(PATH_MAX - 1));
        assert_eq!(link_len(PATH_MAX as i64), None);
        assert_eq!(link_len(0), None);
        assert_eq!(link_len(-(libc::ENOENT as i64)), None);
    }

    #[test]
    fn absolute_path_resolves_to_itself() {
        let mut out = ArrayVec::new();
        assert!(resolve_at(libc::AT_FDCWD, b"/a/b", &mut out));
        assert_eq!(&out[..], b"/a/b");
    }

    #[test]
    fn relative_path_resolves_against_cwd() {
        let mut out = ArrayVec::new();
        assert!(resolve_at(libc::AT_FDCWD, b"a/./b", &mut out));
        let expected = std::env::current_dir().unwrap().join("a/./b");
        assert_eq!(std::str::from_utf8(&out).unwrap(), expected.to_str().unwrap());
    }

    #[test]
    fn relative_path_resolves_against_dirfd() {
        let dir = tempfile::tempdir().unwrap();
        let handle = std::fs::File::open(dir.path()).unwrap();
        let mut out = ArrayVec::new();
        assert!(resolve_at(handle.as_raw_fd(), b"x", &mut out));
        let expected = dir.path().canonicalize().unwrap().join("x");
        assert_eq!(std::str::from_utf8(&out).unwrap(), expected.to_str().unwrap());
    }
}
