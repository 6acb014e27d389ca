//! Direct, unbuffered output usable from inside the SIGSYS handler.
//!
//! No allocation, no locks, no stdio: lines are assembled from borrowed
//! slices and go out with one tagged writev(2).

use std::os::fd::RawFd;

use arrayvec::ArrayVec;

use crate::arch::nr;
use crate::reissue;

/// Most parts one line may have.
pub const MAX_PARTS: usize = 8;

fn writev(fd: RawFd, iov: &[libc::iovec]) -> i64 {
    unsafe {
        reissue::syscall(
            nr::WRITEV,
            [fd as u64, iov.as_ptr() as u64, iov.len() as u64, 0, 0, 0],
        )
    }
}

/// Write `parts` to `fd` in order. Returns bytes written or `-errno`.
/// At most [`MAX_PARTS`] parts; anything past that is not written.
pub fn write_parts(fd: RawFd, parts: &[&[u8]]) -> i64 {
    debug_assert!(parts.len() <= MAX_PARTS, "{} parts, limit {MAX_PARTS}", parts.len());
    let mut iov = ArrayVec::<libc::iovec, MAX_PARTS>::new();
    for part in parts.iter().filter(|p| !p.is_empty()).take(MAX_PARTS) {
        iov.push(libc::iovec {
            iov_base: part.as_ptr() as *mut libc::c_void,
            iov_len: part.len(),
        });
    }
    let total: usize = iov.iter().map(|v| v.iov_len).sum();

    let ret = writev(fd, &iov);
    if ret < 0 || ret as usize == total {
        return ret;
    }

    // Short write: push out whatever is left part by part.
    let mut skip = ret as usize;
    let mut written = ret;
    for part in parts.iter().filter(|p| !p.is_empty()).take(MAX_PARTS) {
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        let mut rest = &part[skip..];
        skip = 0;
        while !rest.is_empty() {
            let one = [libc::iovec {
                iov_base: rest.as_ptr() as *mut libc::c_void,
                iov_len: rest.len(),
            }];
            let n = writev(fd, &one);
            if n <= 0 {
                return if n < 0 { n } else { written };
            }
            written += n;
            rest = &rest[n as usize..];
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn parts_arrive_in_order() {
        let mut file = tempfile::tempfile().unwrap();
        let ret = write_parts(file.as_raw_fd(), &[b"open", b"", b"at ", b"/etc/hosts", b"\n"]);
        assert_eq!(ret, 19);

        let mut out = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "openat /etc/hosts\n");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "limit 8")]
    fn too_many_parts_is_caught_in_debug_builds() {
        let part: &[u8] = b"x";
        write_parts(-1, &[part; MAX_PARTS + 1]);
    }

    #[test]
    fn bad_fd_reports_negative_errno() {
        assert_eq!(write_parts(-1, &[b"x"]), -(libc::EBADF as i64));
    }
}
