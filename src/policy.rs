//! Policy hooks: what to do with one trapped call.
//!
//! Policies run on the interrupted thread inside the SIGSYS handler. They
//! must not take locks the interrupted code may hold, so no allocation, no
//! stdio, no `tracing`. Anything they own is built up front.

use std::ffi::CString;
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use arrayvec::{ArrayString, ArrayVec};
use nix::errno::Errno;

use crate::arch::MAX_ARGS;
use crate::arg::{self, PathArg, PATH_MAX};
use crate::context::InterceptedCall;
use crate::rawlog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Reissue with these arguments.
    Permit([u64; MAX_ARGS]),
    /// Do not run the call; it returns `-errno`.
    Deny(Errno),
}

impl PolicyDecision {
    /// Permit with the arguments unchanged.
    pub fn permit(call: &InterceptedCall) -> Self {
        PolicyDecision::Permit(call.args)
    }
}

pub trait Policy: Send + Sync {
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision;
}

impl<F> Policy for F
where
    F: Fn(&InterceptedCall) -> PolicyDecision + Send + Sync,
{
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        self(call)
    }
}

/// Lets every call through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl Policy for PermitAll {
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        PolicyDecision::permit(call)
    }
}

/// Reference policy: one line per call, then permit unchanged.
///
/// ```text
/// [trapdoor] openat(257) /etc/hosts
/// ```
#[derive(Debug)]
pub struct Observe {
    fd: RawFd,
    resolve: bool,
    seen: AtomicU64,
}

impl Observe {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            resolve: false,
            seen: AtomicU64::new(0),
        }
    }

    pub fn stderr() -> Self {
        Self::new(libc::STDERR_FILENO)
    }

    /// Print relative paths resolved against their dirfd or the cwd.
    pub fn resolve_paths(mut self, resolve: bool) -> Self {
        self.resolve = resolve;
        self
    }

    /// Calls observed so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Policy for Observe {
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        self.seen.fetch_add(1, Ordering::Relaxed);

        let mut head = ArrayString::<64>::new();
        let _ = write!(
            head,
            "[trapdoor] {}({})",
            call.name().unwrap_or("syscall"),
            call.nr
        );

        let path = call
            .path_index()
            .and_then(|i| PathArg::read(call.args[i]));
        match path {
            Some(path) => {
                let mut resolved = ArrayVec::<u8, PATH_MAX>::new();
                let shown = if self.resolve
                    && !path.is_absolute()
                    && arg::resolve_at(
                        call.dirfd().unwrap_or(libc::AT_FDCWD),
                        path.as_bytes(),
                        &mut resolved,
                    ) {
                    &resolved[..]
                } else {
                    path.as_bytes()
                };
                rawlog::write_parts(self.fd, &[head.as_bytes(), b" ", shown, b"\n"]);
            }
            None => {
                rawlog::write_parts(self.fd, &[head.as_bytes(), b"\n"]);
            }
        }

        PolicyDecision::permit(call)
    }
}

/// Exact-match path substitution. The replacement strings live as long as
/// the policy, so the pointers handed to the kernel stay valid.
#[derive(Debug, Default)]
pub struct Redirect {
    entries: Vec<(CString, CString)>,
}

impl Redirect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, from: CString, to: CString) -> Self {
        self.entries.push((from, to));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Policy for Redirect {
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        let mut args = call.args;
        if let Some(i) = call.path_index() {
            if let Some(path) = PathArg::read(call.args[i]) {
                if let Some((_, to)) = self
                    .entries
                    .iter()
                    .find(|(from, _)| from.as_bytes() == path.as_bytes())
                {
                    args[i] = to.as_ptr() as u64;
                }
            }
        }
        PolicyDecision::Permit(args)
    }
}

/// Refuses calls whose path argument matches exactly.
#[derive(Debug, Default)]
pub struct DenyPaths {
    entries: Vec<(CString, Errno)>,
}

impl DenyPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: CString, errno: Errno) -> Self {
        self.entries.push((path, errno));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Policy for DenyPaths {
    /// A path that cannot be read is refused with `EACCES`: it might have
    /// matched. A null pointer is left to the kernel.
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        let Some(addr) = call.path_index().map(|i| call.args[i]) else {
            return PolicyDecision::permit(call);
        };
        if addr == 0 || self.entries.is_empty() {
            return PolicyDecision::permit(call);
        }
        let Some(path) = PathArg::read(addr) else {
            return PolicyDecision::Deny(Errno::EACCES);
        };
        match self
            .entries
            .iter()
            .find(|(p, _)| p.as_bytes() == path.as_bytes())
        {
            Some(&(_, errno)) => PolicyDecision::Deny(errno),
            None => PolicyDecision::permit(call),
        }
    }
}

/// Runs policies in order. Each sees the arguments the previous one
/// permitted; the first deny ends the chain.
#[derive(Default)]
pub struct PolicyChain {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, policy: impl Policy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Policy for PolicyChain {
    fn decide(&self, call: &InterceptedCall) -> PolicyDecision {
        let mut current = *call;
        for policy in &self.policies {
            match policy.decide(&current) {
                PolicyDecision::Permit(args) => current.args = args,
                deny @ PolicyDecision::Deny(_) => return deny,
            }
        }
        PolicyDecision::Permit(current.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::nr;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    fn openat(path: &CString) -> InterceptedCall {
        InterceptedCall::new(
            nr::OPENAT,
            [
                libc::AT_FDCWD as u64,
                path.as_ptr() as u64,
                libc::O_RDONLY as u64,
                0,
                0,
                0,
            ],
        )
    }

    fn cstring(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn permit_all_keeps_arguments() {
        let path = cstring("/etc/hosts");
        let call = openat(&path);
        assert_eq!(PermitAll.decide(&call), PolicyDecision::Permit(call.args));
    }

    #[test]
    fn closures_are_policies() {
        let deny_everything = |_: &InterceptedCall| PolicyDecision::Deny(Errno::EPERM);
        let call = InterceptedCall::new(nr::GETPID, [0; MAX_ARGS]);
        assert_eq!(deny_everything.decide(&call), PolicyDecision::Deny(Errno::EPERM));
    }

    #[test]
    fn redirect_swaps_matching_path_pointer() {
        let policy = Redirect::new().path(cstring("/etc/hosts"), cstring("/etc/hostname"));
        let path = cstring("/etc/hosts");
        let call = openat(&path);

        let PolicyDecision::Permit(args) = policy.decide(&call) else {
            panic!("redirect must permit");
        };
        let target = PathArg::read(args[1]).unwrap();
        assert_eq!(target.as_bytes(), b"/etc/hostname");
        assert_eq!(args[0], call.args[0]);
        assert_eq!(args[2], call.args[2]);
    }

    #[test]
    fn redirect_ignores_other_paths_and_prefixes() {
        let policy = Redirect::new().path(cstring("/etc/hosts"), cstring("/etc/hostname"));
        for other in ["/etc/passwd", "/etc/hosts.allow", "/etc/host"] {
            let path = cstring(other);
            let call = openat(&path);
            assert_eq!(policy.decide(&call), PolicyDecision::Permit(call.args));
        }
    }

    #[test]
    fn deny_paths_returns_configured_errno() {
        let policy = DenyPaths::new().path(cstring("/etc/shadow"), Errno::EACCES);
        let denied = cstring("/etc/shadow");
        assert_eq!(
            policy.decide(&openat(&denied)),
            PolicyDecision::Deny(Errno::EACCES)
        );

        let allowed = cstring("/etc/hosts");
        let call = openat(&allowed);
        assert_eq!(policy.decide(&call), PolicyDecision::Permit(call.args));
    }

    #[test]
    fn deny_paths_refuses_unreadable_path() {
        let policy = DenyPaths::new().path(cstring("/etc/shadow"), Errno::ENOENT);
        let mut call = InterceptedCall::new(nr::OPENAT, [libc::AT_FDCWD as u64, 8, 0, 0, 0, 0]);
        assert_eq!(policy.decide(&call), PolicyDecision::Deny(Errno::EACCES));

        call.args[1] = 0;
        assert_eq!(policy.decide(&call), PolicyDecision::Permit(call.args));
    }

    #[test]
    fn chain_feeds_rewritten_arguments_forward() {
        let chain = PolicyChain::new()
            .then(Redirect::new().path(cstring("/a"), cstring("/b")))
            .then(DenyPaths::new().path(cstring("/b"), Errno::ENOENT));
        let path = cstring("/a");
        assert_eq!(
            chain.decide(&openat(&path)),
            PolicyDecision::Deny(Errno::ENOENT)
        );
    }

    #[test]
    fn empty_chain_permits() {
        let call = InterceptedCall::new(nr::GETPID, [1, 2, 3, 4, 5, 6]);
        assert_eq!(
            PolicyChain::new().decide(&call),
            PolicyDecision::Permit([1, 2, 3, 4, 5, 6])
        );
    }

    #[test]
    fn observe_writes_one_line_per_call() {
        let mut out = tempfile::tempfile().unwrap();
        let observe = Observe::new(out.as_raw_fd());

        let path = cstring("/etc/hosts");
        let call = openat(&path);
        assert_eq!(observe.decide(&call), PolicyDecision::Permit(call.args));
        observe.decide(&InterceptedCall::new(nr::GETPID, [0; MAX_ARGS]));
        assert_eq!(observe.seen(), 2);

        let mut text = String::new();
        out.seek(SeekFrom::Start(0)).unwrap();
        out.read_to_string(&mut text).unwrap();
        assert_eq!(
            text,
            format!(
                "[trapdoor] openat({}) /etc/hosts\n[trapdoor] getpid({})\n",
                nr::OPENAT,
                nr::GETPID
            )
        );
    }

    #[test]
    fn observe_resolves_relative_paths_when_asked() {
        let mut out = tempfile::tempfile().unwrap();
        let observe = Observe::new(out.as_raw_fd()).resolve_paths(true);

        let path = cstring("Cargo.toml");
        observe.decide(&openat(&path));

        let mut text = String::new();
        out.seek(SeekFrom::Start(0)).unwrap();
        out.read_to_string(&mut text).unwrap();
        let expected = std::env::current_dir().unwrap().join("Cargo.toml");
        assert_eq!(
            text,
            format!("[trapdoor] openat({}) {}\n", nr::OPENAT, expected.display())
        );
    }
}
