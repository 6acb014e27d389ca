//! A denied call fails with the policy's errno and has no side effect.

use std::ffi::CString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use trapdoor::{DenyPaths, Engine, FilterRule};

#[test]
fn denied_open_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let forbidden = dir.path().join("forbidden.txt");
    let allowed = dir.path().join("allowed.txt");

    let engine = Engine::builder()
        .rule(FilterRule::openat())
        .policy(DenyPaths::new().path(
            CString::new(forbidden.as_os_str().as_bytes()).unwrap(),
            Errno::EACCES,
        ))
        .install()
        .unwrap();

    let err = fs::File::create(&forbidden).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    assert!(!forbidden.exists());

    fs::write(&allowed, "fine").unwrap();
    assert!(allowed.exists());

    let stats = engine.stats();
    assert_eq!(stats.traps, 2);
    assert_eq!(stats.denied, 1);
    assert_eq!(stats.reissued, 1);
}
