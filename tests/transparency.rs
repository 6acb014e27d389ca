//! A trapped-and-reissued call looks exactly like an untrapped one.

use std::fs;
use std::io::ErrorKind;

use trapdoor::{Engine, FilterRule, PermitAll};

#[test]
fn protected_thread_sees_ordinary_results() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.txt");
    fs::write(&data, b"hello\nworld\n").unwrap();
    let missing = dir.path().join("missing");

    let engine = Engine::builder()
        .rule(FilterRule::openat())
        .policy(PermitAll)
        .install()
        .unwrap();

    assert_eq!(fs::read(&data).unwrap(), b"hello\nworld\n");

    let err = fs::File::open(&missing).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    fs::write(dir.path().join("new.txt"), b"created").unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("new.txt")).unwrap(), "created");

    let stats = engine.shutdown();
    assert_eq!(stats.traps, 4);
    assert_eq!(stats.reissued, 4);
    assert_eq!(stats.denied, 0);
    assert_eq!(stats.unrecognized, 0);

    // Filter stays attached; passthrough keeps opens working.
    assert_eq!(fs::read(&data).unwrap(), b"hello\nworld\n");
}
