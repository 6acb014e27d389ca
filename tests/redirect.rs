//! A policy can point a trapped open at a different file.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use trapdoor::{Engine, FilterRule, Redirect};

fn c_path(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap()
}

#[test]
fn redirected_open_reads_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("original.txt");
    let replacement = dir.path().join("replacement.txt");
    let bystander = dir.path().join("bystander.txt");
    fs::write(&original, "original").unwrap();
    fs::write(&replacement, "replacement").unwrap();
    fs::write(&bystander, "bystander").unwrap();

    let engine = Engine::builder()
        .rule(FilterRule::openat())
        .policy(Redirect::new().path(c_path(&original), c_path(&replacement)))
        .install()
        .unwrap();

    assert_eq!(fs::read_to_string(&original).unwrap(), "replacement");
    assert_eq!(fs::read_to_string(&replacement).unwrap(), "replacement");
    assert_eq!(fs::read_to_string(&bystander).unwrap(), "bystander");

    // Writes follow the redirect too.
    fs::write(&original, "rewritten").unwrap();
    assert_eq!(fs::read_to_string(&replacement).unwrap(), "rewritten");

    let stats = engine.shutdown();
    assert_eq!(stats.traps, 5);
    assert_eq!(stats.reissued, 5);

    // Passthrough after shutdown: the real file again.
    assert_eq!(fs::read_to_string(&original).unwrap(), "original");
}
