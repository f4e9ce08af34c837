//! Spawns the `opencode` binary and checks flag handling and exit codes.

use std::process::Command;

fn opencode(args: &[&str]) -> std::process::Output {
    let dir = tempfile::tempdir().unwrap();
    Command::new(env!("CARGO_BIN_EXE_opencode"))
        .current_dir(dir.path())
        .env("HOME", dir.path())
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_short_and_long_version_exit_zero() {
    for flag in ["-v", "--version"] {
        let out = opencode(&[flag]);
        assert_eq!(out.status.code(), Some(0), "{flag}");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "{flag}: {stdout}");
    }
}

#[test]
fn test_help_exits_zero() {
    let out = opencode(&["-h"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("--output-format"));
}

#[test]
fn test_bad_flags_exit_one() {
    assert_eq!(opencode(&["--no-such-flag"]).status.code(), Some(1));
    // -D needs -s.
    assert_eq!(opencode(&["-D"]).status.code(), Some(1));
    assert_eq!(opencode(&["-f", "yaml", "-p", "hi"]).status.code(), Some(1));
}
