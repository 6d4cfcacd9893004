use crate::common::{TestWorkspace, assert_exit_code, assert_path_exists, init_test_logging};
use std::fs;

#[test]
fn test_local_host_runs_compiler() {
    init_test_logging();
    crate::test_log!("TEST START: test_local_host_runs_compiler");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost"))
        .args(["true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 0);
    assert_path_exists(&ws.lock_dir());
    crate::test_log!("TEST PASS: test_local_host_runs_compiler");
}

#[test]
fn test_compiler_status_is_reported() {
    init_test_logging();
    crate::test_log!("TEST START: test_compiler_status_is_reported");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost"))
        .args(["false", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 1);
    crate::test_log!("TEST PASS: test_compiler_status_is_reported");
}

#[test]
fn test_state_file_removed_after_build() {
    init_test_logging();
    crate::test_log!("TEST START: test_state_file_removed_after_build");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost"))
        .args(["true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");
    assert!(output.status.success());

    let leftovers = fs::read_dir(ws.snapshot_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "state files left behind");
    crate::test_log!("TEST PASS: test_state_file_removed_after_build");
}

#[test]
fn test_unreachable_host_falls_back_and_backs_off() {
    init_test_logging();
    crate::test_log!("TEST START: test_unreachable_host_falls_back_and_backs_off");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("builder.invalid"))
        .args(["true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 0);
    assert_path_exists(&ws.lock_dir().join("backoff_tcp_builder.invalid_3632"));
    crate::test_log!("TEST PASS: test_unreachable_host_falls_back_and_backs_off");
}

#[test]
fn test_disabled_fallback_fails() {
    init_test_logging();
    crate::test_log!("TEST START: test_disabled_fallback_fails");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("builder.invalid"))
        .env("DISTCC_FALLBACK", "0")
        .args(["true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 103);
    crate::test_log!("TEST PASS: test_disabled_fallback_fails");
}

#[test]
fn test_recursive_invocation_is_fatal() {
    init_test_logging();
    crate::test_log!("TEST START: test_recursive_invocation_is_fatal");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost"))
        .env("_DISTCC_SAFEGUARD", "1")
        .args(["true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 111);
    crate::test_log!("TEST PASS: test_recursive_invocation_is_fatal");
}

#[test]
fn test_scan_includes_without_include_server() {
    init_test_logging();
    crate::test_log!("TEST START: test_scan_includes_without_include_server");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("builder.invalid"))
        .args(["--scan-includes", "true", "-c", "hello.c"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 103);
    crate::test_log!("TEST PASS: test_scan_includes_without_include_server");
}

#[test]
fn test_link_runs_locally_without_hosts() {
    init_test_logging();
    crate::test_log!("TEST START: test_link_runs_locally_without_hosts");

    let ws = TestWorkspace::new();
    assert!(ws.source.exists());
    let output = ws
        .dcc(None)
        .args(["true", "hello.o", "-o", "hello"])
        .output()
        .expect("Failed to run dcc");

    assert_exit_code(&output, 0);
    crate::test_log!("TEST PASS: test_link_runs_locally_without_hosts");
}
