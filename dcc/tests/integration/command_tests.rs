use crate::common::{TestWorkspace, assert_contains, assert_exit_code, init_test_logging};

#[test]
fn test_dcc_version() {
    init_test_logging();
    crate::test_log!("TEST START: test_dcc_version");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(None)
        .arg("--version")
        .output()
        .expect("Failed to run dcc --version");

    assert!(output.status.success(), "dcc --version failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, env!("CARGO_PKG_VERSION"));
    crate::test_log!("TEST PASS: test_dcc_version");
}

#[test]
fn test_dcc_help_describes_compile_usage() {
    init_test_logging();
    crate::test_log!("TEST START: test_dcc_help_describes_compile_usage");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(None)
        .arg("--help")
        .output()
        .expect("Failed to run dcc --help");

    assert!(output.status.success(), "dcc --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "Distributed C/C++ compile client");
    assert_contains(&stdout, "--show-hosts");
    assert_contains(&stdout, "--scan-includes");
    assert_contains(&stdout, "DISTCC_HOSTS");
    crate::test_log!("TEST PASS: test_dcc_help_describes_compile_usage");
}

#[test]
fn test_concurrency_sums_slots() {
    init_test_logging();
    crate::test_log!("TEST START: test_concurrency_sums_slots");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost/3 builder/8"))
        .arg("-j")
        .output()
        .expect("Failed to run dcc -j");

    assert!(output.status.success(), "dcc -j failed");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "11");
    crate::test_log!("TEST PASS: test_concurrency_sums_slots");
}

#[test]
fn test_show_hosts_lists_entries() {
    init_test_logging();
    crate::test_log!("TEST START: test_show_hosts_lists_entries");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost/3 builder:4000/8,lzo"))
        .arg("--show-hosts")
        .output()
        .expect("Failed to run dcc --show-hosts");

    assert!(output.status.success(), "dcc --show-hosts failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 2);
    assert_contains(&stdout, "localhost/3");
    assert_contains(&stdout, "builder:4000/8,lzo");
    crate::test_log!("TEST PASS: test_show_hosts_lists_entries");
}

#[test]
fn test_show_hosts_json() {
    init_test_logging();
    crate::test_log!("TEST START: test_show_hosts_json");

    let ws = TestWorkspace::new();
    let output = ws
        .dcc(Some("localhost builder/8"))
        .args(["--show-hosts", "--json"])
        .output()
        .expect("Failed to run dcc --show-hosts --json");

    assert!(output.status.success(), "dcc --show-hosts --json failed");
    let hosts: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("Invalid JSON output");
    let hosts = hosts.as_array().expect("Expected a JSON array");
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0]["mode"], "local");
    assert_eq!(hosts[1]["hostname"], "builder");
    assert_eq!(hosts[1]["port"], 3632);
    crate::test_log!("TEST PASS: test_show_hosts_json");
}

#[test]
fn test_missing_host_list() {
    init_test_logging();
    crate::test_log!("TEST START: test_missing_host_list");

    let ws = TestWorkspace::new();
    let output = ws.dcc(None).arg("-j").output().expect("Failed to run dcc -j");

    assert_exit_code(&output, 116);
    crate::test_log!("TEST PASS: test_missing_host_list");
}

#[test]
fn test_missing_operand() {
    init_test_logging();
    crate::test_log!("TEST START: test_missing_operand");

    let ws = TestWorkspace::new();
    let output = ws.dcc(None).output().expect("Failed to run dcc");

    assert_exit_code(&output, 101);
    assert_contains(&String::from_utf8_lossy(&output.stderr), "missing operand");
    crate::test_log!("TEST PASS: test_missing_operand");
}
