//! Panic output must go through the sink's masking.
//!
//! A panic hook is process-wide, so each test re-runs this test binary as
//! a child process and inspects the child's stderr.

use std::process::Command;

use pipestep_log::LogSink;

const CHILD_ENV: &str = "PIPESTEP_PANIC_HOOK_CHILD";
const SECRET: &str = "s3cr3t-panic-value";

fn run_child(test_name: &str, verbose: bool) -> String {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", test_name, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, if verbose { "verbose" } else { "quiet" })
        .output()
        .unwrap();
    assert!(output.status.success(), "child failed: {:?}", output);
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn panic_with_secret(verbose: bool) {
    let sink = LogSink::new();
    sink.set_verbose(verbose);
    sink.register_secret(SECRET);
    sink.install_panic_hook();

    let joined = std::thread::spawn(|| {
        panic!("failed with token {}", SECRET);
    })
    .join();
    assert!(joined.is_err());
}

#[test]
fn test_panic_payload_is_masked_in_verbose_mode() {
    match std::env::var(CHILD_ENV).as_deref() {
        Ok("verbose") => return panic_with_secret(true),
        Ok(_) => return,
        Err(_) => {}
    }

    let stderr = run_child("test_panic_payload_is_masked_in_verbose_mode", true);
    assert!(!stderr.contains(SECRET), "stderr: {}", stderr);
    assert!(stderr.contains("panicked: failed with token ***"), "stderr: {}", stderr);
    assert!(stderr.contains("location=") && stderr.contains("panic_hook.rs"), "stderr: {}", stderr);
}

#[test]
fn test_panic_is_silent_without_verbose() {
    match std::env::var(CHILD_ENV).as_deref() {
        Ok("quiet") => return panic_with_secret(false),
        Ok(_) => return,
        Err(_) => {}
    }

    let stderr = run_child("test_panic_is_silent_without_verbose", false);
    assert!(!stderr.contains(SECRET), "stderr: {}", stderr);
    assert!(!stderr.contains("panicked"), "stderr: {}", stderr);
}
