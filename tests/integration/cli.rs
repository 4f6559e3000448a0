use std::process::Command;

fn tasklane() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tasklane"))
}

#[test]
fn test_demo_prints_every_job() {
    let output = tasklane()
        .args(["--log-level", "warn", "demo", "--workers", "2"])
        .env_remove("TASKLANE_CONFIG")
        .output()
        .expect("failed to run tasklane");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "demo failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let mut lines: Vec<&str> = stdout.lines().collect();
    lines.sort_unstable();
    assert_eq!(
        lines,
        vec![
            "job failed: job_failed",
            "job result: 120",
            "job result: 5050",
            "job result: 83",
        ]
    );
}

#[test]
fn test_demo_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasklane.toml");
    std::fs::write(&path, "[jobs]\nworkers = 1\nqueue_capacity = 8\n").unwrap();

    let output = tasklane()
        .args(["--log-level", "error", "demo", "--config"])
        .arg(&path)
        .output()
        .expect("failed to run tasklane");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 4);
}

#[test]
fn test_demo_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[jobs]\nworkers = \"many\"\n").unwrap();

    let output = tasklane()
        .args(["demo", "--config"])
        .arg(&path)
        .output()
        .expect("failed to run tasklane");
    assert!(!output.status.success());
}

#[test]
fn test_worker_exits_on_closed_input() {
    let output = tasklane()
        .args(["--log-level", "error", "worker", "--id", "3"])
        .stdin(std::process::Stdio::null())
        .output()
        .expect("failed to run tasklane");
    assert!(output.status.success());
    // Only the Hello frame: a u32 length prefix and its body.
    let len = u32::from_le_bytes(output.stdout[..4].try_into().unwrap()) as usize;
    assert_eq!(output.stdout.len(), 4 + len);
}
