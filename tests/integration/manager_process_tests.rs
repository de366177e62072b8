//! Spawning and stopping the kernel-manager child.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use serial_test::serial;
use slack_kernel_relay::config::GlobalConfig;
use slack_kernel_relay::frontend::KernelManagerProcess;
use slack_kernel_relay::kernel::PidRegistry;
use slack_kernel_relay::models::process_record::ProcessRecord;
use slack_kernel_relay::AppError;

fn sleeper(pid_dir: &Path) -> KernelManagerProcess {
    KernelManagerProcess::new("sleep", vec!["30".into()], pid_dir, Duration::from_secs(2))
}

#[tokio::test]
#[serial]
async fn start_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let manager = sleeper(dir.path());

    let pid = manager.start().await.unwrap();
    assert!(pid > 0);
    assert!(manager.is_running().await);

    manager.stop().await.unwrap();
    assert!(!manager.is_running().await);
}

#[tokio::test]
#[serial]
async fn second_stop_is_a_misuse_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = sleeper(dir.path());
    manager.start().await.unwrap();

    manager.stop().await.unwrap();
    let err = manager.stop().await.unwrap_err();
    assert!(matches!(err, AppError::NotRunning(_)));
}

#[tokio::test]
async fn stop_without_start_is_a_misuse_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = sleeper(dir.path()).stop().await.unwrap_err();
    assert!(matches!(err, AppError::NotRunning(_)));
}

#[tokio::test]
#[serial]
async fn start_while_running_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = sleeper(dir.path());
    manager.start().await.unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyRunning(_)));
    manager.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn start_after_child_exit_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = KernelManagerProcess::new("true", Vec::new(), dir.path(), Duration::from_secs(1));
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    manager.start().await.unwrap();
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = KernelManagerProcess::new(
        "/nonexistent/slack-kernel-manager",
        Vec::new(),
        dir.path(),
        Duration::from_secs(1),
    );
    assert!(matches!(manager.start().await, Err(AppError::Spawn(_))));
}

#[tokio::test]
#[serial]
async fn stop_sweeps_recorded_kernels() {
    let dir = tempfile::tempdir().unwrap();
    let registry = PidRegistry::new(dir.path());
    registry.record(ProcessRecord::new(999_999_999)).unwrap();
    let manager = sleeper(dir.path());
    manager.start().await.unwrap();

    let report = manager.stop().await.unwrap();

    assert_eq!(report.failed, vec![999_999_999]);
    assert!(registry.list().unwrap().is_empty());
}

#[tokio::test]
async fn stubborn_child_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let manager = KernelManagerProcess::new(
        "sh",
        vec!["-c".into(), "trap '' TERM; sleep 30".into()],
        dir.path(),
        Duration::from_millis(200),
    );
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop finishes after the grace period")
        .unwrap();
    assert!(!manager.is_running().await);
}

/// Manager stand-in that records a long-lived "kernel" in `pid_dir` and
/// takes a second to exit on SIGTERM, leaving its kernel for the sweep.
fn kernel_recording_manager(pid_dir: &Path) -> KernelManagerProcess {
    std::fs::create_dir_all(pid_dir).unwrap();
    KernelManagerProcess::new(
        "sh",
        vec![
            "-c".into(),
            "trap 'sleep 1; exit 0' TERM; sleep 300 & echo kernel > \"$0/$!\"; while :; do sleep 0.1; done"
                .into(),
            pid_dir.as_os_str().to_owned(),
        ],
        pid_dir,
        Duration::from_secs(5),
    )
}

async fn wait_for_records(registry: &PidRegistry, count: usize) -> Vec<ProcessRecord> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let records = registry.list().unwrap();
            if records.len() == count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("kernel records settle")
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn concurrent_restarts_leave_one_live_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let pid_dir = dir.path().join("pids");
    let registry = PidRegistry::new(&pid_dir);
    let manager = Arc::new(kernel_recording_manager(&pid_dir));
    manager.start().await.unwrap();
    wait_for_records(&registry, 1).await;

    let first = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.restart().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.restart().await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let records = wait_for_records(&registry, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.is_running().await);
    assert!(is_alive(records[0].pid), "current kernel must survive both restarts");

    manager.stop().await.unwrap();
    assert!(registry.list().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn restart_without_child_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let manager = sleeper(dir.path());

    manager.restart().await.unwrap();

    assert!(manager.is_running().await);
    manager.stop().await.unwrap();
}

#[test]
fn from_config_passes_config_path() {
    let config = GlobalConfig::from_toml_str(
        "[kernel]\ncommand = \"kernel-launcher\"\n\n[manager]\nprogram = \"/bin/echo\"\n",
    )
    .unwrap();
    let manager = KernelManagerProcess::from_config(&config, Path::new("relay.toml")).unwrap();
    let debug = format!("{manager:?}");
    assert!(debug.contains("/bin/echo"));
    assert!(debug.contains("--config"));
    assert!(debug.contains("relay.toml"));
}
