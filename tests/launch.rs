//! End-to-end launches through `LaunchBuilder`.

use lifeline::process::exit_code;
use lifeline::{LaunchBuilder, LifelineConfig, Status, Terminate};
use std::path::Path;
use std::time::Duration;

const WRAPPER: &str = env!("CARGO_BIN_EXE_lifeline-wrapper");

fn config_in(dir: &Path) -> LifelineConfig {
    let mut config = LifelineConfig::default();
    config.launch.sentinel_dir = Some(dir.to_path_buf());
    config.launch.forward_output = false;
    config.watcher.poll_interval_ms = 20;
    config.watcher.max_wait_ms = 200;
    config
}

#[tokio::test]
async fn test_native_wrapper_stops_cooperatively() {
    let dir = tempfile::tempdir().unwrap();
    let process = LaunchBuilder::native_wrapper(WRAPPER, "lifeline.demo.Cooperative", ["300"])
        .config(&config_in(dir.path()))
        .build()
        .unwrap()
        .start()
        .unwrap();

    assert!(process.has_process_alive_file());
    assert!(process.exist_process_alive_file());
    // Let the wrapper adopt the files before the stop request.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(process.status(), Status::Running);

    process.terminate();
    assert!(!process.exist_process_alive_file());
    assert_eq!(process.status(), Status::Terminating);
    // Repeating the request changes nothing.
    process.terminate();

    let status = tokio::time::timeout(Duration::from_secs(10), process.wait_and_cleanup())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit_code(status), 0);
    assert_eq!(process.status(), Status::Interrupted);
    assert!(!process.exist_process_kill_file());
}

#[tokio::test]
async fn test_native_wrapper_kill_request() {
    let dir = tempfile::tempdir().unwrap();
    let process = LaunchBuilder::native_wrapper(WRAPPER, "lifeline.demo.Stubborn", Vec::<String>::new())
        .config(&config_in(dir.path()))
        .build()
        .unwrap()
        .start()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    process.kill();
    assert_eq!(process.status(), Status::Terminating);

    let status = tokio::time::timeout(Duration::from_secs(10), process.wait_and_cleanup())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit_code(status), 99);
    assert_eq!(process.status(), Status::Killed);
}

#[tokio::test]
async fn test_unrecognized_command_passthrough() {
    let dir = tempfile::tempdir().unwrap();
    let process = LaunchBuilder::new(["sh", "-c", "exit 3"])
        .config(&config_in(dir.path()))
        .build()
        .unwrap()
        .start()
        .unwrap();

    assert!(!process.has_process_alive_file());
    let status = process.wait_and_cleanup().await.unwrap();
    assert_eq!(exit_code(status), 3);
    assert_eq!(process.status(), Status::Finished);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_terminate_without_wrapper_destroys() {
    let dir = tempfile::tempdir().unwrap();
    let process = LaunchBuilder::new(["sleep", "30"])
        .config(&config_in(dir.path()))
        .build()
        .unwrap()
        .start()
        .unwrap();

    process.terminate();
    let status = tokio::time::timeout(Duration::from_secs(10), process.wait_and_cleanup())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());
    assert_eq!(process.status(), Status::Destroyed);
}
