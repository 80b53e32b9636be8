//! Wrapper entry point for Rust-hosted targets.
//!
//! Usage: `lifeline-wrapper <alive-file> <kill-file> <entry-point> [args...]`

use lifeline::wrapper::{self, EntryPoints, WrapperRuntime};
use std::io::Write;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(50);

/// Prints `ready`, waits for a stop request, accepts it, then spends
/// `args[0]` milliseconds (default 500) cleaning up before exiting 0.
fn cooperative(runtime: &WrapperRuntime, args: &[String]) -> i32 {
    let cleanup_ms = args.first().and_then(|a| a.parse().ok()).unwrap_or(500);
    announce("ready");
    while !runtime.wait_for_terminate_request(TICK) {}

    runtime.accept_terminate_request();
    announce("stopping");
    std::thread::sleep(Duration::from_millis(cleanup_ms));
    announce("clean exit");
    0
}

/// Prints `ready` and never looks at stop requests.
fn stubborn(runtime: &WrapperRuntime, _args: &[String]) -> i32 {
    announce("ready");
    loop {
        std::thread::sleep(TICK);
        // Interrupts are cleared and otherwise ignored.
        runtime.main().clear_interrupt();
    }
}

/// Prints its arguments on one line and exits with the status in `args[0]`.
fn exit_with(_runtime: &WrapperRuntime, args: &[String]) -> i32 {
    announce(&args.join(" "));
    args.first().and_then(|a| a.parse().ok()).unwrap_or(0)
}

fn announce(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LIFELINE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let entry_points = EntryPoints::new()
        .register("lifeline.demo.Cooperative", cooperative)
        .register("lifeline.demo.Stubborn", stubborn)
        .register("lifeline.demo.Exit", exit_with);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = wrapper::run(&entry_points, &args);
    let _ = std::io::stdout().flush();
    std::process::exit(code);
}
