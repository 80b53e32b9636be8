use clap::{Args, Parser, Subcommand};
use lifeline::process::exit_code;
use lifeline::{CooperativeProcess, LaunchBuilder, LaunchError, LifelineConfig, Terminate};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Launch a child process and stop it cooperatively: a first request asks
/// the child to wind down, a second makes it stop, and a hard destroy
/// follows if it still has not exited.
#[derive(Parser, Debug)]
#[command(name = "lifeline", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "lifeline.toml", global = true)]
    config: PathBuf,

    /// Debug logging (launch decisions, sentinel paths)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn the command and supervise it until it exits
    Run(RunArgs),
    /// Print the command that would be spawned, as JSON, without spawning it
    Plan(LaunchArgs),
}

#[derive(Args, Debug)]
struct LaunchArgs {
    /// Launch through this native wrapper executable; the first command
    /// token is then the entry point
    #[arg(long, value_name = "PATH")]
    wrapper: Option<String>,

    /// Working directory for the child
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Request a graceful stop after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Seconds between the graceful request and kill (overrides config)
    #[arg(long, value_name = "SECS")]
    grace: Option<u64>,

    /// Seconds between kill and destroy (overrides config)
    #[arg(long, value_name = "SECS")]
    kill_grace: Option<u64>,

    /// Discard the child's stdout and stderr
    #[arg(long)]
    no_forward: bool,

    #[command(flatten)]
    launch: LaunchArgs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match LifelineConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("lifeline: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Command::Run(args) => run(args, &config).await,
        Command::Plan(args) => plan(&args, &config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "lifeline failed");
            eprintln!("lifeline: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    // stdout carries the child's output, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn builder(args: &LaunchArgs, config: &LifelineConfig) -> Result<LaunchBuilder, LaunchError> {
    let mut builder = match &args.wrapper {
        Some(wrapper) => {
            let (entry, rest) = args
                .command
                .split_first()
                .ok_or(LaunchError::EmptyCommand)?;
            LaunchBuilder::native_wrapper(wrapper.as_str(), entry.as_str(), rest.iter().cloned())
        }
        None => LaunchBuilder::new(args.command.iter().cloned()),
    }
    .config(config);

    if let Some(cwd) = &args.cwd {
        builder = builder.working_dir(cwd);
    }
    Ok(builder)
}

fn plan(args: &LaunchArgs, config: &LifelineConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let spec = builder(args, config)?.build()?;
    println!("{}", serde_json::to_string_pretty(&spec.plan())?);
    // Dropping the launch spec removes the sentinel files it created.
    drop(spec);
    Ok(0)
}

async fn run(args: RunArgs, config: &LifelineConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let mut builder = builder(&args.launch, config)?.process_group(true);
    if args.no_forward {
        builder = builder.forward_output(false);
    }
    let process = builder.build()?.start()?;
    // Nothing feeds the child; close its stdin so reads see EOF.
    drop(process.process().take_stdin());

    let escalation = Escalation {
        grace: args
            .grace
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.shutdown.grace()),
        kill_grace: args
            .kill_grace
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.shutdown.kill_grace()),
    };
    let deadline = args
        .timeout
        .and_then(|secs| deadline_after(Duration::from_secs(secs)));

    supervise(&process, deadline, escalation).await;

    let status = process.wait_and_cleanup().await?;
    tracing::info!(
        status = %process.status(),
        exit = ?status.code(),
        "child exited"
    );
    Ok(exit_code(status))
}

/// `delay` from now, or `None` (never) when that is past what `Instant` can hold.
fn deadline_after(delay: Duration) -> Option<Instant> {
    Instant::now().checked_add(delay)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Running,
    Terminating,
    Killing,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
struct Escalation {
    grace: Duration,
    kill_grace: Duration,
}

impl Escalation {
    /// Move to the next stage and return when the one after it is due.
    fn advance(&self, process: &CooperativeProcess, stage: &mut Stage) -> Option<Instant> {
        match *stage {
            Stage::Running => {
                tracing::info!(grace_secs = self.grace.as_secs(), "requesting graceful stop");
                process.terminate();
                *stage = Stage::Terminating;
                deadline_after(self.grace)
            }
            Stage::Terminating => {
                tracing::info!(kill_grace_secs = self.kill_grace.as_secs(), "requesting kill");
                process.kill();
                *stage = Stage::Killing;
                deadline_after(self.kill_grace)
            }
            Stage::Killing => {
                tracing::warn!("child still running, destroying");
                process.destroy();
                *stage = Stage::Destroyed;
                None
            }
            Stage::Destroyed => None,
        }
    }
}

/// Wait for the child, escalating on Ctrl-C or when a deadline passes.
async fn supervise(process: &CooperativeProcess, mut deadline: Option<Instant>, escalation: Escalation) {
    let mut stage = Stage::Running;
    loop {
        let due = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = process.wait_for() => return,
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                    let _ = process.wait_for().await;
                    return;
                }
                tracing::info!(stage = ?stage, "interrupt received");
            }
            _ = due => {
                tracing::info!(stage = ?stage, "deadline reached");
            }
        }
        deadline = escalation.advance(process, &mut stage);
    }
}
