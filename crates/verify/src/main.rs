use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cluster_verify::{
    config::{Config, LogFormat},
    install::{InstallCheck, InstallOptions},
    job::{JobLogCoordinator, JobTarget, JobVerifyOptions},
    kubernetes::KubeResourceClient,
    metrics,
    observe::{EventWatcher, StopSignal, WatchOptions, WatchOutcome},
    sinks::{FanoutSink, FileSink, LogSink, StdoutSink},
};

#[derive(Parser)]
#[command(
    name = "cluster-verify",
    version,
    about = "Verifies that Kubernetes workloads become ready or finish in time"
)]
struct Cli {
    /// Print the collected metrics before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Waits until a number of pods in a namespace are ready
    Pods(PodsArgs),
    /// Verifies that a Job succeeds, tailing its logs as it runs
    Job(JobArgs),
    /// Verifies that every pod of an installation is ready
    Install(InstallArgs),
}

#[derive(Args)]
struct PodsArgs {
    #[arg(short, long)]
    namespace: Option<String>,

    /// Only count pods matching this label selector
    #[arg(short, long, default_value = "")]
    selector: String,

    /// Number of ready pods to wait for
    #[arg(short, long, default_value_t = 2)]
    count: usize,

    /// How long to wait for the initial pod and event listings
    #[arg(long, value_parser = humantime::parse_duration)]
    sync_timeout: Option<Duration>,
}

#[derive(Args)]
struct JobArgs {
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector of the Job; the newest match is verified
    #[arg(short = 'l', long, conflicts_with = "name", required_unless_present = "name")]
    selector: Option<String>,

    /// Exact name of the Job
    #[arg(long)]
    name: Option<String>,

    /// Container to tail; defaults to the first container of the pod
    #[arg(short, long)]
    container: Option<String>,

    /// How long to wait for the Job to finish
    #[arg(short, long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Time between polls for an active Job or Pod
    #[arg(long, value_parser = humantime::parse_duration)]
    poll: Option<Duration>,

    /// Check the result line in the log of the last pod
    #[arg(long)]
    verify_result: bool,

    /// Report failures as a result line and exit successfully
    #[arg(long)]
    log_fail: bool,

    /// Do not tail the pod logs
    #[arg(long)]
    no_tail: bool,

    /// Also append the tailed logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Args)]
struct InstallArgs {
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector of the pods to check
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Include pipeline build pods
    #[arg(long)]
    include_build: bool,

    /// How long to wait for the pods to be ready
    #[arg(short = 'w', long, value_parser = humantime::parse_duration)]
    pod_wait_time: Option<Duration>,

    /// Time between checks
    #[arg(short, long, value_parser = humantime::parse_duration)]
    poll: Option<Duration>,

    /// Write the logs of failed pods to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let fmt_layer = match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Stops on Ctrl-C.
fn stop_on_ctrl_c() -> StopSignal {
    let stop = StopSignal::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            signal.stop();
        }
    });
    stop
}

async fn connect(namespace: Option<String>, config: &Config) -> anyhow::Result<(Arc<KubeResourceClient>, String)> {
    let client = KubeResourceClient::new()
        .await
        .context("failed to create kubernetes client")?;
    let namespace = namespace
        .or_else(|| config.kube.namespace.clone())
        .unwrap_or_else(|| client.default_namespace().to_string());
    Ok((Arc::new(client), namespace))
}

async fn verify_pods(args: PodsArgs, config: &Config, stop: StopSignal) -> anyhow::Result<()> {
    let (client, namespace) = connect(args.namespace, config).await?;
    let options = WatchOptions {
        target_ready: args.count,
        sync_timeout: args.sync_timeout.unwrap_or(config.timing.sync_timeout),
    };

    let watcher = EventWatcher::new(client, &namespace, options).with_selector(&args.selector);
    let handle = watcher.start(stop).await;
    match handle.wait().await? {
        WatchOutcome::TargetReached { ready } => {
            info!("pods ready in namespace {}: {}", namespace, ready.join(", "));
            Ok(())
        }
        WatchOutcome::Stopped => bail!("stopped before {} pods were ready", args.count),
        WatchOutcome::StreamEnded => bail!("watch of namespace {} ended unexpectedly", namespace),
    }
}

async fn verify_job(args: JobArgs, config: &Config, stop: StopSignal) -> anyhow::Result<()> {
    let target = match (args.name, args.selector) {
        (Some(name), _) => JobTarget::Name(name),
        (None, Some(selector)) => JobTarget::Selector(selector),
        (None, None) => bail!("either --name or --selector is required"),
    };
    let (client, namespace) = connect(args.namespace, config).await?;

    let options = JobVerifyOptions {
        container: args.container,
        duration: args.duration.unwrap_or(config.timing.job_duration),
        poll_period: args.poll.unwrap_or(config.timing.poll_period),
        verify_result: args.verify_result,
        log_fail: args.log_fail,
        no_tail: args.no_tail,
        ..JobVerifyOptions::new(&namespace, target)
    };

    let stdout: Arc<dyn LogSink> = Arc::new(StdoutSink::new(None, config.logging.sink_format));
    let sink: Arc<dyn LogSink> = match args.log_file {
        Some(path) => {
            let file = FileSink::create(&path, config.logging.sink_format)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Arc::new(FanoutSink::new(vec![stdout, Arc::new(file)]))
        }
        None => stdout,
    };

    let coordinator = JobLogCoordinator::new(client, options, sink);
    tokio::select! {
        res = coordinator.run_reporting() => Ok(res?),
        _ = stop.stopped() => bail!("job verification interrupted"),
    }
}

async fn verify_install(args: InstallArgs, config: &Config, stop: StopSignal) -> anyhow::Result<()> {
    let (client, namespace) = connect(args.namespace, config).await?;
    let options = InstallOptions {
        selector: args.selector,
        include_build_pods: args.include_build,
        wait: args.pod_wait_time.unwrap_or(config.timing.install_wait),
        poll_period: args.poll.unwrap_or(InstallOptions::new(&namespace).poll_period),
        log_file: args.log_file,
        ..InstallOptions::new(&namespace)
    };

    let check = InstallCheck::new(client, options);
    let (report, result) = tokio::select! {
        res = check.run() => res,
        _ = stop.stopped() => bail!("install verification interrupted"),
    };
    print!("{}", report);
    Ok(result?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);
    metrics::register_metrics();

    let stop = stop_on_ctrl_c();
    let result = match cli.command {
        Command::Pods(args) => verify_pods(args, &config, stop).await,
        Command::Job(args) => verify_job(args, &config, stop).await,
        Command::Install(args) => verify_install(args, &config, stop).await,
    };

    if cli.print_metrics {
        print!("{}", metrics::gather_metrics());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
