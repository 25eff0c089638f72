//! HTC agent - main entry point.
//!
//! Subcommands:
//! - `serve pubsub-pull`: pull requests from a subscription, publish responses
//! - `serve pubsub-push`: accept push deliveries over HTTP, publish responses
//! - `serve file`: process a newline-delimited file serially
//! - `loadtest grpc`: drive the backend directly from a payload file
//! - `loadtest pubsub`: publish payloads to a topic and time the round trip

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use htc_agent::agent::{process_file, DeliveryAgent};
use htc_agent::broker::{PubSubClient, Subscription};
use htc_agent::invoke::{ByteInvoker, Encoding};
use htc_agent::loadgen::{run_invoke_load, run_publish_load};
use htc_agent::observability::{init_tracing, LogOptions};
use htc_agent::stats::StatsService;
use htc_agent::{Config, Result};

/// Grace period between the first shutdown signal and a forced exit.
const FORCED_EXIT_AFTER: Duration = Duration::from_secs(15);

fn parse_duration(s: &str) -> std::result::Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(s)
}

#[derive(Parser, Debug)]
#[command(name = "htc-agent", version, about = "High-throughput compute agent")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "HTC_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Statistics report frequency
    #[arg(long, global = true, value_parser = parse_duration)]
    freq: Option<Duration>,

    /// Log every task start and completion
    #[arg(long, global = true)]
    log_all: bool,

    /// Log (and report statistics) as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Backend endpoint, http(s)://<host>(:<port>)?/<service>/<method>
    #[arg(long, global = true, env = "HTC_AGENT_ENDPOINT")]
    endpoint: Option<String>,

    /// Backend call timeout
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Project hosting the Pub/Sub topics and subscriptions
    #[arg(long, global = true, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    /// Hostname attached to response messages
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Encoding of request payloads
    #[arg(long, global = true)]
    input_encoding: Option<Encoding>,

    /// Encoding of response payloads
    #[arg(long, global = true)]
    output_encoding: Option<Encoding>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker
    #[command(subcommand)]
    Serve(ServeCommand),

    /// Generate test load
    #[command(subcommand)]
    Loadtest(LoadtestCommand),
}

#[derive(Subcommand, Debug)]
enum ServeCommand {
    /// Pub/Sub pull and publish worker
    PubsubPull {
        subscription: String,
        topic: String,

        /// Shut down after no activity for this long
        #[arg(long, value_parser = parse_duration)]
        idle_timeout: Option<Duration>,

        /// Minimum deadline extension for processing tasks
        #[arg(long, value_parser = parse_duration)]
        min_extension: Option<Duration>,

        /// Maximum deadline for processing tasks
        #[arg(long, value_parser = parse_duration)]
        max_extension: Option<Duration>,

        /// Concurrent receive loops
        #[arg(long, alias = "goroutines")]
        pull_concurrency: Option<usize>,

        /// Maximum messages outstanding
        #[arg(long)]
        max_outstanding: Option<usize>,

        /// Handle messages inline in the receive loops
        #[arg(long)]
        synchronous: bool,
    },

    /// Pub/Sub push endpoint and publish worker
    PubsubPush {
        topic: String,

        /// Listen port
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Read newline-delimited requests and write one response per line
    File { input: PathBuf, output: PathBuf },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Newline-delimited payload file
    #[arg(long)]
    source: Option<PathBuf>,

    /// Loop over the source until cancelled
    #[arg(long = "loop")]
    looped: bool,

    /// Operations per second (0 = no limit)
    #[arg(long)]
    rate: Option<f64>,

    /// Duration of the ramp to the full rate (0 = no ramp)
    #[arg(long, value_parser = parse_duration)]
    ramp: Option<Duration>,

    /// Number of ramp steps
    #[arg(long)]
    ramp_steps: Option<u32>,

    /// Maximum parallel operations (0 = serial)
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Maximum published requests awaiting confirmation
    #[arg(long)]
    max_outstanding: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum LoadtestCommand {
    /// Backend round trip throughput and latency
    Grpc {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Pub/Sub round trip throughput and latency
    Pubsub {
        topic: String,
        subscription: Option<String>,

        #[command(flatten)]
        source: SourceArgs,
    },
}

impl SourceArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.source {
            config.source.path = Some(path.clone());
        }
        config.source.looped |= self.looped;
        if let Some(rate) = self.rate {
            config.source.rate = rate;
        }
        if let Some(ramp) = self.ramp {
            config.source.ramp = ramp;
        }
        if let Some(ramp_steps) = self.ramp_steps {
            config.source.ramp_steps = ramp_steps;
        }
        if let Some(max_parallel) = self.max_parallel {
            config.source.max_parallel = max_parallel;
        }
        if let Some(max_outstanding) = self.max_outstanding {
            config.source.max_outstanding = max_outstanding;
        }
    }
}

/// Config file first, then flags and environment on top.
fn configure(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    if let Some(freq) = cli.freq {
        config.stats.freq = freq;
    }
    config.stats.log_all |= cli.log_all;
    config.stats.log_json |= cli.log_json;
    config.stats.debug |= cli.debug;
    if let Some(endpoint) = &cli.endpoint {
        config.backend.endpoint = Some(endpoint.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.backend.timeout = timeout;
    }
    if let Some(project) = &cli.project {
        config.pubsub.project = Some(project.clone());
    }
    if let Some(hostname) = &cli.hostname {
        config.hostname = Some(hostname.clone());
    }
    if let Some(input) = cli.input_encoding {
        config.encoding.input = input;
    }
    if let Some(output) = cli.output_encoding {
        config.encoding.output = output;
    }

    match &cli.command {
        Command::Serve(ServeCommand::PubsubPull {
            idle_timeout,
            min_extension,
            max_extension,
            pull_concurrency,
            max_outstanding,
            synchronous,
            ..
        }) => {
            if idle_timeout.is_some() {
                config.stats.idle_timeout = *idle_timeout;
            }
            if let Some(min_extension) = min_extension {
                config.receive.min_extension = *min_extension;
            }
            if let Some(max_extension) = max_extension {
                config.receive.max_extension = *max_extension;
            }
            if let Some(pull_concurrency) = pull_concurrency {
                config.receive.pull_concurrency = *pull_concurrency;
            }
            if let Some(max_outstanding) = max_outstanding {
                config.receive.max_outstanding = *max_outstanding;
            }
            config.receive.synchronous |= *synchronous;
        }
        Command::Serve(ServeCommand::PubsubPush { port, .. }) => {
            if let Some(port) = port {
                config.push.port = *port;
            }
        }
        Command::Serve(ServeCommand::File { .. }) => {}
        Command::Loadtest(LoadtestCommand::Grpc { source })
        | Command::Loadtest(LoadtestCommand::Pubsub { source, .. }) => source.apply(&mut config),
    }

    config.validate()?;
    Ok(config)
}

fn spawn_stats(config: &Config, cancel: CancellationToken) -> StatsService {
    let stats = StatsService::spawn(&config.stats, cancel);
    if config.stats.idle_timeout.is_some() {
        stats.handle().set_idle_timeout(config.stats.idle_timeout);
    }
    stats
}

async fn run(command: Command, config: Config, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Serve(ServeCommand::PubsubPull {
            subscription,
            topic,
            ..
        }) => {
            tracing::debug!(%subscription, %topic, "subscribing");
            let client = PubSubClient::from_config(&config.pubsub)?;
            let agent =
                DeliveryAgent::connect(&config, Arc::new(client.topic(&topic)), cancel).await?;
            agent
                .run_pull(Arc::new(client.subscription(&subscription, &config.receive)))
                .await
        }
        Command::Serve(ServeCommand::PubsubPush { topic, .. }) => {
            let client = PubSubClient::from_config(&config.pubsub)?;
            let agent =
                DeliveryAgent::connect(&config, Arc::new(client.topic(&topic)), cancel).await?;
            let listener = TcpListener::bind(("0.0.0.0", config.push.port)).await?;
            agent.run_push(listener).await
        }
        Command::Serve(ServeCommand::File { input, output }) => {
            let encoding = config.encoding;
            let invoker = ByteInvoker::from_config(&config, encoding.input, encoding.output).await?;
            let stats = spawn_stats(&config, cancel.clone());
            let result = process_file(&input, &output, &invoker, &stats.handle(), cancel).await;
            stats.stop().await;
            result.map(|_| ())
        }
        Command::Loadtest(LoadtestCommand::Grpc { .. }) => {
            let encoding = config.encoding;
            let invoker = ByteInvoker::from_config(&config, encoding.input, encoding.output).await?;
            let stats = spawn_stats(&config, cancel.clone());
            let result =
                run_invoke_load(&config.source, Arc::new(invoker), stats.handle(), cancel).await;
            stats.stop().await;
            result
        }
        Command::Loadtest(LoadtestCommand::Pubsub {
            topic,
            subscription,
            ..
        }) => {
            let client = PubSubClient::from_config(&config.pubsub)?;
            let responses = subscription.map(|name| {
                Arc::new(client.subscription(&name, &config.receive)) as Arc<dyn Subscription>
            });
            let stats = spawn_stats(&config, cancel.clone());
            let result = run_publish_load(
                &config.source,
                Arc::new(client.topic(&topic)),
                responses,
                stats.handle(),
                cancel,
            )
            .await;
            stats.stop().await;
            result
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// First signal cancels; a second one, or the grace period, forces an exit.
async fn watch_signals(cancel: CancellationToken) {
    if let Err(e) = shutdown_signal().await {
        tracing::warn!(error = %e, "signal handling unavailable");
        return;
    }
    tracing::info!("received shutdown signal, finishing in-flight work");
    cancel.cancel();

    tokio::select! {
        _ = shutdown_signal() => tracing::warn!("second shutdown signal, exiting now"),
        _ = tokio::time::sleep(FORCED_EXIT_AFTER) => {
            tracing::warn!(grace = ?FORCED_EXIT_AFTER, "shutdown timed out, exiting now");
        }
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match configure(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(LogOptions::from(&config.stats));

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    match run(cli.command, config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            tracing::info!(reason = %e, "cancelled");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
