use anyhow::{bail, Context};
use binlog_capture::pipeline::{self, PipelineComponents, StartOverrides};
use binlog_capture::producer::run_diagnostics;
use binlog_capture::{Config, Position};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "binlog-capture")]
#[command(about = "Binary-log change data capture with restart-safe delivery", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, value_name = "FILE:OFFSET", help = "Start here instead of the stored checkpoint")]
    start_position: Option<String>,

    #[arg(long, value_name = "HEARTBEAT", help = "Stop once this heartbeat has been processed")]
    stop_at_heartbeat: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting binlog-capture");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    let overrides = StartOverrides {
        start_position: args
            .start_position
            .as_deref()
            .map(Position::parse)
            .transpose()
            .context("parsing --start-position")?,
        stop_at_heartbeat: args.stop_at_heartbeat,
    };

    info!(
        client_id = %config.replication.client_id,
        source = ?config.source.path,
        producer = ?config.producer.kind,
        checkpoint_store = ?config.checkpoint.store,
        "Configuration summary"
    );

    let components = PipelineComponents::from_config(&config)
        .await
        .context("building pipeline components")?;

    if let Some(diagnostic) = components.producer.diagnostic() {
        let report = run_diagnostics(&[diagnostic], DIAGNOSTIC_TIMEOUT).await;
        if !report.success {
            bail!("producer diagnostics failed: {:?}", report.checks);
        }
    }

    let handle = pipeline::start_with(&config, components, overrides)
        .await
        .context("starting replication")?;

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the open transaction");
            stop.cancel();
        }
    });

    let stop_timeout = Duration::from_millis(config.replication.stop_timeout_ms);
    match handle.wait(stop_timeout).await {
        Ok(()) => {
            info!("Replication stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Replication failed");
            Err(e.into())
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("binlog_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("binlog_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
