//! Conductor CLI: run the experiment coordinator or one peer.
//!
//! The `coordinate` subcommand blocks until every expected peer has
//! rendezvoused and disconnected again. The `peer` subcommand registers
//! with the coordinator, waits for `go`, then executes its share of the
//! scenario timeline.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_core::{ScenarioParser, ScenarioRunner};
use conductor_sync::{ClientConfig, Coordinator, CoordinatorConfig, SyncClient};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Synchronized start and scripted timelines for distributed experiments", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous coordinator.
    Coordinate {
        /// Address to listen on.
        #[arg(short, long, env = "CONDUCTOR_LISTEN", default_value = "0.0.0.0:7999")]
        listen: String,

        /// Number of peers to wait for.
        #[arg(short, long, env = "CONDUCTOR_EXPECTED_PEERS")]
        peers: usize,

        /// Seconds between table distribution and the go signal.
        #[arg(long, env = "CONDUCTOR_POST_DELAY", default_value = "5.0")]
        post_delay: f64,

        /// Seconds to keep waiting after a peer is lost before readiness.
        #[arg(long, env = "CONDUCTOR_GRACE", default_value = "30.0")]
        grace: f64,
    },

    /// Run one experiment peer.
    Peer {
        /// Coordinator address.
        #[arg(short, long, env = "CONDUCTOR_COORDINATOR", default_value = "127.0.0.1:7999")]
        coordinator: String,

        /// Scenario file to execute.
        #[arg(short, long, env = "CONDUCTOR_SCENARIO")]
        scenario: PathBuf,

        /// Metadata pair to publish at the barrier (repeatable).
        #[arg(short = 'm', long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,

        /// Root for resolving relative &include paths (project level).
        #[arg(long, env = "CONDUCTOR_PROJECT_ROOT")]
        project_root: Option<PathBuf>,

        /// Root for resolving relative &include paths (experiment level).
        #[arg(long, env = "CONDUCTOR_EXPERIMENT_ROOT")]
        experiment_root: Option<PathBuf>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match args.command {
        Command::Coordinate {
            listen,
            peers,
            post_delay,
            grace,
        } => {
            let config = CoordinatorConfig::new(listen, peers)
                .with_post_delay(Duration::from_secs_f64(post_delay))
                .with_grace_period(Duration::from_secs_f64(grace));
            let coordinator = Coordinator::bind(config)
                .await
                .context("Failed to start coordinator")?;
            let report = coordinator.run().await.context("Barrier failed")?;
            info!(
                "Experiment started for {} peers (clock spread {:.3}s..{:.3}s)",
                report.peers, report.min_clock_offset, report.max_clock_offset
            );
        }

        Command::Peer {
            coordinator,
            scenario,
            meta,
            project_root,
            experiment_root,
        } => {
            let mut parser = ScenarioParser::new();
            if let Some(root) = project_root {
                parser = parser.with_project_root(root);
            }
            if let Some(root) = experiment_root {
                parser = parser.with_experiment_root(root);
            }
            let events = parser
                .parse_file(&scenario)
                .with_context(|| format!("Failed to read scenario {}", scenario.display()))?;

            let mut runner = ScenarioRunner::new();
            register_builtin_actions(&mut runner);
            runner.add_events(events);

            let mut config = ClientConfig::new(coordinator);
            for (key, value) in meta {
                config = config.with_var(key, value);
            }

            let synced = SyncClient::new(config)
                .rendezvous()
                .await
                .context("Rendezvous with coordinator failed")?;
            info!(
                "Running as peer {} of {}",
                synced.peer_id,
                synced.table.len()
            );
            synced.drive(&runner).await;
            info!("Scenario complete");
        }
    }

    Ok(())
}

/// Actions every peer understands without adapter code.
fn register_builtin_actions(runner: &mut ScenarioRunner) {
    runner.register("echo", |event| {
        info!("echo: {}", event.args.join(" "));
    });
    runner.register("annotate", |event| {
        info!(
            "=== {} ===",
            event.args.first().map(String::as_str).unwrap_or("")
        );
    });
    let stop = runner.stop_flag();
    runner.register("stop", move |_event| {
        info!("Stop requested by scenario");
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    });
}
