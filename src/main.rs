//! thoughtclaw - cognitive particle runtime
//!
//! Usage:
//!   thoughtclaw run < observations.tsv        → one session over stdin, `key<TAB>payload` per line
//!   thoughtclaw run --session-dir ~/.thoughtclaw --cycles 20
//!   thoughtclaw sessions --session-dir ~/.thoughtclaw
//!   thoughtclaw dump-config                   → default config as TOML

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use thoughtclaw_core::{ExactKey, Observation, RuntimeConfig, Tier, TokenJaccard};
use thoughtclaw_heartbeat::{CognitiveRuntime, Cycles, RuntimeBuilder, RuntimeSnapshot, Termination};
use thoughtclaw_memory::SessionStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "thoughtclaw",
    about = "Cognitive particle runtime - tiered memory driven by a heartbeat",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (TOML). Default: ./thoughtclaw.toml
    #[arg(long, global = true)]
    config: Option<String>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed stdin through one session of the heartbeat
    Run {
        /// Directory holding the session continuity file
        #[arg(long)]
        session_dir: Option<String>,
        /// Stop after this many cycles instead of waiting for the input to settle
        #[arg(long)]
        cycles: Option<u64>,
        /// Idle cycles to run after the last observation is consumed
        #[arg(long, default_value_t = 3)]
        settle: u64,
        /// How content keys resonate
        #[arg(long, value_enum, default_value_t = SimilarityKind::Tokens)]
        similarity: SimilarityKind,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the sessions recorded in a session directory
    Sessions {
        #[arg(long)]
        session_dir: String,
    },
    /// Dump the default config as TOML and exit
    DumpConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum SimilarityKind {
    /// Identical keys only
    Exact,
    /// Word overlap between keys
    Tokens,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::DumpConfig = cli.command {
        println!("{}", RuntimeConfig::default().to_toml());
        return Ok(());
    }

    let _guard = init_tracing(cli.log_dir.as_deref());

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(|| PathBuf::from("thoughtclaw.toml"));

    match cli.command {
        Commands::Run {
            session_dir,
            cycles,
            settle,
            similarity,
            json,
        } => {
            let config = RuntimeConfig::load(&config_path)?;
            let mut builder = CognitiveRuntime::builder(config);
            if let Some(dir) = session_dir {
                builder = builder.session_dir(expand_tilde(&dir));
            }
            builder = match similarity {
                SimilarityKind::Exact => builder.similarity(ExactKey),
                SimilarityKind::Tokens => builder.similarity(TokenJaccard),
            };
            run(builder, cycles, settle, json).await?;
        }
        Commands::Sessions { session_dir } => {
            let store = SessionStore::new(expand_tilde(&session_dir));
            let continuity = store.load()?;
            if continuity.sessions.is_empty() {
                println!("No sessions in {}", store.path().display());
            }
            for record in &continuity.sessions {
                let ended = record
                    .ended_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "session {:>4}  started {}  ended {}  cycles {:>6}  promoted {:>4}  basins {:>3}",
                    record.session,
                    record.started_at.to_rfc3339(),
                    ended,
                    record.cycles,
                    record.promoted.len(),
                    record.basins.len()
                );
            }
            println!(
                "{} episodic, {} semantic particles retained",
                continuity.episodic.len(),
                continuity.semantic.len()
            );
        }
        Commands::DumpConfig => {}
    }

    Ok(())
}

async fn run(builder: RuntimeBuilder, cycles: Option<u64>, settle: u64, json: bool) -> anyhow::Result<()> {
    let rt = builder.build()?;

    let token = rt.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping after the current cycle");
            token.cancel();
        }
    });

    let mut feed = rt.basin_feed();
    let printer = tokio::spawn(async move {
        while let Some(item) = feed.next().await {
            match item {
                Ok(t) => println!(
                    "cycle {:>4}  {:<10} {:?} -> {:?}  members {:?}  cumulative {:.3}",
                    t.cycle, t.kind.to_string(), t.before, t.after, t.members, t.cumulative_activation
                ),
                Err(e) => tracing::warn!("Basin feed lagged: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut queued = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (key, payload) = line.split_once('\t').unwrap_or((line, ""));
        rt.ingest(Observation::new(key, payload, Utc::now()));
        queued += 1;
    }
    tracing::info!("Queued {} observations for session {}", queued, rt.session());

    let outcome = match cycles {
        Some(n) => rt.run(Cycles::new(n)).await,
        None => rt.run(Settle::new(settle)).await,
    };
    let snapshot = rt.snapshot();
    let record = rt.close().await?;
    // The runtime is gone, so the feed ends once it drains.
    let _ = printer.await;
    let summary = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*snapshot)?);
    } else {
        print_summary(&snapshot);
    }
    println!(
        "Session {} closed after {} cycles ({} committed, {} abandoned{})",
        record.session,
        record.cycles,
        summary.committed,
        summary.abandoned,
        if summary.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn print_summary(snapshot: &RuntimeSnapshot) {
    for tier in Tier::ALL {
        let particles = snapshot.particles(tier);
        println!("{} ({})", tier, particles.len());
        for p in particles {
            println!("  {:>6}  {:.3}  {}", p.id, p.activation(), p.key);
        }
    }
    for basin in &snapshot.basins {
        println!(
            "basin {}  centroid {}  members {}  cumulative {:.3}",
            basin.id,
            basin.centroid_key,
            basin.members.len(),
            basin.cumulative_activation
        );
    }
    if let Some(decision) = &snapshot.decision {
        println!("last decision: {:?} ({})", decision.action, decision.rationale);
    }
}

/// Runs until every queued observation has been consumed and `quiet`
/// further cycles have passed without input.
struct Settle {
    quiet: u64,
    idle: u64,
    last: u64,
}

impl Settle {
    fn new(quiet: u64) -> Self {
        Self { quiet, idle: 0, last: 0 }
    }
}

impl Termination for Settle {
    fn should_stop(&mut self, snapshot: &RuntimeSnapshot) -> bool {
        if snapshot.cycle != self.last {
            self.last = snapshot.cycle;
            if snapshot.observed == 0 && snapshot.pending == 0 {
                self.idle += 1;
            } else {
                self.idle = 0;
            }
        }
        snapshot.pending == 0 && self.idle >= self.quiet && snapshot.cycle > 0
    }
}

fn init_tracing(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir.map(expand_tilde) {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "thoughtclaw.log"));
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thoughtclaw=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
