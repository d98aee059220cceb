use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticket_dispatch::broker::{self, normalize_text};
use ticket_dispatch::{
    Broker, DatabaseConfig, Ledger, LedgerKind, Producer, TaskEnvelope, TaskKind, Worker,
    WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "ticket-worker")]
#[command(about = "Ticket platform task worker and queue diagnostics", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker loop until Ctrl-C
    Run,

    /// Show queue depths and the latest ledger records
    Status {
        /// Number of recent records to show per ledger
        #[arg(short, long, default_value = "3")]
        limit: usize,
    },

    /// Push a task onto the main queue
    Enqueue {
        /// Task kind, e.g. notify_ticket_created
        kind: String,

        /// Task fields as key=value; values that parse as JSON are kept typed
        #[arg(value_parser = parse_field)]
        fields: Vec<(String, Value)>,
    },

    /// Check broker liveness (exit code 1 when down)
    Ping,

    /// Delete one ledger list
    Clear {
        #[arg(value_enum)]
        ledger: LedgerArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LedgerArg {
    Processed,
    Failed,
}

impl From<LedgerArg> for LedgerKind {
    fn from(arg: LedgerArg) -> Self {
        match arg {
            LedgerArg::Processed => LedgerKind::Processed,
            LedgerArg::Failed => LedgerKind::Failed,
        }
    }
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    if key.is_empty() {
        return Err(format!("empty field name in `{}`", raw));
    }
    Ok((key.to_string(), normalize_text(value.to_string())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing .env is fine; the process environment still applies.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    match args.command {
        Commands::Run => run(config).await,
        Commands::Status { limit } => status(config, limit).await,
        Commands::Enqueue { kind, fields } => enqueue(config, kind, fields).await,
        Commands::Ping => ping(config).await,
        Commands::Clear { ledger } => clear(config, ledger.into()).await,
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let database = DatabaseConfig::from_env().context("invalid database configuration")?;
    let worker = Worker::connect(config, &database).await?;

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    worker.run().await?;
    Ok(())
}

async fn status(config: WorkerConfig, limit: usize) -> anyhow::Result<()> {
    let broker = broker::connect(&config.broker, config.poll_interval).await?;
    let ledger = Ledger::new(broker, config.queues.clone());
    let counts = ledger.counts().await?;

    println!("{} ({})", config.broker.endpoint(), config.broker.substrate());
    println!("  {:<28} {}", config.queues.main(), counts.pending);
    println!("  {:<28} {}", config.queues.processed(), counts.processed);
    println!("  {:<28} {}", config.queues.failed(), counts.failed);

    for (title, kind) in [("processed", LedgerKind::Processed), ("failed", LedgerKind::Failed)] {
        let records = ledger.recent(kind, limit).await?;
        println!("\nLast {} {}:", records.len(), title);
        for record in records {
            println!("  {}", summarize(&record));
        }
    }
    Ok(())
}

fn summarize(record: &Value) -> String {
    let kind = record["task"]["kind"]
        .as_str()
        .or_else(|| record["task"]["raw"].as_str().map(|_| "<raw>"))
        .unwrap_or("?");
    let at = record["processed_at"].as_str().unwrap_or("?");
    match record["error"].as_str() {
        Some(error) => format!("{} {} error: {}", at, kind, error),
        None => format!("{} {}", at, kind),
    }
}

async fn enqueue(
    config: WorkerConfig,
    kind: String,
    fields: Vec<(String, Value)>,
) -> anyhow::Result<()> {
    if TaskKind::parse(&kind).is_none() {
        tracing::warn!(kind = %kind, "Unknown task kind; the worker will ignore it");
    }
    let envelope = fields
        .into_iter()
        .fold(TaskEnvelope::new(kind), |envelope, (name, value)| {
            envelope.with_field(name, value)
        });

    let broker = broker::connect(&config.broker, config.poll_interval).await?;
    let producer = Producer::new(broker, config.queues.clone());
    let len = producer.enqueue(&envelope).await?;
    println!("{} -> {} (length {})", envelope.kind, config.queues.main(), len);
    Ok(())
}

async fn ping(config: WorkerConfig) -> anyhow::Result<()> {
    let broker = broker::connect(&config.broker, config.poll_interval).await?;
    if !broker.ping().await? {
        anyhow::bail!("{} did not answer PONG", config.broker.endpoint());
    }
    println!("PONG from {} ({})", config.broker.endpoint(), config.broker.substrate());
    Ok(())
}

async fn clear(config: WorkerConfig, kind: LedgerKind) -> anyhow::Result<()> {
    let broker = broker::connect(&config.broker, config.poll_interval).await?;
    let ledger = Ledger::new(broker, config.queues.clone());
    let existed = ledger.clear(kind).await?;
    println!("{:?} ledger {}", kind, if existed { "cleared" } else { "was already empty" });
    Ok(())
}
