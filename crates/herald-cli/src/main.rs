mod todo;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use herald_core::app::{DispatcherBuilder, DispatcherConfig};
use herald_core::impls::{
    InMemoryOutboxStore, InMemoryStreamPublisher, SqliteOutboxStore, TracingPublisher,
};
use herald_core::ports::OutboxStore;
use herald_core::{Event, OutboxId};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::todo::{TodoCreated, TodoService, TodoTable};

#[derive(Debug, Parser)]
#[command(name = "herald", version, about = "Transactional outbox relay")]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "HERALD_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create todos, then relay their events through a flaky in-memory broker.
    Demo {
        #[arg(long, default_value_t = 5)]
        todos: usize,

        /// Publish calls to fail before the broker "recovers".
        #[arg(long, default_value_t = 2)]
        fail_first: usize,

        /// Use a SQLite file instead of the in-memory store.
        #[arg(long)]
        sqlite: Option<PathBuf>,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },

    /// Create one todo and its outbox event in a single transaction.
    CreateTodo {
        #[arg(long, env = "HERALD_DB")]
        db: PathBuf,

        #[arg(long)]
        description: String,

        /// RFC 3339 due date.
        #[arg(long)]
        due: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Relay pending events until Ctrl-C. Events are logged, not sent anywhere.
    Dispatch {
        #[arg(long, env = "HERALD_DB")]
        db: PathBuf,

        #[arg(long, env = "HERALD_STREAM", default_value = "todo-events")]
        stream: String,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },

    /// Print outbox counts as JSON.
    Stats {
        #[arg(long, env = "HERALD_DB")]
        db: PathBuf,
    },

    /// Move a dead-lettered row back to pending.
    Requeue {
        #[arg(long, env = "HERALD_DB")]
        db: PathBuf,

        /// `outbox-42` or `42`.
        id: OutboxId,
    },
}

/// Dispatcher settings. Flags win over the config file, which wins over
/// the defaults.
#[derive(Debug, Clone, Args)]
struct DispatchArgs {
    /// JSON file with `DispatcherConfig` fields.
    #[arg(long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "HERALD_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "HERALD_LEASE_SECS")]
    lease_secs: Option<u64>,

    #[arg(long, env = "HERALD_TICK_MS")]
    tick_ms: Option<u64>,

    #[arg(long, env = "HERALD_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,
}

impl DispatchArgs {
    fn resolve(&self, defaults: DispatcherConfig) -> anyhow::Result<DispatcherConfig> {
        let mut config = match &self.config {
            Some(path) => DispatcherConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => defaults,
        };
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.lease_secs {
            config.lease_secs = v;
        }
        if let Some(v) = self.tick_ms {
            config.tick_interval_ms = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_sqlite(path: &Path) -> anyhow::Result<Arc<SqliteOutboxStore>> {
    let store = SqliteOutboxStore::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Demo {
            todos,
            fail_first,
            sqlite,
            dispatch,
        } => {
            // fast ticks so the demo finishes in seconds
            let config = dispatch.resolve(DispatcherConfig {
                tick_interval_ms: 200,
                backoff_base_ms: 250,
                ..DispatcherConfig::default()
            })?;
            match sqlite {
                Some(path) => run_demo(open_sqlite(&path).await?, todos, fail_first, config).await,
                None => {
                    let store = Arc::new(InMemoryOutboxStore::new());
                    run_demo(store, todos, fail_first, config).await
                }
            }
        }
        Command::CreateTodo {
            db,
            description,
            due,
        } => {
            let store = open_sqlite(&db).await?;
            let item = TodoService::new(store).create(description, due).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
            Ok(())
        }
        Command::Dispatch {
            db,
            stream,
            dispatch,
        } => {
            let store = open_sqlite(&db).await?;
            let dispatcher = DispatcherBuilder::new(store)
                .config(dispatch.resolve(DispatcherConfig::default())?)
                .publish::<TodoCreated, _>(Arc::new(TracingPublisher), stream)?
                .expect_event_types(&[TodoCreated::EVENT_TYPE])
                .build()?;

            let cancel = CancellationToken::new();
            let handle = dispatcher.spawn(cancel.clone());
            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received, shutting down");
            cancel.cancel();
            handle.await?;
            Ok(())
        }
        Command::Stats { db } => {
            let store = open_sqlite(&db).await?;
            let counts = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Requeue { db, id } => {
            let store = open_sqlite(&db).await?;
            store.requeue_dead(id).await?;
            match store.get(id).await? {
                Some(row) => println!("{id}: {} (attempts={})", row.status, row.attempts),
                None => bail!("{id} disappeared after requeue"),
            }
            Ok(())
        }
    }
}

async fn run_demo<S: TodoTable + 'static>(
    store: Arc<S>,
    todos: usize,
    fail_first: usize,
    config: DispatcherConfig,
) -> anyhow::Result<()> {
    store.ensure_schema().await?;
    let service = TodoService::new(Arc::clone(&store));
    for n in 1..=todos {
        let item = service.create(format!("demo todo #{n}"), None).await?;
        info!(todo_id = %item.id, "created todo");
    }

    let publisher = Arc::new(InMemoryStreamPublisher::new());
    publisher.fail_next(fail_first).await;
    let dispatcher = DispatcherBuilder::new(Arc::clone(&store))
        .config(config)
        .publish::<TodoCreated, _>(Arc::clone(&publisher), "todo-events")?
        .expect_event_types(&[TodoCreated::EVENT_TYPE])
        .build()?;

    let cancel = CancellationToken::new();
    let handle = dispatcher.spawn(cancel.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let counts = loop {
        let counts = store.counts().await?;
        if counts.pending == 0 || tokio::time::Instant::now() >= deadline {
            break counts;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    cancel.cancel();
    handle.await?;

    for event in publisher.published().await {
        println!(
            "{} {} key={} {}",
            event.outbox_id,
            event.event_type,
            event.key,
            event.payload_str().unwrap_or("<binary>")
        );
    }
    println!(
        "publish calls={} {}",
        publisher.attempts().await,
        serde_json::to_string(&counts)?
    );
    if counts.pending > 0 {
        bail!("{} rows still pending after 60s", counts.pending);
    }
    Ok(())
}
