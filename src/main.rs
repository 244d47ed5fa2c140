//! tagbridge CLI
//!
//! Command-line front end for the tag query gateway:
//! - Run and delete tag queries
//! - Write tagged points
//! - Run rollup tasks until interrupted
//! - Print a default config file

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagbridge::backend::{Backend, HttpBackend, MemoryBackend};
use tagbridge::config::{generate_default_config, spawn_refresh, Config, LoggingConfig};
use tagbridge::ingest::{DataPoint, Ingestor};
use tagbridge::query::{QueryExecutor, QueryRequest};
use tagbridge::rollup::{IngestSink, RollupScheduler, RollupSink, TracingSink};
use tagbridge::router::Router;
use tagbridge::schema::TagSchemaRegistry;
use tagbridge::types::DataValue;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tagbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tag-based time-series queries over a path-addressed backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Serve from an in-process memory backend instead of the configured instances
    #[arg(long, global = true)]
    pub memory: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a query document and print the result as JSON
    Query {
        /// Query JSON, or @path to read it from a file
        query: String,
        /// Pretty-print the output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Delete every point matched by a query document
    Delete {
        /// Query JSON, or @path to read it from a file
        query: String,
    },

    /// Write a data point
    Write {
        /// Metric name
        metric: String,
        /// Value; anything that does not parse as a number is stored as text
        value: String,
        /// Timestamp (default: now). Supports: "now", ISO 8601, epoch milliseconds
        #[arg(short, long)]
        time: Option<String>,
        /// Tags in key=value format
        #[arg(short = 'T', long)]
        tags: Vec<String>,
    },

    /// Run rollup tasks until interrupted
    Rollup {
        /// Task definition files
        #[arg(required = true)]
        tasks: Vec<PathBuf>,
        /// Only log run summaries instead of storing results under save_as
        #[arg(long)]
        log_only: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Everything a command needs, built from one config snapshot
struct Gateway {
    registry: Arc<TagSchemaRegistry>,
    router: Arc<Router>,
    ingestor: Ingestor,
    executor: QueryExecutor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing config to {}", path.display()))?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging);

    tracing::info!("tagbridge v{}", env!("CARGO_PKG_VERSION"));

    let gateway = build_gateway(&config, cli.memory)?;
    let warmed = gateway.router.prewarm().await;
    tracing::debug!(connections = warmed, "Connection pools warmed");

    match cli.command {
        Commands::Query { query, pretty } => {
            let request = QueryRequest::from_json(&read_document(&query)?)?;
            let response = gateway.executor.execute(&request).await?;
            let out = if pretty {
                serde_json::to_string_pretty(&response)?
            } else {
                serde_json::to_string(&response)?
            };
            println!("{}", out);
        }

        Commands::Delete { query } => {
            let request = QueryRequest::from_json(&read_document(&query)?)?;
            let summary = gateway.executor.delete(&request).await?;
            println!("{}", serde_json::to_string(&summary)?);
            if !summary.failed_targets.is_empty() {
                bail!("delete failed on {:?}", summary.failed_targets);
            }
        }

        Commands::Write {
            metric,
            value,
            time,
            tags,
        } => {
            let mut point = DataPoint::new(metric, parse_timestamp(time.as_deref())?, parse_value(&value));
            for tag in &tags {
                let (key, value) = tag
                    .split_once('=')
                    .with_context(|| format!("tag '{}' is not in key=value format", tag))?;
                point = point.tag(key.trim(), value.trim());
            }
            gateway.ingestor.write(&point).await?;
            println!("Wrote {} at {}", point.metric, point.timestamp);
        }

        Commands::Rollup { tasks, log_only } => {
            run_rollups(&config, cli.config, gateway, &tasks, log_only).await?;
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tagbridge={}", logging.level).into());

    // try_init: tracing may already be set up when embedded
    if logging.format == "json" {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}

fn build_gateway(config: &Config, memory: bool) -> anyhow::Result<Gateway> {
    let registry = if config.schema.persist {
        let path = config.schema.schema_file();
        tracing::info!("Tag schema file: {:?}", path);
        TagSchemaRegistry::open(path, config.schema.max_tag_slots)?
    } else {
        TagSchemaRegistry::new(config.schema.max_tag_slots)
    };
    let registry = Arc::new(registry);

    let backend: Arc<dyn Backend> = if memory {
        tracing::info!("Using in-memory backend");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(HttpBackend::new(config.backend.http_settings())?)
    };

    let router = Arc::new(Router::from_config(config, backend)?);
    let ingestor = Ingestor::new(
        Arc::clone(&registry),
        Arc::clone(&router),
        config.schema.storage_group_count,
    );
    let executor = QueryExecutor::new(Arc::clone(&registry), Arc::clone(&router))
        .with_ingestor(ingestor.clone())
        .with_debug_level(config.debug_level);

    Ok(Gateway {
        registry,
        router,
        ingestor,
        executor,
    })
}

async fn run_rollups(
    config: &Config,
    config_path: Option<PathBuf>,
    gateway: Gateway,
    tasks: &[PathBuf],
    log_only: bool,
) -> anyhow::Result<()> {
    let sink: Arc<dyn RollupSink> = if log_only {
        Arc::new(TracingSink)
    } else {
        Arc::new(IngestSink::new(gateway.ingestor.clone()))
    };
    let scheduler = RollupScheduler::new(gateway.executor.clone(), sink, &config.rollup);

    for path in tasks {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading rollup task {}", path.display()))?;
        let task = scheduler
            .register(&json)
            .with_context(|| format!("registering rollup task {}", path.display()))?;
        println!("Registered rollup {} ({})", task.id, task.definition.name);
    }

    // Routing changes on disk reach the router without a restart
    let refresh = config_path.map(|path| {
        let router = Arc::clone(&gateway.router);
        spawn_refresh(config.clone().into_shared(), path, move |next| {
            if let Err(e) = router.reload(&next.routing) {
                tracing::warn!(error = %e, "Rejected reloaded routing table");
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    scheduler.shutdown();
    if let Some(handle) = refresh {
        handle.abort();
    }
    tracing::info!(metrics = gateway.registry.len(), "tagbridge shutdown complete");
    Ok(())
}

/// Inline JSON, or the contents of the file named after a leading `@`
fn read_document(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("reading query from {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn parse_timestamp(time: Option<&str>) -> anyhow::Result<i64> {
    match time {
        None | Some("now") => Ok(Utc::now().timestamp_millis()),
        Some(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                Ok(dt.timestamp_millis())
            } else if let Ok(ts) = s.parse::<i64>() {
                Ok(ts)
            } else {
                bail!("Invalid timestamp format: {}", s)
            }
        }
    }
}

fn parse_value(value: &str) -> DataValue {
    if let Ok(i) = value.parse::<i64>() {
        DataValue::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        DataValue::Double(f)
    } else {
        DataValue::Text(value.to_string())
    }
}
