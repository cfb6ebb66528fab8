// Quota Relay - Main Entry Point
//
// This binary wires the relay together from a config file:
// - Response listener and correlation sweeper (listen)
// - One-shot invocations through the queue (invoke)
// - Bucket store inspection (buckets)
// - Config validation (check-config)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quota_relay::config::{Config, DEFAULT_CONFIG_FILE};
use quota_relay::{logging, metrics_server};
use quota_relay::rate_limit::{AdmissionController, BucketStore, SqliteBucketStore};
use quota_relay::relay::{
    CorrelationTable, HttpQueueTransport, RelayClient, RequestOrchestrator, RequestSpec,
    ResponseListener,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Quota Relay: rate-limited, queue-decoupled request/response relay
#[derive(Parser, Debug)]
#[command(name = "quota-relay")]
#[command(version)]
#[command(about = "Rate-limited request/response relay over a durable queue", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the response listener until Ctrl-C
    Listen,
    /// Relay a single request and print the response
    Invoke {
        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Absolute target URL
        #[arg(long)]
        url: String,

        /// Request header, repeatable
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Request body
        #[arg(long)]
        body: Option<String>,

        /// Timeout in milliseconds (config default when omitted)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List every bucket in the store
    Buckets,
    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_from_path(&args.config)
        .with_context(|| format!("Invalid configuration in {:?}", args.config))?;
    logging::init(&config.logging, args.verbose)?;

    match args.command {
        Commands::Listen => listen(config).await,
        Commands::Invoke {
            method,
            url,
            headers,
            body,
            timeout_ms,
        } => {
            let mut spec = RequestSpec::new(method, url);
            for header in headers {
                let (name, value) = parse_header(&header)?;
                spec = spec.with_header(name, value);
            }
            if let Some(body) = body {
                spec = spec.with_body(body.into_bytes());
            }
            invoke(config, spec, timeout_ms.map(Duration::from_millis)).await
        }
        Commands::Buckets => list_buckets(&config).await,
        Commands::CheckConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", text);
            Ok(())
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("Invalid header {:?}, expected NAME:VALUE", raw),
    }
}

fn open_store(config: &Config) -> Result<SqliteBucketStore> {
    SqliteBucketStore::open(
        &config.buckets.database_path,
        config.buckets.defaults(),
        config.buckets.busy_timeout(),
    )
    .with_context(|| {
        format!(
            "Failed to open bucket store at {:?}",
            config.buckets.database_path
        )
    })
}

/// Start the metrics server in the background when enabled
fn spawn_metrics(config: &Config, cancel: &CancellationToken) {
    if !config.metrics.enabled {
        return;
    }
    let port = config.metrics.port;
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server::start_metrics_server(port, cancel).await {
            warn!("Metrics server stopped: {:#}", e);
        }
    });
}

async fn listen(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let table = Arc::new(CorrelationTable::new());

    let listener = ResponseListener::bind(
        &config.listener.bind_address,
        table.clone(),
        config.listener.max_frame_size,
    )
    .await?;
    let port = listener.local_addr()?.port();
    info!(
        "Advertising return address {}",
        config.listener.return_address(port)
    );

    let sweeper = CorrelationTable::spawn_sweeper(
        table,
        config.orchestrator.sweep_interval(),
        cancel.clone(),
    );
    spawn_metrics(&config, &cancel);
    let server = tokio::spawn(listener.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    cancel.cancel();

    server.await.context("Listener task panicked")??;
    sweeper.await.context("Sweeper task panicked")?;
    Ok(())
}

async fn invoke(config: Config, spec: RequestSpec, timeout: Option<Duration>) -> Result<()> {
    let cancel = CancellationToken::new();
    let store: Arc<dyn BucketStore> = Arc::new(open_store(&config)?);
    let table = Arc::new(CorrelationTable::new());

    let listener = ResponseListener::bind(
        &config.listener.bind_address,
        table.clone(),
        config.listener.max_frame_size,
    )
    .await?;
    let return_address = config.listener.return_address(listener.local_addr()?.port());
    let server = tokio::spawn(listener.run(cancel.clone()));
    spawn_metrics(&config, &cancel);

    let transport = HttpQueueTransport::new(&config.queue.endpoint, config.queue.publish_timeout())?;
    let orchestrator = RequestOrchestrator::new(
        AdmissionController::new(store, config.admission.backoff()),
        table,
        RelayClient::new(Arc::new(transport)),
        return_address,
    )
    .with_routes(config.routes.template())
    .with_default_timeout(config.orchestrator.default_timeout());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = orchestrator.invoke(spec, timeout, &cancel).await;
    cancel.cancel();
    server.await.context("Listener task panicked")??;

    let response = result?;
    println!("status: {}", response.http_status);
    if let Some(limits) = &response.rate_limit {
        println!(
            "rate-limit: {}/{} until {}",
            limits.remaining, limits.limit, limits.reset_at
        );
    }
    println!("{}", String::from_utf8_lossy(&response.body));
    Ok(())
}

async fn list_buckets(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let buckets = store.list().await?;
    if buckets.is_empty() {
        println!("No buckets recorded");
        return Ok(());
    }

    println!("{:<48} {:>8} {:>10}  RESET AT", "BUCKET", "LIMIT", "REMAINING");
    for bucket in buckets {
        println!(
            "{:<48} {:>8} {:>10}  {}",
            bucket.bucket_id,
            bucket.limit,
            bucket.remaining,
            bucket.reset_at.to_rfc3339()
        );
    }
    Ok(())
}
