use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nexus_config::Config;
use nexus_host::{CapabilityRegistry, StartContext};
use nexus_host_email::{EmailCapability, SmtpMailer};
use nexus_host_fs::{FsCapability, LocalFileSource};
use nexus_host_http::WebCapability;
use nexus_host_kv::KvCapability;
use nexus_host_log::ConsoleCapability;
use nexus_host_time::TimeCapability;
use nexus_log::{ChannelConsumer, LogBroker, LogEvent};
use nexus_runtime::RunScheduler;
use nexus_store::{LogLevel, LogRecord, Runnable, RunnableStore, SqliteStore};
use nexus_trigger::pubsub::FileCredentialLoader;
use nexus_trigger::{
  CronTriggers, EmailTriggers, PubsubConfig, PubsubTriggers, TriggerRegistry, WebTriggers,
};

/// Nexus - a self-hosted runtime for user scripts started by cron, HTTP,
/// Pub/Sub and email triggers
#[derive(Parser)]
#[command(name = "nexus")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the config file (default: <config dir>/nexus/config.toml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Serve web triggers and run cron and Pub/Sub triggers until interrupted
  Serve,

  /// Run a runnable once and stream its log to stderr
  Run {
    /// Uid of the runnable to run
    runnable_uid: i64,
  },

  /// Store a runnable and its triggers from a JSON file
  Import {
    /// Path to the runnable JSON file
    runnable_file: PathBuf,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let config = Config::load_or_default(cli.config.as_deref()).context("failed to load config")?;

  match cli.command {
    Some(Commands::Serve) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(serve(config))
    }
    Some(Commands::Run { runnable_uid }) => {
      // Single-threaded so the log subscription is in place before the run
      // writes its first record.
      let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
      rt.block_on(run_once(config, runnable_uid))
    }
    Some(Commands::Import { runnable_file }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(import(config, &runnable_file))
    }
    None => {
      println!("nexus - use --help to see available commands");
      Ok(())
    }
  }
}

/// Everything a command needs to start runs.
struct Services {
  store: Arc<SqliteStore>,
  scheduler: Arc<RunScheduler>,
  files: Arc<LocalFileSource>,
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
  tokio::fs::create_dir_all(&config.storage.data_dir)
    .await
    .with_context(|| format!("failed to create data dir: {}", config.storage.data_dir.display()))?;

  let url = config.storage.database_url();
  let store = SqliteStore::connect(&url)
    .await
    .with_context(|| format!("failed to open database: {url}"))?;
  store.migrate().await.context("failed to migrate database")?;
  Ok(Arc::new(store))
}

async fn services(config: &Config) -> Result<Services> {
  let store = open_store(config).await?;

  let files_dir = config.storage.files_dir();
  tokio::fs::create_dir_all(&files_dir)
    .await
    .with_context(|| format!("failed to create files dir: {}", files_dir.display()))?;
  let files = Arc::new(LocalFileSource::new(files_dir));

  let http = reqwest::Client::builder()
    .timeout(config.http.timeout())
    .build()
    .context("failed to build http client")?;

  let capabilities = CapabilityRegistry::new()
    .with(Arc::new(ConsoleCapability))
    .with(Arc::new(WebCapability::new(http.clone())))
    .with(Arc::new(EmailCapability::new(Arc::new(SmtpMailer))))
    .with(Arc::new(KvCapability::new(store.clone())))
    .with(Arc::new(FsCapability::new(files.clone())))
    .with(Arc::new(TimeCapability));

  let scheduler = Arc::new(RunScheduler::new(
    store.clone(),
    store.clone(),
    store.clone(),
    Arc::new(LogBroker::new()),
    capabilities,
  ));

  Ok(Services {
    store,
    scheduler,
    files,
  })
}

async fn serve(config: Config) -> Result<()> {
  let addr = config.server.listen_addr()?;
  let services = services(&config).await?;
  let starter = services.scheduler.clone();

  let web = WebTriggers::with_timeout(starter.clone(), config.web.timeout())
    .with_auth(services.store.clone(), services.store.clone());
  // Mail is received by an external SMTP server, which drives the handler
  // through accept_recipient and commit.
  let email = EmailTriggers::new(starter.clone());
  // Pulls are long polls, so this client carries no request timeout.
  let pubsub_http = reqwest::Client::new();
  let pubsub = PubsubTriggers::new(
    starter.clone(),
    Arc::new(FileCredentialLoader::new(
      services.files.clone(),
      pubsub_http.clone(),
    )),
    pubsub_http,
    PubsubConfig {
      api_base: config.pubsub.api_base.clone(),
      backoff: config.pubsub.backoff(),
    },
  );
  let registry = TriggerRegistry::new()
    .with_handler(Arc::new(CronTriggers::with_tick(starter.clone(), config.cron.tick())))
    .with_handler(Arc::new(web.clone()))
    .with_handler(Arc::new(pubsub))
    .with_handler(Arc::new(email));

  let count = registry
    .initialise(services.store.as_ref())
    .await
    .context("failed to load triggers")?;

  let shutdown = CancellationToken::new();
  tokio::spawn(reap_runs(
    services.scheduler.clone(),
    config.runs.retention(),
    config.runs.reap_interval(),
    shutdown.clone(),
  ));

  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .with_context(|| format!("failed to bind {addr}"))?;
  info!(%addr, triggers = count, "nexus_listening");

  let signal = shutdown.clone();
  axum::serve(
    listener,
    web.router().into_make_service_with_connect_info::<SocketAddr>(),
  )
  .with_graceful_shutdown(async move {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "signal_listener_failed");
    }
    signal.cancel();
  })
  .await
  .context("http server failed")?;

  shutdown.cancel();
  registry.shutdown();
  info!("nexus_stopped");
  Ok(())
}

/// Periodically evict finished runs older than `retention`.
async fn reap_runs(
  scheduler: Arc<RunScheduler>,
  retention: Duration,
  every: Duration,
  shutdown: CancellationToken,
) {
  let mut interval = tokio::time::interval(every);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return,
      _ = interval.tick() => {
        let reaped = scheduler.runs().reap(retention);
        if reaped > 0 {
          info!(reaped, remaining = scheduler.runs().len(), "runs_reaped");
        }
      }
    }
  }
}

async fn run_once(config: Config, runnable_uid: i64) -> Result<()> {
  let services = services(&config).await?;
  let scheduler = services.scheduler;

  let handle = scheduler
    .start(runnable_uid, StartContext::manual(), Vec::new())
    .await
    .with_context(|| format!("failed to start runnable {runnable_uid}"))?;
  eprintln!("Started run: {}", handle.run_id);

  let (consumer, mut events) = ChannelConsumer::channel();
  scheduler
    .broker()
    .subscribe(&handle.run_id, consumer)
    .context("failed to subscribe to run log")?;

  while let Some(event) = events.recv().await {
    match event {
      LogEvent::Record(record) => eprintln!("{}", format_record(&record)),
      LogEvent::Done => break,
    }
  }

  let outcome = handle.wait().await;
  match outcome.error {
    Some(error) => bail!("run {} failed: {error}", outcome.run_id),
    None => {
      println!("{}", outcome.value);
      Ok(())
    }
  }
}

fn format_record(record: &LogRecord) -> String {
  let level = match record.level {
    LogLevel::Info => "INFO",
    LogLevel::Warning => "WARN",
    LogLevel::Error => "ERROR",
  };
  format!(
    "{} {level:<5} [{}] {}",
    record.created_at.format("%H:%M:%S%.3f"),
    record.kind.as_str(),
    record.value
  )
}

async fn import(config: Config, runnable_file: &Path) -> Result<()> {
  let content = tokio::fs::read_to_string(runnable_file)
    .await
    .with_context(|| format!("failed to read runnable file: {}", runnable_file.display()))?;
  let runnable: Runnable = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse runnable file: {}", runnable_file.display()))?;

  for trigger in &runnable.triggers {
    ensure!(
      trigger.parent_uid == runnable.uid,
      "trigger {} belongs to runnable {}, not {}",
      trigger.uid,
      trigger.parent_uid,
      runnable.uid
    );
  }

  let store = open_store(&config).await?;
  store
    .save_runnable(&runnable)
    .await
    .with_context(|| format!("failed to save runnable {}", runnable.uid))?;

  eprintln!(
    "Imported runnable {} ({}) with {} triggers",
    runnable.uid,
    runnable.name,
    runnable.triggers.len()
  );
  Ok(())
}
