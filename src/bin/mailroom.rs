//! mailroom CLI: operator interface to the dispatcher and worker pool.

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use mailroom::config::Config;
use mailroom::db::Db;
use mailroom::deploy::DirectorySink;
use mailroom::dispatch::{Dispatcher, Route};
use mailroom::engine::{Backends, GitWorkspaces, Pipeline, PipelineConfig, Worker};
use mailroom::model::ThreadId;
use mailroom::resolver::{ResolverConfig, ThreadResolver};
use mailroom::respond::{FanOut, QueueEmitter, ResponseEmitter, WebhookEmitter};
use mailroom::store::{OwnershipRegistry, ThreadStore};
use mailroom::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "mailroom", about = "Route conversational work to stateful workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until Ctrl-C
    Serve {
        /// Maximum pairs owned at once (overrides MAX_PAIRS)
        #[arg(long)]
        max_pairs: Option<usize>,
    },
    /// Dispatch an inbound message read from a JSON file ("-" for stdin)
    Dispatch {
        /// Path to the message JSON
        input: PathBuf,
    },
    /// List ownership claims
    Claims,
    /// Thread operations
    Threads {
        #[command(subcommand)]
        action: ThreadAction,
    },
}

#[derive(Subcommand)]
enum ThreadAction {
    /// Show a thread
    Show {
        /// Thread ID or continuity token (mr-<uuid>)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "mailroom".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let db = Arc::new(db);

    match cli.command {
        Command::Serve { max_pairs } => cmd_serve(&config, db, max_pairs).await,
        Command::Dispatch { input } => cmd_dispatch(db, input).await,
        Command::Claims => cmd_claims(&db).await,
        Command::Threads {
            action: ThreadAction::Show { id },
        } => cmd_thread_show(&db, &id).await,
    }
}

async fn cmd_serve(config: &Config, db: Arc<Db>, max_pairs: Option<usize>) -> anyhow::Result<()> {
    let steps = PipelineConfig::load(&config.pipeline_config)?;

    let mut emitters: Vec<Arc<dyn ResponseEmitter>> = vec![Arc::new(QueueEmitter::new(db.clone()))];
    if let Some(url) = &config.response_webhook {
        emitters.push(Arc::new(WebhookEmitter::new(url)));
    }

    let pipeline = Pipeline {
        workspaces: Arc::new(GitWorkspaces::new(&config.workspace_root)),
        editor: Arc::new(steps.editor()),
        builder: Arc::new(steps.builder()),
        sink: Arc::new(DirectorySink::new(
            &config.publish_root,
            &config.public_base_url,
        )),
        emitter: Arc::new(FanOut(emitters)),
    };

    let mut worker_config = config.worker_config();
    if let Some(n) = max_pairs {
        worker_config.max_pairs = n;
    }

    let worker = Worker::new(Backends::from_one(db), pipeline, worker_config);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_dispatch(db: Arc<Db>, input: PathBuf) -> anyhow::Result<()> {
    let raw = if input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(&input)?
    };
    let message: serde_json::Value = serde_json::from_str(&raw)?;

    let resolver = ThreadResolver::new(db.clone(), ResolverConfig::default());
    let dispatcher = Dispatcher::new(resolver, db.clone(), db);
    let outcome = dispatcher.dispatch_raw(message).await?;

    let thread = &outcome.resolution.thread;
    println!("Correlation: {}", outcome.request.correlation_id);
    let matched = match outcome.resolution.confidence {
        Some(confidence) => format!("{confidence:?} match"),
        None => "new".to_string(),
    };
    println!("Thread:      {} ({matched})", thread.thread_id);
    println!("Token:       {}", thread.continuity_token());
    match outcome.route {
        Route::Owned { owner, queue } => println!("Route:       {queue} (owned by {owner})"),
        Route::Unclaimed { queue } => println!("Route:       {queue} (claim requested)"),
    }
    Ok(())
}

async fn cmd_claims(db: &Db) -> anyhow::Result<()> {
    let claims = db.list_claims().await?;
    if claims.is_empty() {
        println!("No claims.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<24}  {:<16}  {:<24}  {:<8}  LEASE EXPIRES",
        "PROJECT", "USER", "OWNER", "STATUS"
    );
    println!("{}", "-".repeat(100));
    for claim in &claims {
        let status = if claim.released_at.is_some() {
            "released"
        } else if claim.is_live(now) {
            "live"
        } else {
            "expired"
        };
        println!(
            "{:<24}  {:<16}  {:<24}  {:<8}  {}",
            claim.pair.project_id,
            claim.pair.user_id,
            claim.owner_id,
            status,
            claim.lease_expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} claim(s)", claims.len());
    Ok(())
}

async fn cmd_thread_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let thread_id = match ThreadId::from_token(id) {
        Some(thread_id) => thread_id,
        None => ThreadId(uuid::Uuid::parse_str(id)?),
    };
    let Some(thread) = db.get_thread(thread_id).await? else {
        anyhow::bail!("no thread {id}");
    };

    println!("ID:           {}", thread.thread_id);
    println!("Token:        {}", thread.continuity_token());
    println!("Origin:       {}", thread.origin_address);
    println!("Project:      {}", thread.pair.project_id);
    println!("User:         {}", thread.pair.user_id);
    println!("Branch:       {}", thread.branch_name);
    println!("Subject:      {}", thread.subject);
    println!("Created:      {}", thread.created_at);
    println!("Last Active:  {}", thread.last_activity_at);
    Ok(())
}
