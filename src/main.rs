use std::io::BufRead;
use std::time::Duration;

use anyhow::Context;
use blorp_engine::{ConnectionContext, EventRegistry, HandlerResult, Registration, Reply, Response};
use blorp_server::{App, AppConfig, Backend};
use blorp_store::MemoryBroker;
use blorp_telemetry::{init_telemetry, TelemetryConfig};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::Level;

#[derive(Parser)]
#[command(name = "blorp", about = "Run a blorp instance with demo handlers")]
struct Cli {
    /// Application name; namespaces every broker key.
    #[arg(long, env = "BLORP_NAME", default_value = "basic")]
    name: String,

    #[arg(long, env = "BLORP_REDIS_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "BLORP_REDIS_PORT", default_value_t = 6379)]
    port: u16,

    #[arg(long, env = "BLORP_REDIS_DB", default_value_t = 0)]
    database: u32,

    #[arg(long, env = "BLORP_POOL_SIZE", default_value_t = 10)]
    pool_size: usize,

    /// Session TTL in seconds.
    #[arg(long, env = "BLORP_SESSION_TTL", default_value_t = 1800)]
    session_ttl: u64,

    /// Use a process-local broker instead of Redis.
    #[arg(long, env = "BLORP_IN_MEMORY")]
    in_memory: bool,

    #[arg(long, env = "BLORP_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long, env = "BLORP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Clone, Copy)]
enum Mode {
    /// Demo handlers; stdin lines are broadcast to every connection.
    Basic,
    /// Log every message; type `stop` to shut down.
    Stopping,
}

async fn on_json(ctx: ConnectionContext, data: Value) -> HandlerResult {
    Ok(Reply::payload(json!({
        "orig": data,
        "new": format!("hello {}!", ctx.connection_id()),
    })))
}

async fn on_string(ctx: ConnectionContext, data: Value) -> HandlerResult {
    tokio::time::sleep(Duration::from_secs(5)).await;
    ctx.update_session(|session| {
        session.insert("string_message_sent".into(), json!(true));
    })
    .await?;
    Ok(Reply::payload(format!("Got \"{}\" from you!", text(&data))))
}

async fn on_everything_else(ctx: ConnectionContext, data: Value) -> HandlerResult {
    let message = format!(
        "{} sent a message to everyone: \"{}\"",
        ctx.connection_id(),
        text(&data)
    );
    Ok(Response::new(message).to_all().event("something").into())
}

async fn log_message(ctx: ConnectionContext, data: Value) -> HandlerResult {
    tracing::info!(connection_id = %ctx.connection_id(), %data, "got a message");
    Ok(Reply::Nothing)
}

fn text(data: &Value) -> String {
    data.as_str().map_or_else(|| data.to_string(), str::to_owned)
}

fn registry(mode: Mode) -> anyhow::Result<EventRegistry> {
    let builder = match mode {
        Mode::Basic => EventRegistry::builder()
            .register(
                Registration::new("json", on_json)
                    .unordered()
                    .parse_json()
                    .return_event("something"),
            )
            .register(Registration::new("string", on_string).return_event("something"))
            .on(".*", on_everything_else),
        Mode::Stopping => EventRegistry::builder().on(".*", log_message),
    };
    Ok(builder.build()?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..TelemetryConfig::default()
    });

    let mode = cli.mode.unwrap_or(Mode::Basic);
    let config = AppConfig {
        name: cli.name,
        host: cli.host,
        port: cli.port,
        database: cli.database,
        pool_size: cli.pool_size,
        session_ttl: Duration::from_secs(cli.session_ttl),
        ..AppConfig::default()
    };
    let backend = if cli.in_memory {
        Backend::Memory(MemoryBroker::new())
    } else {
        Backend::Redis
    };

    let metrics = telemetry.metrics().unwrap_or_default();
    let app = App::with_backend(config, registry(mode)?, backend, metrics);
    app.start_in_new_thread()?;
    tracing::info!(app = %app.config().name, "blorp instance starting");

    let prompt = match mode {
        Mode::Basic => "Type something to say to the nice websockets (stop to stop):",
        Mode::Stopping => "Stop to stop:",
    };
    println!("{prompt}");
    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();
        if line == "stop" {
            break;
        }
        if matches!(mode, Mode::Basic) && !line.is_empty() {
            if let Err(e) = app.send_sync_to_all("something", json!(line)) {
                tracing::warn!(error = %e, "broadcast failed");
            }
        }
    }

    app.stop();
    let report = app.join()?;
    tracing::info!(
        handed_off = report.handed_off.len(),
        disconnected = report.disconnected.len(),
        "blorp instance stopped"
    );
    Ok(())
}
