//! Calltrace - request tracing for outbound API calls
//!
//! Command line front end: classify calls, inspect the session, run the
//! safe serializer, send real requests through the interceptor or watch a
//! simulated storefront session.

use anyhow::Context;
use calltrace_core::config::{to_toml, ConfigLoader, TracerConfig};
use calltrace_core::identity::IdentityStore;
use calltrace_core::interceptor::TraceInterceptor;
use calltrace_core::metrics::InterceptorMetrics;
use calltrace_core::request::ApiRequest;
use calltrace_core::serialize::serialize_with_depth;
use calltrace_core::sink::{EventSink, FanoutSink, LogSink, MemorySink};
use calltrace_core::transport::{ScriptedOutcome, ScriptedTransport, TransportError};
use calltrace_core::value::TraceValue;
use calltrace_export::collector::{CollectorConfig, CollectorSink};
use calltrace_export::http::ReqwestTransport;
use calltrace_export::jsonl::{JsonlSink, JsonlSinkConfig};
use clap::{Parser, Subcommand};
use http::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Request tracing for outbound API calls", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file (falls back to CALLTRACE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the business event a call would produce
    Classify {
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request URL
        #[arg(short, long)]
        url: String,

        /// Request body (JSON)
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Inspect or reset the persisted session
    Session {
        #[command(subcommand)]
        action: Option<SessionAction>,
    },

    /// Run the safe serializer over a JSON value
    Serialize {
        /// Value to serialize (JSON)
        #[arg(short, long)]
        json: String,

        /// Maximum nesting depth
        #[arg(long)]
        max_depth: Option<usize>,

        /// Make the top-level object reference itself
        #[arg(long)]
        cycle: bool,
    },

    /// Send a real request through the interceptor
    Send {
        /// Request URL
        #[arg(short, long)]
        url: String,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request body (JSON)
        #[arg(short, long)]
        body: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Simulate a storefront session against a canned transport
    Demo {
        /// Number of times to replay the scenario
        #[arg(long, default_value = "1")]
        calls: usize,

        /// Simulated network latency in milliseconds
        #[arg(long, default_value = "25")]
        latency: u64,
    },

    /// Print the effective configuration
    Config {
        /// Print built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum SessionAction {
    /// Show the current session
    Info,
    /// Start a new session
    Regenerate,
    /// Forget the persisted session and start over
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.tracer.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };
    init_logging(log_level, &cli.format)?;

    match cli.command {
        Commands::Classify { method, url, body } => classify_command(&method, &url, body),
        Commands::Session { action } => {
            session_command(&config, action.unwrap_or(SessionAction::Info))
        }
        Commands::Serialize {
            json,
            max_depth,
            cycle,
        } => serialize_command(&config, &json, max_depth, cycle),
        Commands::Send {
            url,
            method,
            body,
            timeout,
        } => send_command(&config, &url, &method, body, timeout).await,
        Commands::Demo { calls, latency } => demo_command(&config, calls, latency).await,
        Commands::Config { default } => config_command(&config, default),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> TracerConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // logging is not up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            TracerConfig::default()
        }
    }
}

fn init_logging(level: Level, format: &str) -> anyhow::Result<()> {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format.to_lowercase().as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        "text" => tracing::subscriber::set_global_default(builder.finish())?,
        other => anyhow::bail!("Unknown log format: {} (expected json or text)", other),
    }
    Ok(())
}

fn parse_method(method: &str) -> anyhow::Result<Method> {
    Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))
}

fn parse_json(json: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(json).with_context(|| format!("Invalid JSON: {}", json))
}

fn classify_command(method: &str, url: &str, body: Option<String>) -> anyhow::Result<()> {
    let method = parse_method(method)?;
    let body = body.as_deref().map(parse_json).transpose()?.map(TraceValue::from);

    let event = calltrace_core::classify(&method, url, body.as_ref());
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn session_command(config: &TracerConfig, action: SessionAction) -> anyhow::Result<()> {
    let identity = IdentityStore::from_settings(&config.session);

    match action {
        SessionAction::Info => {}
        SessionAction::Regenerate => {
            let id = identity.regenerate_session();
            info!("Started session {}", id);
        }
        SessionAction::Clear => {
            identity.clear_session();
            info!("Cleared persisted session");
        }
    }

    println!("{}", serde_json::to_string_pretty(&identity.info())?);
    Ok(())
}

fn serialize_command(
    config: &TracerConfig,
    json: &str,
    max_depth: Option<usize>,
    cycle: bool,
) -> anyhow::Result<()> {
    let value = TraceValue::from(parse_json(json)?);
    if cycle && !value.insert("self", value.clone()) {
        warn!("--cycle needs a JSON object at the top level");
    }

    let depth = max_depth.unwrap_or(config.tracer.serializer_max_depth);
    println!("{}", serialize_with_depth(&value, depth));
    Ok(())
}

/// The configured sinks, plus handles needed to drain them on exit
struct Sinks {
    fanout: Arc<FanoutSink>,
    collector: Option<Arc<CollectorSink>>,
}

impl Sinks {
    fn build(config: &TracerConfig, extra: Vec<Arc<dyn EventSink>>) -> anyhow::Result<Self> {
        let mut fanout = FanoutSink::new();
        for sink in extra {
            fanout.push(sink);
        }

        if config.jsonl.enabled {
            let sink = JsonlSink::open(JsonlSinkConfig::from(&config.jsonl))
                .with_context(|| format!("Failed to open JSONL sink at {}", config.jsonl.path))?;
            fanout.push(Arc::new(sink));
        }

        let collector = if config.collector.enabled {
            let sink = Arc::new(CollectorSink::spawn(CollectorConfig::from(&config.collector))?);
            info!("Delivering events to collector at {}", sink.url());
            fanout.push(sink.clone());
            Some(sink)
        } else {
            None
        };

        Ok(Self {
            fanout: Arc::new(fanout),
            collector,
        })
    }

    async fn finish(self) {
        if let Err(e) = self.fanout.flush() {
            warn!("Failed to flush sinks: {}", e);
        }
        if let Some(collector) = &self.collector {
            if let Err(e) = collector.drain().await {
                error!("Failed to drain collector sink: {}", e);
            }
            let stats = collector.stats();
            info!(
                "Collector: sent={}, dropped={}",
                stats.events_sent, stats.events_dropped
            );
        }
    }
}

async fn send_command(
    config: &TracerConfig,
    url: &str,
    method: &str,
    body: Option<String>,
    timeout: u64,
) -> anyhow::Result<()> {
    let method = parse_method(method)?;
    let mut request = ApiRequest::new(method, url);
    if let Some(body) = body {
        request = request.with_json(parse_json(&body)?);
    }

    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(timeout))?);
    let sinks = Sinks::build(config, vec![Arc::new(LogSink) as Arc<dyn EventSink>])?;
    let identity = Arc::new(IdentityStore::from_settings(&config.session));
    let interceptor =
        TraceInterceptor::from_config(config, transport, sinks.fanout.clone(), identity);

    let result = interceptor.execute(&request).await;
    sinks.finish().await;

    let response = result?;
    println!("HTTP {}", response.status);
    if let Some(body) = &response.body {
        println!("{}", serialize_with_depth(body, config.tracer.serializer_max_depth));
    }
    Ok(())
}

/// Calls made by one pass of the demo scenario
fn demo_requests() -> Vec<ApiRequest> {
    vec![
        ApiRequest::get("/api/products"),
        ApiRequest::get("/api/products/search?q=laptop&sort=price"),
        ApiRequest::get("/api/products/PROD-123"),
        ApiRequest::post("/api/cart")
            .with_json(serde_json::json!({"sku": "PROD-123", "quantity": 1})),
        ApiRequest::post("/api/orders")
            .with_json(serde_json::json!({"items": ["PROD-123"], "total": 1299.0})),
        ApiRequest::get("/api/products/PROD-404"),
        ApiRequest::get("/api/inventory"),
        ApiRequest::get("/api/recommendations"),
        ApiRequest::post("/api/analytics").with_json(serde_json::json!({"event": "page_view"})),
    ]
}

fn demo_transport(latency: Duration) -> ScriptedTransport {
    ScriptedTransport::new()
        .with_latency(latency)
        .route(
            "/api/products/PROD-404",
            ScriptedOutcome::Respond {
                status: 404,
                body: serde_json::json!({"message": "Product not found"}),
            },
        )
        .route(
            "/api/inventory",
            ScriptedOutcome::Respond {
                status: 500,
                body: serde_json::json!({"message": "Inventory service unavailable"}),
            },
        )
        .route(
            "/api/recommendations",
            ScriptedOutcome::Fail(TransportError::Network("connection reset".to_string())),
        )
        .route(
            "/api/products/search",
            ScriptedOutcome::Respond {
                status: 200,
                body: serde_json::json!({"results": [{"id": "PROD-123", "name": "Laptop"}]}),
            },
        )
        .route(
            "/api/products/PROD-123",
            ScriptedOutcome::Respond {
                status: 200,
                body: serde_json::json!({"id": "PROD-123", "name": "Laptop", "price": 1299.0}),
            },
        )
        .route(
            "/api/products",
            ScriptedOutcome::Respond {
                status: 200,
                body: serde_json::json!([{"id": "PROD-123"}, {"id": "PROD-456"}]),
            },
        )
}

async fn demo_command(config: &TracerConfig, rounds: usize, latency_ms: u64) -> anyhow::Result<()> {
    println!();
    println!("  Calltrace v{} - DEMO MODE", calltrace_core::VERSION);
    println!();

    let memory = Arc::new(MemorySink::new());
    let sinks = Sinks::build(config, vec![memory.clone() as Arc<dyn EventSink>])?;
    let transport = Arc::new(demo_transport(Duration::from_millis(latency_ms)));
    let identity = Arc::new(IdentityStore::ephemeral());
    let metrics = Arc::new(InterceptorMetrics::new());
    let interceptor =
        TraceInterceptor::from_config(config, transport, sinks.fanout.clone(), identity)
            .with_metrics(metrics.clone());

    for round in 0..rounds.max(1) {
        info!("Demo round {}", round + 1);
        for request in demo_requests() {
            let method = request.method.as_str();
            match interceptor.execute(&request).await {
                Ok(response) => println!("  {:<6} {:<45} {}", method, request.url, response.status),
                Err(e) => println!("  {:<6} {:<45} {}", method, request.url, e),
            }
        }
    }

    println!();
    println!("  Events:");
    for event in memory.events() {
        println!("{}", serde_json::to_string(&event)?);
    }

    println!();
    println!("  Metrics:");
    println!("{}", serde_json::to_string_pretty(&metrics.to_json())?);
    println!();
    print!("{}", metrics.to_prometheus());
    println!();

    sinks.finish().await;
    Ok(())
}

fn config_command(config: &TracerConfig, default: bool) -> anyhow::Result<()> {
    let rendered = if default {
        to_toml(&TracerConfig::default())?
    } else {
        to_toml(config)?
    };
    print!("{}", rendered);
    Ok(())
}
