//! Process entry point: loads config, wires the scheduler/storage/monitor
//! behind an explicit `SystemContext`, runs the initial preload cycle, then
//! serves the Read API Gateway while the scheduler and monitor keep running
//! as background tasks.

use anyhow::{bail, Context, Result};
use clap::Parser;
use marketdata_plane::adapters::crypto::CryptoAdapter;
use marketdata_plane::adapters::forex::ForexAdapter;
use marketdata_plane::adapters::fred::FredAdapter;
use marketdata_plane::adapters::intraday_bars::IntradayBarsAdapter;
use marketdata_plane::adapters::news::NewsAdapter;
use marketdata_plane::adapters::retail_quote::RetailQuoteAdapter;
use marketdata_plane::adapters::SourceAdapter;
use marketdata_plane::config::Config;
use marketdata_plane::context::SystemContext;
use marketdata_plane::gateway;
use marketdata_plane::model::AuthMode;
use marketdata_plane::monitor::Monitor;
use marketdata_plane::scheduler::Scheduler;
use marketdata_plane::storage::Storage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "marketdata-plane", about = "Market-intelligence data plane")]
struct Args {
    /// Path to the YAML source/series catalog.
    #[arg(long, env = "MARKETDATA_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Durable-store connection string override.
    #[arg(long, env = "DATABASE_URL")]
    db_path: Option<String>,

    /// Forces the Validator into degraded-mode bypass.
    #[arg(long, env = "SKIP_VALIDATION")]
    skip_validation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if args.skip_validation {
        config.skip_validation = true;
    }
    if config.skip_validation {
        warn!("skip_validation is enabled: the Validator will accept otherwise-suspect values (degraded mode)");
    }
    let config = Arc::new(config);

    info!(
        sources = config.sources.len(),
        series = config.series.len(),
        "configuration loaded"
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build HTTP client")?;

    let adapters = build_adapters(&config, &http_client)?;
    let storage = Arc::new(Storage::open(&config.db_path).context("failed to open durable store")?);

    for series_key in &config.series_order {
        let descriptor = &config.series[series_key];
        if let Err(e) = storage.put_series_meta(series_key, descriptor) {
            warn!(series_key, error = %e, "failed to seed series:meta cache");
        }
    }

    let scheduler = Arc::new(Scheduler::new(config.clone(), adapters, storage.clone()));
    let ctx = SystemContext::new(config.clone(), storage.clone(), scheduler.clone());

    info!("running initial preload cycle");
    let preload_report = scheduler.run_cycle(None).await;
    info!(
        success_rate = preload_report.success_rate,
        failed = preload_report.failed_series.len(),
        "initial preload cycle complete"
    );
    ctx.mark_ready();

    spawn_cycle_loop(scheduler.clone());
    spawn_monitor_loop(config.clone(), storage.clone());
    spawn_hot_cache_sweep(storage.clone());

    let app = gateway::build_router(ctx.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.gateway_port));
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "read API gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("gateway server error")?;

    Ok(())
}

/// Builds one adapter per configured source: a separate struct per provider
/// family, never a shared switch inside an adapter. Which family a
/// `source_id` maps to is a fixed convention — the id names the provider
/// it speaks.
fn build_adapters(config: &Config, client: &reqwest::Client) -> Result<HashMap<String, Arc<dyn SourceAdapter>>> {
    let mut adapters: HashMap<String, Arc<dyn SourceAdapter>> = HashMap::with_capacity(config.sources.len());

    for (source_id, descriptor) in &config.sources {
        let adapter: Arc<dyn SourceAdapter> = match source_id.as_str() {
            "retail_quote" => Arc::new(RetailQuoteAdapter::new(client.clone(), descriptor.base_url.clone())),
            "forex" => Arc::new(ForexAdapter::new(client.clone(), descriptor.base_url.clone())),
            "crypto" => Arc::new(CryptoAdapter::new(client.clone(), descriptor.base_url.clone())),
            "fred" => {
                let query_name = query_param_name(&descriptor.auth_mode)
                    .with_context(|| format!("source '{source_id}' must use api_key_query auth"))?;
                let api_key = config.credential_for(source_id);
                Arc::new(FredAdapter::new(client.clone(), descriptor.base_url.clone(), api_key, query_name))
            }
            "intraday_bars" => {
                let query_name = query_param_name(&descriptor.auth_mode)
                    .with_context(|| format!("source '{source_id}' must use api_key_query auth"))?;
                let api_key = config.credential_for(source_id);
                Arc::new(IntradayBarsAdapter::new(client.clone(), descriptor.base_url.clone(), api_key, query_name))
            }
            "news" => {
                let header_name = header_param_name(&descriptor.auth_mode)
                    .with_context(|| format!("source '{source_id}' must use api_key_header auth"))?;
                let api_key = config.credential_for(source_id);
                Arc::new(NewsAdapter::new(client.clone(), descriptor.base_url.clone(), api_key, header_name))
            }
            other => bail!(
                "source '{source_id}' has unrecognized adapter family '{other}'; expected one of \
                 retail_quote, fred, intraday_bars, forex, crypto, news"
            ),
        };
        adapters.insert(source_id.clone(), adapter);
    }

    Ok(adapters)
}

fn query_param_name(auth_mode: &AuthMode) -> Result<String> {
    match auth_mode {
        AuthMode::ApiKeyQuery { query_name, .. } => Ok(query_name.clone()),
        _ => bail!("expected api_key_query auth mode"),
    }
}

fn header_param_name(auth_mode: &AuthMode) -> Result<String> {
    match auth_mode {
        AuthMode::ApiKeyHeader { header_name, .. } => Ok(header_name.clone()),
        _ => bail!("expected api_key_header auth mode"),
    }
}

/// Drives the Fetch Scheduler's refresh clock. A single fine-grained tick
/// is sufficient: `run_cycle` only attempts series whose own
/// `refresh_period` has elapsed, so price-class and macro-class series
/// naturally settle onto their configured cadences without two
/// separately-scheduled loops.
fn spawn_cycle_loop(scheduler: Arc<Scheduler>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick; preload already ran one cycle.
        loop {
            ticker.tick().await;
            let report = scheduler.run_cycle(None).await;
            if !report.failed_series.is_empty() {
                warn!(failed = ?report.failed_series, "cycle completed with failures");
            }
        }
    });
}

fn spawn_monitor_loop(config: Arc<Config>, storage: Arc<Storage>) {
    tokio::spawn(async move {
        let monitor = Monitor::new(config.clone(), storage);
        let mut ticker = tokio::time::interval(config.monitor_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = monitor.tick();
            if report.escalated {
                warn!(coverage_pct = report.coverage_pct, "ESCALATION raised by health monitor");
            }
        }
    });
}

fn spawn_hot_cache_sweep(storage: Arc<Storage>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            storage.sweep_hot_cache();
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketdata_plane=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
