use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genrelay::cli::{Cli, Command};
use genrelay::config::{API_KEY_ENV, RelayConfig};
use genrelay::discount::{DiscountCache, DiscountLookupError, DiscountOracle};
use genrelay::ledger::{CreditLedger, InMemoryLedger};
use genrelay::orchestrator::{JobOrchestrator, JobOutcome};
use genrelay::poller::PollConfig;
use genrelay::pricing::{Capability, Discount};
use genrelay::provider::{
    HttpProvider, JobHandle, JobProvider, ProviderRequest, ScriptStep, ScriptedProvider,
    StatusReport,
};
use genrelay::ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "genrelay=debug" } else { "genrelay=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => RelayConfig::load_from(path),
        None => RelayConfig::load(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Command::Run {
            capability,
            endpoint,
            params,
            actor,
            grant,
        } => {
            let request = ProviderRequest {
                capability: capability.into(),
                endpoint,
                params: parse_params(&params)?,
            };
            run_job(&config, request, &actor, grant, cli.verbose).await
        }
        Command::Status { job_id, endpoint } => show_status(&config, job_id, endpoint).await,
        Command::Price { capability, params } => {
            let capability = Capability::from(capability);
            let price = config
                .price_table()
                .resolve(capability, &parse_params(&params)?)?;
            println!("{capability}: {} credits", price.normalize());
            Ok(())
        }
        Command::Demo => run_demo(&config).await,
    }
}

fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("--params must be a JSON object")
}

fn http_provider(config: &RelayConfig) -> Result<HttpProvider> {
    if config.provider.api_key.is_empty() {
        bail!("no API key: set {API_KEY_ENV} or provider.api_key in genrelay.toml");
    }
    Ok(HttpProvider::with_base_url(
        config.provider.api_key.clone(),
        config.provider.base_url.clone(),
        config.request_timeout(),
    )?
    .with_lexicon(config.lexicon.clone()))
}

async fn run_job(
    config: &RelayConfig,
    request: ProviderRequest,
    actor: &str,
    grant: Decimal,
    verbose: bool,
) -> Result<()> {
    let ledger = InMemoryLedger::new();
    ledger.grant(actor, grant).await?;
    let orchestrator = JobOrchestrator::from_config(http_provider(config)?, ledger, config);

    // Ctrl-C stops polling; the job keeps running at the provider.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let progress = JobProgress::start(&format!(
        "{} via {}",
        request.capability, request.endpoint
    ));
    match orchestrator.run(actor, request, &cancel).await {
        Ok(outcome) => {
            progress.complete(&outcome);
            if verbose && let JobOutcome::Completed { summary, .. } = &outcome {
                progress.print_summary(summary);
            }
            Ok(())
        }
        Err(e) => {
            progress.failure(&e);
            Err(e.into())
        }
    }
}

async fn show_status(config: &RelayConfig, job_id: String, endpoint: String) -> Result<()> {
    let provider = http_provider(config)?;
    let report = provider.status(&JobHandle { endpoint, job_id }).await?;
    let class = config.lexicon.classify(&report.status);
    println!("status: {} ({class:?})", report.status);
    if let Some(error) = &report.error {
        println!("error:  {error}");
    }
    if let Some(result) = &report.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

/// Oracle for the demo: actors named `vip-*` get 20% off.
struct DemoDiscounts;

impl DiscountOracle for DemoDiscounts {
    async fn lookup(
        &self,
        actor_id: &str,
        _capability: Capability,
    ) -> Result<Discount, DiscountLookupError> {
        Ok(Discount {
            percent_off: if actor_id.starts_with("vip-") { 20 } else { 0 },
            free_tier: false,
        })
    }
}

fn demo_poll_config() -> PollConfig {
    PollConfig {
        initial_delay: Duration::from_millis(300),
        base_interval: Duration::from_millis(200),
        queued_interval: Duration::from_millis(250),
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_millis(500),
        jitter_max: Duration::from_millis(100),
        artifact_retry_delay: Duration::from_millis(150),
        budget: Some(Duration::from_secs(3)),
        ..PollConfig::default()
    }
}

async fn demo_orchestrator(
    config: &RelayConfig,
    provider: ScriptedProvider,
    actor: &str,
    cache: &Arc<DiscountCache>,
) -> Result<JobOrchestrator<ScriptedProvider, InMemoryLedger, DemoDiscounts>> {
    let ledger = InMemoryLedger::new();
    ledger.grant(actor, dec!(10)).await?;
    Ok(JobOrchestrator::from_config(provider, ledger, config)
        .with_poll_config(demo_poll_config())
        .with_discounts(DemoDiscounts, Arc::clone(cache)))
}

async fn run_demo(config: &RelayConfig) -> Result<()> {
    let cache = Arc::new(DiscountCache::new(config.discount.to_config()));
    let stop_sweeper = CancellationToken::new();
    let sweeper = Arc::clone(&cache).spawn_sweeper(
        config.discount.sweep_interval(),
        stop_sweeper.clone(),
    );
    let video = json!({"prompt": "a red fox in the snow", "duration": "6s"});

    println!("1) Successful video job with a flaky status endpoint (vip actor, 20% off)");
    let provider = ScriptedProvider::new(
        "demo-ok",
        vec![
            ScriptStep::Report(StatusReport::queued()),
            ScriptStep::TransportError("502 Bad Gateway".into()),
            ScriptStep::Report(StatusReport::in_progress()),
            ScriptStep::Report(StatusReport::completed(json!({
                "data": {"video": {"url": "https://cdn.example/demo/fox.mp4"}}
            }))),
        ],
    );
    let orch = demo_orchestrator(config, provider, "vip-ana", &cache).await?;
    demo_step(&orch, "vip-ana", video.clone()).await;

    println!("\n2) Provider failure: reservation refunded");
    let provider = ScriptedProvider::new(
        "demo-fail",
        vec![
            ScriptStep::Report(StatusReport::in_progress()),
            ScriptStep::Report(StatusReport::failed("content policy violation")),
        ],
    );
    let orch = demo_orchestrator(config, provider, "bob", &cache).await?;
    demo_step(&orch, "bob", video.clone()).await;

    println!("\n3) Timeout: credits held, then reconciled");
    let provider = ScriptedProvider::new("demo-slow", vec![]);
    let orch = demo_orchestrator(config, provider, "carol", &cache).await?;
    demo_step(&orch, "carol", video).await;
    orch.provider().push(ScriptStep::Report(StatusReport::completed(json!({
        "video": "https://cdn.example/demo/late.mp4"
    }))));
    for pending in orch.pending_jobs().await {
        let progress = JobProgress::start(&format!("Reconciling {}", pending.job_id));
        match orch.reconcile(&pending.job_id).await {
            Ok(outcome) => progress.complete(&outcome),
            Err(e) => progress.failure(&e),
        }
    }
    print_account(&orch, "carol").await;

    stop_sweeper.cancel();
    sweeper.await?;
    Ok(())
}

async fn demo_step(
    orch: &JobOrchestrator<ScriptedProvider, InMemoryLedger, DemoDiscounts>,
    actor: &str,
    params: Value,
) {
    let progress = JobProgress::start(&format!("{actor}: video job"));
    match orch
        .submit_and_await(actor, Capability::Video, "fal-ai/veo3", params)
        .await
    {
        Ok(outcome) => progress.complete(&outcome),
        Err(e) => progress.failure(&e),
    }
    print_account(orch, actor).await;
}

async fn print_account(
    orch: &JobOrchestrator<ScriptedProvider, InMemoryLedger, DemoDiscounts>,
    actor: &str,
) {
    let account = orch.ledger().account(actor).await;
    println!(
        "    {actor}: balance {} · reserved {}",
        account.balance.normalize(),
        account.reserved_total.normalize()
    );
}
