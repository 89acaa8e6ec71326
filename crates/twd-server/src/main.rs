// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Process assembly for the Twinward agent.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use twd_audit::AuditLog;
use twd_bus::{BusConfig, EventBusClient};
use twd_capability::{PriorityIndex, tool_specs};
use twd_config::{BreakerSettings, LmProvider, Settings};
use twd_llm::{LmClient, OpenAiCompatClient, OpenAiConfig, ResilientLmClient, RulesPlanner};
use twd_orchestrator::{Orchestrator, OrchestratorConfig};
use twd_ratelimit::RateLimiter;
use twd_resilience::{BreakerConfig, CircuitBreaker};
use twd_safety::{KernelConfig, SafetyKernel};
use twd_server::drain::DrainState;
use twd_server::metrics::Metrics;
use twd_server::{AppState, build_app};
use twd_shadow::{ShadowConfig, ShadowManager};
use twd_twin::{TwinClient, TwinConfig};

#[derive(Parser, Debug)]
#[command(name = "twinward-agent", version, about = "Safety-governed digital-twin agent")]
struct Args {
    /// Path to the TOML settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address override.
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn breaker_config(settings: &BreakerSettings) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: settings.failure_threshold,
        recovery_timeout: Duration::from_secs_f64(settings.recovery_timeout_secs),
        half_open_max_calls: settings.half_open_max_calls,
    }
}

fn build_llm(settings: &Settings) -> Result<Arc<dyn LmClient>> {
    match settings.llm.provider {
        LmProvider::Rules => Ok(Arc::new(RulesPlanner::new())),
        LmProvider::Openai => {
            let api_key = settings
                .llm
                .api_key
                .clone()
                .context("llm.provider is 'openai' but no API key is configured")?;
            let primary = Arc::new(OpenAiCompatClient::new(OpenAiConfig {
                base_url: settings.llm.base_url.clone(),
                api_key,
                model: settings.llm.model.clone(),
                max_tokens: settings.llm.max_tokens,
                timeout: Duration::from_secs_f64(settings.twin.http_timeout_secs),
            })?);
            Ok(Arc::new(ResilientLmClient::new(
                primary,
                Some(Arc::new(RulesPlanner::new())),
                CircuitBreaker::new(breaker_config(&settings.llm.breaker)),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("twd=debug,twinward=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match &args.config {
        Some(path) => Settings::from_toml_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => Settings::default(),
    };
    settings.apply_env_overrides();
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    for warning in settings.validate() {
        warn!("config: {warning}");
    }
    let settings = Arc::new(settings);

    // Outbound clients.
    let twin_breaker = Arc::new(CircuitBreaker::new(breaker_config(&settings.twin.breaker)));
    let twin = Arc::new(TwinClient::new(
        TwinConfig {
            aas_base_url: settings.twin.base_url.clone(),
            submodel_base_url: settings.twin.submodel_base_url.clone(),
            timeout: Duration::from_secs_f64(settings.twin.http_timeout_secs),
        },
        Arc::clone(&twin_breaker),
    )?);
    let bus = Arc::new(EventBusClient::new(BusConfig {
        host: settings.bus.host.clone(),
        port: settings.bus.port,
        client_id: settings.bus.client_id.clone(),
        username: settings.bus.username.clone(),
        password: settings.bus.password.clone(),
        base_reconnect_delay: Duration::from_secs_f64(settings.bus.base_reconnect_delay_secs),
        max_reconnect_delay: Duration::from_secs_f64(settings.bus.max_reconnect_delay_secs),
    }));

    // Shadow: handlers and subscriptions go in before the first snapshot,
    // then the bus connects.
    let shadow = Arc::new(ShadowManager::new(
        Arc::clone(&twin),
        ShadowConfig {
            aas_id: settings.twin.aas_id.clone(),
            aas_repo_id: settings.twin.aas_repo_id.clone(),
            submodel_repo_id: settings.twin.submodel_repo_id.clone(),
        },
    ));
    shadow
        .initialize(&bus)
        .await
        .context("initial twin snapshot")?;
    bus.start();

    // Capability index from the replicated operations.
    let tools = tool_specs(&shadow.get_operations().await);
    info!(count = tools.len(), "loaded tools");
    let capabilities = Arc::new(PriorityIndex::new(
        tools,
        settings.capability.always_include.iter().cloned(),
    ));

    // Safety kernel.
    let audit = Arc::new(
        AuditLog::open(&settings.safety.audit_log_path).context("open audit log")?,
    );
    let safety = Arc::new(SafetyKernel::new(
        Arc::clone(&shadow),
        Arc::clone(&twin),
        audit,
        KernelConfig {
            policy_submodel_id: settings.safety.policy_submodel_id.clone(),
            require_policy_verification: settings.safety.policy_verification_required,
            interlock_fail_safe: settings.safety.interlock_fail_safe,
            policy_cache_ttl: Duration::from_secs(settings.safety.policy_cache_ttl_seconds),
            policy_max_age: settings.safety.policy_max_age_seconds.map(Duration::from_secs),
            approval_poll_interval: Duration::from_secs(2),
        },
    ));

    let llm = build_llm(&settings)?;
    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        Arc::clone(&shadow),
        Arc::clone(&twin),
        Arc::clone(&safety),
        capabilities,
        OrchestratorConfig {
            capability_top_k: settings.capability.top_k,
            job_poll_interval: Duration::from_secs_f64(settings.jobs.poll_interval_secs),
            job_timeout: Duration::from_secs_f64(settings.jobs.timeout_secs),
            job_http_fallback_polls: settings.jobs.http_fallback_polls,
            approval_timeout: Duration::from_secs_f64(settings.safety.approval_timeout_secs),
            tool_concurrency_limit: settings.server.tool_concurrency_limit,
            llm_concurrency_limit: settings.llm.concurrency_limit,
            history_limit: 64,
        },
    ));

    let drain = Arc::new(DrainState::default());
    let state = Arc::new(AppState {
        orchestrator,
        safety,
        shadow,
        bus: Arc::clone(&bus),
        twin_breaker,
        limiter: Arc::new(RateLimiter::new(
            settings.server.rate_limit_rpm,
            settings.server.rate_limit_burst,
        )),
        settings: Arc::clone(&settings),
        drain: Arc::clone(&drain),
        metrics: Arc::new(Metrics::default()),
        started_at: Instant::now(),
    });

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("bind {}", settings.server.bind))?;
    info!(bind = %settings.server.bind, aas_id = %settings.twin.aas_id, "twinward agent listening");

    let shutdown_drain = Arc::clone(&drain);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_drain.trigger_shutdown();
    })
    .await
    .context("serve")?;

    drain
        .wait_for_drain(Duration::from_secs_f64(settings.server.drain_timeout_secs))
        .await;
    bus.shutdown();
    info!("twinward agent shutdown complete");
    Ok(())
}
