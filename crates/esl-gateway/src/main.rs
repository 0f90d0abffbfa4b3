use anyhow::Context;
use clap::Parser;
use esl_gateway::logging::init_logging;
use esl_gateway::{Gateway, GatewayConfig, IdleTimeoutPolicy, RetryCeilingPolicy};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "esl-gateway", about = "ESL access point gateway")]
struct Args {
    /// TOML file with gateway settings; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    store: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long)]
    idle_timeout_policy: Option<IdleTimeoutPolicy>,
    #[arg(long)]
    retry_ceiling_policy: Option<RetryCeilingPolicy>,
    #[arg(long)]
    dispatch_interval_ms: Option<u64>,
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(addr) = resolve_addr(&args.addr) {
        config.listen_addr = addr;
    }
    if !args.store.trim().is_empty() {
        config.default_store_code = args.store.trim().to_string();
    }
    if !args.log_dir.trim().is_empty() {
        config.log_dir = Some(args.log_dir.clone());
    }
    config.debug = config.debug || args.debug || env_true("ESL_GATEWAY_DEBUG");
    if let Some(policy) = args.idle_timeout_policy {
        config.idle_timeout_policy = policy;
    }
    if let Some(policy) = args.retry_ceiling_policy {
        config.retry_ceiling_policy = policy;
    }
    if let Some(interval) = args.dispatch_interval_ms {
        config.dispatch_interval_ms = interval;
    }
    Ok(config)
}

fn resolve_addr(addr_flag: &str) -> Option<String> {
    if !addr_flag.trim().is_empty() {
        return Some(addr_flag.to_string());
    }
    match std::env::var("ESL_GATEWAY_ADDR") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config);

    let gateway = Gateway::new(config);
    gateway.on_task_results(|batch| match serde_json::to_string(&batch) {
        Ok(json) => info!(event = "esl_task_results", results = batch.results.len(), batch = %json),
        Err(err) => warn!(event = "esl_task_results_encode_failed", error = %err),
    });
    gateway.on_ap_status(|status| match serde_json::to_string(&status) {
        Ok(json) => info!(event = "esl_ap_status", store = %status.store_code, ap_id = %status.ap_id, status = %json),
        Err(err) => warn!(event = "esl_ap_status_encode_failed", error = %err),
    });

    let addr = gateway.start().await.context("starting gateway")?;
    info!(event = "esl_gateway_ready", addr = %addr, store = %gateway.config().default_store_code);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!(event = "esl_gateway_signal", signal = "ctrl_c");
    gateway.shutdown().await;
    Ok(())
}
