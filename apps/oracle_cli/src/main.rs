use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use oracle_client::{LocalAgentBinding, ReasoningController, ReasoningView, RunHandler};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod http_agent;
mod scripted;

use config::load_settings;
use http_agent::HttpAgent;
use scripted::ScriptedPipeline;

const SYNC_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    query: String,
    /// Remote agent base URL; runs the offline scripted pipeline when absent.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "oracle.toml")]
    config: PathBuf,
    #[arg(long)]
    step_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(server_url) = args.server_url {
        settings.server_url = Some(server_url);
    }
    if let Some(step_delay_ms) = args.step_delay_ms {
        settings.step_delay_ms = step_delay_ms;
    }

    let handler: Arc<dyn RunHandler> = match settings.server_url.as_deref() {
        Some(server_url) => Arc::new(HttpAgent::new(server_url)?),
        None => Arc::new(ScriptedPipeline::new(settings.step_delay())),
    };
    let binding = LocalAgentBinding::with_handler(handler);
    let controller = ReasoningController::new_with_options(
        Arc::new(binding.clone()),
        settings.controller_options(),
    );
    controller.attach(binding.updates());

    let subscription = controller.on_stage_change(|stage| println!("-> {stage}"));
    let mut pulse = controller.watch_pulse();
    let pulse_task = tokio::spawn(async move {
        while pulse.changed().await.is_ok() {
            let current = *pulse.borrow_and_update();
            debug!(pulsing = ?current, "pulse changed");
        }
    });

    if args.query.trim().is_empty() {
        warn!("query is blank; nothing to run");
    }
    controller
        .send_query(&args.query)
        .await
        .context("reasoning run failed")?;

    if tokio::time::timeout(SYNC_SETTLE_TIMEOUT, wait_for_sync(&controller, &binding))
        .await
        .is_err()
    {
        warn!("controller did not catch up with the final snapshot");
    }
    print_view(&controller.view());

    subscription.unsubscribe();
    controller.teardown();
    pulse_task.abort();
    Ok(())
}

async fn wait_for_sync(controller: &ReasoningController, binding: &LocalAgentBinding) {
    loop {
        let published = binding.current();
        let running = published.running;
        let mirrored = published.snapshot.unwrap_or_default();
        if controller.is_loading() == running && controller.state() == mirrored {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn print_view(view: &ReasoningView) {
    println!();
    println!("query:        {}", view.state.query);
    println!("stage:        {}", view.current_node);
    println!("risk score:   {:.0}%", view.risk_score() * 100.0);
    println!("backtracks:   {}", view.backtrack_count());
    if let Some(reason) = view.state.active_backtrack_reason() {
        println!("backtracking: {reason}");
    }
    if let Some(scout) = view.scout_data() {
        println!(
            "conditions:   {} / {} track / {}",
            scout.racecourse, scout.track_condition, scout.weather
        );
    }
    if let Some(draft) = view.strategy_draft() {
        println!(
            "strategy:     {} ({:.0}% confidence)",
            draft.recommended_horse,
            draft.confidence_score * 100.0
        );
    }
    for call in view.tool_calls() {
        let args = serde_json::Value::Object(call.args.clone());
        println!("tool [{}]: {} {args}", call.node, call.tool);
    }
    for step in view.reasoning_trace() {
        match &step.action {
            Some(action) => println!("[{}] {} ({action})", step.node, step.thought),
            None => println!("[{}] {}", step.node, step.thought),
        }
    }
    match view.final_recommendation() {
        Some(recommendation) => println!("\n{recommendation}"),
        None => println!("\nno recommendation"),
    }
}
