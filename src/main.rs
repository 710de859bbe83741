use anyhow::{Result, anyhow};
use portal_runner::cli::{Args, ConfigDiscovery, ExecutionMode, RunConfig};
use portal_runner::task::TaskTree;
use portal_runner::{
    ActionPlan, ActionRegistry, LoggingEventHandler, PortalFixture, RunOrchestrator, RunSummary,
    SimulatedPortal, TaskId, env, export,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode = args.mode().map_err(|e| anyhow!(e))?;

    let verbose = matches!(&mode, ExecutionMode::Run(config) if config.verbose);
    let default_filter = if verbose {
        env::VERBOSE_LOG_FILTER
    } else {
        env::DEFAULT_LOG_FILTER
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match mode {
        ExecutionMode::Run(config) => run_mode(config).await,
        ExecutionMode::ShowConfig { config_override } => {
            ConfigDiscovery::show_discovery_info(config_override.as_deref())
        }
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Configuration file: {:?}", path);
            Ok(())
        }
    }
}

async fn run_mode(config: RunConfig) -> Result<()> {
    let runner_config = ConfigDiscovery::discover_config(config.config_override.as_deref())?;
    let registry = ActionRegistry::default();
    for action_id in &config.action_ids {
        if registry.get(action_id).is_none() {
            return Err(anyhow!(
                "Unknown action '{}'. Available actions: {}",
                action_id,
                registry.ids().join(", ")
            ));
        }
    }

    info!("Loading portal fixture from {:?}", config.fixture);
    let fixture = PortalFixture::from_json_file(&config.fixture)?;
    let portal = Arc::new(SimulatedPortal::new(fixture));
    let clients = portal.clients().to_vec();
    let client_ids: Vec<String> = if config.client_ids.is_empty() {
        clients.iter().map(|c| c.id.clone()).collect()
    } else {
        config.client_ids.clone()
    };

    let mut orchestrator = RunOrchestrator::new(
        runner_config,
        registry,
        clients,
        portal.clone(),
        portal,
    );
    orchestrator.add_event_handler(Box::new(LoggingEventHandler));
    orchestrator
        .tasks()
        .add_event_handler(Box::new(LoggingEventHandler))
        .await;

    let plans: Vec<ActionPlan> = config
        .action_ids
        .iter()
        .map(|action_id| ActionPlan {
            action_id: action_id.clone(),
            input: config.input.clone(),
        })
        .collect();

    let Some(mut summary) = orchestrator.run_selected(&client_ids, &plans).await? else {
        warn!("Nothing was run");
        return Ok(());
    };
    print_summary(&orchestrator, &summary).await;

    let mut retries_left = config.retries;
    while retries_left > 0 && !summary.retryable.is_empty() {
        retries_left -= 1;
        match orchestrator.retry_failures().await? {
            Some(retry) => {
                print_summary(&orchestrator, &retry).await;
                summary = retry;
            }
            None => break,
        }
    }

    let outputs = orchestrator.merged_outputs();
    println!();
    println!("Merged outputs:");
    for merged in &outputs {
        println!(
            "  {} / {}: {} records from {} units",
            merged.client_id,
            merged.action_id,
            merged.output.record_count(),
            merged.output.units.len()
        );
    }
    if !summary.retryable.is_empty() {
        println!();
        println!("Still failing:");
        for failures in &summary.retryable {
            println!("  {}: {}", failures.client_id, failures.action_ids.join(", "));
        }
    }

    if let Some(path) = &config.output {
        export::write_json_file(path, &outputs)?;
        println!("Wrote {:?}", path);
    }

    Ok(())
}

async fn print_summary(orchestrator: &RunOrchestrator, summary: &RunSummary) {
    let tree = orchestrator.tasks().snapshot().await;
    println!();
    print_task(&tree, summary.root_task, 0);
}

fn print_task(tree: &TaskTree, task_id: TaskId, depth: usize) {
    let Ok(task) = tree.get_task(task_id) else {
        return;
    };
    let progress = tree
        .effective_progress(task_id)
        .ok()
        .and_then(|p| p.fraction())
        .map(|f| format!(" {:.0}%", f * 100.0))
        .unwrap_or_default();
    let error = task
        .error
        .as_ref()
        .map(|e| format!(" ({})", e))
        .unwrap_or_default();
    println!(
        "{}{} [{:?}]{}{}",
        "  ".repeat(depth),
        task.title,
        task.state,
        progress,
        error
    );
    for &child in &task.children {
        print_task(tree, child, depth + 1);
    }
}
