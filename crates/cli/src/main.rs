//! `stageflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate workflow and rule set documents.
//! - `select`  : show which workflow a work item would get, and why.
//! - `schema`  : print the JSON Schema of the definition documents.
//! - `simulate`: drive a workflow with scripted stage results in memory.
//! - `migrate` : run pending database migrations.

mod documents;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agents::LogDispatcher;
use db::{MemoryStore, PgStore, models::NewWorkItem};
use engine::{
    ConditionRegistry, EngineConfig, Orchestrator, SelectionInput, Step,
    WorkflowExecutor, models::definition_schemas, select,
};

use crate::documents::{load_definitions, parse_priority, parse_result};

#[derive(Parser)]
#[command(
    name = "stageflow",
    about = "Workflow orchestration for multi-agent work items",
    version
)]
struct Cli {
    /// Engine configuration file (TOML). Missing file means defaults.
    #[arg(long, env = "STAGEFLOW_CONFIG", default_value = "stageflow.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct DefinitionArgs {
    /// JSON array of workflow definitions.
    #[arg(long)]
    workflows: PathBuf,
    /// Selection rule set (JSON). Defaults to the first workflow, no rules.
    #[arg(long)]
    rules: Option<PathBuf>,
}

#[derive(clap::Args)]
struct ItemArgs {
    #[arg(long, default_value = "untitled")]
    title: String,
    #[arg(long)]
    goal: Option<String>,
    /// P0..P3
    #[arg(long)]
    priority: Option<String>,
    /// Repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Skip rule matching and use this workflow.
    #[arg(long)]
    workflow: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate definitions and print the rule evaluation order.
    Validate {
        #[command(flatten)]
        definitions: DefinitionArgs,
    },
    /// Select a workflow for the described work item.
    Select {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        item: ItemArgs,
    },
    /// Print the JSON Schema for workflow and rule set documents.
    Schema,
    /// Run a work item through its workflow with scripted results.
    Simulate {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        item: ItemArgs,
        /// Comma-separated `status[:feedback]` list, e.g.
        /// `approved,rejected:missing tests,approved`.
        #[arg(long, value_delimiter = ',')]
        results: Vec<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config).await?;
    let conditions = ConditionRegistry::new();

    match cli.command {
        Command::Validate { definitions } => {
            let defs = load(&definitions, &conditions, &config)?;
            println!("valid: {} workflows", defs.workflow_ids().count());
            println!("default workflow: {}", defs.rule_set().default_workflow_id);
            for (i, rule) in defs.rule_set().rules.iter().enumerate() {
                println!("{:>3}. {} -> {}", i + 1, rule.id, rule.workflow_id);
            }
        }

        Command::Select { definitions, item } => {
            let defs = load(&definitions, &conditions, &config)?;
            let input = selection_input(&item)?;
            let selection = select(&input, &defs)?;
            println!("{}", serde_json::to_string_pretty(&selection)?);
        }

        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&definition_schemas())?);
        }

        Command::Simulate { definitions, item, results } => {
            let defs = load(&definitions, &conditions, &config)?;
            simulate(defs, conditions, config, item, results).await?;
        }

        Command::Migrate { database_url } => {
            info!("Running migrations");
            let store = PgStore::connect(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            store.migrate().await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
    }

    Ok(())
}

fn load(
    args: &DefinitionArgs,
    conditions: &ConditionRegistry,
    config: &EngineConfig,
) -> Result<engine::DefinitionSet> {
    load_definitions(&args.workflows, args.rules.as_deref(), conditions, config)
}

fn selection_input(item: &ItemArgs) -> Result<SelectionInput> {
    let priority = parse_priority(item.priority.as_deref())?;

    Ok(SelectionInput {
        requested_workflow_id: item.workflow.clone(),
        priority,
        tags: item.tags.clone(),
        title: item.title.clone(),
        goal: item.goal.clone().unwrap_or_default(),
    })
}

async fn simulate(
    definitions: engine::DefinitionSet,
    conditions: ConditionRegistry,
    config: EngineConfig,
    item: ItemArgs,
    results: Vec<String>,
) -> Result<()> {
    let scripted = results
        .iter()
        .map(|r| parse_result(r))
        .collect::<Result<Vec<_>>>()?;
    let priority = parse_priority(item.priority.as_deref())?;

    let store = MemoryStore::new();
    let record = store
        .insert_work_item(NewWorkItem {
            title: item.title.clone(),
            goal: item.goal.clone(),
            priority: priority.map(|p| p.to_string()),
            tags: item.tags.clone(),
            metadata: serde_json::json!({}),
        })
        .await;

    let executor = WorkflowExecutor::new(Arc::new(definitions), Arc::new(conditions), config.executor);
    let orchestrator = Orchestrator::new(store.clone(), LogDispatcher, executor, config.dispatch);

    let step = orchestrator.start(record.id, item.workflow.as_deref()).await?;
    if let Some(selection) = &step.selection {
        println!("selected {} ({})", selection.workflow_id, selection.reason);
    }
    print_step("start", &step)?;

    let mut ctx = step.outcome.next_context;
    for (raw, result) in results.iter().zip(scripted) {
        let Some(current) = ctx.take() else {
            warn!("work item is no longer active; ignoring remaining results");
            break;
        };
        let step = orchestrator.advance(&current, result).await?;
        print_step(raw, &step)?;
        ctx = step.outcome.next_context;
    }

    if let Some(final_item) = store.work_item(record.id).await {
        println!(
            "final: {} (iteration {}{})",
            final_item.status,
            final_item.iteration_count,
            final_item
                .blocked_reason
                .map(|r| format!(", blocked: {r}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_step(label: &str, step: &Step) -> Result<()> {
    println!("{label:>12} => {}", serde_json::to_string(&step.outcome)?);
    if let Some(message) = &step.outcome.escalation_message {
        println!("{message}");
    }
    Ok(())
}
