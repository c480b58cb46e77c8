//! Dummy data seeder
//!
//! A write-capable agent fills the CRM with realistic coffee-shop records.
//! The generation mode decides whether it may create customers, tags and
//! products or only new sales against existing rows.
use crate::agent::{
    AgentDriver, AgentOutcome, AgentResult, AgentRunConfig, ChatMessage, ExecuteSqlTool,
    SqlPolicy, ToolSet,
};
use crate::config::SeedConfig;
use crate::context::AgentContext;
use crate::database::SqlExecutor;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const STEP_LIMIT_OUTPUT: &str =
    "Agent reached the maximum number of steps. Try again with the lighter `existing` mode.";
pub const NO_OUTPUT: &str = "No output from agent.";

/// Tables the `existing` mode may read but never write
pub const EXISTING_MODE_FORBIDDEN: &[&str] = &["Tag", "Product", "Customer"];

const SEED_REQUEST: &str = "Generate dummy data for the active mode. Stop once the minimum targets are met, then show the final summary.";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Mostly brand-new tags, products, customers and sales
    New,
    /// Reuse existing rows, insert sales only
    Existing,
    /// Combine existing and new rows
    #[default]
    Mixed,
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationMode::New => write!(f, "new"),
            GenerationMode::Existing => write!(f, "existing"),
            GenerationMode::Mixed => write!(f, "mixed"),
        }
    }
}

impl GenerationMode {
    pub fn policy(self) -> SqlPolicy {
        let policy = SqlPolicy::read_write().with_label(self.to_string());
        match self {
            GenerationMode::Existing => policy.with_forbidden_tables(EXISTING_MODE_FORBIDDEN.iter().copied()),
            GenerationMode::New | GenerationMode::Mixed => policy,
        }
    }

    pub fn minimum_targets(self) -> &'static [&'static str] {
        match self {
            GenerationMode::Existing => &[
                "- at least 10 sales",
                "- 0 new tags",
                "- 0 new products",
                "- 0 new customers",
            ],
            GenerationMode::New | GenerationMode::Mixed => &[
                "- at least 1 tags",
                "- at least 1 products",
                "- at least 1 customers",
                "- at least 10 sales",
            ],
        }
    }
}

/// `--json` output of a seeding run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedOutput {
    pub output: String,
}

pub fn seed_system_prompt(schema: &str, mode: GenerationMode) -> String {
    let mut lines = vec![
        "You are a PostgreSQL data generator for a coffee shop CRM.".to_string(),
        "Use tool execute_sql to inspect tables and insert realistic data.".to_string(),
        "Authoritative schema (do not invent table or column names):".to_string(),
        schema.to_string(),
        "Mode:".to_string(),
        format!("- {}", mode),
        "Mode rules:".to_string(),
        "- new: mostly create brand-new tags/products/customers/sales".to_string(),
        "- existing: strictly reuse existing tags/products/customers and only insert new sales".to_string(),
        "- mixed: combine existing and new rows. can create more than minimum target".to_string(),
        "Required minimum inserts in this run:".to_string(),
    ];
    lines.extend(mode.minimum_targets().iter().map(|t| t.to_string()));
    lines.extend(
        [
            "Hard constraints:",
            "- every inserted sale MUST explicitly set soldAt (do not rely on DB default)",
            "- soldAt expression: NOW() - (RANDOM() * INTERVAL '30 days')",
            "- enforce soldAt between NOW() - INTERVAL '30 days' and NOW()",
            "- quantity between 1 and 5",
            "- totalPrice = product price * quantity",
            "- if mode is existing, NEVER INSERT INTO, UPDATE or DELETE FROM Tag/Product/Customer",
            "- use Indonesian-style names and realistic coffee-shop records",
            "- avoid DDL and schema changes",
            "- execute one SQL statement per tool call",
            "- every customer MUST have minimum one interest Tag. one customer can have multiple Tag",
            "Final output: concise summary of inserted/updated rows per entity and whether target was fully met.",
        ]
        .iter()
        .map(|l| l.to_string()),
    );
    lines.join("\n")
}

pub fn seed_run_config(
    config: &SeedConfig,
    executor: Arc<dyn SqlExecutor>,
    schema: &str,
    mode: GenerationMode,
) -> AgentRunConfig {
    AgentRunConfig {
        max_steps: config.max_steps,
        timeout: config.timeout(),
        tools: ToolSet::new().with(ExecuteSqlTool::new(executor, mode.policy()).into_definition()),
        system_prompt: seed_system_prompt(schema, mode),
    }
}

/// Compiled config for `mode`, built on first use and cached on the context.
pub async fn compiled_seed_config(
    context: &AgentContext,
    mode: GenerationMode,
) -> AgentResult<Arc<AgentRunConfig>> {
    if let Some(config) = context.cached_seed_config(mode).await {
        return Ok(config);
    }

    let schema = context.full_schema().await?;
    let config = seed_run_config(&context.config().seed, context.executor(), schema, mode);
    Ok(context.store_seed_config(mode, config).await)
}

/// Run the seeder and return its summary.
///
/// Hitting the step limit is reported as output, not as an error.
pub async fn run_dummy_data_agent(context: &AgentContext, mode: GenerationMode) -> AgentResult<String> {
    let model = context.model()?;
    let config = compiled_seed_config(context, mode).await?;
    info!("Seeding dummy data in {} mode", mode);

    match AgentDriver::new(model)
        .run(&config, vec![ChatMessage::user(SEED_REQUEST)])
        .await
    {
        AgentOutcome::Finished(result) => {
            info!("Seeding finished after {} steps", result.steps);
            if result.final_text.is_empty() {
                Ok(NO_OUTPUT.to_string())
            } else {
                Ok(result.final_text)
            }
        }
        AgentOutcome::StepLimitExceeded { max_steps, .. } => {
            warn!("Seeding stopped at the step limit ({})", max_steps);
            Ok(STEP_LIMIT_OUTPUT.to_string())
        }
        outcome => outcome.into_result().map(|result| result.final_text),
    }
}
