use clap::Parser;
use kopikita_agent::agent::{HistoryEntry, sanitize};
use kopikita_agent::chat::{ChatReply, ChatRequest, generate_chat_reply};
use kopikita_agent::cli::{Args, Command, check_sql_policy};
use kopikita_agent::config::Config;
use kopikita_agent::context::AgentContext;
use kopikita_agent::dummy_data::{SeedOutput, run_dummy_data_agent};
use kopikita_agent::logging;
use kopikita_agent::promo_ideas::generate_promo_ideas;
use std::error::Error as StdError;
use std::path::Path;
use std::process::ExitCode;
use tracing::debug;

fn read_history(path: &Path) -> Result<Vec<HistoryEntry>, Box<dyn StdError>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read history file {}: {}", path.display(), e))?;
    let history = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid history file {}: {}", path.display(), e))?;
    Ok(history)
}

fn print_config_keys() {
    for (key, description) in Config::documentation() {
        if key.is_empty() {
            println!();
        } else if key.starts_with('[') {
            println!("{}  {}", key, description);
        } else {
            println!("  {:<26}{}", key, description);
        }
    }
}

/// Commands answered without a database connection
fn run_offline(command: Command, config: &Config) -> Result<(), Box<dyn StdError>> {
    match command {
        Command::CheckSql {
            query,
            write,
            mode,
            limit,
        } => {
            let policy = check_sql_policy(write, mode, limit, config.chat.row_limit);
            let sanitized = sanitize(&query, &policy)
                .map_err(|e| format!("Rejected ({} policy): {}", policy.label, e))?;
            println!("{}", sanitized);
        }
        Command::ConfigKeys => print_config_keys(),
        _ => {}
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<(), Box<dyn StdError>> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.database_url.clone() {
        config.database_url = Some(url);
    }

    let _log_guard = logging::init(&config.logging, args.verbose)?;
    debug!("{:?}", args);
    debug!("{:?}", config);

    if !args.command.needs_database() {
        return run_offline(args.command, &config);
    }

    let context = AgentContext::connect(config)
        .await
        .map_err(|e| e.user_message())?;

    match args.command {
        Command::Chat {
            message,
            history,
            json,
        } => {
            let history = match history {
                Some(path) => read_history(&path)?,
                None => Vec::new(),
            };
            let reply = generate_chat_reply(&context, ChatRequest::new(message, history)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ChatReply { reply })?);
            } else {
                println!("{}", reply);
            }
        }
        Command::PromoIdeas { week } => {
            let report = generate_promo_ideas(&context, week.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Seed { mode, json } => {
            let output = run_dummy_data_agent(&context, mode)
                .await
                .map_err(|e| e.user_message())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&SeedOutput { output })?);
            } else {
                println!("{}", output);
            }
        }
        Command::Schema => {
            let schema = context.crm_schema().await.map_err(|e| e.user_message())?;
            println!("{}", schema);
        }
        Command::CheckSql { .. } | Command::ConfigKeys => {}
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
