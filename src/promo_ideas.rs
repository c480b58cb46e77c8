//! Weekly promo idea generator
//!
//! The model studies recent sales and customer interests with read-only
//! queries, then answers with a JSON array of promo drafts. Anything short
//! of a usable answer falls back to the built-in idea library, so callers
//! always get ideas to show.
use crate::agent::{
    AgentDriver, AgentRunConfig, ChatMessage, ExecuteSqlTool, SqlPolicy, ToolSet, extract_json,
};
use crate::config::PromoConfig;
use crate::context::AgentContext;
use crate::database::SqlExecutor;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_IDEAS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromoError {
    #[error("Invalid week format '{0}'. Use YYYY-MM-DD")]
    InvalidWeekStart(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PromoIdeaDraft {
    pub theme: String,
    pub segment: String,
    pub why_now: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_time: Option<String>,
    pub suggested_tag_names: Vec<String>,
    pub suggested_product_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoIdeasReport {
    pub week_start: String,
    pub ideas: Vec<PromoIdeaDraft>,
    /// True when the built-in library was returned instead of model output
    pub fallback: bool,
}

/// Accepts a bare array or an object wrapping it under `ideas`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DraftPayload {
    List(Vec<PromoIdeaDraft>),
    Wrapped { ideas: Vec<PromoIdeaDraft> },
}

fn week_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"))
}

/// Monday of the week containing `today`
pub fn current_week_start(today: NaiveDate) -> NaiveDate {
    today - ChronoDuration::days(i64::from(today.weekday().num_days_from_monday()))
}

/// Validate a `YYYY-MM-DD` week start; blank or absent means this week.
pub fn parse_week_start(input: Option<&str>, today: NaiveDate) -> Result<NaiveDate, PromoError> {
    let input = input.map(str::trim).filter(|s| !s.is_empty());
    let Some(input) = input else {
        return Ok(current_week_start(today));
    };

    if !week_re().is_match(input) {
        return Err(PromoError::InvalidWeekStart(input.to_string()));
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| PromoError::InvalidWeekStart(input.to_string()))
}

fn default_idea(
    theme: &str,
    segment: &str,
    why_now: &str,
    message: &str,
    best_time: &str,
    tags: &[&str],
    products: &[&str],
) -> PromoIdeaDraft {
    PromoIdeaDraft {
        theme: theme.to_string(),
        segment: segment.to_string(),
        why_now: why_now.to_string(),
        message: message.to_string(),
        best_time: Some(best_time.to_string()),
        suggested_tag_names: tags.iter().map(|t| t.to_string()).collect(),
        suggested_product_names: products.iter().map(|p| p.to_string()).collect(),
    }
}

/// Built-in library returned when generation fails
pub fn default_promo_ideas() -> Vec<PromoIdeaDraft> {
    vec![
        default_idea(
            "Caramel Week",
            "Pelanggan dengan minat sweet drinks atau caramel (42 pelanggan)",
            "Minat minuman manis jadi kelompok terbesar minggu ini.",
            "Hi! New Caramel Cold Brew lagi hadir minggu ini - diskon 10% sampai Minggu. Mau coba besok pagi?",
            "Morning rush (07:00 - 10:30)",
            &["Sweet Drinks", "Caramel"],
            &["Caramel Cold Brew"],
        ),
        default_idea(
            "Pastry + Coffee Bundle",
            "Pastry lovers + pembeli pagi (18 pelanggan)",
            "Tag pastry naik tajam di hari kerja.",
            "Coba latte + croissant bundle, hemat 10k. Berlaku jam 7-11 pagi. Mau saya siapin?",
            "Weekday breakfast (07:00 - 11:00)",
            &["Pastry"],
            &["Latte", "Croissant"],
        ),
        default_idea(
            "Weekend Oat Milk Special",
            "Pelanggan oat milk dan healthy choice (26 pelanggan)",
            "Minat oat milk stabil naik selama 3 minggu terakhir.",
            "Weekend ini ada Oat Latte special 15% off, cuma Sabtu-Minggu. Mau aku kirim menu rekomendasinya?",
            "Weekend afternoon (14:00 - 18:00)",
            &["Oat Milk", "Healthy Choice"],
            &["Oat Latte"],
        ),
    ]
}

fn clean_names(names: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if !name.is_empty() && !cleaned.iter().any(|n| n == name) {
            cleaned.push(name.to_string());
        }
    }
    cleaned
}

/// Parse model output into at most [`MAX_IDEAS`] usable drafts.
pub fn parse_drafts(text: &str) -> Vec<PromoIdeaDraft> {
    let drafts = match extract_json::<DraftPayload>(text) {
        Some(DraftPayload::List(drafts)) | Some(DraftPayload::Wrapped { ideas: drafts }) => drafts,
        None => return Vec::new(),
    };

    drafts
        .into_iter()
        .filter(|d| !d.theme.trim().is_empty() && !d.message.trim().is_empty())
        .map(|d| PromoIdeaDraft {
            theme: d.theme.trim().to_string(),
            segment: d.segment.trim().to_string(),
            why_now: d.why_now.trim().to_string(),
            message: d.message.trim().to_string(),
            best_time: d
                .best_time
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            suggested_tag_names: clean_names(d.suggested_tag_names),
            suggested_product_names: clean_names(d.suggested_product_names),
        })
        .take(MAX_IDEAS)
        .collect()
}

pub fn promo_system_prompt(schema: &str, week_start: NaiveDate) -> String {
    let week_end = week_start + ChronoDuration::days(6);
    [
        "You are a marketing analyst for an Indonesian coffee shop CRM.".to_string(),
        format!(
            "Plan promotions for the week of {} to {}.",
            week_start.format("%Y-%m-%d"),
            week_end.format("%Y-%m-%d")
        ),
        "Use the execute_sql tool to study the last 30 days of sales, best-selling products and the most common customer interest tags.".to_string(),
        "Base every idea on numbers you queried. Do not invent tags or products that do not exist.".to_string(),
        "".to_string(),
        "Database schema (PostgreSQL, quote mixed-case identifiers):".to_string(),
        schema.to_string(),
        "".to_string(),
        format!("Final answer: ONLY a JSON array of at most {} objects with keys:", MAX_IDEAS),
        "theme, segment, whyNow, message, bestTime, suggestedTagNames (array of existing tag names), suggestedProductNames (array of existing product names).".to_string(),
        "message is a short, friendly WhatsApp text in Indonesian addressed to the customer.".to_string(),
    ]
    .join("\n")
}

pub fn promo_run_config(
    config: &PromoConfig,
    executor: Arc<dyn SqlExecutor>,
    schema: &str,
    week_start: NaiveDate,
) -> AgentRunConfig {
    let policy = SqlPolicy::read_only(config.row_limit);
    AgentRunConfig {
        max_steps: config.max_steps,
        timeout: config.timeout(),
        tools: ToolSet::new().with(ExecuteSqlTool::new(executor, policy).into_definition()),
        system_prompt: promo_system_prompt(schema, week_start),
    }
}

fn fallback_report(week_start: NaiveDate) -> PromoIdeasReport {
    PromoIdeasReport {
        week_start: week_start.format("%Y-%m-%d").to_string(),
        ideas: default_promo_ideas(),
        fallback: true,
    }
}

/// Generate drafts for the given week. Only an invalid week start is an
/// error; generation problems yield the fallback library.
pub async fn generate_promo_ideas(
    context: &AgentContext,
    week_start: Option<&str>,
) -> Result<PromoIdeasReport, PromoError> {
    let week_start = parse_week_start(week_start, Utc::now().date_naive())?;
    info!("Generating promo ideas for week {}", week_start);

    let model = match context.model() {
        Ok(model) => model,
        Err(e) => {
            warn!("Promo ideas fall back: {}", e);
            return Ok(fallback_report(week_start));
        }
    };
    let schema = match context.crm_schema().await {
        Ok(schema) => schema,
        Err(e) => {
            warn!("Promo ideas fall back: {}", e);
            return Ok(fallback_report(week_start));
        }
    };

    let run_config = promo_run_config(&context.config().promo, context.executor(), schema, week_start);
    let request = ChatMessage::user(format!(
        "Generate promo ideas for the week starting {}.",
        week_start.format("%Y-%m-%d")
    ));

    let result = match AgentDriver::new(model)
        .run(&run_config, vec![request])
        .await
        .into_result()
    {
        Ok(result) => result,
        Err(e) => {
            warn!("Promo ideas fall back: {}", e);
            return Ok(fallback_report(week_start));
        }
    };

    let ideas = parse_drafts(&result.final_text);
    if ideas.is_empty() {
        warn!("Promo ideas fall back: no usable drafts in model output");
        return Ok(fallback_report(week_start));
    }

    info!("Generated {} promo ideas in {} steps", ideas.len(), result.steps);
    Ok(PromoIdeasReport {
        week_start: week_start.format("%Y-%m-%d").to_string(),
        ideas,
        fallback: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChatModel;
    use crate::agent::testing::{StubExecutor, StubModel, tool_call_reply};
    use crate::config::Config;
    use rstest::rstest;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[rstest]
    #[case("2025-06-04", "2025-06-02")] // Wednesday
    #[case("2025-06-02", "2025-06-02")] // Monday
    #[case("2025-06-08", "2025-06-02")] // Sunday
    #[case("2025-01-01", "2024-12-30")] // across the year boundary
    fn test_current_week_start(#[case] today: &str, #[case] expected: &str) {
        assert_eq!(current_week_start(date(today)), date(expected));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some("   "))]
    fn test_absent_week_defaults_to_monday(#[case] input: Option<&str>) {
        assert_eq!(
            parse_week_start(input, date("2025-06-05")).unwrap(),
            date("2025-06-02")
        );
    }

    #[rstest]
    #[case("2025-6-2")]
    #[case("2025-02-30")]
    #[case("2025-13-01")]
    #[case("next monday")]
    #[case("2025-06-02T00:00:00Z")]
    fn test_invalid_week_start(#[case] input: &str) {
        assert_eq!(
            parse_week_start(Some(input), date("2025-06-05")),
            Err(PromoError::InvalidWeekStart(input.to_string()))
        );
    }

    #[test]
    fn test_explicit_week_start_is_kept() {
        assert_eq!(
            parse_week_start(Some(" 2024-02-29 "), date("2025-06-05")).unwrap(),
            date("2024-02-29")
        );
    }

    #[test]
    fn test_parse_drafts_from_fenced_array() {
        let text = format!(
            "```json\n{}\n```",
            json!([{
                "theme": " Caramel Week ",
                "segment": "Sweet drink lovers",
                "whyNow": "Caramel sales up",
                "message": "Diskon 10%!",
                "bestTime": "",
                "suggestedTagNames": ["Caramel", " Caramel", ""],
                "suggestedProductNames": ["Caramel Latte"]
            }])
        );
        let drafts = parse_drafts(&text);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].theme, "Caramel Week");
        assert_eq!(drafts[0].best_time, None);
        assert_eq!(drafts[0].suggested_tag_names, vec!["Caramel".to_string()]);
    }

    #[test]
    fn test_parse_drafts_filters_and_caps() {
        let mut ideas: Vec<_> = (0..7)
            .map(|i| json!({"theme": format!("T{}", i), "message": "m"}))
            .collect();
        ideas.insert(0, json!({"theme": "", "message": "no theme"}));
        ideas.insert(1, json!({"theme": "no message"}));

        let drafts = parse_drafts(&json!({ "ideas": ideas }).to_string());
        assert_eq!(drafts.len(), MAX_IDEAS);
        assert_eq!(drafts[0].theme, "T0");
        assert_eq!(drafts[4].theme, "T4");
    }

    #[test]
    fn test_parse_drafts_without_json() {
        assert!(parse_drafts("I could not find enough data.").is_empty());
    }

    #[test]
    fn test_default_library() {
        let ideas = default_promo_ideas();
        let themes: Vec<&str> = ideas.iter().map(|i| i.theme.as_str()).collect();
        assert_eq!(
            themes,
            vec!["Caramel Week", "Pastry + Coffee Bundle", "Weekend Oat Milk Special"]
        );
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = fallback_report(date("2025-06-02"));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["weekStart"], "2025-06-02");
        assert_eq!(value["fallback"], true);
        assert_eq!(value["ideas"][0]["whyNow"], "Minat minuman manis jadi kelompok terbesar minggu ini.");
        assert!(value["ideas"][0]["suggestedTagNames"].is_array());
    }

    #[test]
    fn test_prompt_mentions_week_range() {
        let prompt = promo_system_prompt("SCHEMA", date("2025-06-02"));
        assert!(prompt.contains("2025-06-02 to 2025-06-08"));
        assert!(prompt.contains("SCHEMA"));
    }

    fn context_with(model: StubModel, executor: Arc<StubExecutor>) -> AgentContext {
        let model: Arc<dyn ChatModel> = Arc::new(model);
        AgentContext::new(Config::default(), Some(model), executor)
    }

    #[tokio::test]
    async fn test_generates_drafts_with_row_cap() {
        let executor = Arc::new(StubExecutor::with_count(30));
        let answer = json!([{
            "theme": "Latte Monday",
            "segment": "Morning regulars",
            "whyNow": "30 latte sales last week",
            "message": "Latte 2x lebih hemat hari Senin!",
            "suggestedTagNames": ["Morning"],
            "suggestedProductNames": ["Latte"]
        }])
        .to_string();
        let context = context_with(
            StubModel::replies(vec![
                tool_call_reply("call_1", "SELECT name FROM \"Product\""),
                ChatMessage::assistant(answer),
            ]),
            executor.clone(),
        );

        let report = generate_promo_ideas(&context, Some("2025-06-02")).await.unwrap();

        assert!(!report.fallback);
        assert_eq!(report.week_start, "2025-06-02");
        assert_eq!(report.ideas.len(), 1);
        assert_eq!(report.ideas[0].theme, "Latte Monday");
        assert_eq!(
            executor.executed(),
            vec!["SELECT name FROM \"Product\" LIMIT 20".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unparsable_answer_falls_back() {
        let context = context_with(
            StubModel::replies(vec![ChatMessage::assistant("Sorry, no ideas.")]),
            Arc::new(StubExecutor::default()),
        );
        let report = generate_promo_ideas(&context, Some("2025-06-02")).await.unwrap();
        assert!(report.fallback);
        assert_eq!(report.ideas, default_promo_ideas());
    }

    #[tokio::test]
    async fn test_missing_model_falls_back() {
        let context = AgentContext::new(Config::default(), None, Arc::new(StubExecutor::default()));
        let report = generate_promo_ideas(&context, None).await.unwrap();
        assert!(report.fallback);
        assert_eq!(report.ideas.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_week_is_an_error() {
        let context = AgentContext::new(Config::default(), None, Arc::new(StubExecutor::default()));
        assert!(matches!(
            generate_promo_ideas(&context, Some("2025-02-30")).await,
            Err(PromoError::InvalidWeekStart(_))
        ));
    }
}
