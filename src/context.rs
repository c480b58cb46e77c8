//! Composition root shared by every agent run
use crate::agent::{AgentError, AgentResult, AgentRunConfig, ChatModel, SchemaCache, create_chat_model};
use crate::config::Config;
use crate::database::{SqlExecutor, normalize_database_url};
use crate::database_postgresql::PostgresClient;
use crate::dummy_data::GenerationMode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Long-lived state: configuration, model client, database handle and the
/// caches that outlive a single run. Share it behind an `Arc`.
pub struct AgentContext {
    config: Config,
    model: Option<Arc<dyn ChatModel>>,
    executor: Arc<dyn SqlExecutor>,
    crm_schema: SchemaCache,
    seed_schema: SchemaCache,
    seed_configs: RwLock<HashMap<GenerationMode, Arc<AgentRunConfig>>>,
}

impl AgentContext {
    /// Assemble from parts. Without a model, runs report a configuration
    /// error instead of calling out.
    pub fn new(
        config: Config,
        model: Option<Arc<dyn ChatModel>>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        let crm_schema = SchemaCache::for_tables(
            config.schema.include_tables.clone(),
            config.schema.sample_rows,
        );
        let seed_schema = SchemaCache::all_tables(config.schema.sample_rows);

        Self {
            config,
            model,
            executor,
            crm_schema,
            seed_schema,
            seed_configs: RwLock::new(HashMap::new()),
        }
    }

    /// Build the production context: PostgreSQL pool and OpenAI-compatible
    /// client. A missing API key is tolerated here and reported per run.
    pub async fn connect(config: Config) -> AgentResult<Self> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            AgentError::ConfigurationError(
                "DATABASE_URL is not set. Pass --database-url or set it in the config file"
                    .to_string(),
            )
        })?;
        let url = normalize_database_url(url);
        let executor = PostgresClient::connect(&url, &config.database).await?;

        let model = match create_chat_model(&config.ai) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!("Model client unavailable: {}", e);
                None
            }
        };

        Ok(Self::new(config, model, Arc::new(executor)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> Arc<dyn SqlExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> AgentResult<Arc<dyn ChatModel>> {
        self.model.clone().ok_or_else(|| {
            AgentError::ConfigurationError(
                "AI_API_KEY is not set. Add it to the environment or to [ai] api_key".to_string(),
            )
        })
    }

    /// Schema text of the allow-listed CRM tables
    pub async fn crm_schema(&self) -> AgentResult<&str> {
        self.crm_schema.get_or_load(self.executor.as_ref()).await
    }

    /// Schema text of every public table, for the seeder
    pub async fn full_schema(&self) -> AgentResult<&str> {
        self.seed_schema.get_or_load(self.executor.as_ref()).await
    }

    pub(crate) async fn cached_seed_config(&self, mode: GenerationMode) -> Option<Arc<AgentRunConfig>> {
        self.seed_configs.read().await.get(&mode).cloned()
    }

    /// Store a compiled config; an entry raced in first wins.
    pub(crate) async fn store_seed_config(
        &self,
        mode: GenerationMode,
        config: AgentRunConfig,
    ) -> Arc<AgentRunConfig> {
        let mut configs = self.seed_configs.write().await;
        let entry = configs.entry(mode).or_insert_with(|| {
            debug!("Compiled seed config for mode {}", mode);
            Arc::new(config)
        });
        Arc::clone(entry)
    }
}
