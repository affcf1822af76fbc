#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use crate::archive::ChatArchive;
use crate::backend::BackendClient;
use crate::store::{ChatStore, SqliteStore, SupabaseStore};
use crate::types::*;
use crate::vendors::VendorRegistry;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "LEARNFLOW_PORT", default_value_t = 3000)]
    pub port: u16,
    #[arg(long, env = "LEARNFLOW_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,
    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub gemini_base_url: String,

    #[arg(long, env = "PPLX_API_KEY", hide_env_values = true)]
    pub pplx_api_key: Option<String>,
    #[arg(long, env = "PPLX_BASE_URL", default_value = "https://api.perplexity.ai")]
    pub pplx_base_url: String,

    #[arg(long, env = "CEREBRAS_API_KEY", hide_env_values = true)]
    pub cerebras_api_key: Option<String>,
    #[arg(long, env = "CEREBRAS_BASE_URL", default_value = "https://api.cerebras.ai/v1")]
    pub cerebras_base_url: String,

    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,
    /// SQLite file used for the chat archive when Supabase is not configured.
    #[arg(long, env = "LEARNFLOW_DATABASE")]
    pub database: Option<String>,

    #[arg(long, env = "BACKEND_API_URL", default_value = "http://localhost:8080/api")]
    pub backend_api_url: String,

    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub vendors: Arc<VendorRegistry>,
    pub archive: Option<ChatArchive>,
    pub backend: BackendClient,
    pub args: Arc<Args>,
}

impl AppState {
    /// Builds shared state: one HTTP client, the vendor registry and whichever
    /// chat store the configuration names (Supabase first, then SQLite).
    pub async fn from_args(args: Args) -> Result<Self> {
        let args = Arc::new(args);
        let client = build_http_client(&args)?;
        let vendors = Arc::new(VendorRegistry::new(client.clone(), args.clone()));

        let store: Option<Arc<dyn ChatStore>> = match (&args.supabase_url, &args.supabase_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
                tracing::info!("Chat archive: Supabase at {}", url);
                Some(Arc::new(SupabaseStore::new(client.clone(), url, key)))
            }
            _ => match &args.database {
                Some(path) if !path.is_empty() => {
                    tracing::info!("Chat archive: SQLite at {}", path);
                    let pool = crate::db::init_db(path).await?;
                    Some(Arc::new(SqliteStore::new(pool)))
                }
                _ => {
                    tracing::warn!("No chat archive configured; messages will not be persisted");
                    None
                }
            },
        };

        let archive = store.map(|s| ChatArchive::new(s, vendors.clone()));
        let backend = BackendClient::new(client.clone(), &args.backend_api_url);

        Ok(Self {
            client,
            vendors,
            archive,
            backend,
            args,
        })
    }
}

pub fn build_http_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()?;
    Ok(client)
}
