use std::sync::Arc;

use longform::api::{router, AppState};
use longform::config::EngineConfig;
use longform::engine::EngineDeps;
use longform::llm::{HttpCatalog, HttpProvider};
use longform::store::{ChatStore, Database, JobStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    let api_key = std::env::var("LONGFORM_API_KEY")
        .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
        .unwrap_or_else(|_| {
            eprintln!("Error: LONGFORM_API_KEY not set");
            eprintln!("  export LONGFORM_API_KEY=sk-or-...");
            std::process::exit(1);
        });

    let db = Arc::new(Database::open(&config.database_path)?);
    let deps = EngineDeps {
        jobs: Arc::new(JobStore::new(Arc::clone(&db))),
        chats: Arc::new(ChatStore::new(Arc::clone(&db))),
        llm: Arc::new(HttpProvider::new(
            config.provider_base_url.clone(),
            secrecy::SecretString::from(api_key),
        )),
        catalog: Arc::new(HttpCatalog::new(
            config.provider_base_url.clone(),
            config.catalog_ttl,
        )),
        config: config.clone(),
    };

    let app = router(AppState { deps });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Longform listening");
    axum::serve(listener, app).await?;

    Ok(())
}
