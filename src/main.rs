use axum::Router;
use budget_reconciler::{api, AppConfig, MemoryStore, PgStore, ReconcileStore, ReconciliationService};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

fn build_app<S: ReconcileStore>(store: S, config: &AppConfig) -> Router {
    let service = Arc::new(ReconciliationService::new(Arc::new(store), config));
    api::router(service)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env()?;
    info!("Starting server with config: {:?}", config);

    // 有数据库地址时使用 PostgreSQL, 否则使用进程内存储
    let app = match config.database.url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url, &config.database).await?;
            info!("Database pool created");
            build_app(store, &config)
        }
        None => {
            info!("No database url configured, using in-memory store");
            build_app(MemoryStore::new(), &config)
        }
    };

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("  POST /nf/suggest-budget-links            - linking suggestions");
    info!("  POST /nf/link-to-budget                  - batch link");
    info!("  PUT  /nf/:id/validate                    - validate invoice");
    info!("  GET  /contracts/:id/execution            - contract execution");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
