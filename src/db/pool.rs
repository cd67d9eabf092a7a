use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use std::str::FromStr;
use std::time::Duration;

use super::schema;
use crate::config::DatabaseConfig;

/// 创建数据库连接池
pub async fn create_pool(database_url: &str, config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let mut connect_options = PgConnectOptions::from_str(database_url)?;

    // 慢查询日志阈值
    connect_options = connect_options.log_slow_statements(
        tracing::log::LevelFilter::Warn,
        Duration::from_secs(config.slow_statement_secs),
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(connect_options)
        .await
}

/// 执行建表语句
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in schema::statements() {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("schema ready");
    Ok(())
}
