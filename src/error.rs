use thiserror::Error;

/// 对账引擎错误
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// 请求结构不合法 (空驳回原因、无明细发票校验、非法状态转换等)
    #[error("validation failed: {0}")]
    Validation(String),

    /// 引用或并发冲突
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Decode(String),
}

impl ReconcileError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        ReconcileError::NotFound { entity, id }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
