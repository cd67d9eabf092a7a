//! HTTP 接口
//!
//! | Method | Path | 说明 |
//! |--------|------|------|
//! | `POST` | `/nf/suggest-budget-links` | 发票关联建议 |
//! | `PUT`  | `/nf/items/:id/link` | 手工关联 / 清除 |
//! | `POST` | `/nf/items/:id/apply-suggestion` | 应用高置信度建议 |
//! | `POST` | `/nf/link-to-budget` | 批量关联 |
//! | `POST` / `PUT` | `/nf/items/:id/classify` | 自动 / 手工分类 |
//! | `GET`  | `/nf/items/:id/links` | 关联历史 |
//! | `PUT`  | `/nf/:id/process`, `/nf/:id/validate`, `/nf/:id/reject` | 状态变更 |
//! | `PUT`  | `/nf/:id/contract` | 设置所属合同 |
//! | `POST` | `/nf/bulk-validate`, `/nf/bulk-reject` | 批量状态变更 |
//! | `POST` | `/contracts/:id/recalculate-execution` | 重算 |
//! | `GET`  | `/contracts/:id/execution` | 执行视图 |
//! | `GET`  | `/contracts/:id/budget/:item_id/realization` | 单个预算项 |
//! | `GET`  | `/contracts/:id/unlinked-nfs` | 含未关联明细的发票 |
//! | `GET`  | `/contracts/:id/execution/export` | CSV 导出 |
//! | `POST` | `/import/budget`, `/import/nf` | 导入 |

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::db::ReconcileStore;
use crate::service::ReconciliationService;

pub use error::ApiError;
pub use handlers::health_check;

/// 构建路由, 附带请求级 tracing
pub fn router<S: ReconcileStore>(service: Arc<ReconciliationService<S>>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // 匹配与关联
        .route("/nf/suggest-budget-links", post(handlers::suggest_links::<S>))
        .route("/nf/link-to-budget", post(handlers::link_to_budget::<S>))
        .route("/nf/items/:id/link", put(handlers::manual_link::<S>))
        .route("/nf/items/:id/apply-suggestion", post(handlers::apply_suggestion::<S>))
        .route(
            "/nf/items/:id/classify",
            post(handlers::classify::<S>).put(handlers::classify_manual::<S>),
        )
        .route("/nf/items/:id/links", get(handlers::link_history::<S>))
        // 发票状态
        .route("/nf/bulk-validate", post(handlers::bulk_validate::<S>))
        .route("/nf/bulk-reject", post(handlers::bulk_reject::<S>))
        .route("/nf/:id/process", put(handlers::mark_processed::<S>))
        .route("/nf/:id/validate", put(handlers::validate_invoice::<S>))
        .route("/nf/:id/reject", put(handlers::reject_invoice::<S>))
        .route("/nf/:id/contract", put(handlers::associate_contract::<S>))
        // 合同执行
        .route(
            "/contracts/:id/recalculate-execution",
            post(handlers::recalculate_execution::<S>),
        )
        .route("/contracts/:id/execution", get(handlers::get_execution::<S>))
        .route("/contracts/:id/execution/export", get(handlers::export_execution::<S>))
        .route(
            "/contracts/:id/budget/:item_id/realization",
            get(handlers::get_item_realization::<S>),
        )
        .route("/contracts/:id/unlinked-nfs", get(handlers::unlinked_invoices::<S>))
        // 导入
        .route("/import/budget", post(handlers::import_budget::<S>))
        .route("/import/nf", post(handlers::import_invoice::<S>))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(service)
}
