use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::ReconcileStore;
use crate::models::{BudgetItem, Contract, Invoice, InvoiceLineItem, LinkRequest};
use crate::service::ReconciliationService;

type Service<S> = State<Arc<ReconciliationService<S>>>;
type ApiResult = Result<Response, ApiError>;

/// 统一响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> ApiResult {
    let response = ApiResponse {
        success: true,
        message: message.into(),
        data: Some(data),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// 请求体: 发票建议
#[derive(Debug, Deserialize)]
pub struct SuggestRequest {
    pub invoice_id: i64,
    pub contract_id: i64,
    #[serde(default)]
    pub unlinked_only: bool,
}

/// 请求体: 手工关联, `budget_item_id` 为空表示清除
#[derive(Debug, Deserialize)]
pub struct ManualLinkRequest {
    pub budget_item_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ApplySuggestionRequest {
    pub budget_item_id: i64,
}

/// 请求体: 批量关联
#[derive(Debug, Deserialize)]
pub struct BatchLinkRequest {
    pub invoice_id: i64,
    pub contract_id: i64,
    pub links: Vec<LinkRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub category: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AssociateContractRequest {
    pub contract_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkValidateRequest {
    pub invoice_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkRejectRequest {
    pub invoice_ids: Vec<i64>,
    #[serde(default)]
    pub reason: String,
}

/// 请求体: 预算导入
#[derive(Debug, Deserialize)]
pub struct ImportBudgetRequest {
    pub contract: Contract,
    pub items: Vec<BudgetItem>,
}

/// 请求体: 发票导入
#[derive(Debug, Deserialize)]
pub struct ImportInvoiceRequest {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLineItem>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

// ─── 匹配与关联 ───────────────────────────────────────────────────────────

pub async fn suggest_links<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<SuggestRequest>,
) -> ApiResult {
    let suggestions = service
        .generate_linking_suggestions(req.invoice_id, req.contract_id, req.unlinked_only)
        .await?;
    ok(format!("{} suggestions for invoice {}", suggestions.len(), req.invoice_id), suggestions)
}

pub async fn manual_link<S: ReconcileStore>(
    State(service): Service<S>,
    Path(line_item_id): Path<i64>,
    Json(req): Json<ManualLinkRequest>,
) -> ApiResult {
    let link = service.manual_link(line_item_id, req.budget_item_id).await?;
    let message = match &link {
        Some(link) => format!("line item {} linked to budget item {}", line_item_id, link.budget_item_id),
        None => format!("line item {} unlinked", line_item_id),
    };
    ok(message, link)
}

pub async fn apply_suggestion<S: ReconcileStore>(
    State(service): Service<S>,
    Path(line_item_id): Path<i64>,
    Json(req): Json<ApplySuggestionRequest>,
) -> ApiResult {
    let link = service.apply_suggestion(line_item_id, req.budget_item_id).await?;
    ok(format!("suggestion applied with confidence {}", link.confidence), link)
}

/// 批量关联; 部分失败仍返回 200, 明细见 `errors`
pub async fn link_to_budget<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<BatchLinkRequest>,
) -> ApiResult {
    let result = service.apply_batch(req.invoice_id, req.contract_id, &req.links).await?;
    let response = ApiResponse {
        success: result.success,
        message: format!(
            "{} linked, {} warnings, {} errors",
            result.linked_items.len(),
            result.warnings.len(),
            result.errors.len()
        ),
        data: Some(result),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

pub async fn classify<S: ReconcileStore>(
    State(service): Service<S>,
    Path(line_item_id): Path<i64>,
) -> ApiResult {
    let outcome = service.classify_line_item(line_item_id).await?;
    let message = if outcome.classified {
        format!("line item {} classified", line_item_id)
    } else {
        format!("no budget item scored high enough for line item {}", line_item_id)
    };
    ok(message, outcome)
}

pub async fn classify_manual<S: ReconcileStore>(
    State(service): Service<S>,
    Path(line_item_id): Path<i64>,
    Json(req): Json<ClassifyRequest>,
) -> ApiResult {
    let line = service.classify_line_item_manual(line_item_id, &req.category).await?;
    ok(format!("line item {} classified manually", line_item_id), line)
}

pub async fn link_history<S: ReconcileStore>(
    State(service): Service<S>,
    Path(line_item_id): Path<i64>,
) -> ApiResult {
    let links = service.link_history(line_item_id).await?;
    ok(format!("{} links", links.len()), links)
}

// ─── 发票状态 ─────────────────────────────────────────────────────────────

pub async fn mark_processed<S: ReconcileStore>(
    State(service): Service<S>,
    Path(invoice_id): Path<i64>,
) -> ApiResult {
    let transition = service.mark_processed(invoice_id).await?;
    ok(format!("invoice {} processed", invoice_id), transition)
}

pub async fn validate_invoice<S: ReconcileStore>(
    State(service): Service<S>,
    Path(invoice_id): Path<i64>,
) -> ApiResult {
    let transition = service.validate_invoice(invoice_id).await?;
    ok(format!("invoice {} validated", invoice_id), transition)
}

pub async fn reject_invoice<S: ReconcileStore>(
    State(service): Service<S>,
    Path(invoice_id): Path<i64>,
    Json(req): Json<RejectRequest>,
) -> ApiResult {
    let transition = service.reject_invoice(invoice_id, &req.reason).await?;
    ok(format!("invoice {} rejected", invoice_id), transition)
}

pub async fn associate_contract<S: ReconcileStore>(
    State(service): Service<S>,
    Path(invoice_id): Path<i64>,
    Json(req): Json<AssociateContractRequest>,
) -> ApiResult {
    let invoice = service.associate_contract(invoice_id, req.contract_id).await?;
    ok(format!("invoice {} associated with contract {}", invoice_id, req.contract_id), invoice)
}

pub async fn bulk_validate<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<BulkValidateRequest>,
) -> ApiResult {
    let outcomes = service.bulk_validate(&req.invoice_ids).await;
    let validated = outcomes.iter().filter(|o| o.success).count();
    ok(format!("{} of {} invoices validated", validated, outcomes.len()), outcomes)
}

pub async fn bulk_reject<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<BulkRejectRequest>,
) -> ApiResult {
    let outcomes = service.bulk_reject(&req.invoice_ids, &req.reason).await;
    let rejected = outcomes.iter().filter(|o| o.success).count();
    ok(format!("{} of {} invoices rejected", rejected, outcomes.len()), outcomes)
}

// ─── 合同执行 ─────────────────────────────────────────────────────────────

pub async fn recalculate_execution<S: ReconcileStore>(
    State(service): Service<S>,
    Path(contract_id): Path<i64>,
) -> ApiResult {
    let execution = service.recalculate_execution(contract_id).await?;
    ok(format!("contract {} recalculated", contract_id), execution)
}

pub async fn get_execution<S: ReconcileStore>(
    State(service): Service<S>,
    Path(contract_id): Path<i64>,
) -> ApiResult {
    let execution = service.get_contract_execution(contract_id).await?;
    ok(format!("{:.2}% executed", execution.financial_progress), execution)
}

pub async fn get_item_realization<S: ReconcileStore>(
    State(service): Service<S>,
    Path((contract_id, budget_item_id)): Path<(i64, i64)>,
) -> ApiResult {
    let realization = service.get_budget_item_realization(contract_id, budget_item_id).await?;
    ok(realization.status.as_str(), realization)
}

pub async fn unlinked_invoices<S: ReconcileStore>(
    State(service): Service<S>,
    Path(contract_id): Path<i64>,
) -> ApiResult {
    let invoices = service.list_unlinked_invoices(contract_id).await?;
    ok(format!("{} invoices with unlinked items", invoices.len()), invoices)
}

pub async fn export_execution<S: ReconcileStore>(
    State(service): Service<S>,
    Path(contract_id): Path<i64>,
) -> ApiResult {
    let csv = service.export_execution_csv(contract_id).await?;
    let disposition = format!("attachment; filename=\"contract-{}-execution.csv\"", contract_id);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}

// ─── 导入 ─────────────────────────────────────────────────────────────────

pub async fn import_budget<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<ImportBudgetRequest>,
) -> ApiResult {
    let contract_id = req.contract.id;
    let count = service.import_budget(req.contract, req.items).await?;
    ok(format!("{} budget items imported for contract {}", count, contract_id), count)
}

pub async fn import_invoice<S: ReconcileStore>(
    State(service): Service<S>,
    Json(req): Json<ImportInvoiceRequest>,
) -> ApiResult {
    let invoice_id = req.invoice.id;
    let count = req.lines.len();
    service.import_invoice(req.invoice, req.lines).await?;
    ok(format!("invoice {} imported with {} line items", invoice_id, count), invoice_id)
}
