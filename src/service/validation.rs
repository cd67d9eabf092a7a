//! 发票与明细的状态机
//!
//! 这里只做规则判断并生成 [`StatusChange`], 真正的写入由存储层以
//! compare-and-set 方式完成。

use chrono::{DateTime, Utc};

use crate::error::{ReconcileError, Result};
use crate::models::{BudgetItem, IntegrationStatus, Invoice, StatusChange, ValidationStatus};

/// 发票状态是否允许 `from → to`
pub fn can_transition(from: ValidationStatus, to: ValidationStatus) -> bool {
    use ValidationStatus::*;
    matches!(
        (from, to),
        (Pending, Processed) | (Processed, Validated) | (Processed, Rejected)
    )
}

fn transition(invoice: &Invoice, to: ValidationStatus, reason: Option<String>, at: DateTime<Utc>) -> Result<StatusChange> {
    let from = invoice.validation_status;
    if !can_transition(from, to) {
        return Err(ReconcileError::Validation(format!(
            "invoice {} cannot move from {} to {}",
            invoice.id, from, to
        )));
    }
    Ok(StatusChange {
        invoice_id: invoice.id,
        from,
        to,
        reason,
        at,
    })
}

/// pending → processed
pub fn plan_process(invoice: &Invoice, at: DateTime<Utc>) -> Result<StatusChange> {
    transition(invoice, ValidationStatus::Processed, None, at)
}

/// processed → validated, 至少要有一条明细
pub fn plan_validate(invoice: &Invoice, line_count: usize, at: DateTime<Utc>) -> Result<StatusChange> {
    let change = transition(invoice, ValidationStatus::Validated, None, at)?;
    if line_count == 0 {
        return Err(ReconcileError::Validation(format!(
            "invoice {} has no line items",
            invoice.id
        )));
    }
    Ok(change)
}

/// processed → rejected, 驳回原因不能为空
pub fn plan_reject(invoice: &Invoice, reason: &str, at: DateTime<Utc>) -> Result<StatusChange> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ReconcileError::Validation("rejection reason is required".to_string()));
    }
    transition(invoice, ValidationStatus::Rejected, Some(reason.to_string()), at)
}

/// 关联前置条件: 发票未驳回, 且与预算项属于同一合同
pub fn ensure_linkable(invoice: &Invoice, budget_item: &BudgetItem) -> Result<()> {
    if invoice.validation_status == ValidationStatus::Rejected {
        return Err(ReconcileError::Validation(format!(
            "invoice {} is rejected",
            invoice.id
        )));
    }
    match invoice.contract_id {
        Some(contract_id) if contract_id == budget_item.contract_id => Ok(()),
        Some(contract_id) => Err(ReconcileError::Conflict(format!(
            "budget item {} belongs to contract {}, invoice {} to contract {}",
            budget_item.id, budget_item.contract_id, invoice.id, contract_id
        ))),
        None => Err(ReconcileError::Conflict(format!(
            "invoice {} is not associated with a contract",
            invoice.id
        ))),
    }
}

/// 终态发票不能再改合同
pub fn ensure_associable(invoice: &Invoice) -> Result<()> {
    if invoice.validation_status.is_terminal() {
        return Err(ReconcileError::Validation(format!(
            "invoice {} is {} and can no longer change contract",
            invoice.id, invoice.validation_status
        )));
    }
    Ok(())
}

/// 分类后的集成状态; 已集成的明细保持集成
pub fn after_classification(current: IntegrationStatus) -> IntegrationStatus {
    current.max(IntegrationStatus::Classified)
}
