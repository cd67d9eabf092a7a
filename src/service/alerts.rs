use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashSet;

use super::realization::ContractSnapshot;
use crate::config::AlertPolicy;
use crate::models::{
    Alert, AlertType, BudgetRealization, ContractExecution, RealizationStatus, Severity, ValidationStatus,
};

/// 由最新的执行视图生成告警
///
/// 告警 id 由类型和对象决定, 时间取自快照中的状态/关联变更时间,
/// 同一快照重复生成结果一致。排序: 级别降序, 检测时间降序, id 升序。
pub fn generate_alerts(
    execution: &ContractExecution,
    snapshot: &ContractSnapshot,
    policy: &AlertPolicy,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if execution.financial_progress > 100.0 {
        alerts.push(Alert {
            id: format!("budget_exceeded:contract:{}", execution.contract_id),
            alert_type: AlertType::BudgetExceeded,
            severity: Severity::High,
            message: format!(
                "Contract {} realized {} of {} predicted ({:.2}%)",
                execution.contract_id,
                execution.total_realized,
                execution.total_predicted,
                execution.financial_progress
            ),
            budget_item_id: None,
            invoice_id: None,
            suggested_action: Some("Review pending invoices and negotiate a budget amendment".to_string()),
            detected_at: execution.last_update,
        });
    }

    for item in &execution.items {
        match item.status {
            RealizationStatus::OverBudget => alerts.push(Alert {
                id: format!("budget_exceeded:item:{}", item.budget_item_id),
                alert_type: AlertType::BudgetExceeded,
                severity: Severity::High,
                message: format!(
                    "Budget item '{}' exceeded by {} ({:.2}%)",
                    item.description, item.variance, item.variance_percent
                ),
                budget_item_id: Some(item.budget_item_id),
                invoice_id: None,
                suggested_action: Some("Check the linked invoices for misclassified items".to_string()),
                detected_at: item_activity(item, snapshot),
            }),
            RealizationStatus::InProgress if -item.variance_percent < policy.variance_threshold_percent => {
                alerts.push(Alert {
                    id: format!("variance_high:item:{}", item.budget_item_id),
                    alert_type: AlertType::VarianceHigh,
                    severity: Severity::Medium,
                    message: format!(
                        "Budget item '{}' has {:.2}% of its predicted value left",
                        item.description, -item.variance_percent
                    ),
                    budget_item_id: Some(item.budget_item_id),
                    invoice_id: None,
                    suggested_action: Some("Monitor upcoming invoices for this item".to_string()),
                    detected_at: item_activity(item, snapshot),
                })
            }
            _ => {}
        }
    }

    let linked_lines: HashSet<i64> = snapshot.active_links().into_keys().collect();
    for invoice in &snapshot.invoices {
        if invoice.validation_status != ValidationStatus::Validated {
            continue;
        }
        let has_link = snapshot
            .line_items
            .iter()
            .any(|l| l.invoice_id == invoice.id && linked_lines.contains(&l.id));
        if has_link {
            continue;
        }
        alerts.push(Alert {
            id: format!("missing_nf:invoice:{}", invoice.id),
            alert_type: AlertType::MissingNf,
            severity: Severity::Low,
            message: format!(
                "Validated invoice {} from {} has no line item linked to the budget",
                invoice.number, invoice.supplier
            ),
            budget_item_id: None,
            invoice_id: Some(invoice.id),
            suggested_action: Some("Link the invoice items to budget items".to_string()),
            detected_at: invoice.status_changed_at,
        });
    }

    alerts.sort_by(|a, b| {
        (Reverse(a.severity), Reverse(a.detected_at), &a.id).cmp(&(Reverse(b.severity), Reverse(b.detected_at), &b.id))
    });
    alerts
}

/// 预算项最近一次被计入的时间: 关联创建或发票校验, 取较晚者
fn item_activity(item: &BudgetRealization, snapshot: &ContractSnapshot) -> Option<DateTime<Utc>> {
    let active = snapshot.active_links();
    item.linked_items
        .iter()
        .flat_map(|linked| {
            let link_at = active.get(&linked.line_item_id).map(|l| l.created_at);
            let validated_at = snapshot.invoice(linked.invoice_id).and_then(|i| i.status_changed_at);
            link_at.into_iter().chain(validated_at)
        })
        .max()
}
