use bigdecimal::BigDecimal;
use serde::Serialize;

use crate::error::{ReconcileError, Result};
use crate::models::ContractExecution;

#[derive(Debug, Serialize)]
struct ExecutionRow<'a> {
    budget_item_id: Option<i64>,
    description: &'a str,
    category: &'a str,
    predicted_value: &'a BigDecimal,
    realized_value: &'a BigDecimal,
    variance: String,
    variance_percent: f64,
    realized_quantity: Option<&'a BigDecimal>,
    status: &'a str,
    linked_items: usize,
}

/// 合同执行情况导出为 CSV, 每个预算项一行, 末尾一行合计
pub fn execution_csv(execution: &ContractExecution) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    for item in &execution.items {
        writer.serialize(ExecutionRow {
            budget_item_id: Some(item.budget_item_id),
            description: &item.description,
            category: &item.category,
            predicted_value: &item.predicted_value,
            realized_value: &item.realized_value,
            variance: item.variance.to_string(),
            variance_percent: item.variance_percent,
            realized_quantity: Some(&item.realized_quantity),
            status: item.status.as_str(),
            linked_items: item.linked_items.len(),
        })?;
    }

    // 合计行
    writer.serialize(ExecutionRow {
        budget_item_id: None,
        description: "TOTAL",
        category: "",
        predicted_value: &execution.total_predicted,
        realized_value: &execution.total_realized,
        variance: (&execution.total_realized - &execution.total_predicted).to_string(),
        variance_percent: execution.financial_progress,
        realized_quantity: None,
        status: "",
        linked_items: execution.items.iter().map(|i| i.linked_items.len()).sum(),
    })?;

    let bytes = writer.into_inner().map_err(|e| ReconcileError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| ReconcileError::Decode(e.to_string()))
}
