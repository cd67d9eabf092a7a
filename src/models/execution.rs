use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 预算项执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealizationStatus {
    NotStarted,
    InProgress,
    Completed,
    OverBudget,
}

impl RealizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealizationStatus::NotStarted => "not_started",
            RealizationStatus::InProgress => "in_progress",
            RealizationStatus::Completed => "completed",
            RealizationStatus::OverBudget => "over_budget",
        }
    }
}

/// 计入某预算项的发票明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedLineItem {
    pub invoice_id: i64,
    pub line_item_id: i64,
    pub value: BigDecimal,
    pub quantity: BigDecimal,
    pub emission_date: NaiveDate,
}

/// 单个预算项的实现情况 (派生, 不落库)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRealization {
    pub budget_item_id: i64,
    pub description: String,
    pub category: String,
    pub predicted_value: BigDecimal,
    pub realized_value: BigDecimal,
    pub variance: BigDecimal,
    pub variance_percent: f64,
    pub predicted_quantity: Option<BigDecimal>,
    pub realized_quantity: BigDecimal,
    pub status: RealizationStatus,
    pub linked_items: Vec<LinkedLineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BudgetExceeded,
    VarianceHigh,
    MissingNf,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BudgetExceeded => "budget_exceeded",
            AlertType::VarianceHigh => "variance_high",
            AlertType::MissingNf => "missing_nf",
        }
    }
}

/// 告警级别, 按严重程度升序声明以便排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// 执行告警 (派生, 不落库)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub budget_item_id: Option<i64>,
    pub invoice_id: Option<i64>,
    pub suggested_action: Option<String>,
    pub detected_at: Option<DateTime<Utc>>,
}

/// 合同执行视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractExecution {
    pub contract_id: i64,
    pub total_predicted: BigDecimal,
    pub total_realized: BigDecimal,
    pub financial_progress: f64,
    pub items: Vec<BudgetRealization>,
    pub alerts: Vec<Alert>,
    pub warnings: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ContractExecution {
    pub fn item(&self, budget_item_id: i64) -> Option<&BudgetRealization> {
        self.items.iter().find(|i| i.budget_item_id == budget_item_id)
    }
}
