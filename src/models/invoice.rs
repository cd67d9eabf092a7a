use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 发票(NF)校验状态
///
/// `pending → processed → {validated | rejected}`, 后两者为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Processed,
    Validated,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Processed => "processed",
            ValidationStatus::Validated => "validated",
            ValidationStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationStatus::Validated | ValidationStatus::Rejected)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ValidationStatus::Pending),
            "processed" => Ok(ValidationStatus::Processed),
            "validated" => Ok(ValidationStatus::Validated),
            "rejected" => Ok(ValidationStatus::Rejected),
            other => Err(format!("unknown validation status: {other}")),
        }
    }
}

/// 分类来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Manual,
    Rule,
    Heuristic,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Manual => "manual",
            ClassificationSource::Rule => "rule",
            ClassificationSource::Heuristic => "heuristic",
        }
    }
}

impl FromStr for ClassificationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ClassificationSource::Manual),
            "rule" => Ok(ClassificationSource::Rule),
            "heuristic" => Ok(ClassificationSource::Heuristic),
            other => Err(format!("unknown classification source: {other}")),
        }
    }
}

/// 明细集成状态: `unclassified → classified → integrated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Unclassified,
    Classified,
    Integrated,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Unclassified => "unclassified",
            IntegrationStatus::Classified => "classified",
            IntegrationStatus::Integrated => "integrated",
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclassified" => Ok(IntegrationStatus::Unclassified),
            "classified" => Ok(IntegrationStatus::Classified),
            "integrated" => Ok(IntegrationStatus::Integrated),
            other => Err(format!("unknown integration status: {other}")),
        }
    }
}

/// 发票主表 (NF)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub contract_id: Option<i64>,
    pub number: String,                              // NF 号
    pub supplier: String,
    pub total_value: BigDecimal,
    pub emission_date: NaiveDate,
    pub validation_status: ValidationStatus,
    pub rejection_reason: Option<String>,
    pub status_changed_at: Option<DateTime<Utc>>,
}

/// 发票明细
///
/// `linked_budget_item_id` 由存储层根据当前有效关联填充, 不单独落库。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: i64,
    pub invoice_id: i64,
    pub description: String,
    pub quantity: BigDecimal,
    pub unit_value: BigDecimal,
    pub total_value: BigDecimal,
    pub category: Option<String>,
    pub linked_budget_item_id: Option<i64>,
    pub classification_confidence: Option<u8>,       // 0-100
    pub classification_source: ClassificationSource,
    pub integration_status: IntegrationStatus,
}

/// 明细分类结果, 由 Linker 写回
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Option<String>,
    pub confidence: Option<u8>,
    pub source: ClassificationSource,
    pub status: IntegrationStatus,
}

/// 状态变更请求 (compare-and-set)
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub invoice_id: i64,
    pub from: ValidationStatus,
    pub to: ValidationStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}
