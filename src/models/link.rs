use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::invoice::Classification;

/// 明细 → 预算项关联
///
/// 每个明细至多一条有效关联 (`cleared_at` 为空), 由存储层唯一约束保证。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub line_item_id: i64,
    pub budget_item_id: i64,
    pub contract_id: i64,
    pub confidence: u8,
    pub is_manual: bool,
    pub created_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl Link {
    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// 新关联
#[derive(Debug, Clone, PartialEq)]
pub struct NewLink {
    pub budget_item_id: i64,
    pub contract_id: i64,
    pub confidence: u8,
    pub is_manual: bool,
}

/// 关联替换请求
///
/// `expected` 为调用方读到的当前有效关联预算项; 与存储中不一致时返回冲突。
/// `link` 为空表示清除。
#[derive(Debug, Clone, PartialEq)]
pub struct LinkChange {
    pub line_item_id: i64,
    pub expected: Option<i64>,
    pub link: Option<NewLink>,
    pub classification: Classification,
    pub at: DateTime<Utc>,
}

/// 批量关联请求项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub line_item_id: i64,
    pub budget_item_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedItem {
    pub line_item_id: i64,
    pub budget_item_id: i64,
    pub confidence: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWarning {
    pub line_item_id: i64,
    pub budget_item_id: i64,
    pub confidence: u8,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchErrorKind {
    NotFound,
    Conflict,
    Validation,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub line_item_id: i64,
    pub budget_item_id: i64,
    pub kind: BatchErrorKind,
    pub message: String,
}

/// 批量关联结果: 部分成功也在此返回, 不整体抛错
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchLinkResult {
    pub success: bool,
    pub linked_items: Vec<LinkedItem>,
    pub warnings: Vec<BatchWarning>,
    pub errors: Vec<BatchError>,
}
