use serde::{Deserialize, Serialize};

/// 置信度分档
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,   // 可自动应用
    Medium,
    Low,
}

/// 各维度相似度 (0-100, 已取整)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityFactors {
    pub description: u8,
    pub value: u8,
    pub category: u8,
}

/// 评分结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchScore {
    pub composite: u8,
    pub factors: SimilarityFactors,
}

/// 明细 → 预算项的匹配建议
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub line_item_id: i64,
    pub budget_item_id: i64,
    pub confidence_score: u8,
    pub tier: ConfidenceTier,
    pub reason: String,
    pub factors: SimilarityFactors,
}
