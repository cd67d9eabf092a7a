use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use rayon::prelude::*;
use std::cmp::Reverse;

use crate::config::{MatchingPolicy, ScoringWeights};
use crate::models::{BudgetItem, InvoiceLineItem, MatchScore, SimilarityFactors, Suggestion};

/// 评分策略
///
/// 默认实现为 [`HeuristicScorer`]; 替换为统计或模型评分时 Linker 与计算器无需改动。
/// 实现必须是纯函数, 以便在 rayon 线程池上并行调用。
pub trait MatchScorer: Send + Sync {
    fn score(&self, line: &InvoiceLineItem, budget: &BudgetItem) -> MatchScore;
}

/// 启发式评分: 描述 / 金额 / 类别加权
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    weights: ScoringWeights,
}

impl HeuristicScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }
}

impl MatchScorer for HeuristicScorer {
    fn score(&self, line: &InvoiceLineItem, budget: &BudgetItem) -> MatchScore {
        let description = description_similarity(&line.description, &budget.description);
        let value = value_similarity(&line.total_value, &budget.predicted_total_value);
        let category = category_similarity(line.category.as_deref(), Some(budget.category.as_str()));

        let w = &self.weights;
        let composite = w.description * description + w.value * value + w.category * category;

        MatchScore {
            composite: to_score(composite),
            factors: SimilarityFactors {
                description: to_score(description),
                value: to_score(value),
                category: to_score(category),
            },
        }
    }
}

fn to_score(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// 描述相似度 (0-100)
///
/// 按空白切分并转小写; 明细描述中的词只要与预算描述中任一词互为子串即计为命中。
pub fn description_similarity(line_description: &str, budget_description: &str) -> f64 {
    let left: Vec<String> = line_description.split_whitespace().map(str::to_lowercase).collect();
    let right: Vec<String> = budget_description.split_whitespace().map(str::to_lowercase).collect();

    let longest = left.len().max(right.len());
    if longest == 0 {
        return 0.0;
    }

    let matched = left
        .iter()
        .filter(|l| right.iter().any(|r| r.contains(l.as_str()) || l.contains(r.as_str())))
        .count();

    matched as f64 / longest as f64 * 100.0
}

/// 金额相似度 (0-100), 较大值不为正时为 0
pub fn value_similarity(a: &BigDecimal, b: &BigDecimal) -> f64 {
    let max = if a > b { a } else { b };
    if *max <= BigDecimal::zero() {
        return 0.0;
    }

    let diff = (a - b).abs();
    let ratio = (&diff / max).to_f64().unwrap_or(1.0);
    ((1.0 - ratio) * 100.0).clamp(0.0, 100.0)
}

/// 类别相似度: 双方都有且相同 (忽略大小写) 为 100
pub fn category_similarity(a: Option<&str>, b: Option<&str>) -> f64 {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(a), Some(b)) if !a.is_empty() && a.to_lowercase() == b.to_lowercase() => 100.0,
        _ => 0.0,
    }
}

pub fn match_reason(score: u8) -> &'static str {
    match score {
        90.. => "very strong match: description and value agree",
        80..=89 => "good match: similar description",
        70..=79 => "reasonable match: some elements agree",
        _ => "weak match: review manually",
    }
}

/// 为单个明细生成候选建议
///
/// 低于 `min_score` 的候选丢弃; 按分数降序, 同分按预算项 id 升序。
pub fn suggest(
    scorer: &dyn MatchScorer,
    policy: &MatchingPolicy,
    line: &InvoiceLineItem,
    candidates: &[BudgetItem],
) -> Vec<Suggestion> {
    let mut suggestions: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|budget| {
            let score = scorer.score(line, budget);
            let tier = policy.tier(score.composite)?;
            Some(Suggestion {
                line_item_id: line.id,
                budget_item_id: budget.id,
                confidence_score: score.composite,
                tier,
                reason: match_reason(score.composite).to_string(),
                factors: score.factors,
            })
        })
        .collect();

    suggestions.sort_by_key(|s| (Reverse(s.confidence_score), s.budget_item_id));
    suggestions
}

/// 整张发票的建议: 各明细并行评分后合并
///
/// 合并结果按分数降序, 再按明细 id、预算项 id 升序。
pub fn suggest_for_lines(
    scorer: &dyn MatchScorer,
    policy: &MatchingPolicy,
    lines: &[InvoiceLineItem],
    candidates: &[BudgetItem],
) -> Vec<Suggestion> {
    let per_line: Vec<Vec<Suggestion>> = lines
        .par_iter()
        .map(|line| suggest(scorer, policy, line, candidates))
        .collect();

    let mut all: Vec<Suggestion> = per_line.into_iter().flatten().collect();
    all.sort_by_key(|s| (Reverse(s.confidence_score), s.line_item_id, s.budget_item_id));
    all
}
