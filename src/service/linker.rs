use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::sync::Arc;

use super::matcher::{suggest, MatchScorer};
use super::validation::{after_classification, ensure_linkable};
use crate::config::MatchingPolicy;
use crate::db::ReconcileStore;
use crate::error::{ReconcileError, Result};
use crate::models::{
    BatchError, BatchErrorKind, BatchLinkResult, BatchWarning, BudgetItem, Classification,
    ClassificationSource, ConfidenceTier, IntegrationStatus, Invoice, InvoiceLineItem, Link,
    LinkChange, LinkRequest, LinkedItem, NewLink, Suggestion, ValidationStatus,
};

/// 自动分类结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyOutcome {
    pub classified: bool,
    pub line_item: InvoiceLineItem,
    pub suggestion: Option<Suggestion>,
    /// 高置信度建议被自动应用时生成的关联
    pub link: Option<Link>,
}

/// 明细与预算项之间的关联维护
///
/// 不负责加锁与重算; 调用方 ([`ReconciliationService`](super::ReconciliationService))
/// 在合同锁内调用这里的方法, 之后触发重算。
pub struct Linker<S> {
    store: Arc<S>,
    scorer: Arc<dyn MatchScorer>,
    policy: MatchingPolicy,
}

impl<S: ReconcileStore> Linker<S> {
    pub fn new(store: Arc<S>, scorer: Arc<dyn MatchScorer>, policy: MatchingPolicy) -> Self {
        Self { store, scorer, policy }
    }

    /// 读取明细及其所属发票
    pub async fn load_line(&self, line_item_id: i64) -> Result<(InvoiceLineItem, Invoice)> {
        let line = self
            .store
            .get_line_item(line_item_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("line item", line_item_id))?;
        let invoice = self
            .store
            .get_invoice(line.invoice_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("invoice", line.invoice_id))?;
        Ok((line, invoice))
    }

    async fn load_budget_item(&self, budget_item_id: i64) -> Result<BudgetItem> {
        self.store
            .get_budget_item(budget_item_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("budget item", budget_item_id))
    }

    /// 应用建议: 只有高置信度的建议可以自动应用
    pub async fn apply_suggestion(&self, line_item_id: i64, budget_item_id: i64) -> Result<Link> {
        let (line, invoice) = self.load_line(line_item_id).await?;
        let budget = self.load_budget_item(budget_item_id).await?;
        ensure_linkable(&invoice, &budget)?;

        let score = self.scorer.score(&line, &budget).composite;
        if self.policy.tier(score) != Some(ConfidenceTier::High) {
            return Err(ReconcileError::Validation(format!(
                "score {} is below the auto-apply threshold {}, link line item {} manually",
                score, self.policy.high_threshold, line_item_id
            )));
        }

        let change = LinkChange {
            line_item_id,
            expected: line.linked_budget_item_id,
            link: Some(NewLink {
                budget_item_id,
                contract_id: budget.contract_id,
                confidence: score,
                is_manual: false,
            }),
            classification: Classification {
                category: Some(budget.category.clone()),
                confidence: Some(score),
                source: ClassificationSource::Heuristic,
                status: IntegrationStatus::Integrated,
            },
            at: Utc::now(),
        };
        self.store
            .replace_link(change)
            .await?
            .ok_or_else(|| ReconcileError::Conflict(format!("line item {} was not linked", line_item_id)))
    }

    /// 手工关联; `budget_item_id` 为空时清除当前关联
    pub async fn manual_link(&self, line_item_id: i64, budget_item_id: Option<i64>) -> Result<Option<Link>> {
        let (line, invoice) = self.load_line(line_item_id).await?;

        let Some(budget_item_id) = budget_item_id else {
            if invoice.validation_status == ValidationStatus::Rejected {
                return Err(ReconcileError::Validation(format!("invoice {} is rejected", invoice.id)));
            }
            if line.linked_budget_item_id.is_none() {
                return Ok(None);
            }
            let change = LinkChange {
                line_item_id,
                expected: line.linked_budget_item_id,
                link: None,
                classification: Classification {
                    category: None,
                    confidence: None,
                    source: ClassificationSource::Manual,
                    status: IntegrationStatus::Unclassified,
                },
                at: Utc::now(),
            };
            return self.store.replace_link(change).await;
        };

        let budget = self.load_budget_item(budget_item_id).await?;
        ensure_linkable(&invoice, &budget)?;
        let score = self.scorer.score(&line, &budget).composite;

        let change = LinkChange {
            line_item_id,
            expected: line.linked_budget_item_id,
            link: Some(NewLink {
                budget_item_id,
                contract_id: budget.contract_id,
                confidence: score,
                is_manual: true,
            }),
            classification: manual_classification(&budget),
            at: Utc::now(),
        };
        self.store.replace_link(change).await
    }

    /// 批量关联, 逐条校验逐条提交
    ///
    /// 发票级前置条件不满足时整体失败; 单条失败记入 `errors`, 其余照常提交。
    /// 已关联到其他预算项的明细不会被覆盖。
    pub async fn apply_batch(
        &self,
        invoice_id: i64,
        contract_id: i64,
        requests: &[LinkRequest],
    ) -> Result<BatchLinkResult> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("invoice", invoice_id))?;
        if invoice.validation_status == ValidationStatus::Rejected {
            return Err(ReconcileError::Validation(format!("invoice {} is rejected", invoice_id)));
        }
        if invoice.contract_id != Some(contract_id) {
            return Err(ReconcileError::Conflict(format!(
                "invoice {} does not belong to contract {}",
                invoice_id, contract_id
            )));
        }

        let budget_items: IndexMap<i64, BudgetItem> = self
            .store
            .list_budget_items(contract_id)
            .await?
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        let lines: IndexMap<i64, InvoiceLineItem> = self
            .store
            .list_line_items(invoice_id)
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();

        let mut result = BatchLinkResult::default();
        let mut seen: IndexSet<i64> = IndexSet::new();

        for request in requests {
            let error = |kind: BatchErrorKind, message: String| BatchError {
                line_item_id: request.line_item_id,
                budget_item_id: request.budget_item_id,
                kind,
                message,
            };

            if !seen.insert(request.line_item_id) {
                result.errors.push(error(
                    BatchErrorKind::Validation,
                    format!("line item {} appears more than once in the batch", request.line_item_id),
                ));
                continue;
            }

            let Some(line) = lines.get(&request.line_item_id) else {
                result.errors.push(error(
                    BatchErrorKind::NotFound,
                    format!("line item {} not found on invoice {}", request.line_item_id, invoice_id),
                ));
                continue;
            };

            let Some(budget) = budget_items.get(&request.budget_item_id) else {
                let outcome = match self.store.get_budget_item(request.budget_item_id).await {
                    Ok(Some(other)) => error(
                        BatchErrorKind::Conflict,
                        format!(
                            "budget item {} belongs to contract {}, not {}",
                            other.id, other.contract_id, contract_id
                        ),
                    ),
                    Ok(None) => error(
                        BatchErrorKind::NotFound,
                        format!("budget item {} not found", request.budget_item_id),
                    ),
                    Err(e) => error(BatchErrorKind::Storage, e.to_string()),
                };
                result.errors.push(outcome);
                continue;
            };

            let score = self.scorer.score(line, budget).composite;

            match line.linked_budget_item_id {
                Some(current) if current == budget.id => {
                    // 相同关联重复提交视为成功
                    result.linked_items.push(LinkedItem {
                        line_item_id: line.id,
                        budget_item_id: budget.id,
                        confidence: score,
                    });
                    continue;
                }
                Some(current) => {
                    result.errors.push(error(
                        BatchErrorKind::Conflict,
                        format!("line item {} is already linked to budget item {}", line.id, current),
                    ));
                    continue;
                }
                None => {}
            }

            let change = LinkChange {
                line_item_id: line.id,
                expected: None,
                link: Some(NewLink {
                    budget_item_id: budget.id,
                    contract_id,
                    confidence: score,
                    is_manual: true,
                }),
                classification: manual_classification(budget),
                at: Utc::now(),
            };

            match self.store.replace_link(change).await {
                Ok(_) => {
                    result.linked_items.push(LinkedItem {
                        line_item_id: line.id,
                        budget_item_id: budget.id,
                        confidence: score,
                    });
                    if score < self.policy.medium_threshold {
                        result.warnings.push(BatchWarning {
                            line_item_id: line.id,
                            budget_item_id: budget.id,
                            confidence: score,
                            message: format!("low confidence match ({}) accepted as manual link", score),
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!("link line item {} → budget item {} failed: {}", line.id, budget.id, e);
                    result.errors.push(error(batch_error_kind(&e), e.to_string()));
                }
            }
        }

        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// 自动分类: 取最高分建议; 高置信度且开启自动应用时直接关联
    ///
    /// 已有有效关联的明细不做改动。
    pub async fn classify(&self, line_item_id: i64) -> Result<ClassifyOutcome> {
        let (line, invoice) = self.load_line(line_item_id).await?;
        if invoice.validation_status == ValidationStatus::Rejected {
            return Err(ReconcileError::Validation(format!("invoice {} is rejected", invoice.id)));
        }
        let contract_id = invoice.contract_id.ok_or_else(|| {
            ReconcileError::Validation(format!("invoice {} is not associated with a contract", invoice.id))
        })?;

        // 已关联的明细保留关联时的分类
        if line.linked_budget_item_id.is_some() {
            return Ok(ClassifyOutcome {
                classified: false,
                line_item: line,
                suggestion: None,
                link: None,
            });
        }

        let candidates = self.store.list_budget_items(contract_id).await?;
        let top = suggest(self.scorer.as_ref(), &self.policy, &line, &candidates)
            .into_iter()
            .next();

        let Some(top) = top else {
            return Ok(ClassifyOutcome {
                classified: false,
                line_item: line,
                suggestion: None,
                link: None,
            });
        };

        if top.tier == ConfidenceTier::High && self.policy.auto_apply_high_confidence {
            let link = self.apply_suggestion(line_item_id, top.budget_item_id).await?;
            let line_item = self
                .store
                .get_line_item(line_item_id)
                .await?
                .ok_or_else(|| ReconcileError::not_found("line item", line_item_id))?;
            return Ok(ClassifyOutcome {
                classified: true,
                line_item,
                suggestion: Some(top),
                link: Some(link),
            });
        }

        let budget_category = candidates
            .iter()
            .find(|b| b.id == top.budget_item_id)
            .map(|b| b.category.clone());
        let classification = Classification {
            category: line.category.clone().or(budget_category),
            confidence: Some(top.confidence_score),
            source: ClassificationSource::Heuristic,
            status: after_classification(line.integration_status),
        };
        let line_item = self.store.update_classification(line_item_id, classification).await?;

        Ok(ClassifyOutcome {
            classified: true,
            line_item,
            suggestion: Some(top),
            link: None,
        })
    }

    /// 手工分类
    pub async fn classify_manual(&self, line_item_id: i64, category: &str) -> Result<InvoiceLineItem> {
        let category = category.trim();
        if category.is_empty() {
            return Err(ReconcileError::Validation("category is required".to_string()));
        }
        let (line, invoice) = self.load_line(line_item_id).await?;
        if invoice.validation_status == ValidationStatus::Rejected {
            return Err(ReconcileError::Validation(format!("invoice {} is rejected", invoice.id)));
        }

        let classification = Classification {
            category: Some(category.to_string()),
            confidence: Some(100),
            source: ClassificationSource::Manual,
            status: after_classification(line.integration_status),
        };
        self.store.update_classification(line_item_id, classification).await
    }
}

fn manual_classification(budget: &BudgetItem) -> Classification {
    Classification {
        category: Some(budget.category.clone()),
        confidence: Some(100),
        source: ClassificationSource::Manual,
        status: IntegrationStatus::Integrated,
    }
}

fn batch_error_kind(err: &ReconcileError) -> BatchErrorKind {
    match err {
        ReconcileError::NotFound { .. } => BatchErrorKind::NotFound,
        ReconcileError::Conflict(_) => BatchErrorKind::Conflict,
        ReconcileError::Validation(_) => BatchErrorKind::Validation,
        _ => BatchErrorKind::Storage,
    }
}
