use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{
    BudgetItem, BudgetRealization, Contract, ContractExecution, Invoice, InvoiceLineItem, Link,
    LinkedLineItem, RealizationStatus, ValidationStatus,
};

/// 某一时刻合同的完整数据快照, 计算器与告警生成器只读它
#[derive(Debug, Clone)]
pub struct ContractSnapshot {
    pub contract: Contract,
    pub budget_items: Vec<BudgetItem>,
    pub invoices: Vec<Invoice>,
    pub line_items: Vec<InvoiceLineItem>,
    /// 含已清除的关联
    pub links: Vec<Link>,
}

impl ContractSnapshot {
    /// 明细 id → 当前有效关联
    pub fn active_links(&self) -> HashMap<i64, &Link> {
        self.links
            .iter()
            .filter(|l| l.is_active() && l.contract_id == self.contract.id)
            .map(|l| (l.line_item_id, l))
            .collect()
    }

    pub fn invoice(&self, invoice_id: i64) -> Option<&Invoice> {
        self.invoices.iter().find(|i| i.id == invoice_id)
    }

    /// 最近一次状态变更或关联变更的时间
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let invoice_changes = self.invoices.iter().filter_map(|i| i.status_changed_at);
        let link_changes = self
            .links
            .iter()
            .flat_map(|l| std::iter::once(l.created_at).chain(l.cleared_at));
        invoice_changes.chain(link_changes).max()
    }
}

/// `numerator / denominator × 100`, 保留两位小数; 分母为 0 时为 0
pub fn percent(numerator: &BigDecimal, denominator: &BigDecimal) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    (numerator * BigDecimal::from(100) / denominator)
        .round(2)
        .to_string()
        .parse()
        .unwrap_or(0.0)
}

pub fn realization_status(realized: &BigDecimal, predicted: &BigDecimal) -> RealizationStatus {
    if realized.is_zero() {
        RealizationStatus::NotStarted
    } else if realized > predicted {
        RealizationStatus::OverBudget
    } else if realized == predicted {
        RealizationStatus::Completed
    } else {
        RealizationStatus::InProgress
    }
}

/// 全量重算合同执行情况 (不含告警)
///
/// 只有已校验发票上、存在有效关联的明细计入; 每个明细至多计入一个预算项。
/// 输出只依赖快照内容, 重复计算结果完全一致。
pub fn compute_execution(snapshot: &ContractSnapshot) -> ContractExecution {
    let validated: HashMap<i64, &Invoice> = snapshot
        .invoices
        .iter()
        .filter(|i| i.validation_status == ValidationStatus::Validated)
        .map(|i| (i.id, i))
        .collect();
    let active = snapshot.active_links();

    // 预算项 id → 计入的明细
    let mut contributions: HashMap<i64, Vec<LinkedLineItem>> = HashMap::new();
    for line in &snapshot.line_items {
        let Some(invoice) = validated.get(&line.invoice_id) else {
            continue;
        };
        let Some(link) = active.get(&line.id) else {
            continue;
        };
        contributions.entry(link.budget_item_id).or_default().push(LinkedLineItem {
            invoice_id: invoice.id,
            line_item_id: line.id,
            value: line.total_value.clone(),
            quantity: line.quantity.clone(),
            emission_date: invoice.emission_date,
        });
    }

    let mut items: Vec<BudgetRealization> = snapshot
        .budget_items
        .iter()
        .map(|budget| {
            let mut linked_items = contributions.remove(&budget.id).unwrap_or_default();
            linked_items.sort_by_key(|l| l.line_item_id);

            let realized_value: BigDecimal = linked_items.iter().map(|l| &l.value).sum();
            let realized_quantity: BigDecimal = linked_items.iter().map(|l| &l.quantity).sum();
            let predicted_value = budget.predicted_total_value.clone();
            let variance = &realized_value - &predicted_value;

            BudgetRealization {
                budget_item_id: budget.id,
                description: budget.description.clone(),
                category: budget.category.clone(),
                variance_percent: percent(&variance, &predicted_value),
                status: realization_status(&realized_value, &predicted_value),
                predicted_value,
                realized_value,
                variance,
                predicted_quantity: budget.predicted_quantity.clone(),
                realized_quantity,
                linked_items,
            }
        })
        .collect();
    items.sort_by_key(|i| i.budget_item_id);

    let total_predicted: BigDecimal = items.iter().map(|i| &i.predicted_value).sum();
    let total_realized: BigDecimal = items.iter().map(|i| &i.realized_value).sum();

    let mut warnings = Vec::new();
    if let Some(contract_value) = &snapshot.contract.contract_value {
        if *contract_value != total_predicted {
            warnings.push(format!(
                "contract value {} differs from budget total {}",
                contract_value, total_predicted
            ));
        }
    }

    ContractExecution {
        contract_id: snapshot.contract.id,
        financial_progress: percent(&total_realized, &total_predicted),
        total_predicted,
        total_realized,
        items,
        alerts: Vec::new(),
        warnings,
        last_update: snapshot.last_activity(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ClassificationSource, IntegrationStatus};
    use chrono::{NaiveDate, TimeZone};
    use std::str::FromStr;

    pub(crate) fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    pub(crate) fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    pub(crate) fn snapshot(budgets: &[(i64, &str)]) -> ContractSnapshot {
        ContractSnapshot {
            contract: Contract {
                id: 1,
                name: "Edifício Aurora".to_string(),
                contract_value: None,
                realized_value: BigDecimal::zero(),
            },
            budget_items: budgets
                .iter()
                .map(|&(id, predicted)| BudgetItem {
                    id,
                    contract_id: 1,
                    description: format!("Item {id}"),
                    category: "material".to_string(),
                    predicted_quantity: None,
                    predicted_unit_value: None,
                    predicted_total_value: dec(predicted),
                })
                .collect(),
            invoices: Vec::new(),
            line_items: Vec::new(),
            links: Vec::new(),
        }
    }

    /// 一张发票一条明细, 关联到 `budget_item_id`
    pub(crate) fn add_invoice(
        snap: &mut ContractSnapshot,
        invoice_id: i64,
        status: ValidationStatus,
        value: &str,
        budget_item_id: Option<i64>,
        minute: u32,
    ) {
        snap.invoices.push(Invoice {
            id: invoice_id,
            contract_id: Some(1),
            number: format!("NF-{invoice_id}"),
            supplier: "Fornecedor".to_string(),
            total_value: dec(value),
            emission_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            validation_status: status,
            rejection_reason: None,
            status_changed_at: Some(at(minute)),
        });
        let line_id = invoice_id * 100;
        snap.line_items.push(InvoiceLineItem {
            id: line_id,
            invoice_id,
            description: "Vergalhão".to_string(),
            quantity: dec("2"),
            unit_value: dec(value) / BigDecimal::from(2),
            total_value: dec(value),
            category: Some("material".to_string()),
            linked_budget_item_id: budget_item_id,
            classification_confidence: Some(100),
            classification_source: ClassificationSource::Manual,
            integration_status: IntegrationStatus::Integrated,
        });
        if let Some(budget_item_id) = budget_item_id {
            snap.links.push(Link {
                id: snap.links.len() as i64 + 1,
                line_item_id: line_id,
                budget_item_id,
                contract_id: 1,
                confidence: 90,
                is_manual: true,
                created_at: at(minute.saturating_sub(1)),
                cleared_at: None,
            });
        }
    }

    #[test]
    fn status_boundaries() {
        let predicted = dec("100");
        assert_eq!(realization_status(&dec("0"), &predicted), RealizationStatus::NotStarted);
        assert_eq!(realization_status(&dec("40"), &predicted), RealizationStatus::InProgress);
        assert_eq!(realization_status(&dec("100.00"), &predicted), RealizationStatus::Completed);
        assert_eq!(realization_status(&dec("100.01"), &predicted), RealizationStatus::OverBudget);
    }

    #[test]
    fn percent_rounds_and_guards_zero() {
        assert_eq!(percent(&dec("1"), &dec("3")), 33.33);
        assert_eq!(percent(&dec("2"), &dec("3")), 66.67);
        assert_eq!(percent(&dec("5"), &dec("0")), 0.0);
        assert_eq!(percent(&dec("-2000"), &dec("10000")), -20.0);
    }

    #[test]
    fn two_validated_invoices_push_item_over_budget() {
        let mut snap = snapshot(&[(1, "10000")]);
        add_invoice(&mut snap, 1, ValidationStatus::Validated, "6000", Some(1), 5);
        add_invoice(&mut snap, 2, ValidationStatus::Validated, "5000", Some(1), 10);

        let exec = compute_execution(&snap);
        let item = exec.item(1).unwrap();
        assert_eq!(item.realized_value, dec("11000"));
        assert_eq!(item.variance, dec("1000"));
        assert_eq!(item.variance_percent, 10.0);
        assert_eq!(item.status, RealizationStatus::OverBudget);
        assert_eq!(item.realized_quantity, dec("4"));
        assert_eq!(item.linked_items.len(), 2);
        assert_eq!(exec.financial_progress, 110.0);
        assert_eq!(exec.last_update, Some(at(10)));
    }

    #[test]
    fn only_validated_linked_lines_count() {
        let mut snap = snapshot(&[(1, "10000"), (2, "5000")]);
        add_invoice(&mut snap, 1, ValidationStatus::Validated, "1000", Some(1), 1);
        add_invoice(&mut snap, 2, ValidationStatus::Processed, "2000", Some(1), 2);
        add_invoice(&mut snap, 3, ValidationStatus::Rejected, "3000", Some(2), 3);
        add_invoice(&mut snap, 4, ValidationStatus::Validated, "4000", None, 4);
        // 已清除的关联不计入
        snap.links.push(Link {
            id: 99,
            line_item_id: 400,
            budget_item_id: 2,
            contract_id: 1,
            confidence: 80,
            is_manual: false,
            created_at: at(4),
            cleared_at: Some(at(6)),
        });

        let exec = compute_execution(&snap);
        assert_eq!(exec.item(1).unwrap().realized_value, dec("1000"));
        assert_eq!(exec.item(2).unwrap().realized_value, dec("0"));
        assert_eq!(exec.item(2).unwrap().status, RealizationStatus::NotStarted);
        assert_eq!(exec.total_realized, dec("1000"));
        assert_eq!(exec.total_predicted, dec("15000"));
        assert_eq!(exec.last_update, Some(at(6)));

        let validated_linked: BigDecimal = [dec("1000")].iter().sum();
        assert!(exec.total_realized <= validated_linked);
    }

    #[test]
    fn recompute_is_identical() {
        let mut snap = snapshot(&[(1, "10000"), (2, "300")]);
        add_invoice(&mut snap, 1, ValidationStatus::Validated, "300", Some(2), 3);
        add_invoice(&mut snap, 2, ValidationStatus::Validated, "7000", Some(1), 8);

        let first = compute_execution(&snap);
        let second = compute_execution(&snap);
        assert_eq!(first, second);
        assert_eq!(first.item(2).unwrap().status, RealizationStatus::Completed);
    }

    #[test]
    fn contract_value_mismatch_becomes_warning() {
        let mut snap = snapshot(&[(1, "10000"), (2, "5000")]);
        snap.contract.contract_value = Some(dec("15000.00"));
        assert!(compute_execution(&snap).warnings.is_empty());

        snap.contract.contract_value = Some(dec("16000"));
        let exec = compute_execution(&snap);
        assert_eq!(exec.warnings.len(), 1);
        assert!(exec.warnings[0].contains("16000"));
        assert!(exec.warnings[0].contains("15000"));
    }

    #[test]
    fn empty_budget_has_zero_progress() {
        let exec = compute_execution(&snapshot(&[]));
        assert_eq!(exec.financial_progress, 0.0);
        assert!(exec.items.is_empty());
        assert_eq!(exec.last_update, None);
    }
}
