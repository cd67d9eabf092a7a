// ==========================================
// 并发关联测试
// ==========================================
// 职责: 同一明细被并发关联到不同预算项时, 只能有一条有效关联
// ==========================================


use bigdecimal::BigDecimal;
use budget_reconciler::models::{
    BatchErrorKind, BudgetItem, Classification, ClassificationSource, Contract, IntegrationStatus,
    Invoice, InvoiceLineItem, Link, LinkChange, LinkRequest, NewLink, StatusChange, ValidationStatus,
};
use budget_reconciler::{AppConfig, MemoryStore, ReconcileError, ReconcileStore, ReconciliationService};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

use test_helpers::{dec, seed_contract, seed_invoice, service};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_on_same_line_item() {
    let service = service();
    seed_contract(
        &service,
        1,
        &[(1, "Cimento CP2", "material", "1000"), (2, "Cimento CP5", "material", "1000")],
    )
    .await;
    seed_invoice(&service, 10, Some(1), ValidationStatus::Processed, &[(101, "Cimento", Some("material"), "1000")]).await;

    let a = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .apply_batch(10, 1, &[LinkRequest { line_item_id: 101, budget_item_id: 1 }])
                .await
        })
    };
    let b = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .apply_batch(10, 1, &[LinkRequest { line_item_id: 101, budget_item_id: 2 }])
                .await
        })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!([a.success, b.success].iter().filter(|s| **s).count(), 1);
    let loser = if a.success { &b } else { &a };
    assert_eq!(loser.errors.len(), 1);
    assert_eq!(loser.errors[0].kind, BatchErrorKind::Conflict);

    let history = service.link_history(101).await.unwrap();
    assert_eq!(history.iter().filter(|l| l.is_active()).count(), 1);
}

async fn store_with_line() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_contract(Contract {
            id: 1,
            name: "Obra".to_string(),
            contract_value: None,
            realized_value: BigDecimal::from(0),
        })
        .await
        .unwrap();
    let items = (1..=8)
        .map(|id| BudgetItem {
            id,
            contract_id: 1,
            description: format!("Item {id}"),
            category: "material".to_string(),
            predicted_quantity: None,
            predicted_unit_value: None,
            predicted_total_value: dec("1000"),
        })
        .collect();
    store.insert_budget_items(items).await.unwrap();
    store
        .insert_invoice(
            Invoice {
                id: 10,
                contract_id: Some(1),
                number: "NF-10".to_string(),
                supplier: "Fornecedor".to_string(),
                total_value: dec("500"),
                emission_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                validation_status: ValidationStatus::Processed,
                rejection_reason: None,
                status_changed_at: None,
            },
            vec![InvoiceLineItem {
                id: 101,
                invoice_id: 10,
                description: "Item".to_string(),
                quantity: dec("1"),
                unit_value: dec("500"),
                total_value: dec("500"),
                category: None,
                linked_budget_item_id: None,
                classification_confidence: None,
                classification_source: ClassificationSource::Heuristic,
                integration_status: IntegrationStatus::Unclassified,
            }],
        )
        .await
        .unwrap();
    store
}

fn link_change(budget_item_id: i64, expected: Option<i64>) -> LinkChange {
    LinkChange {
        line_item_id: 101,
        expected,
        link: Some(NewLink {
            budget_item_id,
            contract_id: 1,
            confidence: 50,
            is_manual: true,
        }),
        classification: Classification {
            category: Some("material".to_string()),
            confidence: Some(100),
            source: ClassificationSource::Manual,
            status: IntegrationStatus::Integrated,
        },
        at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_compare_and_set_admits_one_writer() {
    let store = store_with_line().await;

    let handles: Vec<_> = (1..=8)
        .map(|budget_item_id| {
            let store = store.clone();
            tokio::spawn(async move { store.replace_link(link_change(budget_item_id, None)).await })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Some(link)) => winners.push(link),
            Err(ReconcileError::Conflict(_)) => conflicts += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 7);

    let line = store.get_line_item(101).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, Some(winners[0].budget_item_id));
    assert_eq!(store.list_link_history(101).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_expected_link_is_rejected() {
    let store = store_with_line().await;
    store.replace_link(link_change(1, None)).await.unwrap();

    let err = store.replace_link(link_change(2, Some(3))).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    let replaced = store.replace_link(link_change(2, Some(1))).await.unwrap().unwrap();
    assert_eq!(replaced.budget_item_id, 2);

    let history = store.list_link_history(101).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].cleared_at.is_some());
    assert!(history[1].is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_validation_of_same_invoice() {
    let service = service();
    seed_contract(&service, 1, &[(1, "Cimento CP2", "material", "1000")]).await;
    seed_invoice(&service, 20, Some(1), ValidationStatus::Processed, &[(201, "Cimento", None, "400")]).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.validate_invoice(20).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
}

/// 变更发票合同时人为放慢, 用于制造交错
struct SlowAssignStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

impl ReconcileStore for SlowAssignStore {
    async fn insert_contract(&self, contract: Contract) -> budget_reconciler::Result<()> {
        self.inner.insert_contract(contract).await
    }

    async fn insert_budget_items(&self, items: Vec<BudgetItem>) -> budget_reconciler::Result<usize> {
        self.inner.insert_budget_items(items).await
    }

    async fn insert_invoice(&self, invoice: Invoice, lines: Vec<InvoiceLineItem>) -> budget_reconciler::Result<()> {
        self.inner.insert_invoice(invoice, lines).await
    }

    async fn get_contract(&self, contract_id: i64) -> budget_reconciler::Result<Option<Contract>> {
        self.inner.get_contract(contract_id).await
    }

    async fn list_budget_items(&self, contract_id: i64) -> budget_reconciler::Result<Vec<BudgetItem>> {
        self.inner.list_budget_items(contract_id).await
    }

    async fn get_budget_item(&self, budget_item_id: i64) -> budget_reconciler::Result<Option<BudgetItem>> {
        self.inner.get_budget_item(budget_item_id).await
    }

    async fn get_invoice(&self, invoice_id: i64) -> budget_reconciler::Result<Option<Invoice>> {
        self.inner.get_invoice(invoice_id).await
    }

    async fn list_invoices(&self, contract_id: i64) -> budget_reconciler::Result<Vec<Invoice>> {
        self.inner.list_invoices(contract_id).await
    }

    async fn get_line_item(&self, line_item_id: i64) -> budget_reconciler::Result<Option<InvoiceLineItem>> {
        self.inner.get_line_item(line_item_id).await
    }

    async fn list_line_items(&self, invoice_id: i64) -> budget_reconciler::Result<Vec<InvoiceLineItem>> {
        self.inner.list_line_items(invoice_id).await
    }

    async fn list_contract_line_items(&self, contract_id: i64) -> budget_reconciler::Result<Vec<InvoiceLineItem>> {
        self.inner.list_contract_line_items(contract_id).await
    }

    async fn list_contract_links(&self, contract_id: i64) -> budget_reconciler::Result<Vec<Link>> {
        self.inner.list_contract_links(contract_id).await
    }

    async fn list_link_history(&self, line_item_id: i64) -> budget_reconciler::Result<Vec<Link>> {
        self.inner.list_link_history(line_item_id).await
    }

    async fn update_invoice_status(&self, change: StatusChange) -> budget_reconciler::Result<Invoice> {
        self.inner.update_invoice_status(change).await
    }

    async fn set_invoice_contract(&self, invoice_id: i64, contract_id: i64) -> budget_reconciler::Result<Invoice> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_invoice_contract(invoice_id, contract_id).await
    }

    async fn update_classification(
        &self,
        line_item_id: i64,
        classification: Classification,
    ) -> budget_reconciler::Result<InvoiceLineItem> {
        self.inner.update_classification(line_item_id, classification).await
    }

    async fn replace_link(&self, change: LinkChange) -> budget_reconciler::Result<Option<Link>> {
        self.inner.replace_link(change).await
    }

    async fn record_contract_realized(&self, contract_id: i64, realized: BigDecimal) -> budget_reconciler::Result<()> {
        self.inner.record_contract_realized(contract_id, realized).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_link_cannot_slip_in_while_invoice_changes_contract() {
    let inner = store_with_line().await;
    inner
        .insert_contract(Contract {
            id: 2,
            name: "Obra 2".to_string(),
            contract_value: None,
            realized_value: BigDecimal::from(0),
        })
        .await
        .unwrap();
    let store = Arc::new(SlowAssignStore {
        inner: inner.clone(),
        delay: Duration::from_millis(200),
    });
    let service = Arc::new(ReconciliationService::new(store, &AppConfig::default()));

    let associate = {
        let service = service.clone();
        tokio::spawn(async move { service.associate_contract(10, 2).await })
    };
    // 等待合同变更进入存储写入阶段
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 发票已移到合同 2, 合同 1 的预算项不能再关联
    let err = service.manual_link(101, Some(1)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    let moved = associate.await.unwrap().unwrap();
    assert_eq!(moved.contract_id, Some(2));

    let line = inner.get_line_item(101).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, None);
    assert!(inner.list_link_history(101).await.unwrap().is_empty());

    service.validate_invoice(10).await.unwrap();
    let execution = service.get_contract_execution(2).await.unwrap();
    assert!(execution.alerts.iter().any(|a| a.invoice_id == Some(10)));
    assert_eq!(service.get_contract_execution(1).await.unwrap().total_realized, dec("0"));
}
