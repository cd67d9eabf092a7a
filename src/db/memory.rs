use bigdecimal::BigDecimal;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use super::store::ReconcileStore;
use crate::error::{ReconcileError, Result};
use crate::models::{
    BudgetItem, Classification, Contract, Invoice, InvoiceLineItem, Link, LinkChange, StatusChange,
};

/// 进程内存储
///
/// 无数据库时的运行后端, 也是测试后端。有效关联表以明细 id 为键,
/// 通过 `DashMap::entry` 的分片写锁原子地完成 compare-and-set。
///
/// 锁顺序固定为 `active_links → links`, `line_items` 从不与前两者同时持有。
#[derive(Debug)]
pub struct MemoryStore {
    contracts: DashMap<i64, Contract>,
    budget_items: DashMap<i64, BudgetItem>,
    invoices: DashMap<i64, Invoice>,
    line_items: DashMap<i64, InvoiceLineItem>,
    links: DashMap<i64, Link>,
    active_links: DashMap<i64, i64>, // line_item_id -> link id
    next_link_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            contracts: DashMap::new(),
            budget_items: DashMap::new(),
            invoices: DashMap::new(),
            line_items: DashMap::new(),
            links: DashMap::new(),
            active_links: DashMap::new(),
            next_link_id: AtomicI64::new(1),
        }
    }

    fn active_budget_item(&self, line_item_id: i64) -> Option<i64> {
        let link_id = self.active_links.get(&line_item_id).map(|r| *r.value())?;
        self.links.get(&link_id).map(|l| l.budget_item_id)
    }

    fn annotate(&self, mut line: InvoiceLineItem) -> InvoiceLineItem {
        line.linked_budget_item_id = self.active_budget_item(line.id);
        line
    }

    fn contract_invoice_ids(&self, contract_id: i64) -> HashSet<i64> {
        self.invoices
            .iter()
            .filter(|r| r.contract_id == Some(contract_id))
            .map(|r| r.id)
            .collect()
    }
}

impl ReconcileStore for MemoryStore {
    async fn insert_contract(&self, contract: Contract) -> Result<()> {
        match self.contracts.entry(contract.id) {
            Entry::Occupied(_) => Err(ReconcileError::Conflict(format!(
                "contract {} already exists",
                contract.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(contract);
                Ok(())
            }
        }
    }

    async fn insert_budget_items(&self, items: Vec<BudgetItem>) -> Result<usize> {
        for item in &items {
            if !self.contracts.contains_key(&item.contract_id) {
                return Err(ReconcileError::not_found("contract", item.contract_id));
            }
            if self.budget_items.contains_key(&item.id) {
                return Err(ReconcileError::Conflict(format!("budget item {} already exists", item.id)));
            }
        }

        let count = items.len();
        for item in items {
            self.budget_items.insert(item.id, item);
        }
        Ok(count)
    }

    async fn insert_invoice(&self, invoice: Invoice, lines: Vec<InvoiceLineItem>) -> Result<()> {
        if let Some(line) = lines.iter().find(|l| l.invoice_id != invoice.id) {
            return Err(ReconcileError::Validation(format!(
                "line item {} belongs to invoice {}, not {}",
                line.id, line.invoice_id, invoice.id
            )));
        }
        if let Some(line) = lines.iter().find(|l| self.line_items.contains_key(&l.id)) {
            return Err(ReconcileError::Conflict(format!("line item {} already exists", line.id)));
        }

        match self.invoices.entry(invoice.id) {
            Entry::Occupied(_) => {
                return Err(ReconcileError::Conflict(format!("invoice {} already exists", invoice.id)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(invoice);
            }
        }

        for mut line in lines {
            line.linked_budget_item_id = None;
            self.line_items.insert(line.id, line);
        }
        Ok(())
    }

    async fn get_contract(&self, contract_id: i64) -> Result<Option<Contract>> {
        Ok(self.contracts.get(&contract_id).map(|r| r.value().clone()))
    }

    async fn list_budget_items(&self, contract_id: i64) -> Result<Vec<BudgetItem>> {
        let mut items: Vec<BudgetItem> = self
            .budget_items
            .iter()
            .filter(|r| r.contract_id == contract_id)
            .map(|r| r.value().clone())
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn get_budget_item(&self, budget_item_id: i64) -> Result<Option<BudgetItem>> {
        Ok(self.budget_items.get(&budget_item_id).map(|r| r.value().clone()))
    }

    async fn get_invoice(&self, invoice_id: i64) -> Result<Option<Invoice>> {
        Ok(self.invoices.get(&invoice_id).map(|r| r.value().clone()))
    }

    async fn list_invoices(&self, contract_id: i64) -> Result<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|r| r.contract_id == Some(contract_id))
            .map(|r| r.value().clone())
            .collect();
        invoices.sort_by_key(|i| i.id);
        Ok(invoices)
    }

    async fn get_line_item(&self, line_item_id: i64) -> Result<Option<InvoiceLineItem>> {
        let line = self.line_items.get(&line_item_id).map(|r| r.value().clone());
        Ok(line.map(|l| self.annotate(l)))
    }

    async fn list_line_items(&self, invoice_id: i64) -> Result<Vec<InvoiceLineItem>> {
        let mut lines: Vec<InvoiceLineItem> = self
            .line_items
            .iter()
            .filter(|r| r.invoice_id == invoice_id)
            .map(|r| r.value().clone())
            .collect();
        lines.sort_by_key(|l| l.id);
        Ok(lines.into_iter().map(|l| self.annotate(l)).collect())
    }

    async fn list_contract_line_items(&self, contract_id: i64) -> Result<Vec<InvoiceLineItem>> {
        let invoice_ids = self.contract_invoice_ids(contract_id);
        let mut lines: Vec<InvoiceLineItem> = self
            .line_items
            .iter()
            .filter(|r| invoice_ids.contains(&r.invoice_id))
            .map(|r| r.value().clone())
            .collect();
        lines.sort_by_key(|l| l.id);
        Ok(lines.into_iter().map(|l| self.annotate(l)).collect())
    }

    async fn list_contract_links(&self, contract_id: i64) -> Result<Vec<Link>> {
        let mut links: Vec<Link> = self
            .links
            .iter()
            .filter(|r| r.contract_id == contract_id)
            .map(|r| r.value().clone())
            .collect();
        links.sort_by_key(|l| l.id);
        Ok(links)
    }

    async fn list_link_history(&self, line_item_id: i64) -> Result<Vec<Link>> {
        let mut links: Vec<Link> = self
            .links
            .iter()
            .filter(|r| r.line_item_id == line_item_id)
            .map(|r| r.value().clone())
            .collect();
        links.sort_by_key(|l| l.id);
        Ok(links)
    }

    async fn update_invoice_status(&self, change: StatusChange) -> Result<Invoice> {
        let mut invoice = self
            .invoices
            .get_mut(&change.invoice_id)
            .ok_or_else(|| ReconcileError::not_found("invoice", change.invoice_id))?;

        if invoice.validation_status != change.from {
            return Err(ReconcileError::Conflict(format!(
                "invoice {} is {}, expected {}",
                change.invoice_id, invoice.validation_status, change.from
            )));
        }

        invoice.validation_status = change.to;
        invoice.rejection_reason = change.reason;
        invoice.status_changed_at = Some(change.at);
        Ok(invoice.clone())
    }

    async fn set_invoice_contract(&self, invoice_id: i64, contract_id: i64) -> Result<Invoice> {
        if !self.contracts.contains_key(&contract_id) {
            return Err(ReconcileError::not_found("contract", contract_id));
        }
        let mut invoice = self
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| ReconcileError::not_found("invoice", invoice_id))?;
        invoice.contract_id = Some(contract_id);
        Ok(invoice.clone())
    }

    async fn update_classification(
        &self,
        line_item_id: i64,
        classification: Classification,
    ) -> Result<InvoiceLineItem> {
        let updated = {
            let mut line = self
                .line_items
                .get_mut(&line_item_id)
                .ok_or_else(|| ReconcileError::not_found("line item", line_item_id))?;
            line.category = classification.category;
            line.classification_confidence = classification.confidence;
            line.classification_source = classification.source;
            line.integration_status = classification.status;
            line.clone()
        };
        Ok(self.annotate(updated))
    }

    async fn replace_link(&self, change: LinkChange) -> Result<Option<Link>> {
        if !self.line_items.contains_key(&change.line_item_id) {
            return Err(ReconcileError::not_found("line item", change.line_item_id));
        }

        let new_link = |id: i64| {
            change.link.as_ref().map(|new| Link {
                id,
                line_item_id: change.line_item_id,
                budget_item_id: new.budget_item_id,
                contract_id: new.contract_id,
                confidence: new.confidence,
                is_manual: new.is_manual,
                created_at: change.at,
                cleared_at: None,
            })
        };

        let created = match self.active_links.entry(change.line_item_id) {
            Entry::Occupied(mut occupied) => {
                let current_id = *occupied.get();
                let current = self.links.get(&current_id).map(|l| l.budget_item_id);
                if current != change.expected {
                    return Err(ReconcileError::Conflict(format!(
                        "line item {} is linked to {:?}, expected {:?}",
                        change.line_item_id, current, change.expected
                    )));
                }
                if let Some(mut old) = self.links.get_mut(&current_id) {
                    old.cleared_at = Some(change.at);
                }
                match new_link(self.next_link_id.fetch_add(1, Ordering::SeqCst)) {
                    Some(link) => {
                        self.links.insert(link.id, link.clone());
                        occupied.insert(link.id);
                        Some(link)
                    }
                    None => {
                        occupied.remove();
                        None
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if change.expected.is_some() {
                    return Err(ReconcileError::Conflict(format!(
                        "line item {} has no active link, expected {:?}",
                        change.line_item_id, change.expected
                    )));
                }
                match new_link(self.next_link_id.fetch_add(1, Ordering::SeqCst)) {
                    Some(link) => {
                        self.links.insert(link.id, link.clone());
                        vacant.insert(link.id);
                        Some(link)
                    }
                    None => None,
                }
            }
        };

        if let Some(mut line) = self.line_items.get_mut(&change.line_item_id) {
            line.category = change.classification.category;
            line.classification_confidence = change.classification.confidence;
            line.classification_source = change.classification.source;
            line.integration_status = change.classification.status;
        }

        Ok(created)
    }

    async fn record_contract_realized(&self, contract_id: i64, realized: BigDecimal) -> Result<()> {
        let mut contract = self
            .contracts
            .get_mut(&contract_id)
            .ok_or_else(|| ReconcileError::not_found("contract", contract_id))?;
        contract.realized_value = realized;
        Ok(())
    }
}
