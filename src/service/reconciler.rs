use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::alerts::generate_alerts;
use super::linker::{ClassifyOutcome, Linker};
use super::matcher::{suggest_for_lines, HeuristicScorer, MatchScorer};
use super::realization::{compute_execution, ContractSnapshot};
use super::report::execution_csv;
use super::validation::{ensure_associable, plan_process, plan_reject, plan_validate};
use crate::config::{AlertPolicy, AppConfig, MatchingPolicy};
use crate::db::ReconcileStore;
use crate::error::{ReconcileError, Result};
use crate::models::{
    BatchLinkResult, BudgetItem, BudgetRealization, Contract, ContractExecution, Invoice,
    InvoiceLineItem, Link, LinkRequest, StatusChange, Suggestion, ValidationStatus,
};

/// 状态变更结果; 发票属于某合同时附带重算后的执行视图
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceTransition {
    pub invoice: Invoice,
    pub execution: Option<ContractExecution>,
}

/// 批量状态变更中单张发票的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceOutcome {
    pub invoice_id: i64,
    pub success: bool,
    pub status: Option<ValidationStatus>,
    pub message: Option<String>,
}

/// 含未关联明细的发票
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlinkedInvoice {
    pub invoice: Invoice,
    pub line_count: usize,
    pub unlinked_count: usize,
}

/// 对账服务
///
/// 同一合同的写操作 (校验 → 关联 → 重算 → 告警) 在合同级互斥锁内串行执行;
/// 执行视图按合同缓存, 任何写操作都会使其失效。
pub struct ReconciliationService<S> {
    store: Arc<S>,
    scorer: Arc<dyn MatchScorer>,
    linker: Linker<S>,
    matching: MatchingPolicy,
    alert_policy: AlertPolicy,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    unassigned: Arc<Mutex<()>>,
    executions: DashMap<i64, ContractExecution>,
}

impl<S: ReconcileStore> ReconciliationService<S> {
    pub fn new(store: Arc<S>, config: &AppConfig) -> Self {
        let scorer: Arc<dyn MatchScorer> = Arc::new(HeuristicScorer::new(config.matching.weights));
        Self::with_scorer(store, scorer, config.matching.clone(), config.alerts.clone())
    }

    /// 指定评分策略
    pub fn with_scorer(
        store: Arc<S>,
        scorer: Arc<dyn MatchScorer>,
        matching: MatchingPolicy,
        alert_policy: AlertPolicy,
    ) -> Self {
        Self {
            linker: Linker::new(store.clone(), scorer.clone(), matching.clone()),
            store,
            scorer,
            matching,
            alert_policy,
            locks: DashMap::new(),
            unassigned: Arc::new(Mutex::new(())),
            executions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn contract_lock(&self, contract_id: i64) -> Arc<Mutex<()>> {
        self.locks.entry(contract_id).or_default().clone()
    }

    /// 发票所属合同的锁; 未关联合同的发票共用一把锁
    fn owner_lock(&self, contract_id: Option<i64>) -> Arc<Mutex<()>> {
        match contract_id {
            Some(id) => self.contract_lock(id),
            None => self.unassigned.clone(),
        }
    }

    /// 锁定发票当前所属合同; 等锁期间所属合同被改动则按新合同重新加锁
    async fn lock_invoice_owner(&self, invoice_id: i64) -> Result<(Option<i64>, OwnedMutexGuard<()>)> {
        loop {
            let owner = self.load_invoice(invoice_id).await?.contract_id;
            let guard = self.owner_lock(owner).lock_owned().await;
            if self.load_invoice(invoice_id).await?.contract_id == owner {
                return Ok((owner, guard));
            }
            tracing::debug!("invoice {} moved off contract {:?} while waiting for lock", invoice_id, owner);
        }
    }

    async fn lock_line_owner(&self, line_item_id: i64) -> Result<(Option<i64>, OwnedMutexGuard<()>)> {
        let (line, _) = self.linker.load_line(line_item_id).await?;
        self.lock_invoice_owner(line.invoice_id).await
    }

    fn invalidate(&self, contract_id: i64) {
        self.executions.remove(&contract_id);
    }

    async fn load_invoice(&self, invoice_id: i64) -> Result<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("invoice", invoice_id))
    }

    async fn load_snapshot(&self, contract_id: i64) -> Result<ContractSnapshot> {
        let (contract, budget_items, invoices, line_items, links) = futures::try_join!(
            self.store.get_contract(contract_id),
            self.store.list_budget_items(contract_id),
            self.store.list_invoices(contract_id),
            self.store.list_contract_line_items(contract_id),
            self.store.list_contract_links(contract_id),
        )?;
        let contract = contract.ok_or_else(|| ReconcileError::not_found("contract", contract_id))?;

        Ok(ContractSnapshot {
            contract,
            budget_items,
            invoices,
            line_items,
            links,
        })
    }

    /// 重算并写回合同已实现金额; 调用方须持有合同锁
    async fn refresh(&self, contract_id: i64) -> Result<ContractExecution> {
        self.invalidate(contract_id);
        let start_time = Instant::now();

        let snapshot = self.load_snapshot(contract_id).await?;
        let mut execution = compute_execution(&snapshot);
        execution.alerts = generate_alerts(&execution, &snapshot, &self.alert_policy);

        if snapshot.contract.realized_value != execution.total_realized {
            if let Err(e) = self
                .store
                .record_contract_realized(contract_id, execution.total_realized.clone())
                .await
            {
                tracing::error!("contract {} realized total not saved: {}", contract_id, e);
                return Err(e);
            }
        }

        tracing::info!(
            "[Execution] contract {}: {} items, realized {} / {} ({:.2}%), {} alerts, {:?}",
            contract_id,
            execution.items.len(),
            execution.total_realized,
            execution.total_predicted,
            execution.financial_progress,
            execution.alerts.len(),
            start_time.elapsed()
        );
        for warning in &execution.warnings {
            tracing::warn!("contract {}: {}", contract_id, warning);
        }

        self.executions.insert(contract_id, execution.clone());
        Ok(execution)
    }

    /// 在合同锁内执行写操作, 成功后重算
    async fn refresh_locked(&self, contract_id: i64) -> Result<ContractExecution> {
        let lock = self.contract_lock(contract_id);
        let _guard = lock.lock().await;
        self.refresh(contract_id).await
    }

    // ── 匹配建议 ───────────────────────────────────────────────────

    /// 为发票所有明细生成关联建议
    ///
    /// `unlinked_only` 为真时只考虑尚无任何有效关联的预算项。
    pub async fn generate_linking_suggestions(
        &self,
        invoice_id: i64,
        contract_id: i64,
        unlinked_only: bool,
    ) -> Result<Vec<Suggestion>> {
        let invoice = self.load_invoice(invoice_id).await?;
        if let Some(owner) = invoice.contract_id {
            if owner != contract_id {
                return Err(ReconcileError::Conflict(format!(
                    "invoice {} belongs to contract {}, not {}",
                    invoice_id, owner, contract_id
                )));
            }
        }
        if self.store.get_contract(contract_id).await?.is_none() {
            return Err(ReconcileError::not_found("contract", contract_id));
        }

        let (lines, mut candidates) = futures::try_join!(
            self.store.list_line_items(invoice_id),
            self.store.list_budget_items(contract_id),
        )?;

        if unlinked_only {
            let used: HashSet<i64> = self
                .store
                .list_contract_links(contract_id)
                .await?
                .into_iter()
                .filter(Link::is_active)
                .map(|l| l.budget_item_id)
                .collect();
            candidates.retain(|b| !used.contains(&b.id));
        }

        let start_time = Instant::now();
        let suggestions = suggest_for_lines(self.scorer.as_ref(), &self.matching, &lines, &candidates);
        tracing::info!(
            "[Suggest] invoice {}: {} lines x {} budget items -> {} suggestions, {:?}",
            invoice_id,
            lines.len(),
            candidates.len(),
            suggestions.len(),
            start_time.elapsed()
        );
        Ok(suggestions)
    }

    // ── 关联与分类 ─────────────────────────────────────────────────

    pub async fn manual_link(&self, line_item_id: i64, budget_item_id: Option<i64>) -> Result<Option<Link>> {
        let (owner, _guard) = self.lock_line_owner(line_item_id).await?;
        let link = self.linker.manual_link(line_item_id, budget_item_id).await?;
        // 无合同的发票不能关联, 清除也无需重算
        if let Some(contract_id) = owner {
            self.refresh(contract_id).await?;
        }
        Ok(link)
    }

    pub async fn apply_suggestion(&self, line_item_id: i64, budget_item_id: i64) -> Result<Link> {
        let (owner, _guard) = self.lock_line_owner(line_item_id).await?;
        let link = self.linker.apply_suggestion(line_item_id, budget_item_id).await?;
        if let Some(contract_id) = owner {
            self.refresh(contract_id).await?;
        }
        Ok(link)
    }

    pub async fn apply_batch(
        &self,
        invoice_id: i64,
        contract_id: i64,
        requests: &[LinkRequest],
    ) -> Result<BatchLinkResult> {
        let lock = self.contract_lock(contract_id);
        let _guard = lock.lock().await;

        let result = self.linker.apply_batch(invoice_id, contract_id, requests).await?;
        tracing::info!(
            "[Link] invoice {}: {} requested, {} linked, {} warnings, {} errors",
            invoice_id,
            requests.len(),
            result.linked_items.len(),
            result.warnings.len(),
            result.errors.len()
        );
        if !result.linked_items.is_empty() {
            self.refresh(contract_id).await?;
        }
        Ok(result)
    }

    pub async fn classify_line_item(&self, line_item_id: i64) -> Result<ClassifyOutcome> {
        let (owner, _guard) = self.lock_line_owner(line_item_id).await?;
        let outcome = self.linker.classify(line_item_id).await?;
        if let (Some(contract_id), Some(_)) = (owner, &outcome.link) {
            self.refresh(contract_id).await?;
        }
        Ok(outcome)
    }

    pub async fn classify_line_item_manual(&self, line_item_id: i64, category: &str) -> Result<InvoiceLineItem> {
        self.linker.classify_manual(line_item_id, category).await
    }

    /// 明细的关联历史, 按创建顺序
    pub async fn link_history(&self, line_item_id: i64) -> Result<Vec<Link>> {
        if self.store.get_line_item(line_item_id).await?.is_none() {
            return Err(ReconcileError::not_found("line item", line_item_id));
        }
        self.store.list_link_history(line_item_id).await
    }

    // ── 发票状态 ───────────────────────────────────────────────────

    /// 执行状态变更; 失败时不做任何写入, 也不触发重算
    async fn transition<F>(&self, invoice_id: i64, plan: F) -> Result<InvoiceTransition>
    where
        F: FnOnce(&Invoice, usize) -> Result<StatusChange> + Send,
    {
        let (_, _guard) = self.lock_invoice_owner(invoice_id).await?;

        let current = self.load_invoice(invoice_id).await?;
        let line_count = self.store.list_line_items(invoice_id).await?.len();
        let change = plan(&current, line_count)?;
        let (from, to) = (change.from, change.to);
        let invoice = self.store.update_invoice_status(change).await?;
        tracing::info!("[Validation] invoice {}: {} -> {}", invoice_id, from, to);

        let execution = match invoice.contract_id {
            Some(contract_id) => Some(self.refresh(contract_id).await?),
            None => None,
        };
        Ok(InvoiceTransition { invoice, execution })
    }

    pub async fn mark_processed(&self, invoice_id: i64) -> Result<InvoiceTransition> {
        self.transition(invoice_id, |invoice, _| plan_process(invoice, Utc::now())).await
    }

    pub async fn validate_invoice(&self, invoice_id: i64) -> Result<InvoiceTransition> {
        self.transition(invoice_id, |invoice, lines| plan_validate(invoice, lines, Utc::now()))
            .await
    }

    pub async fn reject_invoice(&self, invoice_id: i64, reason: &str) -> Result<InvoiceTransition> {
        let reason = reason.to_string();
        self.transition(invoice_id, move |invoice, _| plan_reject(invoice, &reason, Utc::now()))
            .await
    }

    /// 设置发票所属合同; 终态发票或已有关联的发票不允许变更
    ///
    /// 原合同与新合同的锁按 id 升序同时持有, 期间原合同上的关联操作无法插入。
    pub async fn associate_contract(&self, invoice_id: i64, contract_id: i64) -> Result<Invoice> {
        let (current, _guards) = loop {
            let previous = self.load_invoice(invoice_id).await?.contract_id;
            let mut owners = vec![previous, Some(contract_id)];
            owners.sort();
            owners.dedup();

            let mut guards = Vec::with_capacity(owners.len());
            for owner in owners {
                guards.push(self.owner_lock(owner).lock_owned().await);
            }
            let current = self.load_invoice(invoice_id).await?;
            if current.contract_id == previous {
                break (current, guards);
            }
        };

        ensure_associable(&current)?;
        if current.contract_id == Some(contract_id) {
            return Ok(current);
        }
        let lines = self.store.list_line_items(invoice_id).await?;
        if lines.iter().any(|l| l.linked_budget_item_id.is_some()) {
            return Err(ReconcileError::Conflict(format!(
                "invoice {} has linked items, clear them before changing contract",
                invoice_id
            )));
        }

        let invoice = self.store.set_invoice_contract(invoice_id, contract_id).await?;
        self.invalidate(contract_id);
        if let Some(previous) = current.contract_id {
            self.invalidate(previous);
        }
        tracing::info!("invoice {} associated with contract {}", invoice_id, contract_id);
        Ok(invoice)
    }

    pub async fn bulk_validate(&self, invoice_ids: &[i64]) -> Vec<InvoiceOutcome> {
        let mut outcomes = Vec::with_capacity(invoice_ids.len());
        for &invoice_id in invoice_ids {
            outcomes.push(outcome(invoice_id, self.validate_invoice(invoice_id).await));
        }
        outcomes
    }

    pub async fn bulk_reject(&self, invoice_ids: &[i64], reason: &str) -> Vec<InvoiceOutcome> {
        let mut outcomes = Vec::with_capacity(invoice_ids.len());
        for &invoice_id in invoice_ids {
            outcomes.push(outcome(invoice_id, self.reject_invoice(invoice_id, reason).await));
        }
        outcomes
    }

    // ── 执行情况 ───────────────────────────────────────────────────

    /// 全量重算合同执行情况
    pub async fn recalculate_execution(&self, contract_id: i64) -> Result<ContractExecution> {
        self.refresh_locked(contract_id).await
    }

    /// 读缓存, 未命中时重算
    pub async fn get_contract_execution(&self, contract_id: i64) -> Result<ContractExecution> {
        if let Some(cached) = self.executions.get(&contract_id) {
            return Ok(cached.value().clone());
        }
        self.refresh_locked(contract_id).await
    }

    pub async fn get_budget_item_realization(
        &self,
        contract_id: i64,
        budget_item_id: i64,
    ) -> Result<BudgetRealization> {
        let execution = self.get_contract_execution(contract_id).await?;
        execution
            .item(budget_item_id)
            .cloned()
            .ok_or_else(|| ReconcileError::not_found("budget item", budget_item_id))
    }

    /// 合同下仍有未关联明细的发票 (驳回的除外)
    pub async fn list_unlinked_invoices(&self, contract_id: i64) -> Result<Vec<UnlinkedInvoice>> {
        if self.store.get_contract(contract_id).await?.is_none() {
            return Err(ReconcileError::not_found("contract", contract_id));
        }
        let (invoices, lines) = futures::try_join!(
            self.store.list_invoices(contract_id),
            self.store.list_contract_line_items(contract_id),
        )?;

        let unlinked = invoices
            .into_iter()
            .filter(|i| i.validation_status != ValidationStatus::Rejected)
            .filter_map(|invoice| {
                let own: Vec<&InvoiceLineItem> = lines.iter().filter(|l| l.invoice_id == invoice.id).collect();
                let unlinked_count = own.iter().filter(|l| l.linked_budget_item_id.is_none()).count();
                (own.is_empty() || unlinked_count > 0).then(|| UnlinkedInvoice {
                    line_count: own.len(),
                    unlinked_count,
                    invoice,
                })
            })
            .collect();
        Ok(unlinked)
    }

    pub async fn export_execution_csv(&self, contract_id: i64) -> Result<String> {
        let execution = self.get_contract_execution(contract_id).await?;
        execution_csv(&execution)
    }

    // ── 导入 ───────────────────────────────────────────────────────

    /// 导入合同及其预算
    pub async fn import_budget(&self, contract: Contract, items: Vec<BudgetItem>) -> Result<usize> {
        let contract_id = contract.id;
        if let Some(item) = items.iter().find(|i| i.contract_id != contract_id) {
            return Err(ReconcileError::Validation(format!(
                "budget item {} belongs to contract {}, not {}",
                item.id, item.contract_id, contract_id
            )));
        }

        let lock = self.contract_lock(contract_id);
        let _guard = lock.lock().await;
        if self.store.get_contract(contract_id).await?.is_none() {
            self.store.insert_contract(contract).await?;
        }
        let count = self.store.insert_budget_items(items).await?;
        self.invalidate(contract_id);
        tracing::info!("[Import] contract {}: {} budget items", contract_id, count);
        Ok(count)
    }

    /// 导入发票; 只接受 pending / processed 状态
    pub async fn import_invoice(&self, invoice: Invoice, lines: Vec<InvoiceLineItem>) -> Result<()> {
        if !matches!(
            invoice.validation_status,
            ValidationStatus::Pending | ValidationStatus::Processed
        ) {
            return Err(ReconcileError::Validation(format!(
                "invoice {} must be imported as pending or processed, got {}",
                invoice.id, invoice.validation_status
            )));
        }

        let (invoice_id, contract_id, count) = (invoice.id, invoice.contract_id, lines.len());
        let lock = self.owner_lock(contract_id);
        let _guard = lock.lock().await;
        self.store.insert_invoice(invoice, lines).await?;
        if let Some(contract_id) = contract_id {
            self.invalidate(contract_id);
        }
        tracing::info!("[Import] invoice {}: {} line items", invoice_id, count);
        Ok(())
    }
}

fn outcome(invoice_id: i64, result: Result<InvoiceTransition>) -> InvoiceOutcome {
    match result {
        Ok(t) => InvoiceOutcome {
            invoice_id,
            success: true,
            status: Some(t.invoice.validation_status),
            message: None,
        },
        Err(e) => {
            tracing::warn!("invoice {} skipped: {}", invoice_id, e);
            InvoiceOutcome {
                invoice_id,
                success: false,
                status: None,
                message: Some(e.to_string()),
            }
        }
    }
}
