//! 存储抽象
//!
//! 服务层只依赖 [`ReconcileStore`]; PostgreSQL 与进程内实现分别见
//! [`PgStore`](super::PgStore) 与 [`MemoryStore`](super::MemoryStore)。

use bigdecimal::BigDecimal;
use std::future::Future;

use crate::error::Result;
use crate::models::{
    BudgetItem, Classification, Contract, Invoice, InvoiceLineItem, Link, LinkChange, StatusChange,
};

/// 对账引擎的持久化接口
///
/// 所有方法返回 `Send` future, 以便在 tokio 多线程运行时与 axum 中使用。
/// 唯一有效关联约束必须由实现保证, 不能依赖调用方加锁。
pub trait ReconcileStore: Send + Sync + 'static {
    // ── 导入 (外部协作方写入) ──────────────────────────────────────

    fn insert_contract(&self, contract: Contract) -> impl Future<Output = Result<()>> + Send + '_;

    fn insert_budget_items(
        &self,
        items: Vec<BudgetItem>,
    ) -> impl Future<Output = Result<usize>> + Send + '_;

    fn insert_invoice(
        &self,
        invoice: Invoice,
        lines: Vec<InvoiceLineItem>,
    ) -> impl Future<Output = Result<()>> + Send + '_;

    // ── 读取 ───────────────────────────────────────────────────────

    fn get_contract(&self, contract_id: i64) -> impl Future<Output = Result<Option<Contract>>> + Send + '_;

    fn list_budget_items(&self, contract_id: i64) -> impl Future<Output = Result<Vec<BudgetItem>>> + Send + '_;

    fn get_budget_item(&self, budget_item_id: i64) -> impl Future<Output = Result<Option<BudgetItem>>> + Send + '_;

    fn get_invoice(&self, invoice_id: i64) -> impl Future<Output = Result<Option<Invoice>>> + Send + '_;

    fn list_invoices(&self, contract_id: i64) -> impl Future<Output = Result<Vec<Invoice>>> + Send + '_;

    fn get_line_item(&self, line_item_id: i64) -> impl Future<Output = Result<Option<InvoiceLineItem>>> + Send + '_;

    /// 发票明细, 按 id 升序
    fn list_line_items(&self, invoice_id: i64) -> impl Future<Output = Result<Vec<InvoiceLineItem>>> + Send + '_;

    /// 合同下所有发票的明细, 按 id 升序
    fn list_contract_line_items(
        &self,
        contract_id: i64,
    ) -> impl Future<Output = Result<Vec<InvoiceLineItem>>> + Send + '_;

    /// 合同下的全部关联 (含已清除), 按 id 升序
    fn list_contract_links(&self, contract_id: i64) -> impl Future<Output = Result<Vec<Link>>> + Send + '_;

    /// 明细的关联历史, 按 id 升序
    fn list_link_history(&self, line_item_id: i64) -> impl Future<Output = Result<Vec<Link>>> + Send + '_;

    // ── 写入 ───────────────────────────────────────────────────────

    /// 按 compare-and-set 变更发票状态
    ///
    /// 当前状态与 `change.from` 不一致时返回 `Conflict`。
    fn update_invoice_status(&self, change: StatusChange) -> impl Future<Output = Result<Invoice>> + Send + '_;

    fn set_invoice_contract(
        &self,
        invoice_id: i64,
        contract_id: i64,
    ) -> impl Future<Output = Result<Invoice>> + Send + '_;

    fn update_classification(
        &self,
        line_item_id: i64,
        classification: Classification,
    ) -> impl Future<Output = Result<InvoiceLineItem>> + Send + '_;

    /// 替换或清除明细的有效关联, 同时写回分类状态
    ///
    /// 当前有效关联与 `change.expected` 不一致, 或并发写入触发唯一约束时返回 `Conflict`。
    fn replace_link(&self, change: LinkChange) -> impl Future<Output = Result<Option<Link>>> + Send + '_;

    fn record_contract_realized(
        &self,
        contract_id: i64,
        realized: BigDecimal,
    ) -> impl Future<Output = Result<()>> + Send + '_;
}
