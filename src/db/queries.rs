use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, QueryBuilder};
use std::time::Instant;

use super::store::ReconcileStore;
use crate::config::DatabaseConfig;
use crate::error::{ReconcileError, Result};
use crate::models::{
    BudgetItem, Classification, Contract, Invoice, InvoiceLineItem, Link, LinkChange, StatusChange,
};

const INVOICE_COLUMNS: &str = "id, contract_id, number, supplier, total_value, emission_date, \
     validation_status, rejection_reason, status_changed_at";

const LINK_COLUMNS: &str =
    "id, line_item_id, budget_item_id, contract_id, confidence, is_manual, created_at, cleared_at";

/// 明细查询, 关联当前有效 link 得到 linked_budget_item_id
const LINE_ITEM_SELECT: &str = r#"
        SELECT li.id, li.invoice_id, li.description, li.quantity, li.unit_value, li.total_value,
               li.category, bl.budget_item_id AS linked_budget_item_id,
               li.classification_confidence, li.classification_source, li.integration_status
        FROM invoice_line_items li
        LEFT JOIN budget_links bl ON bl.line_item_id = li.id AND bl.cleared_at IS NULL
"#;

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: i64,
    contract_id: Option<i64>,
    number: String,
    supplier: String,
    total_value: BigDecimal,
    emission_date: NaiveDate,
    validation_status: String,
    rejection_reason: Option<String>,
    status_changed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = ReconcileError;

    fn try_from(row: InvoiceRow) -> Result<Self> {
        Ok(Invoice {
            id: row.id,
            contract_id: row.contract_id,
            number: row.number,
            supplier: row.supplier,
            total_value: row.total_value,
            emission_date: row.emission_date,
            validation_status: row.validation_status.parse().map_err(ReconcileError::Decode)?,
            rejection_reason: row.rejection_reason,
            status_changed_at: row.status_changed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LineItemRow {
    id: i64,
    invoice_id: i64,
    description: String,
    quantity: BigDecimal,
    unit_value: BigDecimal,
    total_value: BigDecimal,
    category: Option<String>,
    linked_budget_item_id: Option<i64>,
    classification_confidence: Option<i16>,
    classification_source: String,
    integration_status: String,
}

impl TryFrom<LineItemRow> for InvoiceLineItem {
    type Error = ReconcileError;

    fn try_from(row: LineItemRow) -> Result<Self> {
        let confidence = row
            .classification_confidence
            .map(|c| u8::try_from(c).map_err(|_| ReconcileError::Decode(format!("confidence out of range: {c}"))))
            .transpose()?;

        Ok(InvoiceLineItem {
            id: row.id,
            invoice_id: row.invoice_id,
            description: row.description,
            quantity: row.quantity,
            unit_value: row.unit_value,
            total_value: row.total_value,
            category: row.category,
            linked_budget_item_id: row.linked_budget_item_id,
            classification_confidence: confidence,
            classification_source: row.classification_source.parse().map_err(ReconcileError::Decode)?,
            integration_status: row.integration_status.parse().map_err(ReconcileError::Decode)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct LinkRow {
    id: i64,
    line_item_id: i64,
    budget_item_id: i64,
    contract_id: i64,
    confidence: i16,
    is_manual: bool,
    created_at: DateTime<Utc>,
    cleared_at: Option<DateTime<Utc>>,
}

impl TryFrom<LinkRow> for Link {
    type Error = ReconcileError;

    fn try_from(row: LinkRow) -> Result<Self> {
        Ok(Link {
            id: row.id,
            line_item_id: row.line_item_id,
            budget_item_id: row.budget_item_id,
            contract_id: row.contract_id,
            confidence: u8::try_from(row.confidence)
                .map_err(|_| ReconcileError::Decode(format!("confidence out of range: {}", row.confidence)))?,
            is_manual: row.is_manual,
            created_at: row.created_at,
            cleared_at: row.cleared_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = ReconcileError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// 唯一约束冲突 (23505) 转为 `Conflict`
fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> ReconcileError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => ReconcileError::Conflict(what()),
        _ => ReconcileError::Database(err),
    }
}

/// PostgreSQL 存储
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建立连接池并初始化表结构
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = super::create_pool(database_url, config).await?;
        super::init_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ReconcileStore for PgStore {
    async fn insert_contract(&self, contract: Contract) -> Result<()> {
        sqlx::query("INSERT INTO contracts (id, name, contract_value, realized_value) VALUES ($1, $2, $3, $4)")
            .bind(contract.id)
            .bind(&contract.name)
            .bind(&contract.contract_value)
            .bind(&contract.realized_value)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, || format!("contract {} already exists", contract.id)))?;
        Ok(())
    }

    async fn insert_budget_items(&self, items: Vec<BudgetItem>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let start_time = Instant::now();
        let mut query_builder = QueryBuilder::new(
            "INSERT INTO budget_items (
                id, contract_id, description, category,
                predicted_quantity, predicted_unit_value, predicted_total_value
            ) ",
        );
        query_builder.push_values(&items, |mut b, item| {
            b.push_bind(item.id)
                .push_bind(item.contract_id)
                .push_bind(&item.description)
                .push_bind(&item.category)
                .push_bind(&item.predicted_quantity)
                .push_bind(&item.predicted_unit_value)
                .push_bind(&item.predicted_total_value);
        });

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, || "budget item already exists".to_string()))?;

        tracing::debug!("budget items inserted: {} rows, {:?}", result.rows_affected(), start_time.elapsed());
        Ok(result.rows_affected() as usize)
    }

    async fn insert_invoice(&self, invoice: Invoice, lines: Vec<InvoiceLineItem>) -> Result<()> {
        if let Some(line) = lines.iter().find(|l| l.invoice_id != invoice.id) {
            return Err(ReconcileError::Validation(format!(
                "line item {} belongs to invoice {}, not {}",
                line.id, line.invoice_id, invoice.id
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(invoice.id)
        .bind(invoice.contract_id)
        .bind(&invoice.number)
        .bind(&invoice.supplier)
        .bind(&invoice.total_value)
        .bind(invoice.emission_date)
        .bind(invoice.validation_status.as_str())
        .bind(&invoice.rejection_reason)
        .bind(invoice.status_changed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("invoice {} already exists", invoice.id)))?;

        if !lines.is_empty() {
            let mut query_builder = QueryBuilder::new(
                "INSERT INTO invoice_line_items (
                    id, invoice_id, description, quantity, unit_value, total_value,
                    category, classification_confidence, classification_source, integration_status
                ) ",
            );
            query_builder.push_values(&lines, |mut b, line| {
                b.push_bind(line.id)
                    .push_bind(line.invoice_id)
                    .push_bind(&line.description)
                    .push_bind(&line.quantity)
                    .push_bind(&line.unit_value)
                    .push_bind(&line.total_value)
                    .push_bind(&line.category)
                    .push_bind(line.classification_confidence.map(i16::from))
                    .push_bind(line.classification_source.as_str())
                    .push_bind(line.integration_status.as_str());
            });
            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| conflict_on_unique(e, || "line item already exists".to_string()))?;
        }

        tx.commit().await?;
        tracing::info!("invoice {} ingested with {} line items", invoice.id, lines.len());
        Ok(())
    }

    async fn get_contract(&self, contract_id: i64) -> Result<Option<Contract>> {
        let contract = sqlx::query_as::<_, Contract>(
            "SELECT id, name, contract_value, realized_value FROM contracts WHERE id = $1",
        )
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    async fn list_budget_items(&self, contract_id: i64) -> Result<Vec<BudgetItem>> {
        let items = sqlx::query_as::<_, BudgetItem>(
            r#"
            SELECT id, contract_id, description, category,
                   predicted_quantity, predicted_unit_value, predicted_total_value
            FROM budget_items
            WHERE contract_id = $1
            ORDER BY id
            "#,
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn get_budget_item(&self, budget_item_id: i64) -> Result<Option<BudgetItem>> {
        let item = sqlx::query_as::<_, BudgetItem>(
            r#"
            SELECT id, contract_id, description, category,
                   predicted_quantity, predicted_unit_value, predicted_total_value
            FROM budget_items
            WHERE id = $1
            "#,
        )
        .bind(budget_item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn get_invoice(&self, invoice_id: i64) -> Result<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1");
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn list_invoices(&self, contract_id: i64) -> Result<Vec<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE contract_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(contract_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn get_line_item(&self, line_item_id: i64) -> Result<Option<InvoiceLineItem>> {
        let sql = format!("{LINE_ITEM_SELECT} WHERE li.id = $1");
        let row = sqlx::query_as::<_, LineItemRow>(&sql)
            .bind(line_item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(InvoiceLineItem::try_from).transpose()
    }

    async fn list_line_items(&self, invoice_id: i64) -> Result<Vec<InvoiceLineItem>> {
        let sql = format!("{LINE_ITEM_SELECT} WHERE li.invoice_id = $1 ORDER BY li.id");
        let rows = sqlx::query_as::<_, LineItemRow>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_contract_line_items(&self, contract_id: i64) -> Result<Vec<InvoiceLineItem>> {
        let sql = format!(
            "{LINE_ITEM_SELECT} INNER JOIN invoices inv ON inv.id = li.invoice_id \
             WHERE inv.contract_id = $1 ORDER BY li.id"
        );
        let start_time = Instant::now();
        let rows = sqlx::query_as::<_, LineItemRow>(&sql)
            .bind(contract_id)
            .fetch_all(&self.pool)
            .await?;
        tracing::debug!("contract {} line items: {} rows, {:?}", contract_id, rows.len(), start_time.elapsed());
        convert_all(rows)
    }

    async fn list_contract_links(&self, contract_id: i64) -> Result<Vec<Link>> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM budget_links WHERE contract_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, LinkRow>(&sql)
            .bind(contract_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_link_history(&self, line_item_id: i64) -> Result<Vec<Link>> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM budget_links WHERE line_item_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, LinkRow>(&sql)
            .bind(line_item_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn update_invoice_status(&self, change: StatusChange) -> Result<Invoice> {
        let sql = format!(
            "UPDATE invoices SET validation_status = $1, rejection_reason = $2, status_changed_at = $3 \
             WHERE id = $4 AND validation_status = $5 RETURNING {INVOICE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(change.to.as_str())
            .bind(&change.reason)
            .bind(change.at)
            .bind(change.invoice_id)
            .bind(change.from.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Invoice::try_from(row),
            None => match self.get_invoice(change.invoice_id).await? {
                None => Err(ReconcileError::not_found("invoice", change.invoice_id)),
                Some(current) => Err(ReconcileError::Conflict(format!(
                    "invoice {} is {}, expected {}",
                    change.invoice_id, current.validation_status, change.from
                ))),
            },
        }
    }

    async fn set_invoice_contract(&self, invoice_id: i64, contract_id: i64) -> Result<Invoice> {
        if self.get_contract(contract_id).await?.is_none() {
            return Err(ReconcileError::not_found("contract", contract_id));
        }

        let sql = format!("UPDATE invoices SET contract_id = $1 WHERE id = $2 RETURNING {INVOICE_COLUMNS}");
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(contract_id)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from)
            .transpose()?
            .ok_or_else(|| ReconcileError::not_found("invoice", invoice_id))
    }

    async fn update_classification(
        &self,
        line_item_id: i64,
        classification: Classification,
    ) -> Result<InvoiceLineItem> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_line_items
            SET category = $1, classification_confidence = $2,
                classification_source = $3, integration_status = $4
            WHERE id = $5
            "#,
        )
        .bind(&classification.category)
        .bind(classification.confidence.map(i16::from))
        .bind(classification.source.as_str())
        .bind(classification.status.as_str())
        .bind(line_item_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::not_found("line item", line_item_id));
        }
        self.get_line_item(line_item_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("line item", line_item_id))
    }

    async fn replace_link(&self, change: LinkChange) -> Result<Option<Link>> {
        let mut tx = self.pool.begin().await?;

        // 锁住明细行, 同一明细的关联替换串行执行
        let locked: Option<i64> = sqlx::query_scalar("SELECT id FROM invoice_line_items WHERE id = $1 FOR UPDATE")
            .bind(change.line_item_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(ReconcileError::not_found("line item", change.line_item_id));
        }

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT budget_item_id FROM budget_links WHERE line_item_id = $1 AND cleared_at IS NULL",
        )
        .bind(change.line_item_id)
        .fetch_optional(&mut *tx)
        .await?;

        if current != change.expected {
            return Err(ReconcileError::Conflict(format!(
                "line item {} is linked to {:?}, expected {:?}",
                change.line_item_id, current, change.expected
            )));
        }

        if current.is_some() {
            sqlx::query("UPDATE budget_links SET cleared_at = $1 WHERE line_item_id = $2 AND cleared_at IS NULL")
                .bind(change.at)
                .bind(change.line_item_id)
                .execute(&mut *tx)
                .await?;
        }

        let created = match &change.link {
            Some(new) => {
                let sql = format!(
                    "INSERT INTO budget_links (line_item_id, budget_item_id, contract_id, confidence, is_manual, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {LINK_COLUMNS}"
                );
                let row = sqlx::query_as::<_, LinkRow>(&sql)
                    .bind(change.line_item_id)
                    .bind(new.budget_item_id)
                    .bind(new.contract_id)
                    .bind(i16::from(new.confidence))
                    .bind(new.is_manual)
                    .bind(change.at)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| {
                        conflict_on_unique(e, || {
                            format!("line item {} was linked concurrently", change.line_item_id)
                        })
                    })?;
                Some(Link::try_from(row)?)
            }
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE invoice_line_items
            SET category = $1, classification_confidence = $2,
                classification_source = $3, integration_status = $4
            WHERE id = $5
            "#,
        )
        .bind(&change.classification.category)
        .bind(change.classification.confidence.map(i16::from))
        .bind(change.classification.source.as_str())
        .bind(change.classification.status.as_str())
        .bind(change.line_item_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn record_contract_realized(&self, contract_id: i64, realized: BigDecimal) -> Result<()> {
        let result = sqlx::query("UPDATE contracts SET realized_value = $1 WHERE id = $2")
            .bind(&realized)
            .bind(contract_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::not_found("contract", contract_id));
        }
        Ok(())
    }
}
