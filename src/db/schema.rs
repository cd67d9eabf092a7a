/// 建表 DDL, 可重复执行
///
/// `budget_links_active_uidx` 保证每个明细至多一条有效关联。
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
    id              BIGINT PRIMARY KEY,
    name            TEXT NOT NULL,
    contract_value  NUMERIC(18, 2),
    realized_value  NUMERIC(18, 2) NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS budget_items (
    id                    BIGINT PRIMARY KEY,
    contract_id           BIGINT NOT NULL REFERENCES contracts(id),
    description           TEXT NOT NULL,
    category              TEXT NOT NULL,
    predicted_quantity    NUMERIC(18, 4),
    predicted_unit_value  NUMERIC(18, 4),
    predicted_total_value NUMERIC(18, 2) NOT NULL
);

CREATE TABLE IF NOT EXISTS invoices (
    id                BIGINT PRIMARY KEY,
    contract_id       BIGINT REFERENCES contracts(id),
    number            TEXT NOT NULL,
    supplier          TEXT NOT NULL,
    total_value       NUMERIC(18, 2) NOT NULL,
    emission_date     DATE NOT NULL,
    validation_status TEXT NOT NULL DEFAULT 'pending',  -- pending | processed | validated | rejected
    rejection_reason  TEXT,
    status_changed_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS invoice_line_items (
    id                        BIGINT PRIMARY KEY,
    invoice_id                BIGINT NOT NULL REFERENCES invoices(id),
    description               TEXT NOT NULL,
    quantity                  NUMERIC(18, 4) NOT NULL,
    unit_value                NUMERIC(18, 4) NOT NULL,
    total_value               NUMERIC(18, 2) NOT NULL,
    category                  TEXT,
    classification_confidence SMALLINT CHECK (classification_confidence BETWEEN 0 AND 100),
    classification_source     TEXT NOT NULL DEFAULT 'heuristic',
    integration_status        TEXT NOT NULL DEFAULT 'unclassified'
);

CREATE TABLE IF NOT EXISTS budget_links (
    id             BIGSERIAL PRIMARY KEY,
    line_item_id   BIGINT NOT NULL REFERENCES invoice_line_items(id),
    budget_item_id BIGINT NOT NULL REFERENCES budget_items(id),
    contract_id    BIGINT NOT NULL REFERENCES contracts(id),
    confidence     SMALLINT NOT NULL,
    is_manual      BOOLEAN NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL,
    cleared_at     TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS budget_links_active_uidx
    ON budget_links (line_item_id) WHERE cleared_at IS NULL;

CREATE INDEX IF NOT EXISTS budget_links_contract_idx ON budget_links (contract_id);
CREATE INDEX IF NOT EXISTS budget_items_contract_idx ON budget_items (contract_id);
CREATE INDEX IF NOT EXISTS invoices_contract_idx ON invoices (contract_id);
CREATE INDEX IF NOT EXISTS invoice_line_items_invoice_idx ON invoice_line_items (invoice_id)
"#;

/// 按语句切分, 逐条执行
pub fn statements() -> impl Iterator<Item = &'static str> {
    SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_split_cleanly() {
        let all: Vec<&str> = statements().collect();
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|s| !s.ends_with(';')));
        assert!(all
            .iter()
            .any(|s| s.contains("UNIQUE INDEX") && s.contains("WHERE cleared_at IS NULL")));
    }
}
