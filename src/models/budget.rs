use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 合同主表
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Contract {
    pub id: i64,
    pub name: String,
    pub contract_value: Option<BigDecimal>, // 预算表头导入的合同金额
    #[serde(default)]
    pub realized_value: BigDecimal,         // 最近一次重算写回的已实现金额
}

/// 预算明细 (BudgetItem)
///
/// 导入后预测值不可变; 合同存续期间不删除。
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct BudgetItem {
    pub id: i64,
    pub contract_id: i64,
    pub description: String,
    pub category: String,
    pub predicted_quantity: Option<BigDecimal>,
    pub predicted_unit_value: Option<BigDecimal>,
    pub predicted_total_value: BigDecimal,
}
