use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const API_VERSION: &str = "1.0.0";

/// Sign carrier for a transaction amount: credits increase the balance,
/// debits decrease it. Amounts themselves are stored unsigned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: TransactionKind,
    pub amount: u64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalanceSnapshot {
    pub owner_id: String,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebitRequest {
    pub amount: u64,
    pub feature: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Outcome of a debit attempt. `applied == false` means the store refused
/// the conditional decrement; `balance` is the authoritative value either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebitOutcome {
    pub applied: bool,
    pub balance: u64,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditRequest {
    pub amount: u64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditOutcome {
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionPage {
    pub owner_id: String,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileReport {
    pub owner_id: String,
    pub consistent: bool,
    pub recorded_balance: u64,
    pub transaction_sum: i64,
    pub drift: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransactionKind::Credit).unwrap(),
            "\"credit\""
        );
        assert_eq!(
            serde_json::to_string(&TransactionKind::Debit).unwrap(),
            "\"debit\""
        );
    }

    #[test]
    fn debit_request_rejects_unknown_fields() {
        let parsed = serde_json::from_str::<DebitRequest>(
            r#"{"amount": 5, "feature": "addon_purchase", "bogus": true}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn transaction_record_omits_absent_feature() {
        let rec = TransactionRecord {
            id: Uuid::new_v4(),
            owner_id: "user-1".to_string(),
            kind: TransactionKind::Credit,
            amount: 60,
            description: "Initial token allocation".to_string(),
            feature: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("feature").is_none());
    }
}
