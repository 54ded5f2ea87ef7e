use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of reasons an incoming payload is rejected before touching the store.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("received empty payload")]
    EmptyPayload,
    #[error("invalid JSON format: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("field {0} is required")]
    MissingField(&'static str),
    #[error("amount must be non-zero")]
    ZeroAmount,
}

/// Kind of loyalty transaction carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Purchase,
    Refund,
    Bonus,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Bonus => "bonus",
        };
        write!(f, "{name}")
    }
}

/// A transaction event as it is read from the log.
///
/// `id` identifies the logical transaction and doubles as the idempotency key
/// in the store. `amount` is signed: refunds are expected to be negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Deserialize and validate a raw log payload.
    pub fn from_payload(payload: Option<&[u8]>) -> Result<Self, ValidationError> {
        let payload = match payload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(ValidationError::EmptyPayload),
        };

        let event: Event = serde_json::from_slice(payload)?;
        event.validate()?;

        Ok(event)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("user_id"));
        }
        if self.amount == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        Ok(())
    }
}
