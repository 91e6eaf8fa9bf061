// src/receipt/mod.rs

mod input;
mod normalize;
mod summary_filter;

pub use input::{MimeType, RawReceiptInput};
pub use normalize::{DEFAULT_UNIT, parse_model_response};
pub use summary_filter::{MatchRule, SummaryFilter};

use crate::discrepancy::VerifiedItem;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

/// Verification state of a single line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Received,
    Missing,
    Partial,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Received => "received",
            ItemStatus::Missing => "missing",
            ItemStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "received" => Some(ItemStatus::Received),
            "missing" => Some(ItemStatus::Missing),
            "partial" => Some(ItemStatus::Partial),
            _ => None,
        }
    }
}

/// A single product line read off a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedLineItem {
    pub id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub price_per_unit: f64,
    pub total_price: f64,
    pub received_quantity: Option<f64>,
    pub status: ItemStatus,
}

/// Structured result of one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedReceipt {
    pub supplier_name: String,
    pub date: Date,
    pub order_number: Option<String>,
    pub items: Vec<ExtractedLineItem>,
    pub total_value: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("{pending} item(s) still pending verification")]
    Unverified { pending: usize },
    #[error("no item with id {0}")]
    UnknownItem(String),
}

impl ExtractedLineItem {
    /// Everything listed arrived.
    pub fn mark_received(&mut self) {
        self.received_quantity = Some(self.quantity);
        self.status = ItemStatus::Received;
    }

    /// `missing` units did not arrive.
    pub fn mark_missing(&mut self, missing: f64) {
        if !(missing > 0.0) {
            self.mark_received();
        } else if missing >= self.quantity {
            self.received_quantity = Some(0.0);
            self.status = ItemStatus::Missing;
        } else {
            self.received_quantity = Some(self.quantity - missing);
            self.status = ItemStatus::Partial;
        }
    }

    /// Record a counted quantity as-is and derive the status from it.
    ///
    /// Out-of-range readings are stored unchanged; the discrepancy
    /// calculator decides how to treat them.
    pub fn set_received(&mut self, received: f64) {
        self.received_quantity = Some(received);
        self.status = if received >= self.quantity {
            ItemStatus::Received
        } else if !(received > 0.0) {
            ItemStatus::Missing
        } else {
            ItemStatus::Partial
        };
    }

    pub fn reset(&mut self) {
        self.received_quantity = None;
        self.status = ItemStatus::Pending;
    }

    fn effective_received(&self) -> f64 {
        match (self.received_quantity, self.status) {
            (Some(q), _) => q,
            (None, ItemStatus::Received) => self.quantity,
            (None, _) => 0.0,
        }
    }

    pub fn missing_quantity(&self) -> f64 {
        if self.status == ItemStatus::Pending {
            return 0.0;
        }
        (self.quantity - self.effective_received().max(0.0)).max(0.0)
    }

    pub fn to_verified(&self) -> VerifiedItem {
        VerifiedItem {
            name: self.name.clone(),
            expected_quantity: self.quantity,
            received_quantity: self.effective_received(),
            unit_price: self.price_per_unit,
            unit: self.unit.clone(),
        }
    }
}

impl ExtractedReceipt {
    pub fn item_mut(&mut self, id: &str) -> Result<&mut ExtractedLineItem, VerificationError> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| VerificationError::UnknownItem(id.to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .count()
    }

    /// Running value of what has been marked missing so far.
    pub fn missing_value(&self) -> f64 {
        self.items
            .iter()
            .map(|i| i.missing_quantity() * i.price_per_unit)
            .sum()
    }

    /// Hand the verified items to the discrepancy calculator. Refuses while
    /// anything is still pending.
    pub fn verified_items(&self) -> Result<Vec<VerifiedItem>, VerificationError> {
        verified_items(&self.items)
    }
}

pub fn verified_items(items: &[ExtractedLineItem]) -> Result<Vec<VerifiedItem>, VerificationError> {
    let pending = items
        .iter()
        .filter(|i| i.status == ItemStatus::Pending)
        .count();
    if pending > 0 {
        return Err(VerificationError::Unverified { pending });
    }
    Ok(items.iter().map(ExtractedLineItem::to_verified).collect())
}
