// src/discrepancy.rs

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// One line after the restaurant has counted what arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedItem {
    pub name: String,
    pub expected_quantity: f64,
    pub received_quantity: f64,
    pub unit_price: f64,
    pub unit: String,
}

/// A line that came up short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyItem {
    pub item_name: String,
    pub expected_quantity: f64,
    pub received_quantity: f64,
    pub missing_quantity: f64,
    pub unit_price: f64,
    pub missing_value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyReport {
    pub items: Vec<DiscrepancyItem>,
    pub total_missing_value: f64,
    pub items_count: usize,
    pub status: ReportStatus,
}

impl DiscrepancyReport {
    pub fn has_discrepancies(&self) -> bool {
        self.items_count > 0
    }
}

/// Compare expected and received quantities. Fully received lines are left
/// out of the report; a negative (or NaN) reading counts as nothing
/// received.
pub fn compute_discrepancy(items: &[VerifiedItem]) -> DiscrepancyReport {
    let items: Vec<DiscrepancyItem> = items
        .iter()
        .filter_map(|item| {
            let received = if item.received_quantity > 0.0 {
                item.received_quantity
            } else {
                0.0
            };
            let missing = (item.expected_quantity - received).max(0.0);
            (missing > 0.0).then(|| DiscrepancyItem {
                item_name: item.name.clone(),
                expected_quantity: item.expected_quantity,
                received_quantity: received,
                missing_quantity: missing,
                unit_price: item.unit_price,
                missing_value: missing * item.unit_price,
                unit: item.unit.clone(),
            })
        })
        .collect();

    DiscrepancyReport {
        total_missing_value: items.iter().map(|i| i.missing_value).sum(),
        items_count: items.len(),
        items,
        status: ReportStatus::Pending,
    }
}

/// Supplier-side lifecycle of a missing-items report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Acknowledged,
    Resolved,
    Disputed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierAction {
    Acknowledge,
    Resolve,
    Dispute,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {action:?} a report that is {from:?}")]
pub struct TransitionError {
    pub from: ReportStatus,
    pub action: SupplierAction,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Acknowledged => "acknowledged",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReportStatus::Pending),
            "acknowledged" => Some(ReportStatus::Acknowledged),
            "resolved" => Some(ReportStatus::Resolved),
            "disputed" => Some(ReportStatus::Disputed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Resolved | ReportStatus::Disputed)
    }

    /// pending → acknowledged → resolved; pending/acknowledged → disputed.
    pub fn apply(self, action: SupplierAction) -> Result<ReportStatus, TransitionError> {
        match (self, action) {
            (ReportStatus::Pending, SupplierAction::Acknowledge) => Ok(ReportStatus::Acknowledged),
            (ReportStatus::Acknowledged, SupplierAction::Resolve) => Ok(ReportStatus::Resolved),
            (ReportStatus::Pending | ReportStatus::Acknowledged, SupplierAction::Dispute) => {
                Ok(ReportStatus::Disputed)
            }
            (from, action) => Err(TransitionError { from, action }),
        }
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportStatus::parse(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown report status: {s}"))
    }
}

/// Status of the delivery record that owns a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Extracted, not yet verified.
    Draft,
    /// Verified with nothing missing.
    Complete,
    /// Discrepancy reported, waiting on the supplier.
    PendingRedelivery,
    Resolved,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Draft => "draft",
            DeliveryStatus::Complete => "complete",
            DeliveryStatus::PendingRedelivery => "pending_redelivery",
            DeliveryStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DeliveryStatus::Draft),
            "complete" => Some(DeliveryStatus::Complete),
            "pending_redelivery" => Some(DeliveryStatus::PendingRedelivery),
            "resolved" => Some(DeliveryStatus::Resolved),
            _ => None,
        }
    }

    pub fn from_report(report: &DiscrepancyReport) -> Self {
        if report.has_discrepancies() {
            DeliveryStatus::PendingRedelivery
        } else {
            DeliveryStatus::Complete
        }
    }

    /// Only a resolved report moves the delivery on.
    pub fn after_report_status(self, status: ReportStatus) -> Self {
        match status {
            ReportStatus::Resolved => DeliveryStatus::Resolved,
            _ => self,
        }
    }
}
