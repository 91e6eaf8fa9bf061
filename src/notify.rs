// src/notify.rs

use crate::discrepancy::{DiscrepancyReport, ReportStatus};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

pub const REPORT_NOTIFICATION: &str = "missing_items_report";

/// What happened to a missing-items report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEvent {
    Created,
    Acknowledged,
    Resolved,
    Disputed,
}

impl ReportEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportEvent::Created => "created",
            ReportEvent::Acknowledged => "acknowledged",
            ReportEvent::Resolved => "resolved",
            ReportEvent::Disputed => "disputed",
        }
    }

    /// The event announcing a move into `status`; `None` for `Pending`,
    /// which is only ever the initial state.
    pub fn for_status(status: ReportStatus) -> Option<Self> {
        match status {
            ReportStatus::Pending => None,
            ReportStatus::Acknowledged => Some(ReportEvent::Acknowledged),
            ReportStatus::Resolved => Some(ReportEvent::Resolved),
            ReportStatus::Disputed => Some(ReportEvent::Disputed),
        }
    }
}

/// A logical notification for the counterparty. Delivery is someone
/// else's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub user_id: String,
    pub kind: &'static str,
    pub event: ReportEvent,
    pub title: String,
    pub message: String,
    pub link_type: &'static str,
    pub link_id: String,
    pub metadata: Value,
}

impl NotificationEvent {
    /// Tell the supplier a restaurant reported missing items.
    pub fn report_created(
        supplier_id: &str,
        report_id: &str,
        delivery_id: &str,
        report: &DiscrepancyReport,
    ) -> Self {
        Self {
            user_id: supplier_id.to_string(),
            kind: REPORT_NOTIFICATION,
            event: ReportEvent::Created,
            title: "Missing Items Reported".to_string(),
            message: format!(
                "{} item(s) missing, value €{:.2}",
                report.items_count, report.total_missing_value
            ),
            link_type: REPORT_NOTIFICATION,
            link_id: report_id.to_string(),
            metadata: json!({
                "event": ReportEvent::Created,
                "delivery_id": delivery_id,
                "items_count": report.items_count,
                "total_missing_value": report.total_missing_value,
            }),
        }
    }

    /// Tell the restaurant the supplier acted on its report.
    pub fn report_status_changed(
        restaurant_id: &str,
        report_id: &str,
        delivery_id: Option<&str>,
        event: ReportEvent,
        notes: Option<&str>,
    ) -> Self {
        let title = match event {
            ReportEvent::Created => "Missing Items Reported",
            ReportEvent::Acknowledged => "Report Acknowledged",
            ReportEvent::Resolved => "Report Resolved",
            ReportEvent::Disputed => "Report Disputed",
        };
        Self {
            user_id: restaurant_id.to_string(),
            kind: REPORT_NOTIFICATION,
            event,
            title: title.to_string(),
            message: notes
                .map(str::to_string)
                .unwrap_or_else(|| format!("Supplier {} your missing items report", event.as_str())),
            link_type: REPORT_NOTIFICATION,
            link_id: report_id.to_string(),
            metadata: json!({
                "event": event,
                "delivery_id": delivery_id,
            }),
        }
    }
}

/// Anything that can take notification events off our hands.
pub trait NotificationSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn emit(&self, event: &NotificationEvent) -> Result<(), Self::Error>;
}

/// Only logs. Useful when no dispatcher is wired up.
pub struct LogSink;

impl NotificationSink for LogSink {
    type Error = std::convert::Infallible;

    fn emit(&self, event: &NotificationEvent) -> Result<(), Self::Error> {
        info!(
            user_id = %event.user_id,
            kind = event.kind,
            event = event.event.as_str(),
            link_id = %event.link_id,
            "Notification"
        );
        Ok(())
    }
}
