// src/workflow.rs

use crate::delivery_db::DeliveryStore;
use crate::discrepancy::{
    DeliveryStatus, DiscrepancyReport, ReportStatus, SupplierAction, TransitionError,
    compute_discrepancy,
};
use crate::notify::{NotificationEvent, NotificationSink, ReportEvent};
use crate::receipt::{ExtractedLineItem, VerificationError, verified_items};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, info_span, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("delivery {id} was already verified ({status})")]
    AlreadyVerified { id: String, status: &'static str },
    #[error("delivery {0} has no supplier to report to")]
    NoSupplier(String),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("notification failed: {0}")]
    Notification(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub report: DiscrepancyReport,
    /// Only set when something was missing.
    pub report_id: Option<String>,
    pub delivery_status: DeliveryStatus,
}

fn notify<S: NotificationSink>(sink: &S, event: &NotificationEvent) -> Result<(), WorkflowError> {
    sink.emit(event)
        .map_err(|e| WorkflowError::Notification(Box::new(e)))
}

/// Close the verification step of a draft delivery.
///
/// `items` overrides the stored lines by id; every line must end up
/// verified. A report is only written (and the supplier told) when
/// something is missing.
pub fn submit_verification<S: NotificationSink>(
    store: &DeliveryStore,
    sink: &S,
    delivery_id: &str,
    items: &[ExtractedLineItem],
) -> Result<VerificationOutcome, WorkflowError> {
    let _span = info_span!("submit_verification", delivery_id = %delivery_id).entered();

    let delivery = store
        .get_delivery(delivery_id)?
        .ok_or_else(|| WorkflowError::NotFound {
            kind: "delivery",
            id: delivery_id.to_string(),
        })?;
    if delivery.status != DeliveryStatus::Draft {
        return Err(WorkflowError::AlreadyVerified {
            id: delivery.id,
            status: delivery.status.as_str(),
        });
    }

    let mut merged = store.get_delivery_items(delivery_id)?;
    for item in items {
        let slot = merged
            .iter_mut()
            .find(|stored| stored.id == item.id)
            .ok_or_else(|| VerificationError::UnknownItem(item.id.clone()))?;
        slot.received_quantity = item.received_quantity;
        slot.status = item.status;
    }

    let report = compute_discrepancy(&verified_items(&merged)?);
    let supplier_id = match (&delivery.supplier_id, report.has_discrepancies()) {
        (Some(supplier), _) => Some(supplier.as_str()),
        (None, false) => None,
        (None, true) => return Err(WorkflowError::NoSupplier(delivery.id)),
    };

    let delivery_status = DeliveryStatus::from_report(&report);

    // One savepoint: a failed emit leaves the delivery in draft with no
    // report, so the same submission can be retried.
    let report_id = store.atomically(|store| -> Result<_, WorkflowError> {
        store.record_verification(delivery_id, &merged)?;
        store.set_delivery_status(delivery_id, delivery_status, Some(report.total_missing_value))?;

        match supplier_id {
            Some(supplier) if report.has_discrepancies() => {
                let report_id = store.create_report(&delivery, supplier, &report)?;
                notify(
                    sink,
                    &NotificationEvent::report_created(supplier, &report_id, &delivery.id, &report),
                )?;
                Ok(Some(report_id))
            }
            _ => Ok(None),
        }
    })?;

    info!(
        items_count = report.items_count,
        total_missing_value = report.total_missing_value,
        status = delivery_status.as_str(),
        "Verification submitted"
    );

    Ok(VerificationOutcome {
        report,
        report_id,
        delivery_status,
    })
}

/// Apply a supplier's response to a report and tell the restaurant. The
/// status change only sticks once the notification is accepted.
pub fn apply_supplier_action<S: NotificationSink>(
    store: &DeliveryStore,
    sink: &S,
    report_id: &str,
    action: SupplierAction,
    notes: Option<&str>,
    at: OffsetDateTime,
) -> Result<ReportStatus, WorkflowError> {
    let _span = info_span!("supplier_action", report_id = %report_id, ?action).entered();

    let report = store
        .get_report(report_id)?
        .ok_or_else(|| WorkflowError::NotFound {
            kind: "report",
            id: report_id.to_string(),
        })?;

    let next = report.status.apply(action).inspect_err(|e| {
        warn!(error = %e, "Rejected report transition");
    })?;
    store.atomically(|store| -> Result<(), WorkflowError> {
        store.update_report_status(report_id, next, notes, &report.supplier_id, at)?;

        if let Some(delivery_id) = report.delivery_id.as_deref() {
            match store.get_delivery(delivery_id)? {
                Some(delivery) => {
                    let status = delivery.status.after_report_status(next);
                    if status != delivery.status {
                        store.set_delivery_status(delivery_id, status, None)?;
                    }
                }
                None => warn!(delivery_id = %delivery_id, "Report points at a missing delivery"),
            }
        }

        match ReportEvent::for_status(next) {
            Some(event) => notify(
                sink,
                &NotificationEvent::report_status_changed(
                    &report.restaurant_id,
                    report_id,
                    report.delivery_id.as_deref(),
                    event,
                    notes,
                ),
            ),
            None => Ok(()),
        }
    })?;

    info!(from = report.status.as_str(), to = next.as_str(), "Report status changed");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_db::NewDelivery;
    use crate::receipt::{ExtractedReceipt, ItemStatus};
    use std::cell::{Cell, RefCell};
    use std::convert::Infallible;
    use time::macros::{date, datetime};

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<NotificationEvent>>,
    }

    impl NotificationSink for RecordingSink {
        type Error = Infallible;

        fn emit(&self, event: &NotificationEvent) -> Result<(), Self::Error> {
            self.events.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    #[derive(Debug, Error)]
    #[error("dispatcher offline")]
    struct Offline;

    /// Refuses the first `failures` events, then records like `RecordingSink`.
    struct FlakySink {
        failures: Cell<usize>,
        events: RefCell<Vec<NotificationEvent>>,
    }

    impl FlakySink {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Cell::new(failures),
                events: RefCell::default(),
            }
        }
    }

    impl NotificationSink for FlakySink {
        type Error = Offline;

        fn emit(&self, event: &NotificationEvent) -> Result<(), Self::Error> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(Offline);
            }
            self.events.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    const AT: OffsetDateTime = datetime!(2025-03-15 09:30 UTC);

    fn line(id: &str, name: &str, quantity: f64, price: f64) -> ExtractedLineItem {
        ExtractedLineItem {
            id: id.to_string(),
            name: name.to_string(),
            quantity,
            unit: "kpl".to_string(),
            price_per_unit: price,
            total_price: quantity * price,
            received_quantity: None,
            status: ItemStatus::Pending,
        }
    }

    fn seeded(supplier_id: Option<&str>) -> (DeliveryStore, String) {
        let store = DeliveryStore::new(":memory:").unwrap();
        let receipt = ExtractedReceipt {
            supplier_name: "Metrotukku".to_string(),
            date: date!(2025 - 03 - 14),
            order_number: None,
            items: vec![
                line("item-1", "Voi", 8.0, 12.0),
                line("item-2", "Siivousliina 10kpl", 3.0, 4.5),
            ],
            total_value: 109.5,
        };
        let id = store
            .insert_delivery(
                &NewDelivery {
                    restaurant_id: "rest-1",
                    supplier_id,
                },
                &receipt,
            )
            .unwrap();
        (store, id)
    }

    fn counted(store: &DeliveryStore, id: &str, missing_butter: f64) -> Vec<ExtractedLineItem> {
        let mut items = store.get_delivery_items(id).unwrap();
        items[0].mark_missing(missing_butter);
        items[1].mark_received();
        items
    }

    #[test]
    fn test_short_delivery_creates_report_and_notifies_supplier() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();

        let outcome = submit_verification(&store, &sink, &id, &counted(&store, &id, 3.0)).unwrap();
        assert_eq!(outcome.delivery_status, DeliveryStatus::PendingRedelivery);
        assert_eq!(outcome.report.items_count, 1);
        assert_eq!(outcome.report.total_missing_value, 36.0);

        let report_id = outcome.report_id.unwrap();
        let stored = store.get_report(&report_id).unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert_eq!(stored.supplier_id, "sup-1");

        let delivery = store.get_delivery(&id).unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::PendingRedelivery);
        assert_eq!(delivery.missing_value, 36.0);

        let events = sink.events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ReportEvent::Created);
        assert_eq!(events[0].user_id, "sup-1");
        assert_eq!(events[0].link_id, report_id);
    }

    #[test]
    fn test_complete_delivery_writes_no_report() {
        let (store, id) = seeded(None);
        let sink = RecordingSink::default();

        let outcome = submit_verification(&store, &sink, &id, &counted(&store, &id, 0.0)).unwrap();
        assert_eq!(outcome.delivery_status, DeliveryStatus::Complete);
        assert_eq!(outcome.report_id, None);
        assert!(store.reports_for_delivery(&id).unwrap().is_empty());
        assert!(sink.events.borrow().is_empty());
    }

    #[test]
    fn test_pending_items_are_refused() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();

        let mut items = store.get_delivery_items(&id).unwrap();
        items[0].mark_received();
        let err = submit_verification(&store, &sink, &id, &items[..1]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Verification(VerificationError::Unverified { pending: 1 })
        ));
        let delivery = store.get_delivery(&id).unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Draft);
    }

    #[test]
    fn test_unknown_delivery_and_item() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();

        assert!(matches!(
            submit_verification(&store, &sink, "nope", &[]),
            Err(WorkflowError::NotFound { kind: "delivery", .. })
        ));

        let mut stray = line("item-9", "Kerma", 1.0, 2.0);
        stray.mark_received();
        assert!(matches!(
            submit_verification(&store, &sink, &id, &[stray]),
            Err(WorkflowError::Verification(VerificationError::UnknownItem(_)))
        ));
    }

    #[test]
    fn test_short_delivery_without_supplier_is_refused() {
        let (store, id) = seeded(None);
        let sink = RecordingSink::default();
        let err = submit_verification(&store, &sink, &id, &counted(&store, &id, 3.0)).unwrap_err();
        assert!(matches!(err, WorkflowError::NoSupplier(_)));
    }

    #[test]
    fn test_second_submission_is_refused() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();
        let items = counted(&store, &id, 3.0);
        submit_verification(&store, &sink, &id, &items).unwrap();
        assert!(matches!(
            submit_verification(&store, &sink, &id, &items),
            Err(WorkflowError::AlreadyVerified { .. })
        ));
        assert_eq!(store.reports_for_delivery(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_acknowledge_then_resolve() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();
        let outcome = submit_verification(&store, &sink, &id, &counted(&store, &id, 3.0)).unwrap();
        let report_id = outcome.report_id.unwrap();

        let status =
            apply_supplier_action(&store, &sink, &report_id, SupplierAction::Acknowledge, None, AT)
                .unwrap();
        assert_eq!(status, ReportStatus::Acknowledged);
        assert_eq!(
            store.get_delivery(&id).unwrap().unwrap().status,
            DeliveryStatus::PendingRedelivery
        );

        let status = apply_supplier_action(
            &store,
            &sink,
            &report_id,
            SupplierAction::Resolve,
            Some("Redelivered"),
            AT,
        )
        .unwrap();
        assert_eq!(status, ReportStatus::Resolved);

        let delivery = store.get_delivery(&id).unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Resolved);
        assert_eq!(delivery.missing_value, 36.0);

        let events = sink.events.borrow();
        let kinds: Vec<_> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            [ReportEvent::Created, ReportEvent::Acknowledged, ReportEvent::Resolved]
        );
        assert_eq!(events[2].user_id, "rest-1");
        assert_eq!(events[2].message, "Redelivered");
    }

    #[test]
    fn test_illegal_transition_changes_nothing() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = RecordingSink::default();
        let outcome = submit_verification(&store, &sink, &id, &counted(&store, &id, 3.0)).unwrap();
        let report_id = outcome.report_id.unwrap();

        let err = apply_supplier_action(&store, &sink, &report_id, SupplierAction::Resolve, None, AT)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Transition(_)));
        assert_eq!(
            store.get_report(&report_id).unwrap().unwrap().status,
            ReportStatus::Pending
        );
        assert_eq!(sink.events.borrow().len(), 1);
    }

    #[test]
    fn test_dispute_keeps_delivery_open() {
        let (store, id) = seeded(Some("sup-1"));
        let outcome = submit_verification(&store, &store, &id, &counted(&store, &id, 8.0)).unwrap();
        let report_id = outcome.report_id.unwrap();
        assert_eq!(outcome.report.items[0].missing_quantity, 8.0);

        apply_supplier_action(
            &store,
            &store,
            &report_id,
            SupplierAction::Dispute,
            Some("All 8 were signed for"),
            AT,
        )
        .unwrap();

        assert_eq!(
            store.get_delivery(&id).unwrap().unwrap().status,
            DeliveryStatus::PendingRedelivery
        );
        assert_eq!(store.unread_notifications("sup-1").unwrap().len(), 1);
        let to_restaurant = store.unread_notifications("rest-1").unwrap();
        assert_eq!(to_restaurant.len(), 1);
        assert_eq!(to_restaurant[0].title, "Report Disputed");
    }

    #[test]
    fn test_failed_notification_leaves_verification_retryable() {
        let (store, id) = seeded(Some("sup-1"));
        let sink = FlakySink::failing(1);
        let items = counted(&store, &id, 3.0);

        let err = submit_verification(&store, &sink, &id, &items).unwrap_err();
        assert!(matches!(err, WorkflowError::Notification(_)));
        assert_eq!(err.to_string(), "notification failed: dispatcher offline");

        let delivery = store.get_delivery(&id).unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Draft);
        assert_eq!(delivery.missing_value, 0.0);
        assert!(store.reports_for_delivery(&id).unwrap().is_empty());
        assert!(
            store
                .get_delivery_items(&id)
                .unwrap()
                .iter()
                .all(|item| item.status == ItemStatus::Pending)
        );

        let outcome = submit_verification(&store, &sink, &id, &items).unwrap();
        assert_eq!(outcome.delivery_status, DeliveryStatus::PendingRedelivery);
        assert_eq!(store.reports_for_delivery(&id).unwrap().len(), 1);
        let events = sink.events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(Some(&events[0].link_id), outcome.report_id.as_ref());
    }

    #[test]
    fn test_failed_notification_keeps_report_status() {
        let (store, id) = seeded(Some("sup-1"));
        let outcome = submit_verification(
            &store,
            &RecordingSink::default(),
            &id,
            &counted(&store, &id, 3.0),
        )
        .unwrap();
        let report_id = outcome.report_id.unwrap();
        let sink = FlakySink::failing(1);

        let err = apply_supplier_action(&store, &sink, &report_id, SupplierAction::Acknowledge, None, AT)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Notification(_)));
        let stored = store.get_report(&report_id).unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert_eq!(stored.acknowledged_at, None);
        assert_eq!(stored.last_action_by.as_deref(), Some("rest-1"));

        let status =
            apply_supplier_action(&store, &sink, &report_id, SupplierAction::Acknowledge, None, AT)
                .unwrap();
        assert_eq!(status, ReportStatus::Acknowledged);
        let stored = store.get_report(&report_id).unwrap().unwrap();
        assert_eq!(stored.last_action_by.as_deref(), Some("sup-1"));
        assert!(stored.acknowledged_at.is_some());

        let events = sink.events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ReportEvent::Acknowledged);
        assert_eq!(events[0].user_id, "rest-1");
    }

    #[test]
    fn test_failed_resolution_keeps_delivery_open() {
        let (store, id) = seeded(Some("sup-1"));
        let recorder = RecordingSink::default();
        let outcome = submit_verification(&store, &recorder, &id, &counted(&store, &id, 3.0)).unwrap();
        let report_id = outcome.report_id.unwrap();
        apply_supplier_action(&store, &recorder, &report_id, SupplierAction::Acknowledge, None, AT)
            .unwrap();

        let sink = FlakySink::failing(1);
        assert!(
            apply_supplier_action(&store, &sink, &report_id, SupplierAction::Resolve, None, AT)
                .is_err()
        );
        assert_eq!(
            store.get_delivery(&id).unwrap().unwrap().status,
            DeliveryStatus::PendingRedelivery
        );
        assert_eq!(
            store.get_report(&report_id).unwrap().unwrap().status,
            ReportStatus::Acknowledged
        );
    }
}
