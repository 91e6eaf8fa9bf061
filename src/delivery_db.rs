use crate::discrepancy::{DeliveryStatus, DiscrepancyItem, DiscrepancyReport, ReportStatus};
use crate::notify::{NotificationEvent, NotificationSink};
use crate::receipt::{ExtractedLineItem, ExtractedReceipt, ItemStatus};
use rusqlite::types::Type;
use rusqlite::{Connection, Result as SqliteResult, Row, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

pub struct DeliveryStore {
    conn: Connection,
}

/// Who a freshly extracted delivery belongs to.
#[derive(Debug, Clone, Copy)]
pub struct NewDelivery<'a> {
    pub restaurant_id: &'a str,
    pub supplier_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDelivery {
    pub id: String,
    pub restaurant_id: String,
    pub supplier_id: Option<String>,
    pub supplier_name: String,
    pub delivery_date: String,
    pub order_number: Option<String>,
    pub total_value: f64,
    pub missing_value: f64,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredReport {
    pub id: String,
    pub delivery_id: Option<String>,
    pub restaurant_id: String,
    pub supplier_id: String,
    pub status: ReportStatus,
    pub total_missing_value: f64,
    pub items_count: usize,
    pub notes: Option<String>,
    pub created_at: String,
    pub acknowledged_at: Option<String>,
    pub resolved_at: Option<String>,
    /// Who last changed the report: the restaurant on creation, the
    /// supplier afterwards.
    pub last_action_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNotification {
    pub id: i64,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: Option<String>,
    pub link_type: Option<String>,
    pub link_id: Option<String>,
    /// JSON text
    pub metadata: Option<String>,
    pub read: bool,
}

const DELIVERY_COLUMNS: &str = "id, restaurant_id, supplier_id, supplier_name, delivery_date, order_number, total_value, missing_value, status";

const REPORT_COLUMNS: &str = "id, delivery_id, restaurant_id, supplier_id, status, total_missing_value, items_count, notes, created_at, acknowledged_at, resolved_at, last_action_by";

impl DeliveryStore {
    /// Open (or create) the store with SQLite backend
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                restaurant_id TEXT NOT NULL,
                supplier_id TEXT,
                supplier_name TEXT NOT NULL,
                delivery_date TEXT NOT NULL,
                order_number TEXT,
                total_value REAL NOT NULL DEFAULT 0,
                missing_value REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'draft',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS delivery_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                delivery_id TEXT NOT NULL,
                item_key TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                quantity REAL NOT NULL,
                unit TEXT NOT NULL,
                price_per_unit REAL NOT NULL,
                total_price REAL NOT NULL,
                received_quantity REAL,
                missing_quantity REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                FOREIGN KEY (delivery_id) REFERENCES deliveries(id) ON DELETE CASCADE,
                UNIQUE (delivery_id, item_key)
            );

            CREATE TABLE IF NOT EXISTS missing_items_reports (
                id TEXT PRIMARY KEY,
                delivery_id TEXT,
                restaurant_id TEXT NOT NULL,
                supplier_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                total_missing_value REAL NOT NULL,
                items_count INTEGER NOT NULL,
                notes TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                acknowledged_at TEXT,
                resolved_at TEXT,
                last_action_by TEXT,
                FOREIGN KEY (delivery_id) REFERENCES deliveries(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS missing_items_report_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id TEXT NOT NULL,
                item_name TEXT NOT NULL,
                expected_quantity REAL NOT NULL,
                received_quantity REAL NOT NULL,
                missing_quantity REAL NOT NULL,
                unit TEXT,
                price_per_unit REAL NOT NULL,
                total_missing_value REAL NOT NULL,
                FOREIGN KEY (report_id) REFERENCES missing_items_reports(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT,
                link_type TEXT,
                link_id TEXT,
                metadata TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                read_at TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_deliveries_restaurant ON deliveries(restaurant_id);
            CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status);
            CREATE INDEX IF NOT EXISTS idx_delivery_items_delivery ON delivery_items(delivery_id);
            CREATE INDEX IF NOT EXISTS idx_reports_delivery ON missing_items_reports(delivery_id);
            CREATE INDEX IF NOT EXISTS idx_reports_supplier ON missing_items_reports(supplier_id, status);
            CREATE INDEX IF NOT EXISTS idx_reports_restaurant ON missing_items_reports(restaurant_id, status);
            CREATE INDEX IF NOT EXISTS idx_report_items_report ON missing_items_report_items(report_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, read);",
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Hex SHA-256 over the given parts; used for record ids.
    pub fn generate_uid(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    fn nonce() -> String {
        OffsetDateTime::now_utc().unix_timestamp_nanos().to_string()
    }

    /// Run `f` inside a savepoint: everything it writes is kept when it
    /// returns `Ok` and rolled back when it returns `Err`. Savepoints nest,
    /// so store methods that use this can be called from within `f`.
    pub fn atomically<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        self.conn.execute_batch("SAVEPOINT atomic")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE atomic")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK TO atomic; RELEASE atomic") {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Store an extracted receipt as a draft delivery. Returns the new id.
    pub fn insert_delivery(
        &self,
        owner: &NewDelivery<'_>,
        receipt: &ExtractedReceipt,
    ) -> SqliteResult<String> {
        let date = receipt.date.to_string();
        let id = Self::generate_uid(&[
            owner.restaurant_id,
            &receipt.supplier_name,
            &date,
            receipt.order_number.as_deref().unwrap_or(""),
            &Self::nonce(),
        ]);

        self.atomically(|store| -> SqliteResult<()> {
            store.conn.execute(
                "INSERT INTO deliveries
                    (id, restaurant_id, supplier_id, supplier_name, delivery_date, order_number, total_value, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    owner.restaurant_id,
                    owner.supplier_id,
                    receipt.supplier_name,
                    date,
                    receipt.order_number,
                    receipt.total_value,
                    DeliveryStatus::Draft.as_str(),
                ],
            )?;
            for (position, item) in receipt.items.iter().enumerate() {
                store.conn.execute(
                    "INSERT INTO delivery_items
                        (delivery_id, item_key, position, name, quantity, unit, price_per_unit, total_price, received_quantity, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id,
                        item.id,
                        position,
                        item.name,
                        item.quantity,
                        item.unit,
                        item.price_per_unit,
                        item.total_price,
                        item.received_quantity,
                        item.status.as_str(),
                    ],
                )?;
            }
            Ok(())
        })?;

        info!(delivery_id = %id, items = receipt.items.len(), "Delivery stored");
        Ok(id)
    }

    /// Get delivery by id
    pub fn get_delivery(&self, id: &str) -> SqliteResult<Option<StoredDelivery>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_delivery(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_delivery_items(&self, delivery_id: &str) -> SqliteResult<Vec<ExtractedLineItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_key, name, quantity, unit, price_per_unit, total_price, received_quantity, status
             FROM delivery_items
             WHERE delivery_id = ?1
             ORDER BY position",
        )?;
        let rows = stmt.query_map(params![delivery_id], |row| {
            Ok(ExtractedLineItem {
                id: row.get(0)?,
                name: row.get(1)?,
                quantity: row.get(2)?,
                unit: row.get(3)?,
                price_per_unit: row.get(4)?,
                total_price: row.get(5)?,
                received_quantity: row.get(6)?,
                status: status_column(row, 7, ItemStatus::parse)?,
            })
        })?;
        rows.collect()
    }

    /// Persist the outcome of the verification step. Returns the number of
    /// item rows updated.
    pub fn record_verification(
        &self,
        delivery_id: &str,
        items: &[ExtractedLineItem],
    ) -> SqliteResult<usize> {
        let updated = self.atomically(|store| -> SqliteResult<usize> {
            let mut updated = 0;
            for item in items {
                updated += store.conn.execute(
                    "UPDATE delivery_items
                     SET received_quantity = ?1, missing_quantity = ?2, status = ?3
                     WHERE delivery_id = ?4 AND item_key = ?5",
                    params![
                        item.received_quantity,
                        item.missing_quantity(),
                        item.status.as_str(),
                        delivery_id,
                        item.id,
                    ],
                )?;
            }
            Ok(updated)
        })?;
        info!(delivery_id = %delivery_id, updated, "Verification recorded");
        Ok(updated)
    }

    /// Move a delivery to `status`; `missing_value` is only overwritten when
    /// given.
    pub fn set_delivery_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        missing_value: Option<f64>,
    ) -> SqliteResult<usize> {
        let changed = self.conn.execute(
            "UPDATE deliveries
             SET status = ?1, missing_value = COALESCE(?2, missing_value), updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![status.as_str(), missing_value, id],
        )?;
        info!(delivery_id = %id, status = status.as_str(), "Delivery status updated");
        Ok(changed)
    }

    /// Write a report and its lines in one transaction. Returns the report id.
    pub fn create_report(
        &self,
        delivery: &StoredDelivery,
        supplier_id: &str,
        report: &DiscrepancyReport,
    ) -> SqliteResult<String> {
        let id = Self::generate_uid(&[&delivery.id, supplier_id, &Self::nonce()]);

        self.atomically(|store| -> SqliteResult<()> {
            store.conn.execute(
                "INSERT INTO missing_items_reports
                    (id, delivery_id, restaurant_id, supplier_id, status, total_missing_value, items_count, last_action_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?3)",
                params![
                    id,
                    delivery.id,
                    delivery.restaurant_id,
                    supplier_id,
                    report.status.as_str(),
                    report.total_missing_value,
                    report.items_count,
                ],
            )?;
            for item in &report.items {
                store.conn.execute(
                    "INSERT INTO missing_items_report_items
                        (report_id, item_name, expected_quantity, received_quantity, missing_quantity, unit, price_per_unit, total_missing_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        item.item_name,
                        item.expected_quantity,
                        item.received_quantity,
                        item.missing_quantity,
                        item.unit,
                        item.unit_price,
                        item.missing_value,
                    ],
                )?;
            }
            Ok(())
        })?;

        info!(
            report_id = %id,
            delivery_id = %delivery.id,
            items = report.items_count,
            total_missing_value = report.total_missing_value,
            "Missing items report stored"
        );
        Ok(id)
    }

    pub fn get_report(&self, id: &str) -> SqliteResult<Option<StoredReport>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM missing_items_reports WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_report(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_report_items(&self, report_id: &str) -> SqliteResult<Vec<DiscrepancyItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_name, expected_quantity, received_quantity, missing_quantity, unit, price_per_unit, total_missing_value
             FROM missing_items_report_items
             WHERE report_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![report_id], |row| {
            Ok(DiscrepancyItem {
                item_name: row.get(0)?,
                expected_quantity: row.get(1)?,
                received_quantity: row.get(2)?,
                missing_quantity: row.get(3)?,
                unit: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                unit_price: row.get(5)?,
                missing_value: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    /// Reports for a delivery, newest first
    pub fn reports_for_delivery(&self, delivery_id: &str) -> SqliteResult<Vec<StoredReport>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS}
             FROM missing_items_reports
             WHERE delivery_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![delivery_id], |row| Self::row_to_report(row))?;
        rows.collect()
    }

    /// A supplier's inbox, newest first, optionally narrowed to one status.
    pub fn reports_for_supplier(
        &self,
        supplier_id: &str,
        status: Option<ReportStatus>,
    ) -> SqliteResult<Vec<StoredReport>> {
        self.reports_where("supplier_id", supplier_id, status)
    }

    pub fn reports_for_restaurant(
        &self,
        restaurant_id: &str,
        status: Option<ReportStatus>,
    ) -> SqliteResult<Vec<StoredReport>> {
        self.reports_where("restaurant_id", restaurant_id, status)
    }

    /// `column` is one of our own column names, never user input.
    fn reports_where(
        &self,
        column: &str,
        owner: &str,
        status: Option<ReportStatus>,
    ) -> SqliteResult<Vec<StoredReport>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS}
             FROM missing_items_reports
             WHERE {column} = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![owner, status.map(|s| s.as_str())], |row| {
            Self::row_to_report(row)
        })?;
        rows.collect()
    }

    /// Persist a supplier-side status change, stamping `acknowledged_at` or
    /// `resolved_at` as appropriate. Notes are kept unless replaced.
    pub fn update_report_status(
        &self,
        id: &str,
        status: ReportStatus,
        notes: Option<&str>,
        actor: &str,
        at: OffsetDateTime,
    ) -> SqliteResult<usize> {
        let stamp = format_timestamp(at);
        let changed = self.conn.execute(
            "UPDATE missing_items_reports
             SET status = ?1,
                 notes = COALESCE(?2, notes),
                 acknowledged_at = CASE WHEN ?1 = 'acknowledged' THEN ?3 ELSE acknowledged_at END,
                 resolved_at = CASE WHEN ?1 = 'resolved' THEN ?3 ELSE resolved_at END,
                 last_action_by = ?4
             WHERE id = ?5",
            params![status.as_str(), notes, stamp, actor, id],
        )?;
        info!(report_id = %id, status = status.as_str(), "Report status updated");
        Ok(changed)
    }

    pub fn insert_notification(&self, event: &NotificationEvent) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO notifications
                (user_id, type, title, message, link_type, link_id, metadata, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                event.user_id,
                event.kind,
                event.title,
                event.message,
                event.link_type,
                event.link_id,
                event.metadata.to_string(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(notification_id = id, user_id = %event.user_id, event = event.event.as_str(), "Notification queued");
        Ok(id)
    }

    pub fn unread_notifications(&self, user_id: &str) -> SqliteResult<Vec<StoredNotification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, type, title, message, link_type, link_id, metadata, read
             FROM notifications
             WHERE user_id = ?1 AND read = 0
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(StoredNotification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                title: row.get(3)?,
                message: row.get(4)?,
                link_type: row.get(5)?,
                link_id: row.get(6)?,
                metadata: row.get(7)?,
                read: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn mark_notification_read(&self, id: i64) -> SqliteResult<usize> {
        self.conn.execute(
            "UPDATE notifications SET read = 1, read_at = ?1 WHERE id = ?2",
            params![format_timestamp(OffsetDateTime::now_utc()), id],
        )
    }

    /// (deliveries, awaiting redelivery, reports, open reports)
    pub fn get_counts(&self) -> SqliteResult<(usize, usize, usize, usize)> {
        let total_deliveries: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM deliveries", [], |row| row.get(0))?;

        let awaiting_redelivery: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM deliveries WHERE status = 'pending_redelivery'",
            [],
            |row| row.get(0),
        )?;

        let total_reports: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM missing_items_reports",
            [],
            |row| row.get(0),
        )?;

        let open_reports: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM missing_items_reports WHERE status IN ('pending', 'acknowledged')",
            [],
            |row| row.get(0),
        )?;

        Ok((total_deliveries, awaiting_redelivery, total_reports, open_reports))
    }

    /// Helper: map a row with the `DELIVERY_COLUMNS` projection.
    fn row_to_delivery(row: &Row<'_>) -> SqliteResult<StoredDelivery> {
        Ok(StoredDelivery {
            id: row.get(0)?,
            restaurant_id: row.get(1)?,
            supplier_id: row.get(2)?,
            supplier_name: row.get(3)?,
            delivery_date: row.get(4)?,
            order_number: row.get(5)?,
            total_value: row.get(6)?,
            missing_value: row.get(7)?,
            status: status_column(row, 8, DeliveryStatus::parse)?,
        })
    }

    /// Helper: map a row with the `REPORT_COLUMNS` projection.
    fn row_to_report(row: &Row<'_>) -> SqliteResult<StoredReport> {
        Ok(StoredReport {
            id: row.get(0)?,
            delivery_id: row.get(1)?,
            restaurant_id: row.get(2)?,
            supplier_id: row.get(3)?,
            status: status_column(row, 4, ReportStatus::parse)?,
            total_missing_value: row.get(5)?,
            items_count: row.get(6)?,
            notes: row.get(7)?,
            created_at: row.get(8)?,
            acknowledged_at: row.get(9)?,
            resolved_at: row.get(10)?,
            last_action_by: row.get(11)?,
        })
    }
}

impl NotificationSink for DeliveryStore {
    type Error = rusqlite::Error;

    fn emit(&self, event: &NotificationEvent) -> Result<(), Self::Error> {
        self.insert_notification(event).map(|_| ())
    }
}

fn status_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> SqliteResult<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown status {raw:?}").into(),
        )
    })
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
