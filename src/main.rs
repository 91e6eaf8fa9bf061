mod config;
mod delivery_db;
mod discrepancy;
mod llm_extract;
mod notify;
mod receipt;
mod workflow;

use clap::{Parser, Subcommand, ValueEnum};
use delivery_db::{DeliveryStore, NewDelivery};
use discrepancy::{ReportStatus, SupplierAction};
use llm_extract::ReceiptExtractor;
use notify::LogSink;
use receipt::{MimeType, RawReceiptInput, VerificationError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "receipt_reconcile", about = "Delivery receipt extraction and missing-item reports")]
struct Cli {
    /// Config file (defaults are used when it does not exist).
    #[arg(long, default_value = ".config/receipt_reconcile.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a receipt image or PDF and print the extracted lines as JSON.
    Extract {
        file: PathBuf,
        /// Declared type of a raw file; sniffed from the content otherwise.
        #[arg(long)]
        mime: Option<MimeType>,
        /// The file holds base64 text (optionally a data URI), not raw bytes.
        #[arg(long)]
        encoded: bool,
        /// Store the result as a draft delivery.
        #[arg(long, requires = "restaurant")]
        save: bool,
        #[arg(long)]
        restaurant: Option<String>,
        #[arg(long)]
        supplier: Option<String>,
    },
    /// Submit counted quantities (`{"item-1": 5, ...}`) for a draft delivery.
    Verify {
        delivery_id: String,
        received: PathBuf,
        /// Log notifications instead of queueing them.
        #[arg(long)]
        log_only: bool,
    },
    /// Apply a supplier response to a missing-items report.
    Report {
        report_id: String,
        action: Action,
        #[arg(long)]
        notes: Option<String>,
        /// Log notifications instead of queueing them.
        #[arg(long)]
        log_only: bool,
    },
    ShowReport {
        report_id: String,
    },
    ShowDelivery {
        delivery_id: String,
    },
    /// List reports for a supplier or a restaurant, newest first.
    Reports {
        #[arg(long, conflicts_with = "restaurant", required_unless_present = "restaurant")]
        supplier: Option<String>,
        #[arg(long)]
        restaurant: Option<String>,
        /// pending, acknowledged, resolved or disputed
        #[arg(long)]
        status: Option<ReportStatus>,
    },
    /// List unread notifications for a user.
    Notifications {
        user_id: String,
        #[arg(long)]
        mark_read: bool,
    },
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Acknowledge,
    Resolve,
    Dispute,
}

impl From<Action> for SupplierAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Acknowledge => SupplierAction::Acknowledge,
            Action::Resolve => SupplierAction::Resolve,
            Action::Dispute => SupplierAction::Dispute,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cfg = config::Config::load_or_default(&cli.config)?;

    // init tracing; RUST_LOG wins over the config
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter)),
        )
        .init();

    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        fs::create_dir_all(parent)?;
    }
    let db = DeliveryStore::new(&cfg.db_path)?;

    match cli.command {
        Command::Extract {
            file,
            mime,
            encoded,
            save,
            restaurant,
            supplier,
        } => {
            let input = if encoded {
                let text = fs::read_to_string(&file)?;
                let text = text.trim();
                match mime {
                    Some(mime) if !text.starts_with("data:") => {
                        RawReceiptInput::from_encoded(&format!("data:{mime};base64,{text}"))
                    }
                    _ => RawReceiptInput::from_encoded(text),
                }
            } else {
                RawReceiptInput::from_bytes(&fs::read(&file)?, mime)
            };

            let service = llm_extract::connect(&cfg).await?;
            let extractor = ReceiptExtractor::new(service)
                .with_filter(cfg.summary_filter())
                .with_max_output_tokens(cfg.extraction.max_output_tokens);
            let receipt = extractor.extract(&input).await.inspect_err(|e| {
                if e.is_transient() {
                    warn!(error = %e, "Extraction service problem, the same file may work on a retry");
                }
            })?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);

            if save {
                let restaurant_id = restaurant.as_deref().unwrap_or_default();
                let id = db.insert_delivery(
                    &NewDelivery {
                        restaurant_id,
                        supplier_id: supplier.as_deref(),
                    },
                    &receipt,
                )?;
                info!(delivery_id = %id, file = %file.display(), "Draft delivery saved");
                println!("delivery: {id}");
            }
        }

        Command::Verify {
            delivery_id,
            received,
            log_only,
        } => {
            let counts: BTreeMap<String, f64> =
                serde_json::from_str(&fs::read_to_string(&received)?)?;
            let mut items = db.get_delivery_items(&delivery_id)?;
            for (key, quantity) in &counts {
                items
                    .iter_mut()
                    .find(|item| &item.id == key)
                    .ok_or_else(|| VerificationError::UnknownItem(key.clone()))?
                    .set_received(*quantity);
            }

            let outcome = if log_only {
                workflow::submit_verification(&db, &LogSink, &delivery_id, &items)?
            } else {
                workflow::submit_verification(&db, &db, &delivery_id, &items)?
            };
            println!("{}", serde_json::to_string_pretty(&outcome.report)?);
            println!("delivery status: {}", outcome.delivery_status.as_str());
            if let Some(report_id) = outcome.report_id {
                println!("report: {report_id}");
            }
        }

        Command::Report {
            report_id,
            action,
            notes,
            log_only,
        } => {
            let now = OffsetDateTime::now_utc();
            let notes = notes.as_deref();
            let status = if log_only {
                workflow::apply_supplier_action(&db, &LogSink, &report_id, action.into(), notes, now)?
            } else {
                workflow::apply_supplier_action(&db, &db, &report_id, action.into(), notes, now)?
            };
            println!("report {report_id}: {}", status.as_str());
        }

        Command::ShowReport { report_id } => {
            let Some(report) = db.get_report(&report_id)? else {
                return Err(format!("report {report_id} not found").into());
            };
            println!(
                "report {} [{}{}] supplier {} restaurant {}",
                report.id,
                report.status.as_str(),
                if report.status.is_terminal() { ", closed" } else { "" },
                report.supplier_id,
                report.restaurant_id
            );
            println!(
                "  {} item(s) missing, value €{:.2}, created {}",
                report.items_count, report.total_missing_value, report.created_at
            );
            if let Some(notes) = &report.notes {
                println!("  notes: {notes}");
            }
            if let Some(actor) = &report.last_action_by {
                println!("  last action by {actor}");
            }
            for item in db.get_report_items(&report_id)? {
                println!(
                    "  - {}: {} of {} {} missing (€{:.2})",
                    item.item_name,
                    item.missing_quantity,
                    item.expected_quantity,
                    item.unit,
                    item.missing_value
                );
            }
        }

        Command::ShowDelivery { delivery_id } => {
            let Some(delivery) = db.get_delivery(&delivery_id)? else {
                return Err(format!("delivery {delivery_id} not found").into());
            };
            println!(
                "delivery {} [{}] {} {} total €{:.2} missing €{:.2}",
                delivery.id,
                delivery.status.as_str(),
                delivery.supplier_name,
                delivery.delivery_date,
                delivery.total_value,
                delivery.missing_value
            );
            for item in db.get_delivery_items(&delivery_id)? {
                println!(
                    "  {} {} x{} {} [{}]",
                    item.id,
                    item.name,
                    item.quantity,
                    item.unit,
                    item.status.as_str()
                );
            }
            for report in db.reports_for_delivery(&delivery_id)? {
                println!("  report {} [{}]", report.id, report.status.as_str());
            }
        }

        Command::Reports {
            supplier,
            restaurant,
            status,
        } => {
            let reports = match (supplier, restaurant) {
                (Some(supplier_id), _) => db.reports_for_supplier(&supplier_id, status)?,
                (None, Some(restaurant_id)) => db.reports_for_restaurant(&restaurant_id, status)?,
                (None, None) => return Err("--supplier or --restaurant is required".into()),
            };
            for report in reports {
                println!(
                    "{} [{}] {} item(s) €{:.2} created {} last action by {}",
                    report.id,
                    report.status.as_str(),
                    report.items_count,
                    report.total_missing_value,
                    report.created_at,
                    report.last_action_by.as_deref().unwrap_or("-")
                );
            }
        }

        Command::Notifications { user_id, mark_read } => {
            for note in db.unread_notifications(&user_id)? {
                println!(
                    "#{} {}: {}",
                    note.id,
                    note.title,
                    note.message.as_deref().unwrap_or("")
                );
                if mark_read {
                    db.mark_notification_read(note.id)?;
                }
            }
        }

        Command::Stats => {
            let (deliveries, awaiting, reports, open) = db.get_counts()?;
            info!(
                deliveries_total = deliveries,
                deliveries_awaiting_redelivery = awaiting,
                reports_total = reports,
                reports_open = open,
                "Database statistics"
            );
        }
    }

    Ok(())
}
