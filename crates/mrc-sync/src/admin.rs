use chrono::NaiveDate;
use mrc_core::{CellValue, LogEntry, MasterRecord, ReasonCode, SYSTEM_USER};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityIndex;
use crate::importer::ImportRunSummary;
use crate::{Consolidator, RunOutcome};

/// Source id stamped on master rows created through manual entry.
pub const MANUAL_SOURCE_ID: &str = "manual_sidebar_entry";
pub const MANUAL_SHEET: &str = "MANUAL";

const DEFAULT_ORIGIN: &str = "Manual entry";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSummary {
    pub tables_seeded: usize,
    pub sources_failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FlagResetSummary {
    pub cleared: usize,
}

/// A single record typed in by a person rather than read from a source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManualEntry {
    pub first_name: String,
    pub last_name: String,
    /// `YYYY-MM-DD`.
    pub dob: String,
    /// Workbook the entry was made from, shown as the record's file name.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ManualEntryOutcome {
    Accepted {
        message: String,
        row: usize,
        duplicates_found: usize,
        uuid: uuid::Uuid,
    },
    Rejected {
        message: String,
    },
}

impl ManualEntry {
    fn validate(&self) -> SyncResult<NaiveDate> {
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() || self.dob.trim().is_empty() {
            return Err(SyncError::InvalidInput("Error: All fields are required.".to_string()));
        }
        NaiveDate::parse_from_str(self.dob.trim(), "%Y-%m-%d")
            .map_err(|_| SyncError::InvalidInput("Error: DOB must be a YYYY-MM-DD date.".to_string()))
    }
}

impl Consolidator {
    /// Clears master, log, cursors and flags, then imports everything again.
    pub async fn rebuild_full_reset(&self, triggered_by: &str) -> RunOutcome<ImportRunSummary> {
        let span = info_span!("rebuild_full_reset", triggered_by);
        let result = self.reset_and_import(true, triggered_by).instrument(span).await;
        self.conclude("rebuild_full_reset", triggered_by, result).await
    }

    /// Resets cursors and flags but keeps master rows. Rows already in master
    /// are recognized by their import key and skipped.
    pub async fn reimport_without_clearing(&self, triggered_by: &str) -> RunOutcome<ImportRunSummary> {
        let span = info_span!("reimport_without_clearing", triggered_by);
        let result = self.reset_and_import(false, triggered_by).instrument(span).await;
        self.conclude("reimport_without_clearing", triggered_by, result).await
    }

    /// Reset and import under one lock, so no edit lands in between.
    async fn reset_and_import(&self, clear_master: bool, triggered_by: &str) -> SyncResult<ImportRunSummary> {
        let _lock = self.lock_master(self.config.batch_lock_wait).await?;
        self.reset_state(clear_master).await?;
        self.import_locked(triggered_by).await
    }

    async fn reset_state(&self, clear_master: bool) -> SyncResult<()> {
        if clear_master {
            self.master.clear().await?;
            self.log.clear().await?;
        }
        let cursors = self.cursors.reset_all().await?;
        let flags = self.flags.reset_all().await?;
        info!(clear_master, cursors, flags, "consolidation state reset");
        Ok(())
    }

    /// Moves every cursor to its table's current last row so existing rows
    /// are never imported.
    pub async fn seed_cursors(&self, triggered_by: &str) -> RunOutcome<SeedSummary> {
        let span = info_span!("seed_cursors", triggered_by);
        let result = self.try_seed_cursors(triggered_by).instrument(span).await;
        self.conclude("seed_cursors", triggered_by, result).await
    }

    async fn try_seed_cursors(&self, triggered_by: &str) -> SyncResult<SeedSummary> {
        let _lock = self.lock_master(self.config.batch_lock_wait).await?;
        let mut summary = SeedSummary::default();
        let mut failures = Vec::new();

        for source in &self.sources {
            let book = match self.provider.open(&source.source_id).await {
                Ok(book) => book,
                Err(err) => {
                    warn!(source = %source.source_id, error = %err, "source could not be opened");
                    summary.sources_failed += 1;
                    failures.push(
                        LogEntry::new(ReasonCode::ErrorOpeningSpreadsheet(err.to_string()))
                            .with_source(&source.source_id, "")
                            .triggered_by(triggered_by),
                    );
                    continue;
                }
            };
            for table in book.tables().await? {
                let last_row = book.last_row(table.table_id).await?;
                self.cursors.set(&source.source_id, table.table_id, last_row).await?;
                summary.tables_seeded += 1;
            }
        }

        self.log.write(&failures).await?;
        info!(tables = summary.tables_seeded, failed = summary.sources_failed, "cursors seeded");
        Ok(summary)
    }

    /// Forgets which duplicate groups were reported; the next pass reports them all again.
    pub async fn reset_duplicate_flags(&self, triggered_by: &str) -> RunOutcome<FlagResetSummary> {
        let result = async {
            let _lock = self.lock_master(self.config.batch_lock_wait).await?;
            let cleared = self.flags.reset_all().await?;
            info!(cleared, "duplicate flags reset");
            Ok::<_, SyncError>(FlagResetSummary { cleared })
        }
        .await;
        self.conclude("reset_duplicate_flags", triggered_by, result).await
    }

    /// Adds a typed-in record, or refreshes the date of a master row with the
    /// same name and date of birth. Bad input is rejected without logging.
    pub async fn add_manual_record(&self, entry: ManualEntry) -> RunOutcome<ManualEntryOutcome> {
        let user = entry.user.clone().unwrap_or_else(|| SYSTEM_USER.to_string());
        let span = info_span!("manual_entry", user = %user);
        match self.try_add_manual_record(&entry, &user).instrument(span).await {
            Err(SyncError::InvalidInput(message)) => {
                info!(%message, "manual entry rejected");
                RunOutcome::Completed(ManualEntryOutcome::Rejected { message })
            }
            result => self.conclude("manual_entry", &user, result).await,
        }
    }

    async fn try_add_manual_record(&self, entry: &ManualEntry, user: &str) -> SyncResult<ManualEntryOutcome> {
        let dob = entry.validate()?;
        let _lock = self.lock_master(self.config.edit_lock_wait).await?;
        let keys = self.key_builder();
        let today = keys.context().today;
        let wanted = keys.group_key(&entry.first_name, &entry.last_name, &CellValue::Date(dob));

        let rows = self.master.all_rows().await?;
        let existing = rows.iter().find(|r| {
            let m = &r.record;
            wanted.is_some() && keys.group_key(&m.first_name, &m.last_name, &m.dob) == wanted
        });

        let outcome = match existing {
            Some(found) => {
                let mut record = found.record.clone();
                record.date = CellValue::Date(today);
                self.master.update_row(found.row, record).await?;
                info!(row = found.row, "manual entry matched an existing master row");
                ManualEntryOutcome::Accepted {
                    message: format!("Existing Master record updated (Row {})", found.row),
                    row: found.row,
                    duplicates_found: 1,
                    uuid: found.record.master_uuid,
                }
            }
            None => {
                let uuid = IdentityIndex::assign();
                let record = MasterRecord {
                    date: CellValue::Date(today),
                    test_type: String::new(),
                    first_name: entry.first_name.trim().to_string(),
                    last_name: entry.last_name.trim().to_string(),
                    dob: CellValue::Date(dob),
                    zip: String::new(),
                    source_id: MANUAL_SOURCE_ID.to_string(),
                    link_token: None,
                    sheet_name: MANUAL_SHEET.to_string(),
                    file_name: entry.origin.clone().unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
                    master_uuid: uuid,
                    potential_duplicates: String::new(),
                };
                let row = self.append_master_row(record).await?;
                info!(row, %uuid, "manual entry added to master");
                ManualEntryOutcome::Accepted {
                    message: "New record added to Master".to_string(),
                    row,
                    duplicates_found: 0,
                    uuid,
                }
            }
        };

        self.group_duplicates(&keys, user).await?;
        self.flush_tables().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(first: &str, last: &str, dob: &str) -> ManualEntry {
        ManualEntry {
            first_name: first.into(),
            last_name: last.into(),
            dob: dob.into(),
            origin: None,
            user: None,
        }
    }

    #[test]
    fn manual_entries_need_every_field_and_an_iso_dob() {
        assert_eq!(
            entry("Jane", "Doe", "1990-05-02").validate().expect("valid"),
            NaiveDate::from_ymd_opt(1990, 5, 2).expect("date")
        );
        assert!(matches!(
            entry("Jane", " ", "1990-05-02").validate(),
            Err(SyncError::InvalidInput(_))
        ));
        assert!(matches!(
            entry("Jane", "Doe", "5/2/1990").validate(),
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn outcomes_serialize_with_a_result_tag() {
        let rejected = ManualEntryOutcome::Rejected {
            message: "Error: All fields are required.".into(),
        };
        let json = serde_json::to_value(&rejected).expect("json");
        assert_eq!(json["result"], "rejected");
    }
}
