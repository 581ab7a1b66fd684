use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mrc_adapters::{ensure_column, SourceSchema, SourceWorkbook, TableInfo};
use mrc_core::{
    columns, CellValue, DateField, DateResolution, ImportKey, KeyBuildError, KeyBuilder, LogEntry, MasterRecord,
    ReasonCode, SourceRecord, TableId,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::grouper::GroupingSummary;
use crate::identity::IdentityIndex;
use crate::{Consolidator, RunOutcome, SourceConfig};

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_scanned: usize,
    pub sources_failed: usize,
    pub tables_scanned: usize,
    pub rows_scanned: usize,
    pub appended: usize,
    pub skipped_existing: usize,
    pub logged: usize,
    pub grouping: GroupingSummary,
}

impl ImportRunSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            sources_scanned: 0,
            sources_failed: 0,
            tables_scanned: 0,
            rows_scanned: 0,
            appended: 0,
            skipped_existing: 0,
            logged: 0,
            grouping: GroupingSummary::default(),
        }
    }
}

/// Everything one run accumulates before the single master append.
struct ImportBatch {
    existing: HashSet<ImportKey>,
    used_uuids: HashSet<Uuid>,
    staged: Vec<MasterRecord>,
    log: Vec<LogEntry>,
    /// `(source, table, last row)`; applied only once the staged rows are stored.
    cursors: Vec<(String, TableId, usize)>,
}

fn date_problem(field: DateField, value: &CellValue, keys: &KeyBuilder) -> Option<String> {
    match keys.resolve_date(value) {
        DateResolution::Date(_) => None,
        DateResolution::Missing => Some(field.to_string()),
        DateResolution::Unparsed(_) => Some(format!("{field}_UNPARSED")),
    }
}

/// Mandatory field problems in the form written to the log, e.g. `DOB` or `DATE_UNPARSED`.
pub(crate) fn missing_fields(record: &SourceRecord, keys: &KeyBuilder) -> Vec<String> {
    let mut missing = Vec::new();
    missing.extend(date_problem(DateField::Date, &record.date, keys));
    if record.first_name.trim().is_empty() {
        missing.push(columns::FIRST_NAME.to_string());
    }
    if record.last_name.trim().is_empty() {
        missing.push(columns::LAST_NAME.to_string());
    }
    missing.extend(date_problem(DateField::Dob, &record.dob, keys));
    missing
}

fn import_key_for(record: &SourceRecord, keys: &KeyBuilder) -> Result<ImportKey, KeyBuildError> {
    keys.import_key(
        &record.date,
        &record.first_name,
        &record.last_name,
        &record.dob,
        &record.zip,
    )
}

impl Consolidator {
    /// Scans every enabled source past its cursors and appends new rows to the
    /// master table, then runs a grouping pass.
    pub async fn run_batch_import(&self, triggered_by: &str) -> RunOutcome<ImportRunSummary> {
        let span = info_span!("batch_import", triggered_by);
        let result = self.try_batch_import(triggered_by).instrument(span).await;
        self.conclude("batch_import", triggered_by, result).await
    }

    async fn try_batch_import(&self, triggered_by: &str) -> SyncResult<ImportRunSummary> {
        let _lock = self.lock_master(self.config.batch_lock_wait).await?;
        self.import_locked(triggered_by).await
    }

    /// The import itself. Caller holds the master lock.
    pub(crate) async fn import_locked(&self, triggered_by: &str) -> SyncResult<ImportRunSummary> {
        let keys = self.key_builder();
        let mut summary = ImportRunSummary::start();

        let master_rows = self.master.all_rows().await?;
        let mut batch = ImportBatch {
            existing: master_rows
                .iter()
                .filter_map(|r| {
                    let m = &r.record;
                    keys.import_key(&m.date, &m.first_name, &m.last_name, &m.dob, &m.zip).ok()
                })
                .collect(),
            used_uuids: master_rows.iter().map(|r| r.record.master_uuid).collect(),
            staged: Vec::new(),
            log: Vec::new(),
            cursors: Vec::new(),
        };

        for source in &self.sources {
            let span = info_span!("import_source", source = %source.source_id);
            summary.sources_scanned += 1;
            let book = match self.provider.open(&source.source_id).await {
                Ok(book) => book,
                Err(err) => {
                    warn!(source = %source.source_id, error = %err, "source could not be opened");
                    summary.sources_failed += 1;
                    batch.log.push(
                        LogEntry::new(ReasonCode::ErrorOpeningSpreadsheet(err.to_string()))
                            .with_source(&source.source_id, "")
                            .triggered_by(triggered_by),
                    );
                    continue;
                }
            };
            if let Err(err) = self
                .import_source(source, book, &keys, &mut batch, &mut summary, triggered_by)
                .instrument(span)
                .await
            {
                warn!(source = %source.source_id, error = %err, "source import aborted");
                summary.sources_failed += 1;
                batch.log.push(
                    LogEntry::new(ReasonCode::SyncError(err.to_string()))
                        .with_source(&source.source_id, "")
                        .triggered_by(triggered_by),
                );
            }
        }

        let staged = std::mem::take(&mut batch.staged);
        summary.appended = staged.len();
        if !staged.is_empty() {
            self.master.append_rows(staged).await?;
        }
        self.flush_tables().await?;
        for (source_id, table_id, last_row) in &batch.cursors {
            self.cursors.advance(source_id, *table_id, *last_row, *last_row).await?;
        }
        summary.logged = batch.log.len();
        self.log.write(&batch.log).await?;

        summary.grouping = self.group_duplicates(&keys, triggered_by).await?;
        self.flush_tables().await?;
        summary.finished_at = Utc::now();
        info!(
            appended = summary.appended,
            skipped = summary.skipped_existing,
            logged = summary.logged,
            failed_sources = summary.sources_failed,
            "batch import finished"
        );
        Ok(summary)
    }

    async fn import_source(
        &self,
        source: &SourceConfig,
        book: Arc<dyn SourceWorkbook>,
        keys: &KeyBuilder,
        batch: &mut ImportBatch,
        summary: &mut ImportRunSummary,
        triggered_by: &str,
    ) -> SyncResult<()> {
        for table in book.tables().await? {
            summary.tables_scanned += 1;
            self.import_table(source, book.as_ref(), &table, keys, batch, summary, triggered_by)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn import_table(
        &self,
        source: &SourceConfig,
        book: &dyn SourceWorkbook,
        table: &TableInfo,
        keys: &KeyBuilder,
        batch: &mut ImportBatch,
        summary: &mut ImportRunSummary,
        triggered_by: &str,
    ) -> SyncResult<()> {
        let source_id = source.source_id.as_str();
        let last_row = book.last_row(table.table_id).await?;
        let stored = self.cursors.get(source_id, table.table_id).await?;
        // Clamp first so a shrunken table is rescanned from its new end.
        let cursor = if stored > last_row {
            info!(table = %table.name, stored, last_row, "table shrank; clamping cursor");
            self.cursors.advance(source_id, table.table_id, last_row, last_row).await?
        } else {
            stored
        };

        let start = (cursor + 1).max(2);
        if last_row < 2 || start > last_row {
            debug!(table = %table.name, cursor, last_row, "nothing new");
            return Ok(());
        }

        let header = book.header(table.table_id).await?;
        let schema = SourceSchema::resolve(&header);
        let uuid_column = ensure_column(book, table.table_id, columns::MASTER_UUID).await?;
        let rows = book.read_rows(table.table_id, start, last_row).await?;

        for (offset, cells) in rows.iter().enumerate() {
            let row = start + offset;
            summary.rows_scanned += 1;
            if cells.iter().all(CellValue::is_blank) {
                continue;
            }

            let record = schema.record(source_id, book.name(), table, row, cells);
            let link = self.row_link(&record.link_token());
            let rejected = |reason: ReasonCode| {
                LogEntry::new(reason)
                    .with_source(source_id, &table.name)
                    .at_row(row)
                    .with_values(record.extracted_values())
                    .with_link(link.clone())
                    .triggered_by(triggered_by)
            };

            if !record.has_any_field() {
                batch.log.push(rejected(ReasonCode::NoData));
                continue;
            }
            let missing = missing_fields(&record, keys);
            if !missing.is_empty() {
                batch.log.push(rejected(ReasonCode::MissingFields(missing)));
                continue;
            }
            let key = match import_key_for(&record, keys) {
                Ok(key) => key,
                Err(err) => {
                    debug!(row, error = %err, "import key not built");
                    batch.log.push(rejected(ReasonCode::CouldNotBuildKey));
                    continue;
                }
            };
            if batch.existing.contains(&key) {
                summary.skipped_existing += 1;
                continue;
            }

            // Keep an identity the source already carries unless it is taken.
            let uuid = match record.identity.uuid() {
                Some(existing) if !batch.used_uuids.contains(&existing) => existing,
                _ => {
                    let fresh = IdentityIndex::assign();
                    if let Err(err) = book
                        .write_cell(table.table_id, row, uuid_column, CellValue::Text(fresh.to_string()))
                        .await
                    {
                        warn!(row, error = %err, "could not write identity back to source");
                    }
                    fresh
                }
            };
            batch.used_uuids.insert(uuid);
            batch.staged.push(MasterRecord::from_source(&record, uuid, keys.context()));
            batch.existing.insert(key);
        }

        batch.cursors.push((source_id.to_string(), table.table_id, last_row));
        Ok(())
    }
}
