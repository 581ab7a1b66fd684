use std::collections::{BTreeSet, HashMap};

use mrc_adapters::{ensure_column, EditEvent, SourceSchema, SourceWorkbook};
use mrc_core::{
    columns, CellValue, GroupKey, KeyBuilder, LinkToken, MasterRecord, SourceIdentity, SourceRecord, TableId,
    SYSTEM_USER,
};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::grouper::{group_rows, GroupingSummary};
use crate::identity::IdentityIndex;
use crate::{Consolidator, RunOutcome};

#[derive(Debug, Clone, Default, Serialize)]
pub struct EditSyncSummary {
    pub rows_considered: usize,
    pub debounced: usize,
    pub blank: usize,
    pub updated: usize,
    pub inserted: usize,
    /// Rows whose identity was missing from master and got a fresh one.
    pub orphans_reassigned: usize,
    /// Rows without an identity matched back through their link token.
    pub relinked: usize,
    pub flagged: usize,
    pub grouping: GroupingSummary,
}

/// Point-in-time `(group key) -> [(master row, label)]` view taken before any writes.
type DuplicateMap = HashMap<GroupKey, Vec<(usize, String)>>;

enum Resolution {
    Existing(usize),
    New,
}

/// Finds the master row a source row without an identity was imported as.
/// Only a unique link match on the same person is trusted.
fn relink(
    index: &IdentityIndex,
    records: &HashMap<usize, MasterRecord>,
    token: &LinkToken,
    group_key: Option<&GroupKey>,
    keys: &KeyBuilder,
) -> SyncResult<(Uuid, usize)> {
    let master_row = index
        .find_master_row_by_link_token(token)
        .ok_or_else(|| SyncError::Unresolved(format!("no unique master row links to {token}")))?;
    let existing = records
        .get(&master_row)
        .ok_or_else(|| SyncError::Unresolved(format!("master row {master_row} vanished")))?;
    let existing_key = keys.group_key(&existing.first_name, &existing.last_name, &existing.dob);
    match group_key {
        Some(wanted) if existing_key.as_ref() == Some(wanted) => Ok((existing.master_uuid, master_row)),
        _ => Err(SyncError::Unresolved(format!(
            "master row {master_row} linked from {token} holds a different person"
        ))),
    }
}

impl Consolidator {
    /// Syncs the rows touched by one edit into the master table.
    pub async fn handle_edit(&self, event: EditEvent) -> RunOutcome<EditSyncSummary> {
        let user = event.user.clone().unwrap_or_else(|| SYSTEM_USER.to_string());
        let span = info_span!(
            "edit_sync",
            source = %event.source_id,
            table = event.table_id,
            rows = ?event.rows()
        );
        match self.try_handle_edit(&event, &user).instrument(span).await {
            Ok(Some(summary)) => RunOutcome::Completed(summary),
            Ok(None) => RunOutcome::Ignored {
                reason: "edited columns are not tracked".to_string(),
            },
            Err(err) => self.conclude("edit_sync", &user, Err(err)).await,
        }
    }

    /// `None` when the edit touched nothing the engine tracks.
    async fn try_handle_edit(&self, event: &EditEvent, user: &str) -> SyncResult<Option<EditSyncSummary>> {
        let book = self.provider.open(&event.source_id).await?;
        if !self.is_relevant_edit(book.as_ref(), event).await? {
            debug!("edit outside tracked columns");
            return Ok(None);
        }
        self.try_sync_edit(book.as_ref(), event, user).await.map(Some)
    }

    /// Checked before the lock is taken.
    async fn is_relevant_edit(&self, book: &dyn SourceWorkbook, event: &EditEvent) -> SyncResult<bool> {
        if *event.rows().end() < 2 {
            return Ok(false);
        }
        let schema = SourceSchema::resolve(&book.header(event.table_id).await?);
        Ok(event.columns().any(|column| schema.is_relevant_column(column)))
    }

    async fn try_sync_edit(
        &self,
        book: &dyn SourceWorkbook,
        event: &EditEvent,
        user: &str,
    ) -> SyncResult<EditSyncSummary> {
        let _lock = self.lock_master(self.config.edit_lock_wait).await?;
        let keys = self.key_builder();
        let table_id = event.table_id;
        let table = book
            .tables()
            .await?
            .into_iter()
            .find(|t| t.table_id == table_id)
            .ok_or_else(|| mrc_adapters::TableError::TableNotFound {
                source_id: event.source_id.clone(),
                table_id,
            })?;

        let uuid_column = ensure_column(book, table_id, columns::MASTER_UUID).await?;
        let note_column = ensure_column(book, table_id, columns::POTENTIAL_DUPLICATES).await?;
        let schema = SourceSchema::resolve(&book.header(table_id).await?);

        let snapshot = self.master.all_rows().await?;
        let mut index = IdentityIndex::build(&snapshot);
        let mut records: HashMap<usize, MasterRecord> =
            snapshot.iter().map(|r| (r.row, r.record.clone())).collect();
        let duplicates: DuplicateMap = group_rows(&snapshot, &keys)
            .into_iter()
            .map(|(key, members)| {
                let refs = members.iter().map(|m| (m.row, m.record.label(m.row))).collect();
                (key, refs)
            })
            .collect();

        let mut summary = EditSyncSummary::default();
        // Rows past the end are blank; do not walk them.
        let last_row = book.last_row(table_id).await?;
        let rows: BTreeSet<usize> = (event.start_row.max(2)..=(*event.rows().end()).min(last_row)).collect();

        for row in rows {
            summary.rows_considered += 1;
            if self.guard.recently_handled(&event.source_id, table_id, row) {
                summary.debounced += 1;
                continue;
            }
            let Some(cells) = book.read_rows(table_id, row, row).await?.into_iter().next() else {
                summary.blank += 1;
                continue;
            };
            if cells.iter().all(CellValue::is_blank) {
                summary.blank += 1;
                continue;
            }

            let mut record = schema.record(&event.source_id, book.name(), &table, row, &cells);
            let token = record.link_token();
            let group_key = keys.group_key(&record.first_name, &record.last_name, &record.dob);

            let found = record
                .identity
                .uuid()
                .and_then(|uuid| index.find_master_row_by_uuid(&uuid).map(|master_row| (uuid, master_row)));
            let (uuid, resolution) = match found {
                Some((uuid, master_row)) => (uuid, Resolution::Existing(master_row)),
                None if record.identity.is_present() => {
                    info!(row, identity = ?record.identity, "identity not found in master; assigning a fresh one");
                    summary.orphans_reassigned += 1;
                    (IdentityIndex::assign(), Resolution::New)
                }
                None => match relink(&index, &records, &token, group_key.as_ref(), &keys) {
                    Ok((uuid, master_row)) => {
                        summary.relinked += 1;
                        (uuid, Resolution::Existing(master_row))
                    }
                    Err(err) => {
                        debug!(row, kind = ?err.kind(), error = %err, "inserting as new");
                        (IdentityIndex::assign(), Resolution::New)
                    }
                },
            };
            if record.identity.uuid() != Some(uuid) {
                book.write_cell(table_id, row, uuid_column, CellValue::Text(uuid.to_string()))
                    .await?;
                record.identity = SourceIdentity::Valid(uuid);
            }

            if record.date.is_blank() {
                record.date = CellValue::Date(keys.context().today);
            }
            let mut master_record = MasterRecord::from_source(&record, uuid, keys.context());

            let own_row = match resolution {
                Resolution::Existing(master_row) => {
                    if let Some(existing) = records.get(&master_row) {
                        master_record.potential_duplicates = existing.potential_duplicates.clone();
                    }
                    self.master.update_row(master_row, master_record.clone()).await?;
                    summary.updated += 1;
                    master_row
                }
                Resolution::New => {
                    let master_row = self.append_master_row(master_record.clone()).await?;
                    index.insert(uuid, Some(&token), master_row);
                    summary.inserted += 1;
                    master_row
                }
            };
            records.insert(own_row, master_record);

            let matches: Vec<&str> = group_key
                .as_ref()
                .and_then(|key| duplicates.get(key))
                .map(|refs| {
                    refs.iter()
                        .filter(|(r, _)| *r != own_row)
                        .map(|(_, label)| label.as_str())
                        .collect()
                })
                .unwrap_or_default();
            self.give_feedback(book, table_id, row, note_column, &record, &matches)
                .await?;
            if !matches.is_empty() {
                summary.flagged += 1;
            }
        }

        summary.grouping = self.group_duplicates(&keys, user).await?;
        self.flush_tables().await?;
        info!(
            updated = summary.updated,
            inserted = summary.inserted,
            debounced = summary.debounced,
            "edit synced"
        );
        Ok(summary)
    }

    /// Flags the source row with its likely duplicates, or clears an old flag.
    async fn give_feedback(
        &self,
        book: &dyn SourceWorkbook,
        table_id: TableId,
        row: usize,
        note_column: usize,
        record: &SourceRecord,
        matches: &[&str],
    ) -> SyncResult<()> {
        if matches.is_empty() {
            if !record.potential_duplicates.is_empty() {
                book.write_cell(table_id, row, note_column, CellValue::Empty).await?;
            }
            book.set_highlight(table_id, row, false).await?;
        } else {
            book.write_cell(table_id, row, note_column, CellValue::Text(matches.join("\n")))
                .await?;
            book.set_highlight(table_id, row, true).await?;
        }
        Ok(())
    }
}
