//! Table provider contracts for source workbooks and the master table, the
//! header schema mapping that turns raw rows into typed records, and the
//! JSON-file backed implementations used by the CLI and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mrc_core::{columns, CellValue, MasterRecord, SourceIdentity, SourceRecord, TableId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mrc-adapters";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("source {0} could not be opened")]
    SourceNotFound(String),
    #[error("table {table_id} not found in source {source_id}")]
    TableNotFound { source_id: String, table_id: TableId },
    #[error("row {row} is outside the {table} table")]
    RowOutOfRange { table: String, row: usize },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_id: TableId,
    pub name: String,
}

/// One independently edited workbook holding one or more source tables.
///
/// Rows and columns are 1-based; row 1 is the header row.
#[async_trait]
pub trait SourceWorkbook: Send + Sync {
    fn source_id(&self) -> &str;
    fn name(&self) -> &str;

    async fn tables(&self) -> Result<Vec<TableInfo>, TableError>;
    async fn header(&self, table_id: TableId) -> Result<Vec<String>, TableError>;
    async fn last_row(&self, table_id: TableId) -> Result<usize, TableError>;
    async fn last_column(&self, table_id: TableId) -> Result<usize, TableError>;

    /// Inclusive on both ends; rows past the end are not returned.
    async fn read_rows(
        &self,
        table_id: TableId,
        from_row: usize,
        to_row: usize,
    ) -> Result<Vec<Vec<CellValue>>, TableError>;

    async fn write_cell(
        &self,
        table_id: TableId,
        row: usize,
        column: usize,
        value: CellValue,
    ) -> Result<(), TableError>;

    async fn set_highlight(&self, table_id: TableId, row: usize, on: bool) -> Result<(), TableError>;
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, source_id: &str) -> Result<Arc<dyn SourceWorkbook>, TableError>;

    /// Re-reads backing storage; called once the master lock is held.
    /// Workbooks already handed out see the fresh contents.
    async fn reload(&self) -> Result<(), TableError> {
        Ok(())
    }

    /// Writes pending changes to backing storage.
    async fn flush(&self) -> Result<(), TableError> {
        Ok(())
    }
}

/// A master row with its 1-based sheet row number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRow {
    pub row: usize,
    pub record: MasterRecord,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSummaryRow {
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
    pub count: usize,
    pub links: Vec<String>,
}

#[async_trait]
pub trait MasterTable: Send + Sync {
    async fn all_rows(&self) -> Result<Vec<MasterRow>, TableError>;
    /// Returns the row numbers the records landed on.
    async fn append_rows(&self, records: Vec<MasterRecord>) -> Result<Vec<usize>, TableError>;
    async fn update_row(&self, row: usize, record: MasterRecord) -> Result<(), TableError>;
    async fn set_note(&self, row: usize, note: &str) -> Result<(), TableError>;
    async fn set_highlight(&self, row: usize, on: bool) -> Result<(), TableError>;
    async fn replace_duplicate_summary(&self, rows: Vec<DuplicateSummaryRow>) -> Result<(), TableError>;
    async fn duplicate_summary(&self) -> Result<Vec<DuplicateSummaryRow>, TableError>;
    /// Drops every record row and the duplicate summary; the header stays.
    async fn clear(&self) -> Result<(), TableError>;

    /// Re-reads backing storage; called once the master lock is held.
    async fn reload(&self) -> Result<(), TableError> {
        Ok(())
    }

    /// Writes pending changes to backing storage.
    async fn flush(&self) -> Result<(), TableError> {
        Ok(())
    }
}

/// An edit notification from a source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEvent {
    pub source_id: String,
    pub table_id: TableId,
    pub start_row: usize,
    pub num_rows: usize,
    pub start_column: usize,
    pub num_columns: usize,
    pub user: Option<String>,
}

impl EditEvent {
    pub fn single_cell(source_id: impl Into<String>, table_id: TableId, row: usize, column: usize) -> Self {
        Self {
            source_id: source_id.into(),
            table_id,
            start_row: row,
            num_rows: 1,
            start_column: column,
            num_columns: 1,
            user: None,
        }
    }

    pub fn by(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn rows(&self) -> RangeInclusive<usize> {
        self.start_row..=self.start_row.saturating_add(self.num_rows.max(1) - 1)
    }

    pub fn columns(&self) -> RangeInclusive<usize> {
        self.start_column..=self.start_column.saturating_add(self.num_columns.max(1) - 1)
    }
}

fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// 0-based index of `name` in `header`: case-insensitive and trimmed first,
/// then ignoring whitespace altogether.
pub fn find_column(header: &[String], name: &str) -> Option<usize> {
    let wanted = name.trim().to_uppercase();
    header
        .iter()
        .position(|h| h.trim().to_uppercase() == wanted)
        .or_else(|| {
            let squashed = squash(name);
            header.iter().position(|h| squash(h) == squashed)
        })
}

/// Column positions resolved once per table from its header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSchema {
    indices: BTreeMap<&'static str, usize>,
}

impl SourceSchema {
    pub fn resolve(header: &[String]) -> Self {
        let indices = columns::RELEVANT
            .iter()
            .filter_map(|name| find_column(header, name).map(|idx| (*name, idx)))
            .collect();
        Self { indices }
    }

    /// 1-based column of a known header.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.indices.get(name).map(|idx| idx + 1)
    }

    pub fn maps_any_field(&self) -> bool {
        columns::SOURCE_FIELDS.iter().any(|name| self.indices.contains_key(name))
    }

    pub fn is_relevant_column(&self, column: usize) -> bool {
        self.indices.values().any(|idx| idx + 1 == column)
    }

    pub fn cell(&self, cells: &[CellValue], name: &str) -> CellValue {
        self.indices
            .get(name)
            .and_then(|idx| cells.get(*idx))
            .cloned()
            .unwrap_or_default()
    }

    pub fn text(&self, cells: &[CellValue], name: &str) -> String {
        self.cell(cells, name).to_text()
    }

    pub fn record(
        &self,
        source_id: &str,
        file_name: &str,
        table: &TableInfo,
        row: usize,
        cells: &[CellValue],
    ) -> SourceRecord {
        SourceRecord {
            source_id: source_id.to_string(),
            file_name: file_name.to_string(),
            table_id: table.table_id,
            sheet_name: table.name.clone(),
            row,
            date: self.cell(cells, columns::DATE),
            test_type: self.text(cells, columns::TEST_TYPE),
            first_name: self.text(cells, columns::FIRST_NAME),
            last_name: self.text(cells, columns::LAST_NAME),
            dob: self.cell(cells, columns::DOB),
            zip: self.text(cells, columns::ZIP_CODE),
            identity: SourceIdentity::parse(&self.text(cells, columns::MASTER_UUID)),
            potential_duplicates: self.text(cells, columns::POTENTIAL_DUPLICATES),
        }
    }
}

/// Makes sure `name` exists in the header row, appending it after the last
/// used column if needed. Returns its 1-based column.
pub async fn ensure_column(
    book: &dyn SourceWorkbook,
    table_id: TableId,
    name: &str,
) -> Result<usize, TableError> {
    let header = book.header(table_id).await?;
    if let Some(idx) = find_column(&header, name) {
        return Ok(idx + 1);
    }
    let column = book.last_column(table_id).await? + 1;
    book.write_cell(table_id, 1, column, CellValue::from(name)).await?;
    info!(source = book.source_id(), table = table_id, column, header = name, "added header column");
    Ok(column)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub table_id: TableId,
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Vec<CellValue>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub highlighted_rows: BTreeSet<usize>,
}

impl TableData {
    pub fn new(table_id: TableId, name: impl Into<String>, header: &[&str]) -> Self {
        Self {
            table_id,
            name: name.into(),
            rows: vec![header.iter().map(|h| CellValue::from(*h)).collect()],
            highlighted_rows: BTreeSet::new(),
        }
    }

    pub fn push_row(&mut self, cells: Vec<CellValue>) -> usize {
        self.rows.push(cells);
        self.rows.len()
    }

    pub fn header(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|r| r.iter().map(CellValue::to_text).collect())
            .unwrap_or_default()
    }

    pub fn last_row(&self) -> usize {
        self.rows
            .iter()
            .rposition(|r| r.iter().any(|c| !c.is_blank()))
            .map_or(0, |idx| idx + 1)
    }

    pub fn last_column(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|r| r.iter().rposition(|c| !c.is_blank()))
            .max()
            .map_or(0, |idx| idx + 1)
    }

    pub fn cell(&self, row: usize, column: usize) -> CellValue {
        row.checked_sub(1)
            .and_then(|r| self.rows.get(r))
            .and_then(|cells| column.checked_sub(1).and_then(|c| cells.get(c)))
            .cloned()
            .unwrap_or_default()
    }

    fn set_cell(&mut self, row: usize, column: usize, value: CellValue) -> Result<(), TableError> {
        if row == 0 || column == 0 {
            return Err(TableError::RowOutOfRange {
                table: self.name.clone(),
                row,
            });
        }
        if self.rows.len() < row {
            self.rows.resize(row, Vec::new());
        }
        let cells = &mut self.rows[row - 1];
        if cells.len() < column {
            cells.resize(column, CellValue::Empty);
        }
        cells[column - 1] = value;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookData {
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableData>,
}

impl WorkbookData {
    pub fn table(&self, table_id: TableId) -> Option<&TableData> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }
}

pub struct MemoryWorkbook {
    source_id: String,
    name: String,
    data: Mutex<WorkbookData>,
}

impl MemoryWorkbook {
    pub fn new(data: WorkbookData) -> Self {
        Self {
            source_id: data.source_id.clone(),
            name: data.name.clone(),
            data: Mutex::new(data),
        }
    }

    pub async fn snapshot(&self) -> WorkbookData {
        self.data.lock().await.clone()
    }

    /// Direct mutation, standing in for a person typing into the workbook.
    pub async fn edit<R>(&self, f: impl FnOnce(&mut WorkbookData) -> R) -> R {
        f(&mut *self.data.lock().await)
    }

    /// Swaps in freshly loaded contents.
    pub async fn replace(&self, data: WorkbookData) {
        *self.data.lock().await = data;
    }

    async fn with_table<R>(
        &self,
        table_id: TableId,
        f: impl FnOnce(&mut TableData) -> Result<R, TableError>,
    ) -> Result<R, TableError> {
        let mut data = self.data.lock().await;
        let table = data
            .tables
            .iter_mut()
            .find(|t| t.table_id == table_id)
            .ok_or_else(|| TableError::TableNotFound {
                source_id: self.source_id.clone(),
                table_id,
            })?;
        f(table)
    }
}

#[async_trait]
impl SourceWorkbook for MemoryWorkbook {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn tables(&self) -> Result<Vec<TableInfo>, TableError> {
        Ok(self
            .data
            .lock()
            .await
            .tables
            .iter()
            .map(|t| TableInfo {
                table_id: t.table_id,
                name: t.name.clone(),
            })
            .collect())
    }

    async fn header(&self, table_id: TableId) -> Result<Vec<String>, TableError> {
        self.with_table(table_id, |t| Ok(t.header())).await
    }

    async fn last_row(&self, table_id: TableId) -> Result<usize, TableError> {
        self.with_table(table_id, |t| Ok(t.last_row())).await
    }

    async fn last_column(&self, table_id: TableId) -> Result<usize, TableError> {
        self.with_table(table_id, |t| Ok(t.last_column())).await
    }

    async fn read_rows(
        &self,
        table_id: TableId,
        from_row: usize,
        to_row: usize,
    ) -> Result<Vec<Vec<CellValue>>, TableError> {
        self.with_table(table_id, |t| {
            let width = t.last_column();
            let end = to_row.min(t.rows.len());
            let start = from_row.max(1);
            if start > end {
                return Ok(Vec::new());
            }
            Ok(t.rows[start - 1..end]
                .iter()
                .map(|cells| {
                    let mut cells = cells.clone();
                    cells.resize(width.max(cells.len()), CellValue::Empty);
                    cells
                })
                .collect())
        })
        .await
    }

    async fn write_cell(
        &self,
        table_id: TableId,
        row: usize,
        column: usize,
        value: CellValue,
    ) -> Result<(), TableError> {
        self.with_table(table_id, |t| t.set_cell(row, column, value)).await
    }

    async fn set_highlight(&self, table_id: TableId, row: usize, on: bool) -> Result<(), TableError> {
        self.with_table(table_id, |t| {
            if on {
                t.highlighted_rows.insert(row);
            } else {
                t.highlighted_rows.remove(&row);
            }
            Ok(())
        })
        .await
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("encoding {}", path.display()))?;
    mrc_storage::write_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub fn load_workbook(path: impl AsRef<Path>) -> Result<WorkbookData> {
    read_json_file(path)
}

/// Workbooks keyed by source id; opening an unknown id fails.
#[derive(Default)]
pub struct WorkbookDirectory {
    books: RwLock<BTreeMap<String, Arc<MemoryWorkbook>>>,
    backing: Option<Backing>,
}

struct Backing {
    dir: PathBuf,
    source_ids: Vec<String>,
}

fn read_book(dir: &Path, source_id: &str) -> Result<WorkbookData> {
    let mut data = load_workbook(dir.join(format!("{source_id}.json")))?;
    if data.source_id.is_empty() {
        data.source_id = source_id.to_string();
    }
    Ok(data)
}

impl WorkbookDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, data: WorkbookData) -> Arc<MemoryWorkbook> {
        let book = Arc::new(MemoryWorkbook::new(data));
        self.books
            .write()
            .await
            .insert(book.source_id().to_string(), Arc::clone(&book));
        book
    }

    pub async fn get(&self, source_id: &str) -> Option<Arc<MemoryWorkbook>> {
        self.books.read().await.get(source_id).cloned()
    }

    /// Loads `<dir>/<source_id>.json` for each id and stays bound to `dir`
    /// for `reload` and `flush`. Unreadable workbooks are left out so that
    /// opening them fails at import time.
    pub async fn load_from_dir(dir: &Path, source_ids: &[String]) -> Self {
        let directory = Self {
            books: RwLock::new(BTreeMap::new()),
            backing: Some(Backing {
                dir: dir.to_path_buf(),
                source_ids: source_ids.to_vec(),
            }),
        };
        directory.refresh_from(dir, source_ids).await;
        directory
    }

    async fn refresh_from(&self, dir: &Path, source_ids: &[String]) {
        for source_id in source_ids {
            match read_book(dir, source_id) {
                Ok(data) => match self.get(source_id).await {
                    Some(book) => book.replace(data).await,
                    None => {
                        self.insert(data).await;
                    }
                },
                Err(err) => warn!(source = %source_id, error = %format!("{err:#}"), "workbook not loaded"),
            }
        }
    }

    pub async fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let books: Vec<_> = self.books.read().await.values().cloned().collect();
        for book in books {
            let path = dir.join(format!("{}.json", book.source_id()));
            write_json_file(&path, &book.snapshot().await).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for WorkbookDirectory {
    async fn open(&self, source_id: &str) -> Result<Arc<dyn SourceWorkbook>, TableError> {
        match self.get(source_id).await {
            Some(book) => Ok(book as Arc<dyn SourceWorkbook>),
            None => Err(TableError::SourceNotFound(source_id.to_string())),
        }
    }

    async fn reload(&self) -> Result<(), TableError> {
        if let Some(backing) = &self.backing {
            self.refresh_from(&backing.dir, &backing.source_ids).await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TableError> {
        if let Some(backing) = &self.backing {
            self.save_to_dir(&backing.dir).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub record: MasterRecord,
    #[serde(default)]
    pub highlighted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterData {
    #[serde(default)]
    pub rows: Vec<MasterEntry>,
    #[serde(default)]
    pub duplicate_summary: Vec<DuplicateSummaryRow>,
}

// Record rows start below the header.
const FIRST_MASTER_ROW: usize = 2;

#[derive(Default)]
pub struct MemoryMasterTable {
    data: Mutex<MasterData>,
    backing: Option<PathBuf>,
}

/// Missing file means an empty master table.
fn read_master(path: &Path) -> Result<MasterData> {
    if !path.exists() {
        return Ok(MasterData::default());
    }
    read_json_file(path)
}

impl MemoryMasterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: MasterData) -> Self {
        Self {
            data: Mutex::new(data),
            backing: None,
        }
    }

    /// Loads `path` and stays bound to it for `reload` and `flush`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Ok(Self {
            data: Mutex::new(read_master(&path)?),
            backing: Some(path),
        })
    }

    pub async fn snapshot(&self) -> MasterData {
        self.data.lock().await.clone()
    }

    async fn with_entry<R>(
        &self,
        row: usize,
        f: impl FnOnce(&mut MasterEntry) -> R,
    ) -> Result<R, TableError> {
        let mut data = self.data.lock().await;
        let entry = row
            .checked_sub(FIRST_MASTER_ROW)
            .and_then(|idx| data.rows.get_mut(idx))
            .ok_or_else(|| TableError::RowOutOfRange {
                table: "master".to_string(),
                row,
            })?;
        Ok(f(entry))
    }
}

#[async_trait]
impl MasterTable for MemoryMasterTable {
    async fn all_rows(&self) -> Result<Vec<MasterRow>, TableError> {
        Ok(self
            .data
            .lock()
            .await
            .rows
            .iter()
            .enumerate()
            .map(|(idx, entry)| MasterRow {
                row: idx + FIRST_MASTER_ROW,
                record: entry.record.clone(),
                highlighted: entry.highlighted,
            })
            .collect())
    }

    async fn append_rows(&self, records: Vec<MasterRecord>) -> Result<Vec<usize>, TableError> {
        let mut data = self.data.lock().await;
        let first = data.rows.len() + FIRST_MASTER_ROW;
        let count = records.len();
        data.rows.extend(records.into_iter().map(|record| MasterEntry {
            record,
            highlighted: false,
        }));
        Ok((first..first + count).collect())
    }

    async fn update_row(&self, row: usize, record: MasterRecord) -> Result<(), TableError> {
        self.with_entry(row, |entry| entry.record = record).await
    }

    async fn set_note(&self, row: usize, note: &str) -> Result<(), TableError> {
        self.with_entry(row, |entry| entry.record.potential_duplicates = note.to_string())
            .await
    }

    async fn set_highlight(&self, row: usize, on: bool) -> Result<(), TableError> {
        self.with_entry(row, |entry| entry.highlighted = on).await
    }

    async fn replace_duplicate_summary(&self, rows: Vec<DuplicateSummaryRow>) -> Result<(), TableError> {
        self.data.lock().await.duplicate_summary = rows;
        Ok(())
    }

    async fn duplicate_summary(&self) -> Result<Vec<DuplicateSummaryRow>, TableError> {
        Ok(self.data.lock().await.duplicate_summary.clone())
    }

    async fn clear(&self) -> Result<(), TableError> {
        let mut data = self.data.lock().await;
        data.rows.clear();
        data.duplicate_summary.clear();
        Ok(())
    }

    async fn reload(&self) -> Result<(), TableError> {
        if let Some(path) = &self.backing {
            let fresh = read_master(path)?;
            *self.data.lock().await = fresh;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TableError> {
        if let Some(path) = &self.backing {
            write_json_file(path, &self.snapshot().await).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrc_core::LinkToken;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn header(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample_book() -> WorkbookData {
        let mut table = TableData::new(
            7,
            "Lab A",
            &["Date", " first name ", "LAST NAME", "DOB", "ZipCode", "Notes"],
        );
        table.push_row(vec![
            "1/10/2024".into(),
            "Jane".into(),
            "Doe".into(),
            "5/2/1990".into(),
            CellValue::Number(10001.0),
            "call back".into(),
        ]);
        WorkbookData {
            source_id: "src-a".into(),
            name: "Clinic A".into(),
            tables: vec![table],
        }
    }

    #[test]
    fn header_lookup_tolerates_case_and_spacing() {
        let h = header(&["date", " Test Type ", "ZIPCODE", "MASTER UUID"]);
        assert_eq!(find_column(&h, columns::DATE), Some(0));
        assert_eq!(find_column(&h, columns::TEST_TYPE), Some(1));
        assert_eq!(find_column(&h, columns::ZIP_CODE), Some(2));
        assert_eq!(find_column(&h, columns::MASTER_UUID), None);
        assert_eq!(find_column(&h, columns::DOB), None);
    }

    #[test]
    fn schema_maps_cells_into_a_source_record() {
        let book = sample_book();
        let table = &book.tables[0];
        let schema = SourceSchema::resolve(&table.header());
        assert!(schema.maps_any_field());
        assert_eq!(schema.column(columns::ZIP_CODE), Some(5));
        assert!(schema.is_relevant_column(2));
        assert!(!schema.is_relevant_column(6));

        let info = TableInfo {
            table_id: table.table_id,
            name: table.name.clone(),
        };
        let record = schema.record(&book.source_id, &book.name, &info, 2, &table.rows[1]);
        assert_eq!(record.first_name, "Jane");
        assert_eq!(record.zip, "10001");
        assert_eq!(record.identity, SourceIdentity::Absent);
        assert_eq!(record.link_token(), LinkToken::new("src-a", 7, 2));
        assert!(record.has_any_field());
    }

    #[tokio::test]
    async fn ensure_column_appends_missing_headers_once() {
        let book = MemoryWorkbook::new(sample_book());
        let col = ensure_column(&book, 7, columns::MASTER_UUID).await.expect("ensure");
        assert_eq!(col, 7);
        let again = ensure_column(&book, 7, columns::MASTER_UUID).await.expect("ensure");
        assert_eq!(again, 7);
        assert_eq!(book.header(7).await.expect("header")[6], columns::MASTER_UUID);
    }

    #[tokio::test]
    async fn workbook_reads_pad_rows_and_ignore_trailing_blanks() {
        let book = MemoryWorkbook::new(sample_book());
        book.edit(|data| {
            data.tables[0].push_row(vec!["".into()]);
        })
        .await;
        assert_eq!(book.last_row(7).await.expect("last row"), 2);

        book.write_cell(7, 4, 2, "Late".into()).await.expect("write");
        assert_eq!(book.last_row(7).await.expect("last row"), 4);
        let rows = book.read_rows(7, 3, 10).await.expect("read");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].iter().all(CellValue::is_blank));
        assert_eq!(rows[1][1], CellValue::from("Late"));
        assert_eq!(rows[1].len(), 6);

        assert!(matches!(
            book.read_rows(99, 1, 2).await,
            Err(TableError::TableNotFound { table_id: 99, .. })
        ));
    }

    #[tokio::test]
    async fn directory_opens_known_sources_only() {
        let dir = WorkbookDirectory::new();
        dir.insert(sample_book()).await;
        let opened = dir.open("src-a").await.expect("open");
        assert_eq!(opened.name(), "Clinic A");
        assert!(matches!(
            dir.open("missing").await,
            Err(TableError::SourceNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn workbooks_round_trip_through_a_directory() {
        let tmp = tempdir().expect("tempdir");
        let dir = WorkbookDirectory::new();
        let book = dir.insert(sample_book()).await;
        book.set_highlight(7, 2, true).await.expect("highlight");
        dir.save_to_dir(tmp.path()).await.expect("save");

        let reloaded =
            WorkbookDirectory::load_from_dir(tmp.path(), &["src-a".to_string(), "gone".to_string()]).await;
        let book = reloaded.get("src-a").await.expect("reloaded book");
        let data = book.snapshot().await;
        assert_eq!(data, {
            let mut expected = sample_book();
            expected.tables[0].highlighted_rows.insert(2);
            expected
        });
        assert!(reloaded.open("gone").await.is_err());
    }

    fn master_record(first: &str) -> MasterRecord {
        MasterRecord {
            date: CellValue::from("1/10/2024"),
            test_type: String::new(),
            first_name: first.into(),
            last_name: "Doe".into(),
            dob: CellValue::from("5/2/1990"),
            zip: String::new(),
            source_id: "src-a".into(),
            link_token: None,
            sheet_name: "Lab A".into(),
            file_name: "Clinic A".into(),
            master_uuid: Uuid::new_v4(),
            potential_duplicates: String::new(),
        }
    }

    #[tokio::test]
    async fn master_rows_are_numbered_below_the_header() {
        let master = MemoryMasterTable::new();
        let rows = master
            .append_rows(vec![master_record("Jane"), master_record("John")])
            .await
            .expect("append");
        assert_eq!(rows, vec![2, 3]);
        assert_eq!(
            master.append_rows(vec![master_record("Jim")]).await.expect("append"),
            vec![4]
        );

        master.set_note(3, "Clinic A (Lab A) Row 2").await.expect("note");
        master.set_highlight(3, true).await.expect("highlight");
        let all = master.all_rows().await.expect("rows");
        assert_eq!(all[1].row, 3);
        assert!(all[1].highlighted);
        assert_eq!(all[1].record.potential_duplicates, "Clinic A (Lab A) Row 2");

        assert!(matches!(
            master.update_row(9, master_record("Nobody")).await,
            Err(TableError::RowOutOfRange { row: 9, .. })
        ));
        master.clear().await.expect("clear");
        assert!(master.all_rows().await.expect("rows").is_empty());
    }

    #[tokio::test]
    async fn master_table_persists_to_json() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("master.json");
        let master = MemoryMasterTable::open(&path).expect("open empty");
        assert!(master.snapshot().await.rows.is_empty());

        master.append_rows(vec![master_record("Jane")]).await.expect("append");
        master
            .replace_duplicate_summary(vec![DuplicateSummaryRow {
                first_name: "JANE".into(),
                last_name: "DOE".into(),
                dob: "1990-05-02".into(),
                count: 2,
                links: vec!["a".into(), "b".into()],
            }])
            .await
            .expect("summary");
        master.flush().await.expect("flush");

        let reopened = MemoryMasterTable::open(&path).expect("reopen");
        assert_eq!(reopened.snapshot().await, master.snapshot().await);
    }

    #[tokio::test]
    async fn bound_master_tables_reload_what_others_flushed() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("master.json");
        let ours = MemoryMasterTable::open(&path).expect("open");
        let theirs = MemoryMasterTable::open(&path).expect("open");

        theirs.append_rows(vec![master_record("Jane")]).await.expect("append");
        theirs.flush().await.expect("flush");
        assert!(ours.all_rows().await.expect("rows").is_empty());

        ours.reload().await.expect("reload");
        assert_eq!(ours.all_rows().await.expect("rows").len(), 1);
        // Unbound tables keep their in-memory rows.
        let loose = MemoryMasterTable::new();
        loose.append_rows(vec![master_record("Jim")]).await.expect("append");
        loose.reload().await.expect("reload");
        assert_eq!(loose.all_rows().await.expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn directory_reload_refreshes_books_already_opened() {
        let tmp = tempdir().expect("tempdir");
        let seed = WorkbookDirectory::new();
        seed.insert(sample_book()).await;
        seed.save_to_dir(tmp.path()).await.expect("save");

        let ids = ["src-a".to_string()];
        let ours = WorkbookDirectory::load_from_dir(tmp.path(), &ids).await;
        let theirs = WorkbookDirectory::load_from_dir(tmp.path(), &ids).await;
        let held = ours.open("src-a").await.expect("open");

        theirs
            .open("src-a")
            .await
            .expect("open")
            .write_cell(7, 3, 2, "John".into())
            .await
            .expect("write");
        theirs.flush().await.expect("flush");

        assert_eq!(held.last_row(7).await.expect("last row"), 2);
        ours.reload().await.expect("reload");
        assert_eq!(held.last_row(7).await.expect("last row"), 3);
    }

    #[test]
    fn edit_event_ranges() {
        let mut event = EditEvent::single_cell("s", 0, 5, 2);
        assert_eq!(event.rows(), 5..=5);
        event.num_rows = 3;
        event.num_columns = 4;
        assert_eq!(event.rows(), 5..=7);
        assert_eq!(event.columns(), 2..=5);

        let huge = EditEvent {
            num_rows: usize::MAX,
            num_columns: usize::MAX,
            ..EditEvent::single_cell("s", 0, 3, 2)
        };
        assert_eq!(huge.rows(), 3..=usize::MAX);
        assert_eq!(huge.columns(), 2..=usize::MAX);
    }
}
