//! Core domain model, date normalization, and composite keys for MRC.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrc-core";

/// Host identifier of a table (sheet) inside a source workbook.
pub type TableId = u64;

/// Header names shared by source tables and the master table.
pub mod columns {
    pub const DATE: &str = "DATE";
    pub const TEST_TYPE: &str = "TEST TYPE";
    pub const FIRST_NAME: &str = "FIRST NAME";
    pub const LAST_NAME: &str = "LAST NAME";
    pub const DOB: &str = "DOB";
    pub const ZIP_CODE: &str = "ZIP CODE";
    pub const MASTER_UUID: &str = "MASTER_UUID";
    pub const POTENTIAL_DUPLICATES: &str = "POTENTIAL_DUPLICATES";
    pub const SHEET: &str = "SHEET";
    pub const SHEET_LINK: &str = "SHEET LINK TO ROW";
    pub const LAB: &str = "LAB (SHEET NAME)";
    pub const GROUP: &str = "GROUP (FILE NAME)";

    /// Fields extracted from every source row.
    pub const SOURCE_FIELDS: [&str; 6] = [DATE, TEST_TYPE, FIRST_NAME, LAST_NAME, DOB, ZIP_CODE];

    /// Fields a batch-imported row must carry.
    pub const MANDATORY: [&str; 4] = [DATE, FIRST_NAME, LAST_NAME, DOB];

    /// Columns whose edits trigger a sync.
    pub const RELEVANT: [&str; 8] = [
        DATE,
        TEST_TYPE,
        FIRST_NAME,
        LAST_NAME,
        DOB,
        ZIP_CODE,
        MASTER_UUID,
        POTENTIAL_DUPLICATES,
    ];

    pub const MASTER: [&str; 12] = [
        DATE,
        TEST_TYPE,
        FIRST_NAME,
        LAST_NAME,
        DOB,
        ZIP_CODE,
        SHEET,
        SHEET_LINK,
        LAB,
        GROUP,
        MASTER_UUID,
        POTENTIAL_DUPLICATES,
    ];

    pub const DUPLICATE_SUMMARY: [&str; 5] = [FIRST_NAME, LAST_NAME, DOB, "COUNT", "LINKS"];
}

/// A single cell as delivered by a table provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Trimmed textual rendering used for names, zip codes and raw log values.
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::DateTime(dt) => dt.to_rfc3339(),
            CellValue::Text(s) => s.trim().to_string(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        CellValue::Date(value)
    }
}

/// Timezone and reference day used when resolving calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateContext {
    pub offset: FixedOffset,
    pub today: NaiveDate,
}

impl DateContext {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            today: Utc::now().with_timezone(&offset).date_naive(),
        }
    }

    pub fn with_today(offset: FixedOffset, today: NaiveDate) -> Self {
        Self { offset, today }
    }

    pub fn utc_today(today: NaiveDate) -> Self {
        Self::with_today(Utc.fix(), today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateResolution {
    Missing,
    Unparsed(String),
    Date(NaiveDate),
}

impl DateResolution {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            DateResolution::Date(d) => Some(*d),
            _ => None,
        }
    }
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{1,2})$").expect("valid regex"))
}

fn month_day_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2,4})$").expect("valid regex"))
}

// Spreadsheet serial day 0.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
const MAX_SERIAL_DAY: f64 = 2_958_465.0;

/// Resolve a raw cell into a calendar date in the master timezone.
pub fn normalize_date(value: &CellValue, ctx: &DateContext) -> DateResolution {
    match value {
        CellValue::Empty => DateResolution::Missing,
        CellValue::Date(d) => DateResolution::Date(*d),
        CellValue::DateTime(dt) => DateResolution::Date(dt.with_timezone(&ctx.offset).date_naive()),
        CellValue::Number(n) => match serial_to_date(*n) {
            Some(d) => DateResolution::Date(d),
            None => DateResolution::Unparsed(value.to_text()),
        },
        CellValue::Text(raw) => {
            let s = raw.trim();
            if s.is_empty() {
                return DateResolution::Missing;
            }
            match parse_date_text(s, ctx) {
                Some(d) => DateResolution::Date(d),
                None => DateResolution::Unparsed(s.to_string()),
            }
        }
    }
}

fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_SERIAL_DAY {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(serial.floor() as u64))
}

fn parse_date_text(s: &str, ctx: &DateContext) -> Option<NaiveDate> {
    if let Some(caps) = month_day_re().captures(s) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let year = ctx.today.year();
        // No rollover into the next month: 2/29 outside a leap year is unparsed,
        // the same as impossible dates in the other forms.
        let candidate = NaiveDate::from_ymd_opt(year, month, day)?;
        if candidate > ctx.today {
            return NaiveDate::from_ymd_opt(year - 1, month, day);
        }
        return Some(candidate);
    }

    if let Some(caps) = month_day_year_re().captures(s) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let mut year: i32 = caps[3].parse().ok()?;
        if year < 100 {
            year += if year >= 70 { 1900 } else { 2000 };
        }
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&ctx.offset).date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Date,
    Dob,
}

impl fmt::Display for DateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateField::Date => f.write_str(columns::DATE),
            DateField::Dob => f.write_str(columns::DOB),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyBuildError {
    #[error("{0} is missing")]
    Missing(DateField),
    #[error("{field} could not be parsed from {raw:?}")]
    Unparsed { field: DateField, raw: String },
}

/// Key used to recognise a row that is already present in the master table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportKey(String);

impl ImportKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad key (name + date of birth) that groups likely-identical people.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub first: String,
    pub last: String,
    pub dob: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.first, self.last, self.dob)
    }
}

pub fn normalize_name(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Builds import and duplicate-group keys against one date context.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    ctx: DateContext,
}

impl KeyBuilder {
    pub fn new(ctx: DateContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &DateContext {
        &self.ctx
    }

    pub fn resolve_date(&self, value: &CellValue) -> DateResolution {
        normalize_date(value, &self.ctx)
    }

    fn require_date(&self, field: DateField, value: &CellValue) -> Result<NaiveDate, KeyBuildError> {
        match self.resolve_date(value) {
            DateResolution::Date(d) => Ok(d),
            DateResolution::Missing => Err(KeyBuildError::Missing(field)),
            DateResolution::Unparsed(raw) => Err(KeyBuildError::Unparsed { field, raw }),
        }
    }

    pub fn import_key(
        &self,
        date: &CellValue,
        first: &str,
        last: &str,
        dob: &CellValue,
        zip: &str,
    ) -> Result<ImportKey, KeyBuildError> {
        let date = self.require_date(DateField::Date, date)?;
        let dob = self.require_date(DateField::Dob, dob)?;
        Ok(ImportKey(format!(
            "{}|{}|{}|{}|{}",
            date.format("%Y-%m-%d"),
            normalize_name(first),
            normalize_name(last),
            dob.format("%Y-%m-%d"),
            zip.trim()
        )))
    }

    /// `None` when any of first name, last name or date of birth is empty.
    pub fn group_key(&self, first: &str, last: &str, dob: &CellValue) -> Option<GroupKey> {
        let first = normalize_name(first);
        let last = normalize_name(last);
        let dob = match self.resolve_date(dob) {
            DateResolution::Date(d) => d.format("%Y-%m-%d").to_string(),
            DateResolution::Unparsed(raw) => raw,
            DateResolution::Missing => return None,
        };
        if first.is_empty() || last.is_empty() {
            return None;
        }
        Some(GroupKey { first, last, dob })
    }
}

/// 1-based column number to spreadsheet letters (`1` → `A`, `27` → `AA`).
pub fn column_letter(column: usize) -> String {
    let mut n = column;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - rem - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn file_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("valid regex"))
}

fn gid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&#]gid=(\d+)").expect("valid regex"))
}

fn range_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)range=[A-Z]+(\d+)").expect("valid regex"))
}

fn canonical_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+)\|(\d+)\|(\d+)$").expect("valid regex"))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn strip_invisible(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                *c,
                '\u{200B}'..='\u{200F}'
                    | '\u{2028}'..='\u{202F}'
                    | '\u{2060}'..='\u{206F}'
                    | '\u{FEFF}'
                    | '\u{00A0}'
                    | '\u{FFFD}'
            )
        })
        .collect()
}

/// Canonical back-reference from a master row to the source row it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkToken {
    pub source_id: String,
    pub table_id: TableId,
    pub row: usize,
}

impl LinkToken {
    pub fn new(source_id: impl Into<String>, table_id: TableId, row: usize) -> Self {
        Self {
            source_id: source_id.into(),
            table_id,
            row,
        }
    }

    /// `source|table|row`, the form used for equality across encodings.
    pub fn canonical(&self) -> String {
        format!("{}|{}|{}", self.source_id, self.table_id, self.row)
    }

    pub fn to_url(&self, base: &str, last_column: usize) -> String {
        let last = column_letter(last_column.max(1));
        format!(
            "{}/d/{}/edit#gid={}&range=A{row}%3A{last}{row}",
            base.trim_end_matches('/'),
            self.source_id,
            self.table_id,
            row = self.row,
        )
    }

    /// Accepts a canonical token or a row URL in any encoding / parameter order.
    pub fn parse(input: &str) -> Option<Self> {
        let mut s = strip_invisible(input.trim());
        if let Some(caps) = canonical_token_re().captures(&s) {
            return Some(Self::new(&caps[1], caps[2].parse().ok()?, caps[3].parse().ok()?));
        }
        for _ in 0..4 {
            let decoded = percent_decode(&s);
            if decoded == s {
                break;
            }
            s = decoded;
        }
        let source_id = file_id_re().captures(&s)?[1].to_string();
        let table_id = gid_re().captures(&s)?[1].parse().ok()?;
        let row = range_row_re().captures(&s)?[1].parse().ok()?;
        Some(Self::new(source_id, table_id, row))
    }
}

impl fmt::Display for LinkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// What a source row's identity cell holds. A malformed value still counts
/// as present: it names a master row that cannot exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum SourceIdentity {
    #[default]
    Absent,
    Valid(Uuid),
    Malformed(String),
}

impl SourceIdentity {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return SourceIdentity::Absent;
        }
        match Uuid::parse_str(text) {
            Ok(uuid) => SourceIdentity::Valid(uuid),
            Err(_) => SourceIdentity::Malformed(text.to_string()),
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            SourceIdentity::Valid(uuid) => Some(*uuid),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, SourceIdentity::Absent)
    }
}

/// One logical record as it exists in a source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub file_name: String,
    pub table_id: TableId,
    pub sheet_name: String,
    pub row: usize,
    pub date: CellValue,
    pub test_type: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: CellValue,
    pub zip: String,
    pub identity: SourceIdentity,
    pub potential_duplicates: String,
}

impl SourceRecord {
    pub fn link_token(&self) -> LinkToken {
        LinkToken::new(&self.source_id, self.table_id, self.row)
    }

    /// True if any extracted field carries a value.
    pub fn has_any_field(&self) -> bool {
        !self.date.is_blank()
            || !self.dob.is_blank()
            || [&self.test_type, &self.first_name, &self.last_name, &self.zip]
                .iter()
                .any(|s| !s.trim().is_empty())
    }

    pub fn extracted_values(&self) -> serde_json::Value {
        serde_json::json!({
            columns::DATE: self.date.to_text(),
            columns::TEST_TYPE: self.test_type,
            columns::FIRST_NAME: self.first_name,
            columns::LAST_NAME: self.last_name,
            columns::DOB: self.dob.to_text(),
            columns::ZIP_CODE: self.zip,
        })
    }
}

/// The canonical merged record held by the master table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub date: CellValue,
    pub test_type: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: CellValue,
    pub zip: String,
    pub source_id: String,
    pub link_token: Option<LinkToken>,
    pub sheet_name: String,
    pub file_name: String,
    pub master_uuid: Uuid,
    #[serde(default)]
    pub potential_duplicates: String,
}

impl MasterRecord {
    /// Dates that resolve are stored as calendar dates; anything else keeps its raw form.
    pub fn from_source(source: &SourceRecord, master_uuid: Uuid, ctx: &DateContext) -> Self {
        let resolve = |value: &CellValue| match normalize_date(value, ctx) {
            DateResolution::Date(d) => CellValue::Date(d),
            _ => value.clone(),
        };
        Self {
            date: resolve(&source.date),
            test_type: source.test_type.trim().to_string(),
            first_name: source.first_name.trim().to_string(),
            last_name: source.last_name.trim().to_string(),
            dob: resolve(&source.dob),
            zip: source.zip.trim().to_string(),
            source_id: source.source_id.clone(),
            link_token: Some(source.link_token()),
            sheet_name: source.sheet_name.clone(),
            file_name: source.file_name.clone(),
            master_uuid,
            potential_duplicates: String::new(),
        }
    }

    /// Human-readable reference to this record at the given master row.
    pub fn label(&self, master_row: usize) -> String {
        format!("{} ({}) Row {}", self.file_name, self.sheet_name, master_row)
    }

    pub fn values(&self) -> serde_json::Value {
        serde_json::json!({
            columns::DATE: self.date.to_text(),
            columns::TEST_TYPE: self.test_type,
            columns::FIRST_NAME: self.first_name,
            columns::LAST_NAME: self.last_name,
            columns::DOB: self.dob.to_text(),
            columns::ZIP_CODE: self.zip,
            columns::SHEET: self.source_id,
            columns::SHEET_LINK: self.link_token.as_ref().map(LinkToken::canonical),
            columns::LAB: self.sheet_name,
            columns::GROUP: self.file_name,
            columns::MASTER_UUID: self.master_uuid.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonCode {
    MissingFields(Vec<String>),
    NoData,
    CouldNotBuildKey,
    ErrorOpeningSpreadsheet(String),
    PotentialDuplicate,
    SyncError(String),
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::MissingFields(fields) => write!(f, "missing_fields: {}", fields.join(",")),
            ReasonCode::NoData => f.write_str("no_data"),
            ReasonCode::CouldNotBuildKey => f.write_str("could_not_build_key"),
            ReasonCode::ErrorOpeningSpreadsheet(msg) => write!(f, "error_opening_spreadsheet: {msg}"),
            ReasonCode::PotentialDuplicate => f.write_str("potential_duplicate"),
            ReasonCode::SyncError(msg) => write!(f, "sync_error: {msg}"),
        }
    }
}

pub const SYSTEM_USER: &str = "system";

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub source_id: String,
    pub sheet_name: String,
    pub row_number: Option<usize>,
    pub original_values: serde_json::Value,
    pub link: Option<String>,
    #[serde(default)]
    pub duplicate_refs: Vec<String>,
    pub triggered_by: String,
}

impl LogEntry {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            source_id: String::new(),
            sheet_name: String::new(),
            row_number: None,
            original_values: serde_json::Value::Null,
            link: None,
            duplicate_refs: Vec::new(),
            triggered_by: SYSTEM_USER.to_string(),
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self.sheet_name = sheet_name.into();
        self
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row_number = Some(row);
        self
    }

    pub fn with_values(mut self, values: serde_json::Value) -> Self {
        self.original_values = values;
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_duplicates(mut self, refs: Vec<String>) -> Self {
        self.duplicate_refs = refs;
        self
    }

    pub fn triggered_by(mut self, user: impl Into<String>) -> Self {
        self.triggered_by = user.into();
        self
    }
}
