//! Positional row schemas
//!
//! The row store speaks in rows of string cells plus a header row. Each
//! dataset has a typed [`Record`] that decodes cells by column *name*,
//! resolved once per scan into a [`HeaderIndex`], so column order in the
//! store does not matter.

use crate::{
    AccountingDetails, AccountingMasterItem, ClassroomType, DatasetKind, Lesson, LessonId,
    Reservation, ReservationId, ReservationStatus, SchemaError, Student, StudentId, TimeRange,
    TimeWindows, Timestamp,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Date cell format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time cell format. Seconds are accepted on input but never written.
pub const TIME_FORMAT: &str = "%H:%M";

// ============================================================================
// ROW SETS
// ============================================================================

/// Header plus rows, as returned by a full row store scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A row that failed to decode during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// Zero-based index into [`RowSet::rows`]
    pub row_index: usize,
    pub error: SchemaError,
}

/// Result of decoding a [`RowSet`] into typed records.
#[derive(Debug, Clone)]
pub struct Decoded<R> {
    pub records: Vec<R>,
    pub rejected: Vec<RejectedRow>,
}

impl RowSet {
    /// Empty row set with the canonical header of `R`.
    pub fn for_record<R: Record>() -> Self {
        Self {
            header: R::columns().iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Decode every row.
    ///
    /// A header missing a required column fails the whole decode. Individual
    /// rows that fail are collected in `rejected`; fully blank rows are skipped.
    pub fn decode<R: Record>(&self) -> Result<Decoded<R>, SchemaError> {
        let index = HeaderIndex::new(R::DATASET, &self.header);
        index.require_all(R::columns())?;

        let mut records = Vec::with_capacity(self.rows.len());
        let mut rejected = Vec::new();
        for (row_index, row) in self.rows.iter().enumerate() {
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            match R::from_row(&index, row) {
                Ok(record) => records.push(record),
                Err(error) => rejected.push(RejectedRow { row_index, error }),
            }
        }
        Ok(Decoded { records, rejected })
    }
}

// ============================================================================
// HEADER INDEX
// ============================================================================

/// Column name to position map for one dataset's header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderIndex {
    dataset: DatasetKind,
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    /// Build from a header row. Names are trimmed; the first occurrence wins.
    pub fn new(dataset: DatasetKind, header: &[String]) -> Self {
        let mut positions = HashMap::with_capacity(header.len());
        for (i, name) in header.iter().enumerate() {
            positions.entry(name.trim().to_string()).or_insert(i);
        }
        Self { dataset, positions }
    }

    /// Index matching the order of [`Record::to_row`].
    pub fn canonical<R: Record>() -> Self {
        let positions = R::columns()
            .iter()
            .enumerate()
            .map(|(i, c)| (c.to_string(), i))
            .collect();
        Self {
            dataset: R::DATASET,
            positions,
        }
    }

    pub fn dataset(&self) -> DatasetKind {
        self.dataset
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn require_all(&self, columns: &[&str]) -> Result<(), SchemaError> {
        match columns.iter().find(|c| !self.positions.contains_key(**c)) {
            Some(missing) => Err(SchemaError::MissingColumn {
                dataset: self.dataset,
                column: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Trimmed cell text. Ragged rows read as empty cells.
    pub fn cell<'a>(&self, row: &'a [String], column: &str) -> Result<&'a str, SchemaError> {
        let position = self
            .position(column)
            .ok_or_else(|| SchemaError::MissingColumn {
                dataset: self.dataset,
                column: column.to_string(),
            })?;
        Ok(row.get(position).map(|c| c.trim()).unwrap_or(""))
    }

    pub fn required<'a>(&self, row: &'a [String], column: &str) -> Result<&'a str, SchemaError> {
        let value = self.cell(row, column)?;
        if value.is_empty() {
            return Err(self.invalid(column, value, "required value is empty"));
        }
        Ok(value)
    }

    pub fn optional(&self, row: &[String], column: &str) -> Result<Option<String>, SchemaError> {
        let value = self.cell(row, column)?;
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    pub fn parse<T>(&self, row: &[String], column: &str) -> Result<T, SchemaError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.required(row, column)?;
        value
            .parse()
            .map_err(|e: T::Err| self.invalid(column, value, &e.to_string()))
    }

    pub fn parse_optional<T>(&self, row: &[String], column: &str) -> Result<Option<T>, SchemaError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.cell(row, column)?;
        if value.is_empty() {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| self.invalid(column, value, &e.to_string()))
    }

    /// Parse, treating malformed values as absent. Used for schedule
    /// configuration, where bad input falls back instead of rejecting the row.
    pub fn parse_lenient<T: FromStr>(&self, row: &[String], column: &str) -> Result<Option<T>, SchemaError> {
        Ok(self.cell(row, column)?.parse().ok())
    }

    pub fn date(&self, row: &[String], column: &str) -> Result<NaiveDate, SchemaError> {
        let value = self.required(row, column)?;
        NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map_err(|e| self.invalid(column, value, &e.to_string()))
    }

    pub fn time_optional(&self, row: &[String], column: &str) -> Result<Option<NaiveTime>, SchemaError> {
        let value = self.cell(row, column)?;
        if value.is_empty() {
            return Ok(None);
        }
        parse_time(value)
            .map(Some)
            .ok_or_else(|| self.invalid(column, value, "expected HH:MM"))
    }

    pub fn time_lenient(&self, row: &[String], column: &str) -> Result<Option<NaiveTime>, SchemaError> {
        Ok(parse_time(self.cell(row, column)?))
    }

    pub fn timestamp(&self, row: &[String], column: &str) -> Result<Timestamp, SchemaError> {
        let value = self.required(row, column)?;
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| self.invalid(column, value, &e.to_string()))
    }

    /// Boolean flag; blank reads as false.
    pub fn flag(&self, row: &[String], column: &str) -> Result<bool, SchemaError> {
        let value = self.cell(row, column)?;
        match value.to_ascii_lowercase().as_str() {
            "" | "false" | "no" | "0" => Ok(false),
            "true" | "yes" | "1" => Ok(true),
            _ => Err(self.invalid(column, value, "expected true or false")),
        }
    }

    pub fn invalid(&self, column: &str, value: &str, reason: &str) -> SchemaError {
        SchemaError::InvalidCell {
            dataset: self.dataset,
            column: column.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

fn fmt_time(time: Option<NaiveTime>) -> String {
    time.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn fmt_optional<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

// ============================================================================
// RECORD TRAIT
// ============================================================================

/// A typed row of one dataset.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Primary key type.
    type Id: Clone + Eq + fmt::Display + Send + Sync;

    const DATASET: DatasetKind;

    /// Bumped whenever the column set changes; cached snapshots written
    /// under another schema version are ignored.
    const SCHEMA_VERSION: u32;

    /// Canonical header, primary key first.
    fn columns() -> &'static [&'static str];

    fn row_id(&self) -> Self::Id;

    fn from_row(header: &HeaderIndex, row: &[String]) -> Result<Self, SchemaError>;

    /// Encode in [`Record::columns`] order.
    fn to_row(&self) -> Vec<String>;

    fn id_column() -> &'static str {
        Self::columns().first().copied().unwrap_or_default()
    }

    /// Patch a single column by name, with the same parsing as a scan.
    fn set_column(&mut self, column: &str, value: &str) -> Result<(), SchemaError> {
        let position = Self::columns()
            .iter()
            .position(|c| *c == column)
            .ok_or_else(|| SchemaError::UnknownColumn {
                dataset: Self::DATASET,
                column: column.to_string(),
            })?;
        if column == Self::id_column() {
            return Err(SchemaError::InvalidCell {
                dataset: Self::DATASET,
                column: column.to_string(),
                value: value.to_string(),
                reason: "primary key cannot be patched".to_string(),
            });
        }

        let mut row = self.to_row();
        if let Some(cell) = row.get_mut(position) {
            *cell = value.to_string();
        }
        *self = Self::from_row(&HeaderIndex::canonical::<Self>(), &row)?;
        Ok(())
    }
}

/// Records that carry a reservation lifecycle status.
pub trait StatusRecord: Record {
    fn status(&self) -> ReservationStatus;
    fn set_status(&mut self, status: ReservationStatus);
}

// ============================================================================
// RESERVATIONS
// ============================================================================

impl Record for Reservation {
    type Id = ReservationId;
    const DATASET: DatasetKind = DatasetKind::Reservations;
    const SCHEMA_VERSION: u32 = 1;

    fn columns() -> &'static [&'static str] {
        &[
            "reservation_id",
            "lesson_id",
            "student_id",
            "date",
            "classroom",
            "start_time",
            "end_time",
            "status",
            "first_lecture",
            "created_at",
            "notes",
            "accounting",
        ]
    }

    fn row_id(&self) -> ReservationId {
        self.reservation_id
    }

    fn from_row(h: &HeaderIndex, row: &[String]) -> Result<Self, SchemaError> {
        let accounting = match h.cell(row, "accounting")? {
            "" => None,
            raw => Some(
                serde_json::from_str::<AccountingDetails>(raw)
                    .map_err(|e| h.invalid("accounting", raw, &e.to_string()))?,
            ),
        };

        Ok(Reservation {
            reservation_id: h.parse(row, "reservation_id")?,
            lesson_id: h.parse(row, "lesson_id")?,
            student_id: h.parse(row, "student_id")?,
            date: h.date(row, "date")?,
            classroom: h.required(row, "classroom")?.to_string(),
            start_time: h.time_optional(row, "start_time")?,
            end_time: h.time_optional(row, "end_time")?,
            status: h.parse(row, "status")?,
            first_lecture: h.flag(row, "first_lecture")?,
            created_at: h.timestamp(row, "created_at")?,
            notes: h.optional(row, "notes")?,
            accounting,
        })
    }

    fn to_row(&self) -> Vec<String> {
        let accounting = self
            .accounting
            .as_ref()
            .and_then(|a| serde_json::to_string(a).ok())
            .unwrap_or_default();
        vec![
            self.reservation_id.to_string(),
            self.lesson_id.to_string(),
            self.student_id.to_string(),
            fmt_date(self.date),
            self.classroom.clone(),
            fmt_time(self.start_time),
            fmt_time(self.end_time),
            self.status.as_db_str().to_string(),
            self.first_lecture.to_string(),
            self.created_at.to_rfc3339(),
            fmt_optional(&self.notes),
            accounting,
        ]
    }
}

impl StatusRecord for Reservation {
    fn status(&self) -> ReservationStatus {
        self.status
    }

    fn set_status(&mut self, status: ReservationStatus) {
        self.status = status;
    }
}

// ============================================================================
// SCHEDULE
// ============================================================================

impl Record for Lesson {
    type Id = LessonId;
    const DATASET: DatasetKind = DatasetKind::Schedule;
    const SCHEMA_VERSION: u32 = 1;

    fn columns() -> &'static [&'static str] {
        &[
            "lesson_id",
            "date",
            "classroom",
            "classroom_type",
            "venue",
            "first_start",
            "first_end",
            "second_start",
            "second_end",
            "beginner_start",
            "total_capacity",
            "beginner_capacity",
            "reservation_ids",
        ]
    }

    fn row_id(&self) -> LessonId {
        self.lesson_id
    }

    fn from_row(h: &HeaderIndex, row: &[String]) -> Result<Self, SchemaError> {
        let window = |start: &str, end: &str| -> Result<Option<TimeRange>, SchemaError> {
            Ok(match (h.time_lenient(row, start)?, h.time_lenient(row, end)?) {
                (Some(s), Some(e)) => TimeRange::new(s, e),
                _ => None,
            })
        };

        let classroom_type = match h.cell(row, "classroom_type")? {
            "" => ClassroomType::default(),
            raw => raw
                .parse()
                .map_err(|e: String| h.invalid("classroom_type", raw, &e))?,
        };

        let ids_cell = h.cell(row, "reservation_ids")?;
        let reservation_ids = ids_cell
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<ReservationId>()
                    .map_err(|e| h.invalid("reservation_ids", s, &e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Lesson {
            lesson_id: h.parse(row, "lesson_id")?,
            date: h.date(row, "date")?,
            classroom: h.required(row, "classroom")?.to_string(),
            classroom_type,
            venue: h.optional(row, "venue")?,
            time_windows: TimeWindows {
                first: window("first_start", "first_end")?,
                second: window("second_start", "second_end")?,
                beginner_start: h.time_lenient(row, "beginner_start")?,
            },
            total_capacity: h.parse(row, "total_capacity")?,
            beginner_capacity: h.parse_lenient(row, "beginner_capacity")?,
            reservation_ids,
        })
    }

    fn to_row(&self) -> Vec<String> {
        let windows = &self.time_windows;
        let ids = self
            .reservation_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            self.lesson_id.to_string(),
            fmt_date(self.date),
            self.classroom.clone(),
            self.classroom_type.to_string(),
            fmt_optional(&self.venue),
            fmt_time(windows.first.map(|w| w.start)),
            fmt_time(windows.first.map(|w| w.end)),
            fmt_time(windows.second.map(|w| w.start)),
            fmt_time(windows.second.map(|w| w.end)),
            fmt_time(windows.beginner_start),
            self.total_capacity.to_string(),
            fmt_optional(&self.beginner_capacity),
            ids,
        ]
    }
}

// ============================================================================
// ROSTER & ACCOUNTING MASTER
// ============================================================================

impl Record for Student {
    type Id = StudentId;
    const DATASET: DatasetKind = DatasetKind::Roster;
    const SCHEMA_VERSION: u32 = 1;

    fn columns() -> &'static [&'static str] {
        &["student_id", "name", "contact"]
    }

    fn row_id(&self) -> StudentId {
        self.student_id
    }

    fn from_row(h: &HeaderIndex, row: &[String]) -> Result<Self, SchemaError> {
        Ok(Student {
            student_id: h.parse(row, "student_id")?,
            name: h.required(row, "name")?.to_string(),
            contact: h.optional(row, "contact")?,
        })
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.student_id.to_string(),
            self.name.clone(),
            fmt_optional(&self.contact),
        ]
    }
}

impl Record for AccountingMasterItem {
    type Id = String;
    const DATASET: DatasetKind = DatasetKind::AccountingMaster;
    const SCHEMA_VERSION: u32 = 1;

    fn columns() -> &'static [&'static str] {
        &["item_code", "item_name", "unit_price", "item_type"]
    }

    fn row_id(&self) -> String {
        self.item_code.clone()
    }

    fn from_row(h: &HeaderIndex, row: &[String]) -> Result<Self, SchemaError> {
        Ok(AccountingMasterItem {
            item_code: h.required(row, "item_code")?.to_string(),
            item_name: h.required(row, "item_name")?.to_string(),
            unit_price: h.parse(row, "unit_price")?,
            item_type: h.cell(row, "item_type")?.to_string(),
        })
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.item_code.clone(),
            self.item_name.clone(),
            self.unit_price.to_string(),
            self.item_type.clone(),
        ]
    }
}

// =============================================================================
// TESTS
// =============================================================================
