use std::fmt;

use thiserror::Error;

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemorySheetStore;
pub use sqlite::SqliteSheetStore;

pub type Row = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sheet {
    Roster,
    Attendance,
}

impl Sheet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sheet::Roster => "roster",
            Sheet::Attendance => "attendance",
        }
    }
}

impl fmt::Display for Sheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Row {position} out of range for sheet {sheet} ({len} rows)")]
    RowOutOfRange {
        sheet: Sheet,
        position: usize,
        len: usize,
    },

    #[error("Malformed row in sheet {sheet}: {message}")]
    MalformedRow { sheet: Sheet, message: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl SheetError {
    pub fn is_quota(&self) -> bool {
        matches!(self, SheetError::QuotaExceeded(_))
    }
}

impl From<sqlx::Error> for SheetError {
    fn from(error: sqlx::Error) -> Self {
        SheetError::Backend(format!("Database error: {}", error))
    }
}

/// A row-oriented table store with whole-sheet reads, single-row appends and
/// single-row deletes by position. Positions are zero-based over data rows and
/// shift down after every delete.
#[rocket::async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, SheetError>;

    async fn append_row(&self, sheet: Sheet, row: Row) -> Result<(), SheetError>;

    async fn delete_row(&self, sheet: Sheet, position: usize) -> Result<(), SheetError>;
}
