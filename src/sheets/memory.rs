use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Row, Sheet, SheetError, TabularStore};

/// Process-local sheets. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySheetStore {
    sheets: Mutex<HashMap<Sheet, Vec<Row>>>,
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, sheet: Sheet, rows: Vec<Row>) -> Self {
        if let Ok(sheets) = self.sheets.get_mut() {
            sheets.insert(sheet, rows);
        }
        self
    }

    fn sheets(&self) -> Result<MutexGuard<'_, HashMap<Sheet, Vec<Row>>>, SheetError> {
        self.sheets
            .lock()
            .map_err(|_| SheetError::Backend("Memory sheet lock poisoned".to_string()))
    }
}

#[rocket::async_trait]
impl TabularStore for MemorySheetStore {
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, SheetError> {
        Ok(self.sheets()?.get(&sheet).cloned().unwrap_or_default())
    }

    async fn append_row(&self, sheet: Sheet, row: Row) -> Result<(), SheetError> {
        self.sheets()?.entry(sheet).or_default().push(row);
        Ok(())
    }

    async fn delete_row(&self, sheet: Sheet, position: usize) -> Result<(), SheetError> {
        let mut sheets = self.sheets()?;
        let rows = sheets.entry(sheet).or_default();

        if position >= rows.len() {
            return Err(SheetError::RowOutOfRange {
                sheet,
                position,
                len: rows.len(),
            });
        }

        rows.remove(position);
        Ok(())
    }
}
