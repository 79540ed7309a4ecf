use sqlx::{Pool, Row as _, Sqlite};
use tracing::{debug, instrument};

use super::schema::CURRENT_SCHEMA;
use super::{Row, Sheet, SheetError, TabularStore};

/// Sheets persisted in SQLite. Each row is stored as a JSON array of cells.
#[derive(Debug, Clone)]
pub struct SqliteSheetStore {
    pool: Pool<Sqlite>,
}

impl SqliteSheetStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    #[instrument(skip_all)]
    pub async fn ensure_schema(&self) -> Result<(), SheetError> {
        for statement in CURRENT_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Sheet schema ready");
        Ok(())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[rocket::async_trait]
impl TabularStore for SqliteSheetStore {
    #[instrument(skip(self))]
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, SheetError> {
        let rows = sqlx::query("SELECT cells FROM sheet_rows WHERE sheet = ? ORDER BY seq")
            .bind(sheet.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let cells: String = row.try_get("cells")?;
                serde_json::from_str::<Row>(&cells).map_err(|e| SheetError::MalformedRow {
                    sheet,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    #[instrument(skip(self, row))]
    async fn append_row(&self, sheet: Sheet, row: Row) -> Result<(), SheetError> {
        let cells = serde_json::to_string(&row).map_err(|e| SheetError::MalformedRow {
            sheet,
            message: e.to_string(),
        })?;

        sqlx::query("INSERT INTO sheet_rows (sheet, cells) VALUES (?, ?)")
            .bind(sheet.as_str())
            .bind(cells)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_row(&self, sheet: Sheet, position: usize) -> Result<(), SheetError> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT seq FROM sheet_rows WHERE sheet = ? ORDER BY seq LIMIT 1 OFFSET ?",
        )
        .bind(sheet.as_str())
        .bind(position as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(seq) = seq else {
            let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sheet_rows WHERE sheet = ?")
                .bind(sheet.as_str())
                .fetch_one(&self.pool)
                .await?;
            return Err(SheetError::RowOutOfRange {
                sheet,
                position,
                len: len as usize,
            });
        };

        sqlx::query("DELETE FROM sheet_rows WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
