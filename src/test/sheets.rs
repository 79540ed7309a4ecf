#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::sheets::{MemorySheetStore, Row, Sheet, SheetError, SqliteSheetStore, TabularStore};

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    async fn sqlite_store() -> SqliteSheetStore {
        // One connection, otherwise every connection gets its own in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteSheetStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    async fn exercise_positions(store: &dyn TabularStore) {
        for name in ["a", "b", "c", "d"] {
            store
                .append_row(Sheet::Attendance, row(&["04.03.2024", "1", "IT-21", name]))
                .await
                .unwrap();
        }
        store
            .append_row(Sheet::Roster, row(&["IT-21", "Alice Brown"]))
            .await
            .unwrap();

        store.delete_row(Sheet::Attendance, 1).await.unwrap();
        store.delete_row(Sheet::Attendance, 2).await.unwrap();

        let remaining: Vec<String> = store
            .read_all(Sheet::Attendance)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r[3].clone())
            .collect();
        assert_eq!(remaining, vec!["a", "c"]);

        let roster = store.read_all(Sheet::Roster).await.unwrap();
        assert_eq!(roster, vec![row(&["IT-21", "Alice Brown"])]);

        let out_of_range = store.delete_row(Sheet::Attendance, 2).await;
        assert!(matches!(
            out_of_range,
            Err(SheetError::RowOutOfRange { position: 2, len: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_positions_shift_after_delete() {
        let store = MemorySheetStore::new();

        exercise_positions(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_positions_shift_after_delete() {
        let store = sqlite_store().await;

        exercise_positions(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_schema_is_idempotent() {
        let store = sqlite_store().await;
        store
            .append_row(Sheet::Roster, row(&["IT-21", "Boris Chen"]))
            .await
            .unwrap();

        store.ensure_schema().await.unwrap();

        assert_eq!(store.read_all(Sheet::Roster).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_rejects_malformed_cells() {
        let store = sqlite_store().await;
        sqlx::query("INSERT INTO sheet_rows (sheet, cells) VALUES ('roster', 'not json')")
            .execute(store.pool())
            .await
            .unwrap();

        let result = store.read_all(Sheet::Roster).await;

        assert!(matches!(
            result,
            Err(SheetError::MalformedRow {
                sheet: Sheet::Roster,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cells_keep_unicode_and_empty_values() {
        let store = sqlite_store().await;
        let cells = row(&["04.03.2024", "1", "IT-21", "Łukasz Żak", "Sick", "", "08:05"]);

        store
            .append_row(Sheet::Attendance, cells.clone())
            .await
            .unwrap();

        assert_eq!(store.read_all(Sheet::Attendance).await.unwrap(), vec![cells]);
    }
}
