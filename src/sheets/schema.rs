/// One table holds every sheet; `seq` gives the row order that positions refer to.
pub const CURRENT_SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS sheet_rows (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    sheet TEXT NOT NULL,
    cells TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_sheet_rows_sheet_seq ON sheet_rows (sheet, seq);
"#,
];
