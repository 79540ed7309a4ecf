use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::RateLimitConfig;
use crate::sheets::{Row, Sheet, SheetError, TabularStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListRosterRows,
    ListAttendanceRows,
    AppendRow(Sheet),
    DeleteRowAt(Sheet, usize),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ListRosterRows => write!(f, "list-roster-rows"),
            Operation::ListAttendanceRows => write!(f, "list-attendance-rows"),
            Operation::AppendRow(sheet) => write!(f, "append-row({})", sheet),
            Operation::DeleteRowAt(sheet, position) => {
                write!(f, "delete-row-at({}, {})", sheet, position)
            }
        }
    }
}

/// Every remote call goes through here. The quota is shared by the whole
/// credential, so there is one cursor for all operations and calls never overlap.
pub struct RateLimitedClient {
    store: Arc<dyn TabularStore>,
    config: RateLimitConfig,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub fn new(store: Arc<dyn TabularStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            last_call: Mutex::new(None),
        }
    }

    pub async fn list_roster_rows(&self) -> Result<Vec<Row>, SheetError> {
        self.call(Operation::ListRosterRows, || {
            self.store.read_all(Sheet::Roster)
        })
        .await
    }

    pub async fn list_attendance_rows(&self) -> Result<Vec<Row>, SheetError> {
        self.call(Operation::ListAttendanceRows, || {
            self.store.read_all(Sheet::Attendance)
        })
        .await
    }

    pub async fn append_row(&self, sheet: Sheet, row: Row) -> Result<(), SheetError> {
        self.call(Operation::AppendRow(sheet), || {
            self.store.append_row(sheet, row.clone())
        })
        .await
    }

    pub async fn delete_row_at(&self, sheet: Sheet, position: usize) -> Result<(), SheetError> {
        self.call(Operation::DeleteRowAt(sheet, position), || {
            self.store.delete_row(sheet, position)
        })
        .await
    }

    #[instrument(skip(self, operation, call), fields(operation = %operation))]
    async fn call<T, F, Fut>(&self, operation: Operation, call: F) -> Result<T, SheetError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SheetError>>,
    {
        // Held for the whole call, including backoff sleeps.
        let mut last_call = self.last_call.lock().await;
        let mut attempt = 0;

        loop {
            if let Some(previous) = *last_call {
                let ready_at = previous + self.config.min_interval;
                let now = Instant::now();
                if ready_at > now {
                    tokio::time::sleep(ready_at - now).await;
                }
            }

            let result = call().await;
            *last_call = Some(Instant::now());

            match result {
                Ok(value) => {
                    debug!(attempt, "Remote call succeeded");
                    return Ok(value);
                }
                Err(err) if err.is_quota() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Quota exceeded, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_quota() {
                        warn!(attempts = attempt + 1, "Quota retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
