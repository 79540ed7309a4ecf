#[cfg(test)]
pub mod test_utils {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveTime};
    use rocket::local::asynchronous::Client;

    use crate::clock::ManualClock;
    use crate::config::{AppConfig, DEFAULT_SLOT_TIMES, RateLimitConfig, SheetBackend};
    use crate::controller::{Action, MarkingController, View};
    use crate::models::{AttendanceRecord, AttendanceStatus, OperatorId, RosterEntry, SlotId};
    use crate::sheets::{MemorySheetStore, Row, Sheet, SheetError, TabularStore};
    use crate::telemetry::init_test_tracing;
    use crate::{Components, init_rocket};

    pub const GROUP: &str = "IT-21";

    pub fn date(day: u32, month: u32, year: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    pub fn slots(ids: &[SlotId]) -> std::collections::BTreeSet<SlotId> {
        ids.iter().copied().collect()
    }

    pub fn names(subjects: &[&str]) -> Vec<String> {
        subjects.iter().map(|s| s.to_string()).collect()
    }

    /// Config with no call spacing and instant backoff.
    pub fn test_config() -> AppConfig {
        AppConfig {
            group_id: GROUP.to_string(),
            backend: SheetBackend::Memory,
            database_url: "sqlite::memory:".to_string(),
            slots: DEFAULT_SLOT_TIMES.parse().unwrap(),
            rate_limit: RateLimitConfig {
                min_interval: Duration::ZERO,
                max_retries: 3,
                base_backoff: Duration::ZERO,
                backoff_factor: 2,
            },
            cache_ttl: Duration::from_secs(30),
            page_size: 10,
            session_idle_ttl: Duration::from_secs(3600),
            session_sweep_interval: Duration::from_secs(60),
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StoreCall {
        Read(Sheet),
        Append(Sheet),
        Delete(Sheet, usize),
    }

    #[derive(Default)]
    struct Faults {
        quota_errors: usize,
        appends_before_failure: Option<usize>,
        fail_reads: bool,
    }

    /// Memory sheets that log every call and fail on request.
    #[derive(Default)]
    pub struct RecordingStore {
        inner: MemorySheetStore,
        calls: Mutex<Vec<StoreCall>>,
        faults: Mutex<Faults>,
    }

    impl RecordingStore {
        pub fn new(inner: MemorySheetStore) -> Self {
            Self {
                inner,
                calls: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }
        }

        /// The next `count` calls of any kind fail with a quota error.
        pub fn quota_errors(&self, count: usize) {
            self.faults.lock().unwrap().quota_errors = count;
        }

        /// Attendance appends succeed `count` more times, then fail.
        pub fn fail_attendance_appends_after(&self, count: usize) {
            self.faults.lock().unwrap().appends_before_failure = Some(count);
        }

        pub fn fail_reads(&self, fail: bool) {
            self.faults.lock().unwrap().fail_reads = fail;
        }

        pub fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn reads(&self, sheet: Sheet) -> usize {
            self.calls()
                .iter()
                .filter(|c| **c == StoreCall::Read(sheet))
                .count()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        /// Rows as stored, without going through the log or the faults.
        pub async fn rows(&self, sheet: Sheet) -> Vec<Row> {
            self.inner.read_all(sheet).await.unwrap()
        }

        pub async fn records(&self) -> Vec<AttendanceRecord> {
            self.rows(Sheet::Attendance)
                .await
                .iter()
                .filter_map(|row| AttendanceRecord::from_row(row))
                .collect()
        }

        fn enter(&self, call: StoreCall) -> Result<(), SheetError> {
            self.calls.lock().unwrap().push(call.clone());
            let mut faults = self.faults.lock().unwrap();

            if faults.quota_errors > 0 {
                faults.quota_errors -= 1;
                return Err(SheetError::QuotaExceeded("Read requests per minute".to_string()));
            }

            match call {
                StoreCall::Read(_) if faults.fail_reads => {
                    Err(SheetError::Backend("Sheet unreachable".to_string()))
                }
                StoreCall::Append(Sheet::Attendance) => match faults.appends_before_failure {
                    Some(0) => Err(SheetError::Backend("Append rejected".to_string())),
                    Some(remaining) => {
                        faults.appends_before_failure = Some(remaining - 1);
                        Ok(())
                    }
                    None => Ok(()),
                },
                _ => Ok(()),
            }
        }
    }

    #[rocket::async_trait]
    impl TabularStore for RecordingStore {
        async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, SheetError> {
            self.enter(StoreCall::Read(sheet))?;
            self.inner.read_all(sheet).await
        }

        async fn append_row(&self, sheet: Sheet, row: Row) -> Result<(), SheetError> {
            self.enter(StoreCall::Append(sheet))?;
            self.inner.append_row(sheet, row).await
        }

        async fn delete_row(&self, sheet: Sheet, position: usize) -> Result<(), SheetError> {
            self.enter(StoreCall::Delete(sheet, position))?;
            self.inner.delete_row(sheet, position).await
        }
    }

    #[derive(Default)]
    pub struct TestSheetBuilder {
        roster: Vec<String>,
        attendance: Vec<Row>,
        page_size: Option<usize>,
        cache_ttl: Option<Duration>,
    }

    impl TestSheetBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn subject(mut self, name: &str) -> Self {
            self.roster.push(name.to_string());
            self
        }

        pub fn subjects(mut self, names: &[&str]) -> Self {
            self.roster.extend(names.iter().map(|n| n.to_string()));
            self
        }

        /// `Subject 01` .. `Subject NN`.
        pub fn numbered_subjects(mut self, count: usize) -> Self {
            self.roster
                .extend((1..=count).map(|i| format!("Subject {:02}", i)));
            self
        }

        pub fn record(
            mut self,
            date: NaiveDate,
            slot: SlotId,
            subject: &str,
            status: AttendanceStatus,
            reason: Option<&str>,
        ) -> Self {
            let record = AttendanceRecord {
                date,
                slot,
                group_id: GROUP.to_string(),
                subject_name: subject.to_string(),
                status,
                reason: reason.map(String::from),
                recorded_at: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            };
            self.attendance.push(record.to_row());
            self
        }

        pub fn raw_attendance_row(mut self, cells: &[&str]) -> Self {
            self.attendance
                .push(cells.iter().map(|c| c.to_string()).collect());
            self
        }

        pub fn page_size(mut self, size: usize) -> Self {
            self.page_size = Some(size);
            self
        }

        pub fn cache_ttl(mut self, ttl: Duration) -> Self {
            self.cache_ttl = Some(ttl);
            self
        }

        pub fn build_store(&self) -> RecordingStore {
            let roster = self
                .roster
                .iter()
                .map(|name| {
                    RosterEntry {
                        group_id: GROUP.to_string(),
                        subject_name: name.clone(),
                    }
                    .to_row()
                })
                .collect();

            RecordingStore::new(
                MemorySheetStore::new()
                    .with_sheet(Sheet::Roster, roster)
                    .with_sheet(Sheet::Attendance, self.attendance.clone()),
            )
        }

        pub fn build(self) -> TestHarness {
            init_test_tracing();

            let sheets = Arc::new(self.build_store());
            let clock = Arc::new(ManualClock::new());

            let mut config = test_config();
            if let Some(size) = self.page_size {
                config.page_size = size;
            }
            if let Some(ttl) = self.cache_ttl {
                config.cache_ttl = ttl;
            }

            let components = Components::new(config, sheets.clone(), clock.clone());

            TestHarness {
                sheets,
                clock,
                components,
            }
        }
    }

    pub struct TestHarness {
        pub sheets: Arc<RecordingStore>,
        pub clock: Arc<ManualClock>,
        pub components: Components,
    }

    impl TestHarness {
        pub fn controller(&self) -> &MarkingController {
            &self.components.controller
        }

        pub async fn act(&self, operator: OperatorId, action: Action) -> View {
            self.components
                .controller
                .handle(operator, action)
                .await
                .unwrap()
        }

        /// Selects `slots` and enters marking.
        pub async fn start_marking(&self, operator: OperatorId, slot_ids: &[SlotId]) -> View {
            for slot in slot_ids {
                self.act(operator, Action::ToggleSlot { slot: *slot }).await;
            }
            self.act(operator, Action::StartMarking).await
        }
    }

    pub fn standard_sheets() -> TestSheetBuilder {
        TestSheetBuilder::new().subjects(&["Alice Brown", "Boris Chen", "Carla Diaz"])
    }

    pub async fn setup_test_client(builder: TestSheetBuilder) -> (Client, Arc<RecordingStore>) {
        let harness = builder.build();
        let sheets = harness.sheets.clone();
        let rocket = init_rocket(harness.components);

        let client = Client::tracked(rocket)
            .await
            .expect("valid rocket instance");

        (client, sheets)
    }
}
