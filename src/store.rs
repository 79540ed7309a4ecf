use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cache::{AttendanceScope, TabularCache};
use crate::client::RateLimitedClient;
use crate::error::AppError;
use crate::models::{
    AttendanceRecord, AttendanceStatus, NO_REASON, RosterEntry, SlotId, format_date,
};
use crate::sheets::{Row, Sheet};

/// Result of applying one status to several subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BulkUpsert {
    Complete {
        records: usize,
        subjects: usize,
    },
    /// Subjects before `failed_subject` were written, the rest were not touched.
    Partial {
        records: usize,
        completed: Vec<String>,
        failed_subject: String,
        error: String,
    },
}

impl BulkUpsert {
    pub fn records(&self) -> usize {
        match self {
            BulkUpsert::Complete { records, .. } | BulkUpsert::Partial { records, .. } => *records,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, BulkUpsert::Complete { .. })
    }
}

/// Positions of rows holding any of the (date, slot, subject) keys, highest
/// first so an earlier delete never shifts a position still to be deleted.
pub fn plan_deletions(
    rows: &[Row],
    date: NaiveDate,
    slots: &BTreeSet<SlotId>,
    subject_name: &str,
) -> Vec<usize> {
    let date = format_date(date);
    let slots: Vec<String> = slots.iter().map(|s| s.to_string()).collect();

    let mut positions: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            slots
                .iter()
                .any(|slot| AttendanceRecord::row_matches_key(row, &date, slot, subject_name))
        })
        .map(|(position, _)| position)
        .collect();

    positions.sort_unstable_by(|a, b| b.cmp(a));
    positions
}

/// Upsert by (date, slot, subject) over a sheet that only appends and deletes.
pub struct AttendanceStore {
    client: Arc<RateLimitedClient>,
    cache: Arc<TabularCache>,
    group_id: String,
}

impl AttendanceStore {
    pub fn new(client: Arc<RateLimitedClient>, cache: Arc<TabularCache>, group_id: &str) -> Self {
        Self {
            client,
            cache,
            group_id: group_id.to_string(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Writes one record per slot for `subject_name`, replacing whatever was
    /// recorded under the same keys. Returns the number of records written.
    #[instrument(skip(self))]
    pub async fn upsert(
        &self,
        date: NaiveDate,
        slots: &BTreeSet<SlotId>,
        subject_name: &str,
        status: AttendanceStatus,
        reason: Option<&str>,
    ) -> Result<usize, AppError> {
        let reason = check_request(slots, status, reason)?;
        let mut mirror = self.client.list_attendance_rows().await?;

        let written = self
            .replace_subject(&mut mirror, date, slots, subject_name, status, reason)
            .await;
        self.invalidate(date, slots).await;

        let records = written.map_err(|(_, err)| err)?;
        info!(records, "Attendance saved");
        Ok(records)
    }

    /// Same as `upsert` for every subject in `subjects`, from a single sheet read.
    ///
    /// Not atomic across subjects: a failure stops the batch and the subjects
    /// already written are reported in `BulkUpsert::Partial`.
    #[instrument(skip(self, subjects), fields(subjects = subjects.len()))]
    pub async fn upsert_many(
        &self,
        date: NaiveDate,
        slots: &BTreeSet<SlotId>,
        subjects: &[String],
        status: AttendanceStatus,
        reason: Option<&str>,
    ) -> Result<BulkUpsert, AppError> {
        let reason = check_request(slots, status, reason)?;
        let mut mirror = self.client.list_attendance_rows().await?;
        let mut records = 0;
        let mut completed = Vec::with_capacity(subjects.len());

        for subject_name in subjects {
            let written = self
                .replace_subject(&mut mirror, date, slots, subject_name, status, reason)
                .await;

            match written {
                Ok(count) => {
                    records += count;
                    completed.push(subject_name.clone());
                }
                Err((count, err)) => {
                    records += count;
                    self.invalidate(date, slots).await;
                    warn!(
                        subject = %subject_name,
                        completed = completed.len(),
                        records,
                        error = %err,
                        "Batch stopped partway"
                    );
                    return Ok(BulkUpsert::Partial {
                        records,
                        completed,
                        failed_subject: subject_name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        self.invalidate(date, slots).await;
        info!(records, subjects = completed.len(), "Attendance saved");

        Ok(BulkUpsert::Complete {
            records,
            subjects: completed.len(),
        })
    }

    /// Deletes then appends against the local mirror of the sheet, keeping the
    /// mirror in step with every remote change. On failure returns how many
    /// records had already been appended.
    async fn replace_subject(
        &self,
        mirror: &mut Vec<Row>,
        date: NaiveDate,
        slots: &BTreeSet<SlotId>,
        subject_name: &str,
        status: AttendanceStatus,
        reason: Option<&str>,
    ) -> Result<usize, (usize, AppError)> {
        for position in plan_deletions(mirror, date, slots, subject_name) {
            self.client
                .delete_row_at(Sheet::Attendance, position)
                .await
                .map_err(|e| (0, AppError::from(e)))?;
            mirror.remove(position);
        }

        let mut appended = 0;
        for slot in slots {
            let record = AttendanceRecord {
                date,
                slot: *slot,
                group_id: self.group_id.clone(),
                subject_name: subject_name.to_string(),
                status,
                reason: reason.map(String::from),
                recorded_at: now_hhmm(),
            };
            let row = record.to_row();

            self.client
                .append_row(Sheet::Attendance, row.clone())
                .await
                .map_err(|e| (appended, AppError::from(e)))?;
            mirror.push(row);
            appended += 1;
        }

        Ok(appended)
    }

    async fn invalidate(&self, date: NaiveDate, slots: &BTreeSet<SlotId>) {
        for slot in slots {
            self.cache
                .invalidate_attendance(AttendanceScope::Key(date, *slot))
                .await;
        }
    }

    /// Adds a subject to the roster. Names are unique within the group; the
    /// check is a scan over a fresh read because the sheet enforces nothing.
    #[instrument(skip(self))]
    pub async fn add_subject(&self, name: &str) -> Result<RosterEntry, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Name cannot be empty".to_string()));
        }

        let rows = self.client.list_roster_rows().await?;
        let exists = rows
            .iter()
            .filter_map(|row| RosterEntry::from_row(row))
            .any(|entry| entry.subject_name == name);

        if exists {
            return Err(AppError::Validation(format!(
                "Subject '{}' is already on the roster",
                name
            )));
        }

        let entry = RosterEntry {
            group_id: self.group_id.clone(),
            subject_name: name.to_string(),
        };
        self.client.append_row(Sheet::Roster, entry.to_row()).await?;
        self.cache.invalidate_roster().await;

        info!(subject = %name, "Subject added");
        Ok(entry)
    }

    /// Every readable attendance record, straight from the sheet.
    #[instrument(skip(self))]
    pub async fn all_records(&self) -> Result<Vec<AttendanceRecord>, AppError> {
        let rows = self.client.list_attendance_rows().await?;
        Ok(rows
            .iter()
            .filter_map(|row| AttendanceRecord::from_row(row))
            .collect())
    }
}

fn check_request<'a>(
    slots: &BTreeSet<SlotId>,
    status: AttendanceStatus,
    reason: Option<&'a str>,
) -> Result<Option<&'a str>, AppError> {
    if slots.is_empty() {
        return Err(AppError::Validation("Select at least one slot".to_string()));
    }

    let reason = reason.map(str::trim).filter(|r| !r.is_empty() && *r != NO_REASON);
    if status.requires_reason() && reason.is_none() {
        return Err(AppError::Validation(format!(
            "Status '{}' needs a reason",
            status.label()
        )));
    }

    Ok(reason)
}

fn now_hhmm() -> NaiveTime {
    let now = Local::now().time();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now)
}
