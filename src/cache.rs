use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::client::RateLimitedClient;
use crate::clock::Clock;
use crate::error::AppError;
use crate::models::{AttendanceRecord, Mark, RosterEntry, SlotId};
use crate::sheets::Row;

pub type Marks = HashMap<String, Mark>;

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheState {
    roster: Option<Cached<Vec<RosterEntry>>>,
    attendance: HashMap<(NaiveDate, SlotId), Cached<Marks>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceScope {
    All,
    Date(NaiveDate),
    Key(NaiveDate, SlotId),
}

/// TTL cache over the roster and per-(date, slot) attendance marks.
///
/// An expired entry is refetched; if that refetch fails the expired value is
/// served instead, and the error only surfaces when nothing was cached before.
pub struct TabularCache {
    client: Arc<RateLimitedClient>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl TabularCache {
    pub fn new(client: Arc<RateLimitedClient>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            client,
            clock,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn is_fresh<T>(&self, entry: &Cached<T>, now: Instant) -> bool {
        now.saturating_duration_since(entry.fetched_at) < self.ttl
    }

    #[instrument(skip(self))]
    pub async fn get_roster(&self) -> Result<Vec<RosterEntry>, AppError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        if let Some(entry) = &state.roster {
            if self.is_fresh(entry, now) {
                return Ok(entry.value.clone());
            }
        }

        match self.client.list_roster_rows().await {
            Ok(rows) => {
                let roster = parse_roster(&rows);
                debug!(subjects = roster.len(), "Roster fetched");
                state.roster = Some(Cached {
                    value: roster.clone(),
                    fetched_at: self.clock.now(),
                });
                Ok(roster)
            }
            Err(err) => match &state.roster {
                Some(stale) => {
                    warn!(error = %err, "Roster fetch failed, serving stale roster");
                    Ok(stale.value.clone())
                }
                None => Err(err.into()),
            },
        }
    }

    pub async fn get_attendance(&self, date: NaiveDate, slot: SlotId) -> Result<Marks, AppError> {
        let mut marks = self
            .get_attendance_many(date, &BTreeSet::from([slot]))
            .await?;
        Ok(marks.remove(&slot).unwrap_or_default())
    }

    /// Marks for several slots of one date. Every missing or expired key is
    /// refreshed from the same sheet read.
    #[instrument(skip(self))]
    pub async fn get_attendance_many(
        &self,
        date: NaiveDate,
        slots: &BTreeSet<SlotId>,
    ) -> Result<HashMap<SlotId, Marks>, AppError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let stale_slots: Vec<SlotId> = slots
            .iter()
            .copied()
            .filter(|slot| {
                state
                    .attendance
                    .get(&(date, *slot))
                    .is_none_or(|entry| !self.is_fresh(entry, now))
            })
            .collect();

        if !stale_slots.is_empty() {
            match self.client.list_attendance_rows().await {
                Ok(rows) => {
                    let fetched_at = self.clock.now();
                    let mut fresh = group_marks(&rows, date, &stale_slots);
                    for slot in &stale_slots {
                        state.attendance.insert(
                            (date, *slot),
                            Cached {
                                value: fresh.remove(slot).unwrap_or_default(),
                                fetched_at,
                            },
                        );
                    }
                    debug!(refreshed = stale_slots.len(), "Attendance fetched");
                }
                Err(err) => {
                    let missing = stale_slots
                        .iter()
                        .any(|slot| !state.attendance.contains_key(&(date, *slot)));
                    if missing {
                        return Err(err.into());
                    }
                    warn!(error = %err, "Attendance fetch failed, serving stale marks");
                }
            }
        }

        Ok(slots
            .iter()
            .map(|slot| {
                let marks = state
                    .attendance
                    .get(&(date, *slot))
                    .map(|entry| entry.value.clone())
                    .unwrap_or_default();
                (*slot, marks)
            })
            .collect())
    }

    pub async fn invalidate_attendance(&self, scope: AttendanceScope) {
        let mut state = self.state.lock().await;
        match scope {
            AttendanceScope::All => state.attendance.clear(),
            AttendanceScope::Date(date) => state.attendance.retain(|(d, _), _| *d != date),
            AttendanceScope::Key(date, slot) => {
                state.attendance.remove(&(date, slot));
            }
        }
        debug!(?scope, "Attendance cache invalidated");
    }

    pub async fn invalidate_roster(&self) {
        self.state.lock().await.roster = None;
        debug!("Roster cache invalidated");
    }
}

fn parse_roster(rows: &[Row]) -> Vec<RosterEntry> {
    rows.iter().filter_map(|row| RosterEntry::from_row(row)).collect()
}

fn group_marks(rows: &[Row], date: NaiveDate, slots: &[SlotId]) -> HashMap<SlotId, Marks> {
    let mut grouped: HashMap<SlotId, Marks> = HashMap::new();

    for record in rows.iter().filter_map(|row| AttendanceRecord::from_row(row)) {
        if record.date == date && slots.contains(&record.slot) {
            grouped
                .entry(record.slot)
                .or_default()
                .insert(record.subject_name.clone(), record.mark());
        }
    }

    grouped
}
