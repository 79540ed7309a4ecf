use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::config::SlotTable;
use crate::models::{AttendanceStatus, NO_REASON, OperatorId, SlotId};

/// Status waiting for the operator's free-text reason. Subjects are resolved
/// by name when the prompt opens so later roster changes cannot retarget it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReason {
    pub subjects: Vec<String>,
    pub status: AttendanceStatus,
    pub whole_roster: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    DateSelecting,
    SlotSelecting,
    Marking,
    AwaitingReason(PendingReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Idle,
    DateSelecting,
    SlotSelecting,
    Marking,
    AwaitingReason,
}

impl SessionPhase {
    pub fn name(&self) -> PhaseName {
        match self {
            SessionPhase::Idle => PhaseName::Idle,
            SessionPhase::DateSelecting => PhaseName::DateSelecting,
            SessionPhase::SlotSelecting => PhaseName::SlotSelecting,
            SessionPhase::Marking => PhaseName::Marking,
            SessionPhase::AwaitingReason(_) => PhaseName::AwaitingReason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Select at least one slot before marking")]
    NoSlotsSelected,

    #[error("Slot {0} is not in the timetable")]
    UnknownSlot(SlotId),

    #[error("The roster is empty, add subjects first")]
    EmptyRoster,

    #[error("Start marking first")]
    NotMarking,

    #[error("Select at least one subject first")]
    NothingSelected,

    #[error("Subject #{index} is not on the current list ({len} subjects)")]
    StaleIndex { index: usize, len: usize },

    #[error("Send the reason, or open the menu to cancel")]
    ReasonPending,

    #[error("Nothing is waiting for text input")]
    NoPendingPrompt,

    #[error("The reason cannot be empty")]
    EmptyReason,

    #[error("'{0}' means no reason, send the reason itself")]
    ReservedReason(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageBoundary {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMove {
    pub page: usize,
    /// Set when the request ran past an end and was clamped or ignored.
    pub boundary: Option<PageBoundary>,
}

pub fn page_count(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1)).max(1)
}

/// Per-operator marking context.
#[derive(Debug, Clone)]
pub struct SessionState {
    current_date: NaiveDate,
    selected_slots: BTreeSet<SlotId>,
    roster_snapshot: Vec<String>,
    selected_indices: BTreeSet<usize>,
    page: usize,
    phase: SessionPhase,
}

impl SessionState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            current_date: today,
            selected_slots: BTreeSet::new(),
            roster_snapshot: Vec::new(),
            selected_indices: BTreeSet::new(),
            page: 0,
            phase: SessionPhase::Idle,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }

    pub fn selected_slots(&self) -> &BTreeSet<SlotId> {
        &self.selected_slots
    }

    pub fn roster_snapshot(&self) -> &[String] {
        &self.roster_snapshot
    }

    pub fn selected_indices(&self) -> &BTreeSet<usize> {
        &self.selected_indices
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn is_marking(&self) -> bool {
        matches!(self.phase, SessionPhase::Marking)
    }

    /// Drops an open reason prompt. Every menu command goes through here first.
    pub fn abandon_prompt(&mut self) -> Option<PendingReason> {
        match std::mem::replace(&mut self.phase, SessionPhase::Marking) {
            SessionPhase::AwaitingReason(pending) => Some(pending),
            other => {
                self.phase = other;
                None
            }
        }
    }

    pub fn show_menu(&mut self) {
        self.selected_indices.clear();
        self.phase = SessionPhase::Idle;
    }

    pub fn begin_date_selection(&mut self) {
        self.selected_indices.clear();
        self.phase = SessionPhase::DateSelecting;
    }

    pub fn set_date(&mut self, date: NaiveDate) {
        self.current_date = date;
        self.selected_indices.clear();
        self.phase = SessionPhase::SlotSelecting;
    }

    pub fn begin_slot_selection(&mut self) {
        self.selected_indices.clear();
        self.phase = SessionPhase::SlotSelecting;
    }

    /// Returns whether the slot is selected afterwards.
    pub fn toggle_slot(&mut self, slot: SlotId, table: &SlotTable) -> Result<bool, TransitionError> {
        if !table.contains(slot) {
            return Err(TransitionError::UnknownSlot(slot));
        }

        self.begin_slot_selection();
        if self.selected_slots.remove(&slot) {
            Ok(false)
        } else {
            self.selected_slots.insert(slot);
            Ok(true)
        }
    }

    pub fn select_all_slots(&mut self, table: &SlotTable) {
        self.begin_slot_selection();
        self.selected_slots = table.slots().collect();
    }

    pub fn clear_slots(&mut self) {
        self.begin_slot_selection();
        self.selected_slots.clear();
    }

    pub fn enter_marking(&mut self, roster: Vec<String>) -> Result<(), TransitionError> {
        if self.selected_slots.is_empty() {
            return Err(TransitionError::NoSlotsSelected);
        }
        if roster.is_empty() {
            return Err(TransitionError::EmptyRoster);
        }

        self.roster_snapshot = roster;
        self.selected_indices.clear();
        self.page = 0;
        self.phase = SessionPhase::Marking;
        Ok(())
    }

    /// Replaces the snapshot. When the roster changed, the selection no longer
    /// points at the same subjects and is cleared. Returns whether it changed.
    pub fn refresh_snapshot(&mut self, roster: Vec<String>, page_size: usize) -> bool {
        if roster == self.roster_snapshot {
            return false;
        }

        self.roster_snapshot = roster;
        self.selected_indices.clear();
        self.page = self
            .page
            .min(page_count(self.roster_snapshot.len(), page_size) - 1);
        true
    }

    pub fn ensure_marking(&self) -> Result<(), TransitionError> {
        match self.phase {
            SessionPhase::Marking => Ok(()),
            SessionPhase::AwaitingReason(_) => Err(TransitionError::ReasonPending),
            SessionPhase::Idle | SessionPhase::DateSelecting | SessionPhase::SlotSelecting => {
                Err(TransitionError::NotMarking)
            }
        }
    }

    /// Returns whether the subject is selected afterwards.
    pub fn toggle_index(&mut self, index: usize) -> Result<bool, TransitionError> {
        self.ensure_marking()?;

        let len = self.roster_snapshot.len();
        if index >= len {
            return Err(TransitionError::StaleIndex { index, len });
        }

        if self.selected_indices.remove(&index) {
            Ok(false)
        } else {
            self.selected_indices.insert(index);
            Ok(true)
        }
    }

    pub fn selected_subjects(&self) -> Vec<String> {
        self.selected_indices
            .iter()
            .filter_map(|i| self.roster_snapshot.get(*i).cloned())
            .collect()
    }

    pub fn clear_selection(&mut self) {
        self.selected_indices.clear();
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        page_count(self.roster_snapshot.len(), page_size)
    }

    /// Indices of the subjects on the current page.
    pub fn page_range(&self, page_size: usize) -> std::ops::Range<usize> {
        let start = (self.page * page_size).min(self.roster_snapshot.len());
        let end = (start + page_size).min(self.roster_snapshot.len());
        start..end
    }

    pub fn go_to_page(&mut self, requested: usize, page_size: usize) -> Result<PageMove, TransitionError> {
        self.ensure_marking()?;

        let last = self.page_count(page_size) - 1;
        let boundary = (requested > last).then_some(PageBoundary::Last);
        self.page = requested.min(last);

        Ok(PageMove {
            page: self.page,
            boundary,
        })
    }

    pub fn next_page(&mut self, page_size: usize) -> Result<PageMove, TransitionError> {
        self.ensure_marking()?;

        let last = self.page_count(page_size) - 1;
        if self.page >= last {
            self.page = last;
            return Ok(PageMove {
                page: self.page,
                boundary: Some(PageBoundary::Last),
            });
        }

        self.page += 1;
        Ok(PageMove {
            page: self.page,
            boundary: None,
        })
    }

    pub fn prev_page(&mut self) -> Result<PageMove, TransitionError> {
        self.ensure_marking()?;

        if self.page == 0 {
            return Ok(PageMove {
                page: 0,
                boundary: Some(PageBoundary::First),
            });
        }

        self.page -= 1;
        Ok(PageMove {
            page: self.page,
            boundary: None,
        })
    }

    pub fn await_reason(
        &mut self,
        subjects: Vec<String>,
        status: AttendanceStatus,
        whole_roster: bool,
    ) -> Result<(), TransitionError> {
        self.ensure_marking()?;
        if subjects.is_empty() {
            return Err(TransitionError::NothingSelected);
        }

        self.phase = SessionPhase::AwaitingReason(PendingReason {
            subjects,
            status,
            whole_roster,
        });
        Ok(())
    }

    /// Consumes the pending prompt with `text` as its reason. Empty text and the
    /// no-reason marker keep the prompt open.
    pub fn take_reason(&mut self, text: &str) -> Result<(PendingReason, String), TransitionError> {
        let SessionPhase::AwaitingReason(_) = self.phase else {
            return Err(TransitionError::NoPendingPrompt);
        };

        let reason = text.trim();
        if reason.is_empty() {
            return Err(TransitionError::EmptyReason);
        }
        if reason == NO_REASON {
            return Err(TransitionError::ReservedReason(NO_REASON));
        }

        let pending = self
            .abandon_prompt()
            .ok_or(TransitionError::NoPendingPrompt)?;
        Ok((pending, reason.to_string()))
    }

    /// Reopens a prompt taken by `take_reason` whose save did not go through.
    pub fn restore_prompt(&mut self, pending: PendingReason) {
        self.phase = SessionPhase::AwaitingReason(pending);
    }

    /// Leaves marking. Date and slots stay for the next round.
    pub fn save_exit(&mut self) {
        self.selected_indices.clear();
        self.phase = SessionPhase::Idle;
    }
}

struct SessionEntry {
    state: Arc<Mutex<SessionState>>,
    last_active: Instant,
}

/// Owns every operator's session. Sessions are created on first use and
/// dropped by `evict_idle` once unused for longer than the idle TTL.
pub struct SessionManager {
    sessions: Mutex<HashMap<OperatorId, SessionEntry>>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
            idle_ttl,
        }
    }

    pub async fn session(&self, operator: OperatorId, today: NaiveDate) -> Arc<Mutex<SessionState>> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;

        let entry = sessions.entry(operator).or_insert_with(|| {
            debug!(operator, "Session created");
            SessionEntry {
                state: Arc::new(Mutex::new(SessionState::new(today))),
                last_active: now,
            }
        });
        entry.last_active = now;
        entry.state.clone()
    }

    #[instrument(skip(self))]
    pub async fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();

        sessions.retain(|_, entry| now.saturating_duration_since(entry.last_active) < self.idle_ttl);

        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
