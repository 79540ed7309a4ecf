use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cache::{AttendanceScope, TabularCache};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{AttendanceStatus, OperatorId, SlotId, format_date, parse_date};
use crate::session::{
    PageBoundary, PageMove, PhaseName, SessionManager, SessionPhase, SessionState,
    TransitionError,
};
use crate::store::{AttendanceStore, BulkUpsert};

const NAME_WIDTH: usize = 15;
const UNMARKED_SYMBOL: &str = "⬜";
const REASON_SYMBOL: &str = "📝";

/// One operator action, as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ShowMenu,
    ChooseDate,
    SetDate { date: String },
    ChooseSlots,
    ToggleSlot { slot: SlotId },
    SelectAllSlots,
    ClearSlots,
    StartMarking,
    ToggleSubject { index: usize },
    ApplyToSelected { status: AttendanceStatus },
    ApplyToAll { status: AttendanceStatus },
    SubmitText { text: String },
    NextPage,
    PrevPage,
    GoToPage { page: usize },
    Refresh,
    SaveExit,
    AddSubject { name: String },
    ListRoster,
}

impl Action {
    /// Menu commands abandon an open reason prompt; marking actions do not.
    fn is_menu_command(&self) -> bool {
        match self {
            Action::ShowMenu
            | Action::ChooseDate
            | Action::SetDate { .. }
            | Action::ChooseSlots
            | Action::ToggleSlot { .. }
            | Action::SelectAllSlots
            | Action::ClearSlots
            | Action::StartMarking
            | Action::SaveExit
            | Action::AddSubject { .. }
            | Action::ListRoster => true,
            Action::ToggleSubject { .. }
            | Action::ApplyToSelected { .. }
            | Action::ApplyToAll { .. }
            | Action::SubmitText { .. }
            | Action::NextPage
            | Action::PrevPage
            | Action::GoToPage { .. }
            | Action::Refresh => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot: SlotId,
    pub time_range: String,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMark {
    pub slot: SlotId,
    pub status: Option<AttendanceStatus>,
    pub symbol: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRow {
    pub index: usize,
    pub subject: String,
    pub label: String,
    pub selected: bool,
    pub marks: Vec<SlotMark>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkingView {
    pub page: usize,
    pub page_count: usize,
    pub total_subjects: usize,
    pub selected_count: usize,
    pub rows: Vec<SubjectRow>,
}

/// Everything the transport needs to render the operator's screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub phase: PhaseName,
    pub group_id: String,
    pub date: String,
    pub slots: Vec<SlotView>,
    pub notices: Vec<Notice>,
    pub prompt: Option<String>,
    pub date_options: Vec<String>,
    pub marking: Option<MarkingView>,
    pub roster: Option<Vec<String>>,
    pub roster_size: Option<usize>,
    pub saved: Option<BulkUpsert>,
}

impl View {
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.notices
            .iter()
            .filter(|n| n.level == NoticeLevel::Warning)
            .map(|n| n.message.as_str())
    }
}

enum Step {
    Rejected(TransitionError),
    Failed(AppError),
}

impl From<TransitionError> for Step {
    fn from(err: TransitionError) -> Self {
        Step::Rejected(err)
    }
}

impl From<AppError> for Step {
    fn from(err: AppError) -> Self {
        Step::Failed(err)
    }
}

#[derive(Default)]
struct Extras {
    notices: Vec<Notice>,
    roster: Option<Vec<String>>,
    roster_size: Option<usize>,
    saved: Option<BulkUpsert>,
}

pub struct MarkingController {
    config: Arc<AppConfig>,
    sessions: Arc<SessionManager>,
    cache: Arc<TabularCache>,
    store: Arc<AttendanceStore>,
}

impl MarkingController {
    pub fn new(
        config: Arc<AppConfig>,
        sessions: Arc<SessionManager>,
        cache: Arc<TabularCache>,
        store: Arc<AttendanceStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            cache,
            store,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Applies one action to the operator's session and renders the result.
    ///
    /// Rejected transitions and invalid input come back as warnings on an
    /// unchanged view; only store failures are returned as errors.
    #[instrument(skip(self, action), fields(action = ?action))]
    pub async fn handle(&self, operator: OperatorId, action: Action) -> Result<View, AppError> {
        let today = Local::now().date_naive();
        let session = self.sessions.session(operator, today).await;
        let mut state = session.lock().await;
        let mut extras = Extras::default();

        if action.is_menu_command() {
            if let Some(pending) = state.abandon_prompt() {
                info!(operator, status = %pending.status, "Reason prompt abandoned");
                extras.notices.push(Notice::info(format!(
                    "Pending '{}' mark discarded",
                    pending.status.label()
                )));
            }
        }

        match self.apply(&mut state, action, &mut extras).await {
            Ok(()) => {}
            Err(Step::Rejected(err)) => extras.notices.push(Notice::warning(err.to_string())),
            Err(Step::Failed(AppError::Validation(msg))) => {
                extras.notices.push(Notice::warning(msg))
            }
            Err(Step::Failed(err)) => return Err(err),
        }

        Ok(self.render(&state, extras).await)
    }

    async fn apply(
        &self,
        state: &mut SessionState,
        action: Action,
        extras: &mut Extras,
    ) -> Result<(), Step> {
        let page_size = self.config.page_size;

        match action {
            Action::ShowMenu => {
                state.show_menu();
                match self.cache.get_roster().await {
                    Ok(roster) => extras.roster_size = Some(roster.len()),
                    Err(err) => warn!(error = %err, "Roster size unavailable for menu"),
                }
            }
            Action::ChooseDate => state.begin_date_selection(),
            Action::SetDate { date } => {
                let date = parse_date(&date)?;
                state.set_date(date);
                extras
                    .notices
                    .push(Notice::info(format!("Date set to {}", format_date(date))));
            }
            Action::ChooseSlots => state.begin_slot_selection(),
            Action::ToggleSlot { slot } => {
                let selected = state.toggle_slot(slot, &self.config.slots)?;
                let verb = if selected { "selected" } else { "deselected" };
                extras.notices.push(Notice::info(format!("Slot {} {}", slot, verb)));
            }
            Action::SelectAllSlots => state.select_all_slots(&self.config.slots),
            Action::ClearSlots => state.clear_slots(),
            Action::StartMarking => {
                if state.selected_slots().is_empty() {
                    return Err(TransitionError::NoSlotsSelected.into());
                }
                let roster = self.roster_names().await?;
                state.enter_marking(roster)?;
            }
            Action::ToggleSubject { index } => {
                state.ensure_marking()?;
                if self.resync(state, extras).await? {
                    return Ok(());
                }

                match state.toggle_index(index) {
                    Ok(_) => {}
                    Err(TransitionError::StaleIndex { index, len }) => {
                        warn!(index, len, "Index outside roster snapshot, forcing refresh");
                        self.cache.invalidate_roster().await;
                        let roster = self.roster_names().await?;
                        state.refresh_snapshot(roster, page_size);
                        extras.notices.push(Notice::warning(format!(
                            "Subject #{} is no longer on the list; the list was refreshed",
                            index + 1
                        )));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Action::ApplyToSelected { status } => {
                state.ensure_marking()?;
                let subjects = state.selected_subjects();
                if subjects.is_empty() {
                    return Err(TransitionError::NothingSelected.into());
                }
                self.apply_status(state, subjects, status, false, extras)
                    .await?;
            }
            Action::ApplyToAll { status } => {
                state.ensure_marking()?;
                self.resync(state, extras).await?;
                let subjects = state.roster_snapshot().to_vec();
                self.apply_status(state, subjects, status, true, extras)
                    .await?;
            }
            Action::SubmitText { text } => {
                let (pending, reason) = state.take_reason(&text)?;
                let saved = self
                    .save(state, &pending.subjects, pending.status, Some(&reason), extras)
                    .await;
                if let Err(err) = saved {
                    state.restore_prompt(pending);
                    return Err(err);
                }
            }
            Action::NextPage => {
                let moved = state.next_page(page_size)?;
                push_page_notice(moved, extras);
            }
            Action::PrevPage => {
                let moved = state.prev_page()?;
                push_page_notice(moved, extras);
            }
            Action::GoToPage { page } => {
                let moved = state.go_to_page(page, page_size)?;
                push_page_notice(moved, extras);
            }
            Action::Refresh => {
                state.ensure_marking()?;
                self.cache.invalidate_roster().await;
                self.cache
                    .invalidate_attendance(AttendanceScope::Date(state.current_date()))
                    .await;
                let roster = self.roster_names().await?;
                if state.refresh_snapshot(roster, page_size) {
                    extras
                        .notices
                        .push(Notice::warning("The roster changed; selection cleared"));
                }
            }
            Action::SaveExit => {
                let was_marking = state.is_marking();
                state.save_exit();
                if was_marking {
                    extras.notices.push(Notice::info(format!(
                        "Marks for {} (slots {}) are saved",
                        format_date(state.current_date()),
                        join_slots(state),
                    )));
                }
            }
            Action::AddSubject { name } => {
                let entry = self.store.add_subject(&name).await?;
                extras
                    .notices
                    .push(Notice::info(format!("{} added", entry.subject_name)));
                if state.is_marking() {
                    let roster = self.roster_names().await?;
                    state.refresh_snapshot(roster, page_size);
                }
            }
            Action::ListRoster => {
                extras.roster = Some(self.roster_names().await?);
            }
        }

        Ok(())
    }

    /// Statuses that need a reason open a prompt; the rest are saved at once.
    async fn apply_status(
        &self,
        state: &mut SessionState,
        subjects: Vec<String>,
        status: AttendanceStatus,
        whole_roster: bool,
        extras: &mut Extras,
    ) -> Result<(), Step> {
        if status.requires_reason() {
            state.await_reason(subjects, status, whole_roster)?;
            return Ok(());
        }

        self.save(state, &subjects, status, None, extras).await
    }

    async fn save(
        &self,
        state: &mut SessionState,
        subjects: &[String],
        status: AttendanceStatus,
        reason: Option<&str>,
        extras: &mut Extras,
    ) -> Result<(), Step> {
        let outcome = self
            .store
            .upsert_many(
                state.current_date(),
                state.selected_slots(),
                subjects,
                status,
                reason,
            )
            .await?;

        match &outcome {
            BulkUpsert::Complete { records, subjects } => {
                state.clear_selection();
                extras.notices.push(Notice::info(format!(
                    "{} {}: {} record(s) saved",
                    subjects,
                    if *subjects == 1 { "subject" } else { "subjects" },
                    records
                )));
            }
            BulkUpsert::Partial {
                completed,
                failed_subject,
                error,
                ..
            } => {
                extras.notices.push(Notice::warning(format!(
                    "Only {} of {} subjects were saved; stopped at {}: {}",
                    completed.len(),
                    subjects.len(),
                    failed_subject,
                    error
                )));
            }
        }

        extras.saved = Some(outcome);
        Ok(())
    }

    /// Brings the snapshot in line with the live roster. Returns true when it
    /// had drifted, in which case the selection was cleared.
    async fn resync(&self, state: &mut SessionState, extras: &mut Extras) -> Result<bool, Step> {
        let roster = self.roster_names().await?;
        let changed = state.refresh_snapshot(roster, self.config.page_size);
        if changed {
            extras.notices.push(Notice::warning(
                "The roster changed; the list was refreshed and the selection cleared",
            ));
        }
        Ok(changed)
    }

    async fn roster_names(&self) -> Result<Vec<String>, AppError> {
        Ok(self
            .cache
            .get_roster()
            .await?
            .into_iter()
            .map(|entry| entry.subject_name)
            .collect())
    }

    async fn render(&self, state: &SessionState, mut extras: Extras) -> View {
        let slots = self
            .config
            .slots
            .slots()
            .map(|slot| SlotView {
                slot,
                time_range: self
                    .config
                    .slots
                    .time_range(slot)
                    .unwrap_or_default()
                    .to_string(),
                selected: state.selected_slots().contains(&slot),
            })
            .collect();

        let (prompt, date_options, marking) = match state.phase() {
            SessionPhase::Idle | SessionPhase::SlotSelecting => (None, Vec::new(), None),
            SessionPhase::DateSelecting => (
                Some("Pick a date or send one as DD.MM.YYYY".to_string()),
                date_options(Local::now().date_naive()),
                None,
            ),
            SessionPhase::Marking => (
                None,
                Vec::new(),
                Some(self.marking_view(state, &mut extras.notices).await),
            ),
            SessionPhase::AwaitingReason(pending) => (
                Some(format!(
                    "Send the reason for {} ({} subject(s))",
                    pending.status.label(),
                    pending.subjects.len()
                )),
                Vec::new(),
                Some(self.marking_view(state, &mut extras.notices).await),
            ),
        };

        View {
            phase: state.phase().name(),
            group_id: self.config.group_id.clone(),
            date: format_date(state.current_date()),
            slots,
            notices: extras.notices,
            prompt,
            date_options,
            marking,
            roster: extras.roster,
            roster_size: extras.roster_size,
            saved: extras.saved,
        }
    }

    async fn marking_view(&self, state: &SessionState, notices: &mut Vec<Notice>) -> MarkingView {
        let page_size = self.config.page_size;
        let marks = match self
            .cache
            .get_attendance_many(state.current_date(), state.selected_slots())
            .await
        {
            Ok(marks) => marks,
            Err(err) => {
                warn!(error = %err, "Attendance unavailable, rendering without marks");
                notices.push(Notice::warning(
                    "Current marks could not be loaded; symbols may be out of date",
                ));
                HashMap::new()
            }
        };

        let rows = state
            .page_range(page_size)
            .map(|index| {
                let subject = state.roster_snapshot()[index].clone();
                let slot_marks: Vec<SlotMark> = state
                    .selected_slots()
                    .iter()
                    .map(|slot| {
                        let mark = marks.get(slot).and_then(|m| m.get(&subject));
                        SlotMark {
                            slot: *slot,
                            status: mark.map(|m| m.status),
                            symbol: mark
                                .map(|m| m.status.symbol())
                                .unwrap_or(UNMARKED_SYMBOL)
                                .to_string(),
                            reason: mark.and_then(|m| m.reason.clone()),
                        }
                    })
                    .collect();

                SubjectRow {
                    index,
                    label: row_label(&subject, &slot_marks),
                    selected: state.selected_indices().contains(&index),
                    subject,
                    marks: slot_marks,
                }
            })
            .collect();

        MarkingView {
            page: state.page(),
            page_count: state.page_count(page_size),
            total_subjects: state.roster_snapshot().len(),
            selected_count: state.selected_indices().len(),
            rows,
        }
    }
}

fn push_page_notice(moved: PageMove, extras: &mut Extras) {
    match moved.boundary {
        Some(PageBoundary::First) => extras.notices.push(Notice::info("This is the first page")),
        Some(PageBoundary::Last) => extras.notices.push(Notice::info("This is the last page")),
        None => {}
    }
}

fn join_slots(state: &SessionState) -> String {
    state
        .selected_slots()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Today, yesterday, tomorrow, then the six days before yesterday.
pub fn date_options(today: NaiveDate) -> Vec<String> {
    let mut options = vec![
        today,
        today - Duration::days(1),
        today + Duration::days(1),
    ];
    options.extend((2..8).map(|days| today - Duration::days(days)));
    options.into_iter().map(format_date).collect()
}

fn row_label(subject: &str, marks: &[SlotMark]) -> String {
    let symbols: String = marks.iter().map(|m| m.symbol.as_str()).collect();
    let note = if marks.iter().any(|m| m.reason.is_some()) {
        REASON_SYMBOL
    } else {
        ""
    };

    let name = if subject.chars().count() > NAME_WIDTH {
        let short: String = subject.chars().take(NAME_WIDTH - 3).collect();
        format!("{}...", short)
    } else {
        subject.to_string()
    };

    format!("{}{} {}", symbols, note, name)
}
