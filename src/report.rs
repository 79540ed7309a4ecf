use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cache::TabularCache;
use crate::config::SlotTable;
use crate::error::AppError;
use crate::models::{
    AttendanceRecord, AttendanceStatus, NO_REASON, RosterEntry, SlotId, TIME_FORMAT, format_date,
};
use crate::store::AttendanceStore;

static MONTH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(0?[1-9]|1[0-2])\.(\d{4})$").expect("month pattern compiles"));

const UNMARKED_SYMBOL: &str = "⬜";
const REASON_SYMBOL: &str = "📝";

/// Calendar month a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSpec {
    pub month: u32,
    pub year: i32,
}

impl MonthSpec {
    pub fn current() -> Self {
        Self::containing(Local::now().date_naive())
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            year: date.year(),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.month() == self.month && date.year() == self.year
    }

    pub fn label(&self) -> String {
        format!("{:02}.{}", self.month, self.year)
    }
}

impl FromStr for MonthSpec {
    type Err = AppError;

    /// Accepts `MM.YYYY` or `current`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.eq_ignore_ascii_case("current") {
            return Ok(Self::current());
        }

        let invalid =
            || AppError::Validation(format!("Invalid month '{}', expected MM.YYYY", input));

        let captures = MONTH_PATTERN.captures(input).ok_or_else(invalid)?;
        let month = captures[1].parse().map_err(|_| invalid())?;
        let year = captures[2].parse().map_err(|_| invalid())?;

        Ok(Self { month, year })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSheet {
    pub name: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub subject_name: String,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub sick: usize,
    pub excused_documented: usize,
    pub excused_other: usize,
    pub attendance_percent: f64,
}

impl SubjectStats {
    fn new(subject_name: &str) -> Self {
        Self {
            subject_name: subject_name.to_string(),
            total: 0,
            present: 0,
            absent: 0,
            sick: 0,
            excused_documented: 0,
            excused_other: 0,
            attendance_percent: 0.0,
        }
    }

    fn count(&mut self, status: AttendanceStatus) {
        self.total += 1;
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Sick => self.sick += 1,
            AttendanceStatus::ExcusedDocumented => self.excused_documented += 1,
            AttendanceStatus::ExcusedOther => self.excused_other += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub days: usize,
    pub sessions: usize,
    pub subjects: usize,
    pub records: usize,
    pub present: usize,
    pub average_attendance_percent: f64,
    /// Every mark other than present.
    pub missed: usize,
    pub sick: usize,
    pub excused: usize,
    /// Disciplinary absences only.
    pub unexcused: usize,
}

/// Workbook model for one month. Rendering to a spreadsheet file happens
/// outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReport {
    pub month: MonthSpec,
    pub title: String,
    pub file_name: String,
    pub summary: ReportSummary,
    pub statistics: Vec<SubjectStats>,
    pub sheets: Vec<ReportSheet>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1(part as f64 / total as f64 * 100.0)
    }
}

/// Builds the monthly workbook. Returns `None` when the month has no records.
pub fn build_monthly_report(
    month: MonthSpec,
    group_id: &str,
    roster: &[RosterEntry],
    records: &[AttendanceRecord],
    slots: &SlotTable,
) -> Option<MonthlyReport> {
    let mut in_month: Vec<&AttendanceRecord> =
        records.iter().filter(|r| month.contains(r.date)).collect();
    if in_month.is_empty() {
        return None;
    }
    in_month.sort_by(|a, b| {
        (a.date, a.slot, &a.subject_name).cmp(&(b.date, b.slot, &b.subject_name))
    });

    // Roster order first, then anyone who has records but has left the roster.
    let mut subjects: Vec<String> = roster.iter().map(|e| e.subject_name.clone()).collect();
    for record in &in_month {
        if !subjects.contains(&record.subject_name) {
            subjects.push(record.subject_name.clone());
        }
    }

    let statistics = subject_statistics(&subjects, &in_month);
    let summary = summarize(&in_month, &statistics);

    let mut sheets = vec![
        attendance_sheet(&subjects, &in_month, slots),
        statistics_sheet(&statistics),
        summary_sheet(&summary),
    ];
    let reasons = reasons_sheet(&in_month);
    if !reasons.rows.is_empty() {
        sheets.push(reasons);
    }

    Some(MonthlyReport {
        month,
        title: format!("Attendance report for {}", month.label()),
        file_name: format!("attendance_{}_{}.xlsx", group_id, month.label()),
        summary,
        statistics,
        sheets,
    })
}

fn subject_statistics(subjects: &[String], records: &[&AttendanceRecord]) -> Vec<SubjectStats> {
    subjects
        .iter()
        .filter_map(|subject| {
            let mut stats = SubjectStats::new(subject);
            for record in records.iter().filter(|r| &r.subject_name == subject) {
                stats.count(record.status);
            }
            if stats.total == 0 {
                return None;
            }
            stats.attendance_percent = percent(stats.present, stats.total);
            Some(stats)
        })
        .collect()
}

fn summarize(records: &[&AttendanceRecord], statistics: &[SubjectStats]) -> ReportSummary {
    let count = |status: AttendanceStatus| records.iter().filter(|r| r.status == status).count();

    let days: BTreeSet<NaiveDate> = records.iter().map(|r| r.date).collect();
    let sessions: BTreeSet<(NaiveDate, SlotId)> = records.iter().map(|r| (r.date, r.slot)).collect();
    let present = count(AttendanceStatus::Present);

    let average = if statistics.is_empty() {
        0.0
    } else {
        round1(
            statistics.iter().map(|s| s.attendance_percent).sum::<f64>() / statistics.len() as f64,
        )
    };

    ReportSummary {
        days: days.len(),
        sessions: sessions.len(),
        subjects: statistics.len(),
        records: records.len(),
        present,
        average_attendance_percent: average,
        missed: records.len() - present,
        sick: count(AttendanceStatus::Sick),
        excused: count(AttendanceStatus::ExcusedDocumented) + count(AttendanceStatus::ExcusedOther),
        unexcused: records
            .iter()
            .filter(|r| r.status.is_disciplinary_absence())
            .count(),
    }
}

/// Subjects down, one column per (date, slot) session across.
fn attendance_sheet(
    subjects: &[String],
    records: &[&AttendanceRecord],
    slots: &SlotTable,
) -> ReportSheet {
    let mut cells: BTreeMap<(NaiveDate, SlotId), BTreeMap<&str, &AttendanceRecord>> =
        BTreeMap::new();
    for record in records {
        cells
            .entry((record.date, record.slot))
            .or_default()
            .insert(record.subject_name.as_str(), record);
    }

    let mut header = vec!["Subject".to_string()];
    header.extend(cells.keys().map(|(date, slot)| match slots.time_range(*slot) {
        Some(range) => format!("{} #{} ({})", format_date(*date), slot, range),
        None => format!("{} #{}", format_date(*date), slot),
    }));

    let rows = subjects
        .iter()
        .map(|subject| {
            let mut row = vec![subject.clone()];
            row.extend(cells.values().map(|by_subject| {
                match by_subject.get(subject.as_str()) {
                    Some(record) if record.reason.is_some() => {
                        format!("{}{}", record.status.symbol(), REASON_SYMBOL)
                    }
                    Some(record) => record.status.symbol().to_string(),
                    None => UNMARKED_SYMBOL.to_string(),
                }
            }));
            row
        })
        .collect();

    ReportSheet {
        name: "Attendance".to_string(),
        header,
        rows,
    }
}

fn statistics_sheet(statistics: &[SubjectStats]) -> ReportSheet {
    let header = [
        "Subject",
        "Total",
        AttendanceStatus::Present.label(),
        AttendanceStatus::Absent.label(),
        AttendanceStatus::Sick.label(),
        AttendanceStatus::ExcusedDocumented.label(),
        AttendanceStatus::ExcusedOther.label(),
        "Attendance %",
    ]
    .map(String::from)
    .to_vec();

    let rows = statistics
        .iter()
        .map(|s| {
            vec![
                s.subject_name.clone(),
                s.total.to_string(),
                s.present.to_string(),
                s.absent.to_string(),
                s.sick.to_string(),
                s.excused_documented.to_string(),
                s.excused_other.to_string(),
                format!("{:.1}", s.attendance_percent),
            ]
        })
        .collect();

    ReportSheet {
        name: "Statistics".to_string(),
        header,
        rows,
    }
}

fn summary_sheet(summary: &ReportSummary) -> ReportSheet {
    let rows = [
        ("Days with classes", summary.days.to_string()),
        ("Sessions", summary.sessions.to_string()),
        ("Subjects", summary.subjects.to_string()),
        (
            "Average attendance %",
            format!("{:.1}", summary.average_attendance_percent),
        ),
        ("Missed", summary.missed.to_string()),
        ("Sick", summary.sick.to_string()),
        ("Excused", summary.excused.to_string()),
        ("Unexcused", summary.unexcused.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| vec![name.to_string(), value])
    .collect();

    ReportSheet {
        name: "Summary".to_string(),
        header: vec!["Metric".to_string(), "Value".to_string()],
        rows,
    }
}

fn reasons_sheet(records: &[&AttendanceRecord]) -> ReportSheet {
    let rows = records
        .iter()
        .filter_map(|r| {
            let reason = r.reason.as_deref().filter(|reason| *reason != NO_REASON)?;
            Some(vec![
                format_date(r.date),
                r.slot.to_string(),
                r.subject_name.clone(),
                r.status.label().to_string(),
                reason.to_string(),
                r.recorded_at.format(TIME_FORMAT).to_string(),
            ])
        })
        .collect();

    ReportSheet {
        name: "Reasons".to_string(),
        header: ["Date", "Slot", "Subject", "Status", "Reason", "Recorded at"]
            .map(String::from)
            .to_vec(),
        rows,
    }
}

/// Reads the roster and every record, then builds the report for `month`.
#[instrument(skip(store, cache, slots))]
pub async fn monthly_report(
    store: &AttendanceStore,
    cache: &TabularCache,
    slots: &SlotTable,
    month: MonthSpec,
) -> Result<MonthlyReport, AppError> {
    let roster = cache.get_roster().await?;
    let records = store.all_records().await?;

    let report = build_monthly_report(month, store.group_id(), &roster, &records, slots)
        .ok_or_else(|| AppError::NotFound(format!("No attendance recorded in {}", month.label())))?;

    info!(
        records = report.summary.records,
        subjects = report.summary.subjects,
        "Monthly report built"
    );
    Ok(report)
}
