use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub type SlotId = u8;
pub type OperatorId = i64;

pub const DATE_FORMAT: &str = "%d.%m.%Y";
pub const TIME_FORMAT: &str = "%H:%M";

/// Sheet value standing for "no reason given".
pub const NO_REASON: &str = "-";

pub fn parse_date(input: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).map_err(|_| {
        AppError::Validation(format!(
            "Invalid date '{}', expected DD.MM.YYYY (e.g. 25.03.2024)",
            input.trim()
        ))
    })
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Sick,
    ExcusedDocumented,
    ExcusedOther,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 5] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Sick,
        AttendanceStatus::ExcusedDocumented,
        AttendanceStatus::ExcusedOther,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Sick => "sick",
            AttendanceStatus::ExcusedDocumented => "excused_documented",
            AttendanceStatus::ExcusedOther => "excused_other",
        }
    }

    /// Text written to the status column of the attendance sheet.
    pub fn label(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Sick => "Sick",
            AttendanceStatus::ExcusedDocumented => "Excused (documented)",
            AttendanceStatus::ExcusedOther => "Excused (other)",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "✅",
            AttendanceStatus::Absent => "❌",
            AttendanceStatus::Sick => "🤒",
            AttendanceStatus::ExcusedDocumented => "📄",
            AttendanceStatus::ExcusedOther => "❓",
        }
    }

    pub fn requires_reason(&self) -> bool {
        matches!(
            self,
            AttendanceStatus::Sick
                | AttendanceStatus::ExcusedDocumented
                | AttendanceStatus::ExcusedOther
        )
    }

    /// Only an unexcused absence counts against the subject.
    pub fn is_disciplinary_absence(&self) -> bool {
        matches!(self, AttendanceStatus::Absent)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }
}

impl FromStr for AttendanceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown attendance status '{}'", s)))
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub group_id: String,
    pub subject_name: String,
}

impl RosterEntry {
    pub fn to_row(&self) -> Vec<String> {
        vec![self.group_id.clone(), self.subject_name.clone()]
    }

    pub fn from_row(row: &[String]) -> Option<Self> {
        match row {
            [group_id, subject_name, ..] if !subject_name.trim().is_empty() => Some(Self {
                group_id: group_id.clone(),
                subject_name: subject_name.clone(),
            }),
            _ => None,
        }
    }
}

/// Status and optional reason of one subject in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub status: AttendanceStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub date: NaiveDate,
    pub slot: SlotId,
    pub group_id: String,
    pub subject_name: String,
    pub status: AttendanceStatus,
    pub reason: Option<String>,
    pub recorded_at: NaiveTime,
}

impl AttendanceRecord {
    pub fn to_row(&self) -> Vec<String> {
        vec![
            format_date(self.date),
            self.slot.to_string(),
            self.group_id.clone(),
            self.subject_name.clone(),
            self.status.label().to_string(),
            self.reason.clone().unwrap_or_else(|| NO_REASON.to_string()),
            self.recorded_at.format(TIME_FORMAT).to_string(),
        ]
    }

    /// Rows that cannot be read as a record are skipped by callers.
    pub fn from_row(row: &[String]) -> Option<Self> {
        let [date, slot, group_id, subject_name, status, rest @ ..] = row else {
            return None;
        };

        let reason = rest
            .first()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty() && *r != NO_REASON)
            .map(String::from);

        let recorded_at = rest
            .get(1)
            .and_then(|t| NaiveTime::parse_from_str(t, TIME_FORMAT).ok())
            .unwrap_or_default();

        Some(Self {
            date: NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?,
            slot: slot.trim().parse().ok()?,
            group_id: group_id.clone(),
            subject_name: subject_name.clone(),
            status: AttendanceStatus::from_label(status)?,
            reason,
            recorded_at,
        })
    }

    pub fn mark(&self) -> Mark {
        Mark {
            status: self.status,
            reason: self.reason.clone(),
        }
    }

    /// Natural key match without parsing the whole row.
    pub fn row_matches_key(row: &[String], date: &str, slot: &str, subject_name: &str) -> bool {
        row.len() >= 4 && row[0] == date && row[1].trim() == slot && row[3] == subject_name
    }
}
