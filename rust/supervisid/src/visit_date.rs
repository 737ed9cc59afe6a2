use crate::timetable::{TimetableIndex, Weekday};
use chrono::NaiveDate;
use serde::Serialize;

/// A proposed visit date that falls outside the taught weekdays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("visit date falls on {weekday}; this class is only taught on {}", .allowed.join(", "))]
pub struct DateRejected {
    pub weekday: &'static str,
    pub allowed: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateCheck {
    pub weekday: &'static str,
    pub is_constrained: bool,
    pub allowed: Vec<&'static str>,
}

pub fn weekday_name(date: NaiveDate) -> &'static str {
    Weekday::of_date(date).map(Weekday::as_str).unwrap_or("Sun")
}

/// Advisory check against the timetable; never mutates anything.
pub fn validate(
    index: &TimetableIndex,
    teacher_id: Option<&str>,
    subject_id: Option<&str>,
    class_id: Option<&str>,
    proposed: NaiveDate,
) -> Result<DateCheck, DateRejected> {
    let allowed = index.allowed_weekdays(teacher_id, subject_id, class_id);
    let weekday = weekday_name(proposed);
    let check = DateCheck {
        weekday,
        is_constrained: allowed.is_constrained,
        allowed: allowed.name_list(),
    };
    if !allowed.is_constrained {
        return Ok(check);
    }
    match Weekday::of_date(proposed) {
        Some(day) if allowed.contains(day) => Ok(check),
        _ => Err(DateRejected {
            weekday,
            allowed: check.allowed,
        }),
    }
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
