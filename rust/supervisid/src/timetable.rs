use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// School days a timetable row can fall on. Sunday is never taught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    /// Accepts English short/long names and the Indonesian day names used by
    /// the timetable feed (`Senin`..`Sabtu`), case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mon" | "monday" | "senin" => Some(Self::Mon),
            "tue" | "tuesday" | "selasa" => Some(Self::Tue),
            "wed" | "wednesday" | "rabu" => Some(Self::Wed),
            "thu" | "thursday" | "kamis" => Some(Self::Thu),
            "fri" | "friday" | "jumat" | "jum'at" => Some(Self::Fri),
            "sat" | "saturday" | "sabtu" => Some(Self::Sat),
            _ => None,
        }
    }

    /// `None` for Sunday.
    pub fn from_chrono(day: chrono::Weekday) -> Option<Self> {
        match day {
            chrono::Weekday::Mon => Some(Self::Mon),
            chrono::Weekday::Tue => Some(Self::Tue),
            chrono::Weekday::Wed => Some(Self::Wed),
            chrono::Weekday::Thu => Some(Self::Thu),
            chrono::Weekday::Fri => Some(Self::Fri),
            chrono::Weekday::Sat => Some(Self::Sat),
            chrono::Weekday::Sun => None,
        }
    }

    pub fn of_date(date: chrono::NaiveDate) -> Option<Self> {
        Self::from_chrono(date.weekday())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "Mon",
            Self::Tue => "Tue",
            Self::Wed => "Wed",
            Self::Thu => "Thu",
            Self::Fri => "Fri",
            Self::Sat => "Sat",
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Active,
    Inactive,
}

impl EntryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "aktif" => Some(Self::Active),
            "inactive" | "nonaktif" | "non-aktif" | "tidak aktif" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntry {
    pub teacher_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub weekday: Weekday,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedWeekdays {
    pub names: BTreeSet<Weekday>,
    pub is_constrained: bool,
}

impl AllowedWeekdays {
    pub fn unconstrained() -> Self {
        Self {
            names: BTreeSet::new(),
            is_constrained: false,
        }
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.names.contains(&day)
    }

    pub fn name_list(&self) -> Vec<&'static str> {
        self.names.iter().map(|d| d.as_str()).collect()
    }
}

type ComboKey = (String, String, String);

/// Lookup from (teacher, subject, class) to the weekdays that combination is
/// actively taught. Built once from a snapshot of the timetable rows.
#[derive(Debug, Clone, Default)]
pub struct TimetableIndex {
    active_days: HashMap<ComboKey, BTreeSet<Weekday>>,
    // Selection chain lookups consider every row, active or not.
    subjects_by_teacher: HashMap<String, BTreeSet<String>>,
    classes_by_teacher_subject: HashMap<(String, String), BTreeSet<String>>,
}

impl TimetableIndex {
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a TimetableEntry>,
    {
        let mut index = Self::default();
        for e in entries {
            index
                .subjects_by_teacher
                .entry(e.teacher_id.clone())
                .or_default()
                .insert(e.subject_id.clone());
            index
                .classes_by_teacher_subject
                .entry((e.teacher_id.clone(), e.subject_id.clone()))
                .or_default()
                .insert(e.class_id.clone());
            if e.status != EntryStatus::Active {
                continue;
            }
            index
                .active_days
                .entry((e.teacher_id.clone(), e.subject_id.clone(), e.class_id.clone()))
                .or_default()
                .insert(e.weekday);
        }
        index
    }

    pub fn allowed_weekdays(
        &self,
        teacher_id: Option<&str>,
        subject_id: Option<&str>,
        class_id: Option<&str>,
    ) -> AllowedWeekdays {
        let (Some(t), Some(s), Some(c)) = (teacher_id, subject_id, class_id) else {
            return AllowedWeekdays::unconstrained();
        };
        let key = (t.to_string(), s.to_string(), c.to_string());
        match self.active_days.get(&key) {
            Some(days) if !days.is_empty() => AllowedWeekdays {
                names: days.clone(),
                is_constrained: true,
            },
            _ => AllowedWeekdays::unconstrained(),
        }
    }

    pub fn subjects_for(&self, teacher_id: &str) -> Vec<String> {
        self.subjects_by_teacher
            .get(teacher_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn classes_for(&self, teacher_id: &str, subject_id: &str) -> Vec<String> {
        self.classes_by_teacher_subject
            .get(&(teacher_id.to_string(), subject_id.to_string()))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}
