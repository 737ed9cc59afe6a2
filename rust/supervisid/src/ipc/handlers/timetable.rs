use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::timetable::{EntryStatus, TimetableEntry, Weekday};
use serde_json::{json, Value};
use tracing::info;

fn entry_field<'a>(row: &'a Value, key: &str, idx: usize) -> Result<&'a str, String> {
    row.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("entries[{}].{} is required", idx, key))
}

fn parse_entry(row: &Value, idx: usize) -> Result<TimetableEntry, String> {
    let teacher_id = entry_field(row, "teacherId", idx)?;
    let subject_id = entry_field(row, "subjectId", idx)?;
    let class_id = entry_field(row, "classId", idx)?;
    let weekday_raw = entry_field(row, "weekday", idx)?;
    let weekday = Weekday::parse(weekday_raw).ok_or_else(|| {
        format!(
            "entries[{}].weekday must be a school day Mon..Sat, got {}",
            idx, weekday_raw
        )
    })?;
    let status = match row.get("status") {
        None | Some(Value::Null) => EntryStatus::Active,
        Some(v) => {
            let raw = v
                .as_str()
                .ok_or_else(|| format!("entries[{}].status must be string", idx))?;
            EntryStatus::parse(raw)
                .ok_or_else(|| format!("entries[{}].status is invalid: {}", idx, raw))?
        }
    };
    Ok(TimetableEntry {
        teacher_id: teacher_id.to_string(),
        subject_id: subject_id.to_string(),
        class_id: class_id.to_string(),
        weekday,
        status,
    })
}

fn handle_timetable_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(rows) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };
    let mut entries = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        match parse_entry(row, idx) {
            Ok(e) => entries.push(e),
            Err(msg) => return err(&req.id, "bad_params", msg, Some(json!({ "index": idx }))),
        }
    }
    let imported = match db::timetable_replace(conn, &entries) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    state.timetable = None;
    let active = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Active)
        .count();
    info!(imported, active, "timetable imported");
    ok(&req.id, json!({ "imported": imported, "active": active }))
}

fn handle_timetable_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::timetable_load(conn) {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_timetable_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match state.timetable_index() {
        Ok(index) => ok(
            &req.id,
            json!({ "subjectIds": index.subjects_for(&teacher_id) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_timetable_classes(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match state.timetable_index() {
        Ok(index) => ok(
            &req.id,
            json!({ "classIds": index.classes_for(&teacher_id, &subject_id) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_allowed_weekdays(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let mut ids = Vec::with_capacity(3);
    for key in ["teacherId", "subjectId", "classId"] {
        match optional_str(req, key) {
            Ok(v) => ids.push(v),
            Err(e) => return e,
        }
    }
    match state.timetable_index() {
        Ok(index) => {
            let allowed =
                index.allowed_weekdays(ids[0].as_deref(), ids[1].as_deref(), ids[2].as_deref());
            ok(
                &req.id,
                json!({
                    "names": allowed.name_list(),
                    "isConstrained": allowed.is_constrained
                }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.import" => Some(handle_timetable_import(state, req)),
        "timetable.list" => Some(handle_timetable_list(state, req)),
        "timetable.subjects" => Some(handle_timetable_subjects(state, req)),
        "timetable.classes" => Some(handle_timetable_classes(state, req)),
        "timetable.allowedWeekdays" => Some(handle_allowed_weekdays(state, req)),
        _ => None,
    }
}
