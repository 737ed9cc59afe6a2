use crate::db::{self, NewVisit, StoredVisit, VisitFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::visit_date::{self, parse_iso_date, DateCheck, DateRejected};
use serde_json::json;
use tracing::{info, warn};

use super::setup::load_active_academic_year;

fn required_date(req: &Request, key: &str) -> Result<chrono::NaiveDate, serde_json::Value> {
    let raw = required_str(req, key)?;
    parse_iso_date(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            None,
        )
    })
}

/// An absent key falls back to the workspace's active academic year; an
/// explicit null means no year.
fn academic_year_param(state: &AppState, req: &Request) -> Result<Option<String>, serde_json::Value> {
    if req.params.get("academicYearId").is_some() {
        return optional_str(req, "academicYearId");
    }
    let conn = db_conn(state, req)?;
    load_active_academic_year(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

/// Present-but-null clears a field; absent keeps the stored value.
fn patch_str(
    req: &Request,
    key: &str,
    existing: Option<String>,
) -> Result<Option<String>, serde_json::Value> {
    if req.params.get(key).is_none() {
        return Ok(existing);
    }
    optional_str(req, key)
}

fn check_date(
    state: &mut AppState,
    req: &Request,
    teacher_id: Option<&str>,
    subject_id: Option<&str>,
    class_id: Option<&str>,
    date: chrono::NaiveDate,
) -> Result<Result<DateCheck, DateRejected>, serde_json::Value> {
    let index = state
        .timetable_index()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(visit_date::validate(index, teacher_id, subject_id, class_id, date))
}

fn date_not_allowed(req: &Request, rejected: &DateRejected) -> serde_json::Value {
    err(
        &req.id,
        "date_not_allowed",
        rejected.to_string(),
        Some(json!(rejected)),
    )
}

fn load_visit(state: &AppState, req: &Request, visit_id: &str) -> Result<StoredVisit, serde_json::Value> {
    let conn = db_conn(state, req)?;
    match db::visit_get(conn, visit_id) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(err(&req.id, "not_found", "visit not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_validate_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut ids = Vec::with_capacity(3);
    for key in ["teacherId", "subjectId", "classId"] {
        match optional_str(req, key) {
            Ok(v) => ids.push(v),
            Err(e) => return e,
        }
    }
    let outcome = match check_date(
        state,
        req,
        ids[0].as_deref(),
        ids[1].as_deref(),
        ids[2].as_deref(),
        date,
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match outcome {
        Ok(check) => ok(
            &req.id,
            json!({
                "valid": true,
                "weekday": check.weekday,
                "isConstrained": check.is_constrained,
                "allowed": check.allowed
            }),
        ),
        Err(rejected) => ok(
            &req.id,
            json!({
                "valid": false,
                "weekday": rejected.weekday,
                "isConstrained": true,
                "allowed": rejected.allowed,
                "message": rejected.to_string()
            }),
        ),
    }
}

fn handle_visits_schedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let mut ids = Vec::with_capacity(4);
    for key in ["supervisorId", "teacherId", "subjectId", "classId"] {
        match required_str(req, key) {
            Ok(v) => ids.push(v),
            Err(e) => return e,
        }
    }
    let (supervisor_id, teacher_id, subject_id, class_id) = (&ids[0], &ids[1], &ids[2], &ids[3]);
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match optional_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let notes = match optional_str(req, "notes") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match academic_year_param(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match check_date(
        state,
        req,
        Some(teacher_id.as_str()),
        Some(subject_id.as_str()),
        Some(class_id.as_str()),
        date,
    ) {
        Ok(Ok(_)) => {}
        Ok(Err(rejected)) => {
            warn!(%teacher_id, %subject_id, %class_id, %date, "visit date rejected");
            return date_not_allowed(req, &rejected);
        }
        Err(e) => return e,
    }

    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let date_str = date.format("%Y-%m-%d").to_string();
    let visit_id = match db::visit_insert(
        conn,
        &NewVisit {
            supervisor_id,
            teacher_id,
            subject_id,
            class_id,
            visit_date: &date_str,
            class_name: class_name.as_deref(),
            notes: notes.as_deref(),
            academic_year_id: academic_year_id.as_deref(),
        },
    ) {
        Ok(id) => id,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    info!(%visit_id, %supervisor_id, %teacher_id, date = %date_str, "visit scheduled");
    match load_visit(state, req, &visit_id) {
        Ok(visit) => ok(&req.id, json!({ "visit": visit })),
        Err(e) => e,
    }
}

fn handle_visits_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let visit = match load_visit(state, req, &visit_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if visit.is_completed() {
        return err(&req.id, "visit_submitted", "visit is already submitted and read-only", None);
    }

    let date_str = match req.params.get("date") {
        None | Some(serde_json::Value::Null) => visit.visit_date.clone(),
        Some(_) => {
            let date = match required_date(req, "date") {
                Ok(v) => v,
                Err(e) => return e,
            };
            match check_date(
                state,
                req,
                Some(visit.teacher_id.as_str()),
                Some(visit.subject_id.as_str()),
                Some(visit.class_id.as_str()),
                date,
            ) {
                Ok(Ok(_)) => {}
                Ok(Err(rejected)) => return date_not_allowed(req, &rejected),
                Err(e) => return e,
            }
            date.format("%Y-%m-%d").to_string()
        }
    };
    let class_name = match patch_str(req, "className", visit.class_name.clone()) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let notes = match patch_str(req, "notes", visit.notes.clone()) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::visit_update_schedule(
        conn,
        &visit_id,
        &date_str,
        class_name.as_deref(),
        notes.as_deref(),
    ) {
        Ok(true) => {}
        // Submitted between the read and the write.
        Ok(false) => {
            return err(&req.id, "visit_submitted", "visit is already submitted and read-only", None)
        }
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    }
    info!(%visit_id, date = %date_str, "visit updated");
    match load_visit(state, req, &visit_id) {
        Ok(visit) => ok(&req.id, json!({ "visit": visit })),
        Err(e) => e,
    }
}

fn handle_visits_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_visit(state, req, &visit_id) {
        Ok(visit) => ok(&req.id, json!({ "visit": visit })),
        Err(e) => e,
    }
}

fn handle_visits_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::visit_delete(conn, &visit_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "visit not found", None),
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    }
    let had_session = state.sessions.remove(&visit_id).is_some();
    state.jobs.forget(&visit_id);
    info!(%visit_id, had_session, "visit deleted");
    ok(&req.id, json!({ "ok": true }))
}

fn handle_visits_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match optional_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let supervisor_id = match optional_str(req, "supervisorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match academic_year_param(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filter = VisitFilter {
        teacher_id: teacher_id.as_deref(),
        supervisor_id: supervisor_id.as_deref(),
        academic_year_id: academic_year_id.as_deref(),
    };
    let visits = match db::visit_list(conn, &filter) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (completed, scheduled): (Vec<_>, Vec<_>) =
        visits.into_iter().partition(StoredVisit::is_completed);
    ok(
        &req.id,
        json!({
            "academicYearId": academic_year_id,
            "scheduled": scheduled,
            "completed": completed
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "visits.validateDate" => Some(handle_validate_date(state, req)),
        "visits.schedule" => Some(handle_visits_schedule(state, req)),
        "visits.update" => Some(handle_visits_update(state, req)),
        "visits.get" => Some(handle_visits_get(state, req)),
        "visits.delete" => Some(handle_visits_delete(state, req)),
        "visits.list" => Some(handle_visits_list(state, req)),
        _ => None,
    }
}
