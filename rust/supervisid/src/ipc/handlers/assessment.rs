use std::time::Duration;

use crate::db::{self, SqliteVisitSink};
use crate::evidence::{decode_payload, EvidenceError, NormalizedImage};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::jobs::RejectedEvidence;
use crate::ipc::types::{AppState, Request};
use crate::rubric::{RubricError, Section};
use crate::workflow::{AssessmentWorkflow, PersistenceError, Stage, ValidationError, WorkflowError};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::setup::load_evidence_config;

const AWAIT_EVIDENCE_TIMEOUT: Duration = Duration::from_secs(60);

fn failures_json(failures: &[ValidationError]) -> Value {
    Value::Array(
        failures
            .iter()
            .map(|f| {
                let mut v = json!(f);
                v["message"] = json!(f.to_string());
                v
            })
            .collect(),
    )
}

/// `ticket` is the stable handle; `index` shifts when an earlier pending slot
/// resolves or a slot is removed.
fn image_json(index: usize, ticket: u64, img: &NormalizedImage) -> Value {
    let mut v = json!(img);
    v["index"] = json!(index);
    v["ticket"] = json!(ticket);
    v
}

fn evidence_json(wf: &AssessmentWorkflow) -> Vec<Value> {
    wf.evidence()
        .entries()
        .into_iter()
        .enumerate()
        .map(|(i, (ticket, img))| image_json(i, ticket, img))
        .collect()
}

fn session_json(visit_id: &str, wf: &AssessmentWorkflow, rejected: &[RejectedEvidence]) -> Value {
    let record = wf.record();
    let scorer = wf.scorer();
    json!({
        "visitId": visit_id,
        "stage": wf.stage(),
        "validationErrors": failures_json(&wf.state().validation_errors),
        "className": record.class_name,
        "topic": record.topic,
        "visitDate": record.visit_date.format("%Y-%m-%d").to_string(),
        "sectionA": scorer.scores(Section::A),
        "sectionB": scorer.scores(Section::B),
        "sectionAComplete": scorer.is_complete(Section::A),
        "sectionBComplete": scorer.is_complete(Section::B),
        "evidence": evidence_json(wf),
        "pendingEvidence": wf.evidence().pending(),
        "evidenceSufficient": wf.evidence().is_sufficient(),
        "rejectedEvidence": rejected,
        "version": record.version
    })
}

fn workflow_err(id: &str, e: &WorkflowError) -> Value {
    let message = e.to_string();
    match e {
        WorkflowError::Submitted => err(id, "visit_submitted", message, None),
        WorkflowError::StageMismatch { current, expected } => err(
            id,
            "stage_mismatch",
            message,
            Some(json!({ "current": current, "expected": expected })),
        ),
        WorkflowError::Blocked { stage, failures } => err(
            id,
            "validation_failed",
            message,
            Some(json!({ "stage": stage, "failures": failures_json(failures) })),
        ),
        WorkflowError::Rubric(RubricError::InvalidItem { .. }) => {
            err(id, "invalid_item", message, None)
        }
        WorkflowError::Rubric(RubricError::InvalidScore { value }) => {
            err(id, "invalid_score", message, Some(json!({ "value": value })))
        }
        WorkflowError::Evidence(ev) => evidence_err(id, ev),
        WorkflowError::Persistence(PersistenceError::Conflict { .. }) => {
            err(id, "persistence_conflict", message, None)
        }
        WorkflowError::Persistence(PersistenceError::NotFound { .. }) => {
            err(id, "not_found", message, None)
        }
        WorkflowError::Persistence(PersistenceError::Backend(_)) => {
            err(id, "persistence_failed", message, None)
        }
    }
}

fn evidence_err(id: &str, e: &EvidenceError) -> Value {
    let message = e.to_string();
    match e {
        EvidenceError::MaxCountExceeded => err(id, "max_count_exceeded", message, None),
        EvidenceError::ImageProcessing(_) => err(id, "image_processing_failed", message, None),
        EvidenceError::InvalidIndex(index) => {
            err(id, "bad_params", message, Some(json!({ "index": index })))
        }
        EvidenceError::UnknownTicket(ticket) => {
            err(id, "not_found", message, Some(json!({ "ticket": ticket })))
        }
        EvidenceError::DuplicateTicket(ticket) => {
            err(id, "bad_params", message, Some(json!({ "ticket": ticket })))
        }
    }
}

fn session_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
    visit_id: &str,
) -> Result<&'a mut AssessmentWorkflow, Value> {
    state.sessions.get_mut(visit_id).ok_or_else(|| {
        err(
            &req.id,
            "not_found",
            "no open assessment for this visit",
            Some(json!({ "visitId": visit_id })),
        )
    })
}

fn handle_open(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let visit = match db::visit_get(conn, &visit_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "visit not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if visit.is_completed() {
        return err(&req.id, "visit_submitted", "visit is already submitted and read-only", None);
    }
    let resumed = state.sessions.contains_key(&visit_id);
    if !resumed {
        let record = match visit.to_visit_record() {
            Ok(r) => r,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        state
            .sessions
            .insert(visit_id.clone(), AssessmentWorkflow::open(record));
        info!(%visit_id, version = visit.version, "assessment opened");
    }
    let Some(wf) = state.sessions.get(&visit_id) else {
        return err(&req.id, "not_found", "no open assessment for this visit", None);
    };
    let mut result = session_json(&visit_id, wf, state.jobs.rejected(&visit_id));
    result["resumed"] = json!(resumed);
    ok(&req.id, result)
}

fn handle_get(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match state.sessions.get(&visit_id) {
        Some(wf) => ok(
            &req.id,
            session_json(&visit_id, wf, state.jobs.rejected(&visit_id)),
        ),
        None => err(&req.id, "not_found", "no open assessment for this visit", None),
    }
}

fn string_param<'a>(req: &'a Request, key: &str) -> Result<Option<&'a str>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| {
            err(&req.id, "bad_params", format!("{} must be string", key), None)
        }),
    }
}

fn handle_set_info(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match string_param(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let topic = match string_param(req, "topic") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let wf = match session_mut(state, req, &visit_id) {
        Ok(wf) => wf,
        Err(e) => return e,
    };
    if let Err(e) = wf.set_info(class_name, topic) {
        return workflow_err(&req.id, &e);
    }
    ok(
        &req.id,
        json!({
            "className": wf.record().class_name,
            "topic": wf.record().topic
        }),
    )
}

fn handle_set_score(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section = match required_str(req, "section") {
        Ok(raw) => match Section::parse(&raw) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", "section must be A or B", None),
        },
        Err(e) => return e,
    };
    let item_key = match required_str(req, "itemKey") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "value must be integer", None);
    };
    let wf = match session_mut(state, req, &visit_id) {
        Ok(wf) => wf,
        Err(e) => return e,
    };
    if let Err(e) = wf.set_score(section, &item_key, value) {
        return workflow_err(&req.id, &e);
    }
    ok(
        &req.id,
        json!({
            "section": section,
            "itemKey": item_key,
            "value": wf.scorer().score(section, &item_key),
            "sectionComplete": wf.scorer().is_complete(section),
            "missing": wf.scorer().missing(section)
        }),
    )
}

fn handle_add_evidence(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let config = match load_evidence_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(image) = req.params.get("image").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing image", None);
    };
    let wait = match req.params.get("wait") {
        None | Some(Value::Null) => true,
        Some(v) => match v.as_bool() {
            Some(b) => b,
            None => return err(&req.id, "bad_params", "wait must be boolean", None),
        },
    };
    if !state.sessions.contains_key(&visit_id) {
        return err(&req.id, "not_found", "no open assessment for this visit", None);
    }
    let raw = match decode_payload(image) {
        Ok(b) => b,
        Err(e) => {
            warn!(%visit_id, error = %e, "evidence rejected");
            return evidence_err(&req.id, &e);
        }
    };

    if !wait {
        let ticket = state.jobs.reserve_ticket();
        let wf = match session_mut(state, req, &visit_id) {
            Ok(wf) => wf,
            Err(e) => return e,
        };
        if let Err(e) = wf.begin_evidence(ticket) {
            return workflow_err(&req.id, &e);
        }
        let pending = wf.evidence().pending();
        state.jobs.spawn(&visit_id, ticket, raw, config);
        info!(%visit_id, ticket, "evidence queued");
        return ok(
            &req.id,
            json!({ "ticket": ticket, "pending": true, "pendingEvidence": pending }),
        );
    }

    let ticket = state.jobs.reserve_ticket();
    let wf = match session_mut(state, req, &visit_id) {
        Ok(wf) => wf,
        Err(e) => return e,
    };
    match wf.add_evidence(ticket, &raw, &config) {
        Ok(img) => {
            let count = wf.evidence().count();
            let index = wf
                .evidence()
                .index_of(ticket)
                .unwrap_or(count.saturating_sub(1));
            info!(%visit_id, ticket, bytes = img.bytes, quality = img.quality, "evidence accepted");
            ok(
                &req.id,
                json!({
                    "image": image_json(index, ticket, &img),
                    "count": count,
                    "pendingEvidence": wf.evidence().pending()
                }),
            )
        }
        Err(e) => {
            warn!(%visit_id, error = %e, "evidence rejected");
            workflow_err(&req.id, &e)
        }
    }
}

fn handle_await_evidence(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !state.sessions.contains_key(&visit_id) {
        return err(&req.id, "not_found", "no open assessment for this visit", None);
    }
    if !state
        .jobs
        .wait_idle(&visit_id, &mut state.sessions, AWAIT_EVIDENCE_TIMEOUT)
    {
        let pending = state
            .sessions
            .get(&visit_id)
            .map(|wf| wf.evidence().pending())
            .unwrap_or(0);
        return err(
            &req.id,
            "evidence_timeout",
            "evidence normalization did not finish in time",
            Some(json!({ "pendingEvidence": pending })),
        );
    }
    let rejected = state.jobs.take_rejected(&visit_id);
    match state.sessions.get(&visit_id) {
        Some(wf) => ok(
            &req.id,
            json!({
                "pendingEvidence": 0,
                "evidence": evidence_json(wf),
                "rejected": rejected
            }),
        ),
        None => err(&req.id, "not_found", "no open assessment for this visit", None),
    }
}

enum EvidenceKey {
    Ticket(u64),
    Index(usize),
}

/// `ticket` wins when both are given.
fn evidence_key(req: &Request) -> Result<EvidenceKey, Value> {
    let as_count = |key: &str| {
        req.params
            .get(key)
            .filter(|v| !v.is_null())
            .map(|v| v.as_u64().ok_or(key.to_string()))
    };
    match (as_count("ticket"), as_count("index")) {
        (Some(Ok(ticket)), _) => Ok(EvidenceKey::Ticket(ticket)),
        (None, Some(Ok(index))) => usize::try_from(index)
            .map(EvidenceKey::Index)
            .map_err(|_| err(&req.id, "bad_params", "index out of range", None)),
        (Some(Err(key)), _) | (None, Some(Err(key))) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a non-negative integer", key),
            None,
        )),
        (None, None) => Err(err(&req.id, "bad_params", "missing ticket or index", None)),
    }
}

fn handle_remove_evidence(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match evidence_key(req) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let wf = match session_mut(state, req, &visit_id) {
        Ok(wf) => wf,
        Err(e) => return e,
    };
    let outcome = match key {
        EvidenceKey::Ticket(ticket) => wf.remove_evidence_ticket(ticket).map(|removed| {
            match &removed {
                Some(img) => info!(%visit_id, ticket, sha256 = %img.sha256, "evidence removed"),
                None => info!(%visit_id, ticket, "pending evidence cancelled"),
            }
            removed.is_none()
        }),
        EvidenceKey::Index(index) => wf.remove_evidence(index).map(|removed| {
            info!(%visit_id, index, sha256 = %removed.sha256, "evidence removed");
            false
        }),
    };
    match outcome {
        Ok(cancelled) => ok(
            &req.id,
            json!({
                "count": wf.evidence().count(),
                "pendingEvidence": wf.evidence().pending(),
                "cancelled": cancelled,
                "evidence": evidence_json(wf)
            }),
        ),
        Err(e) => workflow_err(&req.id, &e),
    }
}

fn handle_advance(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(wf) = state.sessions.get_mut(&visit_id) else {
        return err(&req.id, "not_found", "no open assessment for this visit", None);
    };
    let from = wf.stage();
    let mut sink = SqliteVisitSink::new(conn);
    match wf.advance(&mut sink) {
        Ok(Stage::Submitted) => {
            info!(%visit_id, version = wf.record().version, "assessment submitted");
            // The stored visit is now the record of truth; the session is done.
            state.sessions.remove(&visit_id);
            state.jobs.forget(&visit_id);
            let visit = match db::visit_get(conn, &visit_id) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            ok(
                &req.id,
                json!({ "stage": Stage::Submitted, "visit": visit }),
            )
        }
        Ok(stage) => {
            info!(%visit_id, from = from.as_str(), to = stage.as_str(), "assessment advanced");
            ok(&req.id, session_json(&visit_id, wf, state.jobs.rejected(&visit_id)))
        }
        Err(e) => {
            match &e {
                WorkflowError::Persistence(p) => {
                    warn!(%visit_id, error = %p, "assessment submission failed")
                }
                _ => info!(%visit_id, stage = from.as_str(), error = %e, "assessment advance blocked"),
            }
            workflow_err(&req.id, &e)
        }
    }
}

fn handle_back(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(wf) = state.sessions.get_mut(&visit_id) else {
        return err(&req.id, "not_found", "no open assessment for this visit", None);
    };
    match wf.back() {
        Ok(stage) => {
            info!(%visit_id, to = stage.as_str(), "assessment moved back");
            ok(&req.id, session_json(&visit_id, wf, state.jobs.rejected(&visit_id)))
        }
        Err(e) => workflow_err(&req.id, &e),
    }
}

fn handle_abandon(state: &mut AppState, req: &Request) -> Value {
    let visit_id = match required_str(req, "visitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let discarded = state.sessions.remove(&visit_id).is_some();
    state.jobs.forget(&visit_id);
    if discarded {
        info!(%visit_id, "assessment abandoned");
    }
    ok(&req.id, json!({ "discarded": discarded }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "assessment.open" => Some(handle_open(state, req)),
        "assessment.get" => Some(handle_get(state, req)),
        "assessment.setInfo" => Some(handle_set_info(state, req)),
        "assessment.setScore" => Some(handle_set_score(state, req)),
        "assessment.addEvidence" => Some(handle_add_evidence(state, req)),
        "assessment.awaitEvidence" => Some(handle_await_evidence(state, req)),
        "assessment.removeEvidence" => Some(handle_remove_evidence(state, req)),
        "assessment.advance" => Some(handle_advance(state, req)),
        "assessment.back" => Some(handle_back(state, req)),
        "assessment.abandon" => Some(handle_abandon(state, req)),
        _ => None,
    }
}
