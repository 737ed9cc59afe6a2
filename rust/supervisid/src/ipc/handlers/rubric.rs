use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rubric::{items_for, style_for, Section, LIKERT_MAX, LIKERT_MIN};
use serde_json::json;

fn handle_rubric_items(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let sections = match req.params.get("section") {
        None | Some(serde_json::Value::Null) => vec![Section::A, Section::B],
        Some(v) => match v.as_str().and_then(Section::parse) {
            Some(s) => vec![s],
            None => return err(&req.id, "bad_params", "section must be A or B", None),
        },
    };
    let items: Vec<_> = sections
        .into_iter()
        .flat_map(|s| items_for(s).iter())
        .collect();
    ok(&req.id, json!({ "items": items }))
}

fn handle_rubric_likert(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let values: Vec<_> = (LIKERT_MIN..=LIKERT_MAX).filter_map(style_for).collect();
    ok(&req.id, json!({ "values": values }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rubric.items" => Some(handle_rubric_items(state, req)),
        "rubric.likert" => Some(handle_rubric_likert(state, req)),
        _ => None,
    }
}
