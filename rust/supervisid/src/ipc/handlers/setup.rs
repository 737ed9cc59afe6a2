use crate::db;
use crate::evidence::NormalizeConfig;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Evidence,
    Visits,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "evidence" => Some(Self::Evidence),
            "visits" => Some(Self::Visits),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Evidence => "setup.evidence",
            Self::Visits => "setup.visits",
        }
    }
}

fn config_json(cfg: &NormalizeConfig) -> Value {
    json!({
        "maxEdgePx": cfg.max_edge_px,
        "initialQuality": cfg.initial_quality,
        "targetBytes": cfg.target_bytes,
        "qualityStep": cfg.quality_step,
        "minQuality": cfg.min_quality
    })
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Evidence => config_json(&NormalizeConfig::observation()),
        SetupSection::Visits => json!({ "activeAcademicYearId": null }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_nullable_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::from(parse_i64_range(v, key, min, max)?))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    // A preset resets the whole section before individual fields apply.
    if let (SetupSection::Evidence, Some(preset)) = (section, patch.get("preset")) {
        let cfg = match preset.as_str() {
            Some("observation") => NormalizeConfig::observation(),
            Some("document") => NormalizeConfig::document(),
            _ => return Err("preset must be one of: observation, document".into()),
        };
        *current = config_json(&cfg);
    }
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Evidence => match k.as_str() {
                "preset" => {}
                "maxEdgePx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 100, 4000)?));
                }
                "initialQuality" | "minQuality" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100)?));
                }
                "qualityStep" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "targetBytes" => {
                    obj.insert(
                        k.clone(),
                        parse_nullable_i64_range(v, k, 1024, 20_000_000)?,
                    );
                }
                _ => return Err(format!("unknown evidence field: {}", k)),
            },
            SetupSection::Visits => match k.as_str() {
                "activeAcademicYearId" => {
                    let year = match v {
                        Value::Null => Value::Null,
                        Value::String(s) if !s.trim().is_empty() => Value::from(s.trim()),
                        _ => return Err(format!("{} must be a non-empty string or null", k)),
                    };
                    obj.insert(k.clone(), year);
                }
                _ => return Err(format!("unknown visits field: {}", k)),
            },
        }
    }
    let initial = obj.get("initialQuality").and_then(|v| v.as_i64());
    let floor = obj.get("minQuality").and_then(|v| v.as_i64());
    if let (Some(initial), Some(floor)) = (initial, floor) {
        if floor > initial {
            return Err("minQuality must be <= initialQuality".into());
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

/// Academic year new visits fall into when the caller names none.
pub fn load_active_academic_year(conn: &rusqlite::Connection) -> anyhow::Result<Option<String>> {
    let v = load_section(conn, SetupSection::Visits)?;
    Ok(v
        .get("activeAcademicYearId")
        .and_then(|x| x.as_str())
        .map(str::to_string))
}

/// Normalization settings for the workspace, defaults filled in.
pub fn load_evidence_config(conn: &rusqlite::Connection) -> anyhow::Result<NormalizeConfig> {
    let v = load_section(conn, SetupSection::Evidence)?;
    let defaults = NormalizeConfig::observation();
    let field = |k: &str| v.get(k).and_then(|x| x.as_u64());
    Ok(NormalizeConfig {
        max_edge_px: field("maxEdgePx")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.max_edge_px),
        initial_quality: field("initialQuality")
            .and_then(|n| u8::try_from(n).ok())
            .unwrap_or(defaults.initial_quality),
        target_bytes: field("targetBytes").and_then(|n| usize::try_from(n).ok()),
        quality_step: field("qualityStep")
            .and_then(|n| u8::try_from(n).ok())
            .unwrap_or(defaults.quality_step),
        min_quality: field("minQuality")
            .and_then(|n| u8::try_from(n).ok())
            .unwrap_or(defaults.min_quality),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let evidence = match load_section(conn, SetupSection::Evidence) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let visits = match load_section(conn, SetupSection::Visits) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "evidence": evidence, "visits": visits }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.key(), "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
