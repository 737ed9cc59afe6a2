#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_supervisid");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn supervisid");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the `error` object of a response that must have failed.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

pub fn error_code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

/// A gradient PNG, base64 encoded the way a browser upload arrives.
pub fn png_base64(width: u32, height: u32) -> String {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    format!("data:image/png;base64,{}", BASE64.encode(out.into_inner()))
}

/// One teacher teaching S1 to C1 on Monday and Wednesday.
pub fn standard_timetable() -> serde_json::Value {
    json!({
        "entries": [
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Senin", "status": "Aktif" },
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Wednesday", "status": "Active" },
            { "teacherId": "T1", "subjectId": "S1", "classId": "C2", "weekday": "Fri", "status": "Nonaktif" },
            { "teacherId": "T1", "subjectId": "S2", "classId": "C1", "weekday": "Kamis", "status": "Aktif" },
            { "teacherId": "T2", "subjectId": "S3", "classId": "C3", "weekday": "Tue", "status": "Active" }
        ]
    })
}

/// Opens the assessment and walks it to Execution with section A scored.
pub fn drive_to_execution(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    visit_id: &str,
) {
    let _ = request_ok(stdin, reader, "x-open", "assessment.open", json!({ "visitId": visit_id }));
    let _ = request_ok(
        stdin,
        reader,
        "x-info",
        "assessment.setInfo",
        json!({ "visitId": visit_id, "className": "VIII A", "topic": "Photosynthesis" }),
    );
    let _ = request_ok(stdin, reader, "x-plan", "assessment.advance", json!({ "visitId": visit_id }));
    score_all(stdin, reader, visit_id, "A", &["a1", "a2", "a3", "a4"]);
    let _ = request_ok(stdin, reader, "x-exec", "assessment.advance", json!({ "visitId": visit_id }));
}

pub fn score_all(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    visit_id: &str,
    section: &str,
    keys: &[&str],
) {
    for key in keys {
        let _ = request_ok(
            stdin,
            reader,
            &format!("x-score-{}", key),
            "assessment.setScore",
            json!({ "visitId": visit_id, "section": section, "itemKey": key, "value": 3 }),
        );
    }
}

pub fn schedule_wednesday_visit(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> String {
    let scheduled = request_ok(
        stdin,
        reader,
        "x-schedule",
        "visits.schedule",
        json!({
            "supervisorId": "SUP", "teacherId": "T1", "subjectId": "S1", "classId": "C1",
            "date": "2026-10-14"
        }),
    );
    scheduled
        .pointer("/visit/id")
        .and_then(|v| v.as_str())
        .expect("visit id")
        .to_string()
}
