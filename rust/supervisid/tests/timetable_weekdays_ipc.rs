mod test_support;

use serde_json::json;
use test_support::{error_code, request_err, request_ok, spawn_sidecar, standard_timetable, temp_dir};

fn names(v: &serde_json::Value) -> Vec<String> {
    v.get("names")
        .and_then(|v| v.as_array())
        .expect("names")
        .iter()
        .filter_map(|n| n.as_str().map(str::to_string))
        .collect()
}

#[test]
fn allowed_weekdays_follow_active_rows_for_the_combination() {
    let workspace = temp_dir("supervisid-timetable-weekdays");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(&mut stdin, &mut reader, "2", "timetable.import", standard_timetable());
    assert_eq!(imported.get("imported").and_then(|v| v.as_u64()), Some(5));
    assert_eq!(imported.get("active").and_then(|v| v.as_u64()), Some(4));

    let allowed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.allowedWeekdays",
        json!({ "teacherId": "T1", "subjectId": "S1", "classId": "C1" }),
    );
    assert_eq!(names(&allowed), vec!["Mon", "Wed"]);
    assert_eq!(allowed.get("isConstrained").and_then(|v| v.as_bool()), Some(true));

    // Only an inactive row: no constraint at all.
    let inactive = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.allowedWeekdays",
        json!({ "teacherId": "T1", "subjectId": "S1", "classId": "C2" }),
    );
    assert!(names(&inactive).is_empty());
    assert_eq!(inactive.get("isConstrained").and_then(|v| v.as_bool()), Some(false));

    let partial = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.allowedWeekdays",
        json!({ "teacherId": "T1", "subjectId": "S1" }),
    );
    assert_eq!(partial.get("isConstrained").and_then(|v| v.as_bool()), Some(false));

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.subjects",
        json!({ "teacherId": "T1" }),
    );
    assert_eq!(subjects.get("subjectIds"), Some(&json!(["S1", "S2"])));
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.classes",
        json!({ "teacherId": "T1", "subjectId": "S1" }),
    );
    assert_eq!(classes.get("classIds"), Some(&json!(["C1", "C2"])));

    // Re-import replaces the snapshot and the cached index with it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.import",
        json!({ "entries": [
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Sabtu", "status": "Aktif" }
        ]}),
    );
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.allowedWeekdays",
        json!({ "teacherId": "T1", "subjectId": "S1", "classId": "C1" }),
    );
    assert_eq!(names(&after), vec!["Sat"]);
    let listed = request_ok(&mut stdin, &mut reader, "10", "timetable.list", json!({}));
    assert_eq!(
        listed.get("entries").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn import_rejects_sunday_and_unknown_status_without_writing() {
    let workspace = temp_dir("supervisid-timetable-reject");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "timetable.import", standard_timetable());

    let e = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.import",
        json!({ "entries": [
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Mon" },
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Minggu" }
        ]}),
    );
    assert_eq!(error_code(&e), "bad_params");
    assert_eq!(e.pointer("/details/index").and_then(|v| v.as_u64()), Some(1));

    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.import",
        json!({ "entries": [
            { "teacherId": "T1", "subjectId": "S1", "classId": "C1", "weekday": "Mon", "status": "maybe" }
        ]}),
    );
    assert_eq!(error_code(&e), "bad_params");

    let listed = request_ok(&mut stdin, &mut reader, "5", "timetable.list", json!({}));
    assert_eq!(
        listed.get("entries").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(5)
    );
}
