use crate::timetable::{EntryStatus, TimetableEntry, Weekday};
use crate::workflow::{FinalizedVisit, PersistenceError, VisitRecord, VisitSink};
use crate::visit_date::parse_iso_date;
use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub const DB_FILE: &str = "supervisid.sqlite3";

pub const STATUS_SCHEDULED: &str = "scheduled";
pub const STATUS_COMPLETED: &str = "completed";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(workspace.join(DB_FILE))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_entries(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            weekday TEXT NOT NULL,
            status TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_combo
         ON timetable_entries(teacher_id, subject_id, class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS visits(
            id TEXT PRIMARY KEY,
            supervisor_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            visit_date TEXT NOT NULL,
            class_name TEXT,
            topic TEXT,
            notes TEXT,
            hasil_supervisi TEXT,
            dokumentasi TEXT,
            status TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            academic_year_id TEXT
        )",
        [],
    )?;
    ensure_visits_academic_year(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visits_teacher ON visits(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visits_supervisor ON visits(supervisor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visits_academic_year ON visits(academic_year_id)",
        [],
    )?;

    Ok(conn)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Workspaces created before visits were scoped by academic year.
fn ensure_visits_academic_year(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "visits", "academic_year_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE visits ADD COLUMN academic_year_id TEXT", [])?;
    Ok(())
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Replaces the whole timetable snapshot.
pub fn timetable_replace(conn: &Connection, entries: &[TimetableEntry]) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM timetable_entries", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO timetable_entries(teacher_id, subject_id, class_id, weekday, status)
             VALUES(?, ?, ?, ?, ?)",
        )?;
        for e in entries {
            stmt.execute((
                &e.teacher_id,
                &e.subject_id,
                &e.class_id,
                e.weekday.as_str(),
                e.status.as_str(),
            ))?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

pub fn timetable_load(conn: &Connection) -> anyhow::Result<Vec<TimetableEntry>> {
    let mut stmt = conn.prepare(
        "SELECT teacher_id, subject_id, class_id, weekday, status
         FROM timetable_entries
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (teacher_id, subject_id, class_id, weekday, status) in rows {
        let weekday = Weekday::parse(&weekday)
            .ok_or_else(|| anyhow!("stored timetable weekday is invalid: {}", weekday))?;
        let status = EntryStatus::parse(&status)
            .ok_or_else(|| anyhow!("stored timetable status is invalid: {}", status))?;
        out.push(TimetableEntry {
            teacher_id,
            subject_id,
            class_id,
            weekday,
            status,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVisit {
    pub id: String,
    pub supervisor_id: String,
    pub teacher_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub visit_date: String,
    pub class_name: Option<String>,
    pub topic: Option<String>,
    pub notes: Option<String>,
    #[serde(rename = "hasil_supervisi")]
    pub results: Option<serde_json::Value>,
    #[serde(rename = "dokumentasi")]
    pub evidence: Option<serde_json::Value>,
    pub status: String,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub academic_year_id: Option<String>,
}

impl StoredVisit {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }

    pub fn to_visit_record(&self) -> anyhow::Result<VisitRecord> {
        let visit_date = parse_iso_date(&self.visit_date)
            .ok_or_else(|| anyhow!("stored visit date is invalid: {}", self.visit_date))?;
        Ok(VisitRecord {
            id: self.id.clone(),
            supervisor_id: self.supervisor_id.clone(),
            teacher_id: self.teacher_id.clone(),
            subject_id: self.subject_id.clone(),
            class_id: self.class_id.clone(),
            visit_date,
            class_name: self.class_name.clone().unwrap_or_default(),
            topic: self.topic.clone().unwrap_or_default(),
            version: self.version,
        })
    }
}

const VISIT_COLUMNS: &str = "id, supervisor_id, teacher_id, subject_id, class_id, visit_date,
    class_name, topic, notes, hasil_supervisi, dokumentasi, status, version, created_at, updated_at,
    academic_year_id";

fn json_column(raw: Option<String>) -> Option<serde_json::Value> {
    // Unparseable historical blobs read as absent rather than failing the row.
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn visit_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredVisit> {
    Ok(StoredVisit {
        id: r.get(0)?,
        supervisor_id: r.get(1)?,
        teacher_id: r.get(2)?,
        subject_id: r.get(3)?,
        class_id: r.get(4)?,
        visit_date: r.get(5)?,
        class_name: r.get(6)?,
        topic: r.get(7)?,
        notes: r.get(8)?,
        results: json_column(r.get(9)?),
        evidence: json_column(r.get(10)?),
        status: r.get(11)?,
        version: r.get(12)?,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
        academic_year_id: r.get(15)?,
    })
}

pub struct NewVisit<'a> {
    pub supervisor_id: &'a str,
    pub teacher_id: &'a str,
    pub subject_id: &'a str,
    pub class_id: &'a str,
    pub visit_date: &'a str,
    pub class_name: Option<&'a str>,
    pub notes: Option<&'a str>,
    pub academic_year_id: Option<&'a str>,
}

pub fn visit_insert(conn: &Connection, visit: &NewVisit<'_>) -> anyhow::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_ts();
    conn.execute(
        "INSERT INTO visits(id, supervisor_id, teacher_id, subject_id, class_id, visit_date,
            class_name, notes, status, version, created_at, updated_at, academic_year_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        params![
            id,
            visit.supervisor_id,
            visit.teacher_id,
            visit.subject_id,
            visit.class_id,
            visit.visit_date,
            visit.class_name,
            visit.notes,
            STATUS_SCHEDULED,
            now,
            now,
            visit.academic_year_id
        ],
    )?;
    Ok(id)
}

pub fn visit_get(conn: &Connection, id: &str) -> anyhow::Result<Option<StoredVisit>> {
    let sql = format!("SELECT {} FROM visits WHERE id = ?", VISIT_COLUMNS);
    Ok(conn.query_row(&sql, [id], visit_from_row).optional()?)
}

/// Each `None` filter matches every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitFilter<'a> {
    pub teacher_id: Option<&'a str>,
    pub supervisor_id: Option<&'a str>,
    pub academic_year_id: Option<&'a str>,
}

pub fn visit_list(conn: &Connection, filter: &VisitFilter<'_>) -> anyhow::Result<Vec<StoredVisit>> {
    let sql = format!(
        "SELECT {} FROM visits
         WHERE (?1 IS NULL OR teacher_id = ?1)
           AND (?2 IS NULL OR supervisor_id = ?2)
           AND (?3 IS NULL OR academic_year_id = ?3)
         ORDER BY visit_date DESC, created_at DESC",
        VISIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![filter.teacher_id, filter.supervisor_id, filter.academic_year_id],
            visit_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Reschedule fields of a visit that has not been submitted. Returns false when
/// no scheduled visit matched.
pub fn visit_update_schedule(
    conn: &Connection,
    id: &str,
    visit_date: &str,
    class_name: Option<&str>,
    notes: Option<&str>,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE visits
         SET visit_date = ?, class_name = ?, notes = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND status = ?",
        params![visit_date, class_name, notes, now_ts(), id, STATUS_SCHEDULED],
    )?;
    Ok(changed > 0)
}

pub fn visit_delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    Ok(conn.execute("DELETE FROM visits WHERE id = ?", [id])? > 0)
}

fn backend_err(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

/// Persistence collaborator backed by the workspace database.
pub struct SqliteVisitSink<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVisitSink<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl VisitSink for SqliteVisitSink<'_> {
    fn persist(
        &mut self,
        visit_id: &str,
        expected_version: i64,
        record: &FinalizedVisit,
    ) -> Result<(), PersistenceError> {
        let results = serde_json::to_string(&record.results).map_err(backend_err)?;
        let evidence = serde_json::to_string(&record.evidence).map_err(backend_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE visits
                 SET class_name = ?, topic = ?, hasil_supervisi = ?, dokumentasi = ?,
                     status = ?, version = version + 1, updated_at = ?
                 WHERE id = ? AND version = ? AND status = ?",
                params![
                    record.class_name,
                    record.topic,
                    results,
                    evidence,
                    STATUS_COMPLETED,
                    now_ts(),
                    visit_id,
                    expected_version,
                    STATUS_SCHEDULED
                ],
            )
            .map_err(backend_err)?;
        if changed == 1 {
            return Ok(());
        }
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM visits WHERE id = ?", [visit_id], |r| r.get(0))
            .optional()
            .map_err(backend_err)?;
        match exists {
            Some(_) => Err(PersistenceError::Conflict {
                visit_id: visit_id.to_string(),
                expected_version,
            }),
            None => Err(PersistenceError::NotFound {
                visit_id: visit_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::AssessmentResults;

    fn workspace() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open db");
        (dir, conn)
    }

    fn schedule(conn: &Connection, teacher: &str, date: &str) -> String {
        schedule_in_year(conn, teacher, date, None)
    }

    fn schedule_in_year(conn: &Connection, teacher: &str, date: &str, year: Option<&str>) -> String {
        visit_insert(
            conn,
            &NewVisit {
                supervisor_id: "SUP",
                teacher_id: teacher,
                subject_id: "S1",
                class_id: "C1",
                visit_date: date,
                class_name: Some("X IPA 1"),
                notes: None,
                academic_year_id: year,
            },
        )
        .expect("insert visit")
    }

    fn finalized() -> FinalizedVisit {
        FinalizedVisit {
            supervisor_id: "SUP".into(),
            teacher_id: "T1".into(),
            subject_id: "S1".into(),
            class_id: "C1".into(),
            visit_date: "2026-10-14".into(),
            class_name: "X IPA 1".into(),
            topic: "Vectors".into(),
            results: AssessmentResults::default(),
            evidence: vec!["data:image/jpeg;base64,AAAA".into()],
        }
    }

    #[test]
    fn settings_round_trip_and_overwrite() {
        let (_dir, conn) = workspace();
        assert!(settings_get_json(&conn, "setup.evidence").expect("get").is_none());
        settings_set_json(&conn, "setup.evidence", &serde_json::json!({ "maxEdgePx": 640 }))
            .expect("set");
        settings_set_json(&conn, "setup.evidence", &serde_json::json!({ "maxEdgePx": 900 }))
            .expect("overwrite");
        let v = settings_get_json(&conn, "setup.evidence").expect("get").expect("some");
        assert_eq!(v["maxEdgePx"], 900);
    }

    #[test]
    fn timetable_replace_is_wholesale() {
        let (_dir, conn) = workspace();
        let row = |day| TimetableEntry {
            teacher_id: "T1".into(),
            subject_id: "S1".into(),
            class_id: "C1".into(),
            weekday: day,
            status: EntryStatus::Active,
        };
        timetable_replace(&conn, &[row(Weekday::Mon), row(Weekday::Wed)]).expect("first");
        timetable_replace(&conn, &[row(Weekday::Fri)]).expect("second");
        let loaded = timetable_load(&conn).expect("load");
        assert_eq!(loaded, vec![row(Weekday::Fri)]);
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let (_dir, conn) = workspace();
        schedule(&conn, "T1", "2026-10-12");
        schedule(&conn, "T1", "2026-10-19");
        schedule(&conn, "T2", "2026-10-14");
        let by_teacher = VisitFilter {
            teacher_id: Some("T1"),
            ..Default::default()
        };
        let t1 = visit_list(&conn, &by_teacher).expect("list");
        let dates: Vec<_> = t1.iter().map(|v| v.visit_date.as_str()).collect();
        assert_eq!(dates, vec!["2026-10-19", "2026-10-12"]);
        let by_supervisor = VisitFilter {
            supervisor_id: Some("SUP"),
            ..Default::default()
        };
        assert_eq!(visit_list(&conn, &by_supervisor).expect("all").len(), 3);
    }

    #[test]
    fn list_scopes_by_academic_year() {
        let (_dir, conn) = workspace();
        let current = schedule_in_year(&conn, "T1", "2026-10-12", Some("2026/2027"));
        schedule_in_year(&conn, "T1", "2026-03-09", Some("2025/2026"));
        schedule(&conn, "T1", "2026-10-19");

        let filter = VisitFilter {
            teacher_id: Some("T1"),
            academic_year_id: Some("2026/2027"),
            ..Default::default()
        };
        let scoped = visit_list(&conn, &filter).expect("list");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, current);
        assert_eq!(scoped[0].academic_year_id.as_deref(), Some("2026/2027"));
        assert_eq!(visit_list(&conn, &VisitFilter::default()).expect("all").len(), 3);
    }

    #[test]
    fn reopening_an_unscoped_workspace_adds_the_year_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let conn = Connection::open(dir.path().join(DB_FILE)).expect("raw open");
            conn.execute(
                "CREATE TABLE visits(
                    id TEXT PRIMARY KEY,
                    supervisor_id TEXT NOT NULL,
                    teacher_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    class_id TEXT NOT NULL,
                    visit_date TEXT NOT NULL,
                    class_name TEXT,
                    topic TEXT,
                    notes TEXT,
                    hasil_supervisi TEXT,
                    dokumentasi TEXT,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .expect("legacy table");
            conn.execute(
                "INSERT INTO visits VALUES('old', 'SUP', 'T1', 'S1', 'C1', '2025-09-01',
                    NULL, NULL, NULL, NULL, NULL, 'scheduled', 1, 'x', 'x')",
                [],
            )
            .expect("legacy row");
        }
        let conn = open_db(dir.path()).expect("reopen");
        assert!(table_has_column(&conn, "visits", "academic_year_id").expect("pragma"));
        let old = visit_get(&conn, "old").expect("get").expect("exists");
        assert_eq!(old.academic_year_id, None);
    }

    #[test]
    fn sink_persists_once_then_conflicts() {
        let (_dir, conn) = workspace();
        let id = schedule(&conn, "T1", "2026-10-14");
        let mut sink = SqliteVisitSink::new(&conn);
        sink.persist(&id, 1, &finalized()).expect("persist");

        let stored = visit_get(&conn, &id).expect("get").expect("exists");
        assert!(stored.is_completed());
        assert_eq!(stored.version, 2);
        assert_eq!(stored.topic.as_deref(), Some("Vectors"));
        assert_eq!(stored.evidence.as_ref().and_then(|v| v.as_array()).map(|a| a.len()), Some(1));

        assert_eq!(
            sink.persist(&id, 1, &finalized()),
            Err(PersistenceError::Conflict {
                visit_id: id.clone(),
                expected_version: 1
            })
        );
        assert_eq!(
            sink.persist("missing", 1, &finalized()),
            Err(PersistenceError::NotFound {
                visit_id: "missing".into()
            })
        );
    }

    #[test]
    fn reschedule_bumps_version_and_skips_completed() {
        let (_dir, conn) = workspace();
        let id = schedule(&conn, "T1", "2026-10-14");
        assert!(visit_update_schedule(&conn, &id, "2026-10-21", Some("X IPA 2"), Some("bring plan"))
            .expect("update"));
        let stored = visit_get(&conn, &id).expect("get").expect("exists");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.visit_date, "2026-10-21");

        SqliteVisitSink::new(&conn)
            .persist(&id, 2, &finalized())
            .expect("persist");
        assert!(!visit_update_schedule(&conn, &id, "2026-10-28", None, None).expect("update"));
    }
}
