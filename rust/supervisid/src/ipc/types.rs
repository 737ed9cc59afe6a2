use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::anyhow;
use rusqlite::Connection;
use serde::Deserialize;

use super::jobs::EvidenceJobs;
use crate::db;
use crate::timetable::TimetableIndex;
use crate::workflow::AssessmentWorkflow;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Built lazily from the stored timetable; dropped on import.
    pub timetable: Option<TimetableIndex>,
    /// In-progress assessments keyed by visit id. Nothing here is autosaved.
    pub sessions: HashMap<String, AssessmentWorkflow>,
    pub jobs: EvidenceJobs,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            timetable: None,
            sessions: HashMap::new(),
            jobs: EvidenceJobs::new(),
        }
    }

    pub fn timetable_index(&mut self) -> anyhow::Result<&TimetableIndex> {
        let index = match self.timetable.take() {
            Some(index) => index,
            None => {
                let conn = self
                    .db
                    .as_ref()
                    .ok_or_else(|| anyhow!("select a workspace first"))?;
                TimetableIndex::build(&db::timetable_load(conn)?)
            }
        };
        Ok(&*self.timetable.insert(index))
    }

    pub fn apply_finished_evidence(&mut self) {
        self.jobs.apply_finished(&mut self.sessions);
    }
}
