use crate::evidence::{
    EvidenceCollector, EvidenceError, NormalizeConfig, NormalizedImage, MIN_EVIDENCE,
};
use crate::rubric::{RubricError, RubricScorer, Section};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Info,
    Planning,
    Execution,
    Submitted,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Planning => "Planning",
            Self::Execution => "Execution",
            Self::Submitted => "Submitted",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Info => Some(Self::Planning),
            Self::Planning => Some(Self::Execution),
            Self::Execution => Some(Self::Submitted),
            Self::Submitted => None,
        }
    }

    fn prev(self) -> Self {
        match self {
            Self::Info | Self::Planning => Self::Info,
            Self::Execution => Self::Planning,
            Self::Submitted => Self::Submitted,
        }
    }
}

/// The scheduled visit an assessment is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRecord {
    pub id: String,
    pub supervisor_id: String,
    pub teacher_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub visit_date: NaiveDate,
    pub class_name: String,
    pub topic: String,
    pub version: i64,
}

/// An unmet stage-gate condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    MissingField { field: &'static str },
    #[error("section {} is missing scores for {}", .section.as_str(), .missing.join(", "))]
    SectionIncomplete {
        section: Section,
        missing: Vec<&'static str>,
    },
    #[error("need at least 2 evidence images")]
    TooFewEvidence { count: usize },
    #[error("at most 4 evidence images are allowed")]
    TooManyEvidence { count: usize },
    #[error("{pending} evidence image(s) still processing")]
    EvidencePending { pending: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("visit {visit_id} changed since it was opened (expected version {expected_version})")]
    Conflict {
        visit_id: String,
        expected_version: i64,
    },
    #[error("visit {visit_id} not found")]
    NotFound { visit_id: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("visit is already submitted and read-only")]
    Submitted,
    #[error("only editable on stage {}, current stage is {}", .expected.as_str(), .current.as_str())]
    StageMismatch { current: Stage, expected: Stage },
    #[error("cannot leave stage {}: {}", .stage.as_str(), join_messages(.failures))]
    Blocked {
        stage: Stage,
        failures: Vec<ValidationError>,
    },
    #[error(transparent)]
    Rubric(#[from] RubricError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

fn join_messages(failures: &[ValidationError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentResults {
    pub bagian_a: BTreeMap<String, u8>,
    pub bagian_b: BTreeMap<String, u8>,
}

/// Shape handed to the persistence collaborator on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedVisit {
    pub supervisor_id: String,
    pub teacher_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub visit_date: String,
    pub class_name: String,
    pub topic: String,
    #[serde(rename = "hasil_supervisi")]
    pub results: AssessmentResults,
    #[serde(rename = "dokumentasi")]
    pub evidence: Vec<String>,
}

pub trait VisitSink {
    /// Store the finalized record if the visit is still at `expected_version`.
    fn persist(
        &mut self,
        visit_id: &str,
        expected_version: i64,
        record: &FinalizedVisit,
    ) -> Result<(), PersistenceError>;
}

/// Finite-state value the caller renders from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub stage: Stage,
    pub validation_errors: Vec<ValidationError>,
}

#[derive(Debug, Clone)]
pub struct AssessmentWorkflow {
    record: VisitRecord,
    scorer: RubricScorer,
    evidence: EvidenceCollector,
    state: WorkflowState,
}

impl AssessmentWorkflow {
    pub fn open(record: VisitRecord) -> Self {
        Self {
            record,
            scorer: RubricScorer::new(),
            evidence: EvidenceCollector::new(),
            state: WorkflowState {
                stage: Stage::Info,
                validation_errors: Vec::new(),
            },
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }

    pub fn record(&self) -> &VisitRecord {
        &self.record
    }

    pub fn scorer(&self) -> &RubricScorer {
        &self.scorer
    }

    pub fn evidence(&self) -> &EvidenceCollector {
        &self.evidence
    }

    fn ensure_editable(&self) -> Result<(), WorkflowError> {
        if self.state.stage == Stage::Submitted {
            return Err(WorkflowError::Submitted);
        }
        Ok(())
    }

    pub fn set_info(
        &mut self,
        class_name: Option<&str>,
        topic: Option<&str>,
    ) -> Result<(), WorkflowError> {
        self.ensure_editable()?;
        if self.state.stage != Stage::Info {
            return Err(WorkflowError::StageMismatch {
                current: self.state.stage,
                expected: Stage::Info,
            });
        }
        if let Some(v) = class_name {
            self.record.class_name = v.trim().to_string();
        }
        if let Some(v) = topic {
            self.record.topic = v.trim().to_string();
        }
        Ok(())
    }

    pub fn set_score(&mut self, section: Section, key: &str, value: i64) -> Result<(), WorkflowError> {
        self.ensure_editable()?;
        self.scorer.set_score(section, key, value)?;
        Ok(())
    }

    pub fn add_evidence(
        &mut self,
        ticket: u64,
        raw: &[u8],
        config: &NormalizeConfig,
    ) -> Result<NormalizedImage, WorkflowError> {
        self.ensure_editable()?;
        Ok(self.evidence.add(ticket, raw, config)?)
    }

    /// Reserve a slot for an image normalized off-thread.
    pub fn begin_evidence(&mut self, ticket: u64) -> Result<(), WorkflowError> {
        self.ensure_editable()?;
        Ok(self.evidence.begin(ticket)?)
    }

    pub fn finish_evidence(
        &mut self,
        ticket: u64,
        outcome: Result<NormalizedImage, EvidenceError>,
    ) -> bool {
        self.evidence.finish(ticket, outcome)
    }

    pub fn remove_evidence(&mut self, index: usize) -> Result<NormalizedImage, WorkflowError> {
        self.ensure_editable()?;
        Ok(self.evidence.remove(index)?)
    }

    /// `None` when the ticket named a slot still being normalized.
    pub fn remove_evidence_ticket(
        &mut self,
        ticket: u64,
    ) -> Result<Option<NormalizedImage>, WorkflowError> {
        self.ensure_editable()?;
        Ok(self.evidence.remove_ticket(ticket)?)
    }

    /// Conditions blocking the exit from `stage`; empty when the gate is open.
    pub fn gate(&self, stage: Stage) -> Vec<ValidationError> {
        let mut failures = Vec::new();
        match stage {
            Stage::Info => {
                if self.record.class_name.trim().is_empty() {
                    failures.push(ValidationError::MissingField { field: "className" });
                }
                if self.record.topic.trim().is_empty() {
                    failures.push(ValidationError::MissingField { field: "topic" });
                }
            }
            Stage::Planning => {
                let missing = self.scorer.missing(Section::A);
                if !missing.is_empty() {
                    failures.push(ValidationError::SectionIncomplete {
                        section: Section::A,
                        missing,
                    });
                }
            }
            Stage::Execution => {
                let missing = self.scorer.missing(Section::B);
                if !missing.is_empty() {
                    failures.push(ValidationError::SectionIncomplete {
                        section: Section::B,
                        missing,
                    });
                }
                let pending = self.evidence.pending();
                if pending > 0 {
                    failures.push(ValidationError::EvidencePending { pending });
                }
                if !self.evidence.is_sufficient() {
                    let count = self.evidence.count();
                    if count < MIN_EVIDENCE {
                        failures.push(ValidationError::TooFewEvidence { count });
                    } else {
                        failures.push(ValidationError::TooManyEvidence { count });
                    }
                }
            }
            Stage::Submitted => {}
        }
        failures
    }

    /// Moves one stage forward. Leaving Execution hands the finalized record
    /// to `sink`; on a sink error the workflow stays on Execution.
    pub fn advance(&mut self, sink: &mut dyn VisitSink) -> Result<Stage, WorkflowError> {
        let current = self.state.stage;
        let Some(next) = current.next() else {
            return Err(WorkflowError::Submitted);
        };
        let failures = self.gate(current);
        if !failures.is_empty() {
            self.state.validation_errors = failures.clone();
            return Err(WorkflowError::Blocked {
                stage: current,
                failures,
            });
        }
        if next == Stage::Submitted {
            let record = self.finalized();
            sink.persist(&self.record.id, self.record.version, &record)?;
            self.record.version += 1;
        }
        self.state.stage = next;
        self.state.validation_errors.clear();
        Ok(next)
    }

    pub fn back(&mut self) -> Result<Stage, WorkflowError> {
        self.ensure_editable()?;
        self.state.stage = self.state.stage.prev();
        self.state.validation_errors.clear();
        Ok(self.state.stage)
    }

    pub fn finalized(&self) -> FinalizedVisit {
        FinalizedVisit {
            supervisor_id: self.record.supervisor_id.clone(),
            teacher_id: self.record.teacher_id.clone(),
            subject_id: self.record.subject_id.clone(),
            class_id: self.record.class_id.clone(),
            visit_date: self.record.visit_date.format("%Y-%m-%d").to_string(),
            class_name: self.record.class_name.clone(),
            topic: self.record.topic.clone(),
            results: AssessmentResults {
                bagian_a: self.scorer.scores(Section::A),
                bagian_b: self.scorer.scores(Section::B),
            },
            evidence: self.evidence.images().iter().map(|i| i.data_url()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::items_for;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingSink {
        persisted: Vec<(String, i64, FinalizedVisit)>,
        fail_with: Option<PersistenceError>,
    }

    impl VisitSink for RecordingSink {
        fn persist(
            &mut self,
            visit_id: &str,
            expected_version: i64,
            record: &FinalizedVisit,
        ) -> Result<(), PersistenceError> {
            if let Some(e) = self.fail_with.clone() {
                return Err(e);
            }
            self.persisted
                .push((visit_id.to_string(), expected_version, record.clone()));
            Ok(())
        }
    }

    fn visit() -> VisitRecord {
        VisitRecord {
            id: "v1".into(),
            supervisor_id: "SUP".into(),
            teacher_id: "T1".into(),
            subject_id: "S1".into(),
            class_id: "C1".into(),
            visit_date: NaiveDate::from_ymd_opt(2026, 10, 14).expect("date"),
            class_name: String::new(),
            topic: String::new(),
            version: 1,
        }
    }

    fn png() -> Vec<u8> {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8, y as u8, 90]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png");
        out.into_inner()
    }

    fn score_all(wf: &mut AssessmentWorkflow, section: Section) {
        for item in items_for(section) {
            wf.set_score(section, item.key, 3).expect("score");
        }
    }

    fn to_execution() -> AssessmentWorkflow {
        let mut sink = RecordingSink::default();
        let mut wf = AssessmentWorkflow::open(visit());
        wf.set_info(Some("X IPA 1"), Some("Linear equations")).expect("info");
        wf.advance(&mut sink).expect("to planning");
        score_all(&mut wf, Section::A);
        wf.advance(&mut sink).expect("to execution");
        wf
    }

    #[test]
    fn info_gate_requires_class_and_topic() {
        let mut sink = RecordingSink::default();
        let mut wf = AssessmentWorkflow::open(visit());
        wf.set_info(Some("X IPA 1"), Some("   ")).expect("info");
        let err = wf.advance(&mut sink).expect_err("topic blank");
        assert_eq!(
            err,
            WorkflowError::Blocked {
                stage: Stage::Info,
                failures: vec![ValidationError::MissingField { field: "topic" }],
            }
        );
        assert_eq!(wf.stage(), Stage::Info);
        assert_eq!(wf.state().validation_errors.len(), 1);

        wf.set_info(None, Some("Fractions")).expect("info");
        assert_eq!(wf.advance(&mut sink), Ok(Stage::Planning));
        assert!(wf.state().validation_errors.is_empty());
    }

    #[test]
    fn planning_gate_names_missing_section_a_key() {
        let mut sink = RecordingSink::default();
        let mut wf = AssessmentWorkflow::open(visit());
        wf.set_info(Some("VII B"), Some("Photosynthesis")).expect("info");
        wf.advance(&mut sink).expect("planning");
        for key in ["a1", "a2", "a4"] {
            wf.set_score(Section::A, key, 4).expect("score");
        }
        let err = wf.advance(&mut sink).expect_err("a3 missing");
        assert_eq!(
            err.to_string(),
            "cannot leave stage Planning: section A is missing scores for a3"
        );
        wf.set_score(Section::A, "a3", 1).expect("score");
        assert_eq!(wf.advance(&mut sink), Ok(Stage::Execution));
    }

    #[test]
    fn set_info_only_on_info_stage() {
        let mut wf = to_execution();
        assert_eq!(
            wf.set_info(Some("other"), None),
            Err(WorkflowError::StageMismatch {
                current: Stage::Execution,
                expected: Stage::Info
            })
        );
    }

    #[test]
    fn submission_needs_section_b_and_two_images() {
        let cfg = NormalizeConfig::observation();
        let mut sink = RecordingSink::default();
        let mut wf = to_execution();
        score_all(&mut wf, Section::B);
        wf.add_evidence(1, &png(), &cfg).expect("first");

        let err = wf.advance(&mut sink).expect_err("one image");
        assert_eq!(
            err,
            WorkflowError::Blocked {
                stage: Stage::Execution,
                failures: vec![ValidationError::TooFewEvidence { count: 1 }],
            }
        );
        assert!(err.to_string().ends_with("need at least 2 evidence images"));
        assert!(sink.persisted.is_empty());

        wf.add_evidence(2, &png(), &cfg).expect("second");
        assert_eq!(wf.advance(&mut sink), Ok(Stage::Submitted));
        assert_eq!(sink.persisted.len(), 1);
        let (id, version, rec) = &sink.persisted[0];
        assert_eq!(id, "v1");
        assert_eq!(*version, 1);
        assert_eq!(rec.visit_date, "2026-10-14");
        assert_eq!(rec.results.bagian_a.len(), 4);
        assert_eq!(rec.results.bagian_b.len(), 5);
        assert_eq!(rec.evidence.len(), 2);

        // Terminal: no second emission, no edits.
        assert_eq!(wf.advance(&mut sink), Err(WorkflowError::Submitted));
        assert_eq!(wf.back(), Err(WorkflowError::Submitted));
        assert_eq!(
            wf.set_score(Section::B, "b1", 2),
            Err(WorkflowError::Submitted)
        );
        assert_eq!(sink.persisted.len(), 1);
    }

    #[test]
    fn incomplete_section_b_blocks_even_with_evidence() {
        let cfg = NormalizeConfig::observation();
        let mut sink = RecordingSink::default();
        let mut wf = to_execution();
        wf.add_evidence(3, &png(), &cfg).expect("1");
        wf.add_evidence(4, &png(), &cfg).expect("2");
        wf.set_score(Section::B, "b1", 2).expect("b1");
        match wf.advance(&mut sink) {
            Err(WorkflowError::Blocked { failures, .. }) => {
                assert_eq!(
                    failures,
                    vec![ValidationError::SectionIncomplete {
                        section: Section::B,
                        missing: vec!["b2", "b3", "b4", "b5"],
                    }]
                );
            }
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[test]
    fn pending_normalization_blocks_submission() {
        let cfg = NormalizeConfig::observation();
        let mut sink = RecordingSink::default();
        let mut wf = to_execution();
        score_all(&mut wf, Section::B);
        wf.add_evidence(5, &png(), &cfg).expect("1");
        wf.add_evidence(6, &png(), &cfg).expect("2");
        wf.begin_evidence(11).expect("reserve");
        match wf.advance(&mut sink) {
            Err(WorkflowError::Blocked { failures, .. }) => {
                assert_eq!(failures, vec![ValidationError::EvidencePending { pending: 1 }]);
            }
            other => panic!("expected blocked, got {:?}", other),
        }
        assert!(wf.finish_evidence(11, Err(EvidenceError::ImageProcessing("corrupt".into()))));
        assert_eq!(wf.advance(&mut sink), Ok(Stage::Submitted));
    }

    #[test]
    fn persistence_failure_keeps_execution_for_retry() {
        let cfg = NormalizeConfig::observation();
        let mut sink = RecordingSink {
            fail_with: Some(PersistenceError::Backend("disk full".into())),
            ..Default::default()
        };
        let mut wf = to_execution();
        score_all(&mut wf, Section::B);
        wf.add_evidence(7, &png(), &cfg).expect("1");
        wf.add_evidence(8, &png(), &cfg).expect("2");
        assert!(matches!(
            wf.advance(&mut sink),
            Err(WorkflowError::Persistence(PersistenceError::Backend(_)))
        ));
        assert_eq!(wf.stage(), Stage::Execution);

        sink.fail_with = None;
        assert_eq!(wf.advance(&mut sink), Ok(Stage::Submitted));
        assert_eq!(sink.persisted.len(), 1);
    }

    #[test]
    fn back_transitions_are_never_blocked() {
        let mut wf = to_execution();
        assert_eq!(wf.back(), Ok(Stage::Planning));
        assert_eq!(wf.back(), Ok(Stage::Info));
        assert_eq!(wf.back(), Ok(Stage::Info));
        // Scores survive going back.
        assert!(wf.scorer().is_complete(Section::A));
    }

    #[test]
    fn finalized_record_matches_wire_shape() {
        let mut wf = to_execution();
        wf.set_score(Section::B, "b1", 4).expect("b1");
        let v = serde_json::to_value(wf.finalized()).expect("json");
        assert_eq!(v["supervisorId"], "SUP");
        assert_eq!(v["className"], "X IPA 1");
        assert_eq!(v["hasil_supervisi"]["bagian_a"]["a2"], 3);
        assert_eq!(v["hasil_supervisi"]["bagian_b"]["b1"], 4);
        assert!(v["dokumentasi"].as_array().expect("array").is_empty());
    }
}
