use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Section {
    /// Lesson planning and preparation.
    A,
    /// In-class delivery.
    B,
}

impl Section {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" | "a" | "bagian_a" => Some(Self::A),
            "B" | "b" | "bagian_b" => Some(Self::B),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RubricItem {
    pub key: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub section: Section,
}

const SECTION_A: [RubricItem; 4] = [
    RubricItem {
        key: "a1",
        label: "Minimum component completeness",
        description: "The lesson plan states learning objectives, learning steps, an assessment plan, and learning media.",
        section: Section::A,
    },
    RubricItem {
        key: "a2",
        label: "Fit with learner characteristics",
        description: "The lesson plan is designed around learners' readiness, interests, and level of mastery.",
        section: Section::A,
    },
    RubricItem {
        key: "a3",
        label: "Quality of material presentation",
        description: "The lesson plan is flexible, clear, simple, essential, engaging, and contextual.",
        section: Section::A,
    },
    RubricItem {
        key: "a4",
        label: "Measurable assessment instruments",
        description: "Clear instruments and scoring rubrics exist to measure attainment of the learning objectives.",
        section: Section::A,
    },
];

const SECTION_B: [RubricItem; 5] = [
    RubricItem {
        key: "b1",
        label: "Differentiated instruction",
        description: "Delivery accommodates learners' needs and provides appropriate scaffolding or challenge.",
        section: Section::B,
    },
    RubricItem {
        key: "b2",
        label: "Active engagement and interaction",
        description: "The teacher listens actively, asks open questions, and involves learners in collaboration.",
        section: Section::B,
    },
    RubricItem {
        key: "b3",
        label: "Feedback practice",
        description: "Constructive teacher feedback is given, with room for self-reflection and peer feedback.",
        section: Section::B,
    },
    RubricItem {
        key: "b4",
        label: "Character development",
        description: "The teacher models behaviour, builds class agreements, and integrates character values.",
        section: Section::B,
    },
    RubricItem {
        key: "b5",
        label: "Safe and positive learning climate",
        description: "Learning fosters a sense of joy, safety, and comfort for learners as whole persons.",
        section: Section::B,
    },
];

/// Ordered catalog items for a section.
pub fn items_for(section: Section) -> &'static [RubricItem] {
    match section {
        Section::A => &SECTION_A,
        Section::B => &SECTION_B,
    }
}

pub fn find_item(section: Section, key: &str) -> Option<&'static RubricItem> {
    items_for(section).iter().find(|i| i.key == key)
}

pub const LIKERT_MIN: u8 = 1;
pub const LIKERT_MAX: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikertStyle {
    pub value: u8,
    pub label: &'static str,
    pub tone: &'static str,
}

/// Label and colour tone for one Likert value; `None` outside 1..=4.
pub fn style_for(value: u8) -> Option<LikertStyle> {
    let (label, tone) = match value {
        1 => ("Not yet evident", "red"),
        2 => ("Fair", "yellow"),
        3 => ("Good", "blue"),
        4 => ("Very good", "emerald"),
        _ => return None,
    };
    Some(LikertStyle { value, label, tone })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RubricError {
    #[error("unknown rubric item {key} in section {}", .section.as_str())]
    InvalidItem { section: Section, key: String },
    #[error("score {value} is outside 1..=4")]
    InvalidScore { value: i64 },
}

/// Likert scores for both sections of one visit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RubricScorer {
    section_a: BTreeMap<&'static str, u8>,
    section_b: BTreeMap<&'static str, u8>,
}

impl RubricScorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, section: Section) -> &BTreeMap<&'static str, u8> {
        match section {
            Section::A => &self.section_a,
            Section::B => &self.section_b,
        }
    }

    /// Overwrites any previous score for the key.
    pub fn set_score(&mut self, section: Section, key: &str, value: i64) -> Result<(), RubricError> {
        let item = find_item(section, key).ok_or_else(|| RubricError::InvalidItem {
            section,
            key: key.to_string(),
        })?;
        let score = u8::try_from(value)
            .ok()
            .filter(|v| (LIKERT_MIN..=LIKERT_MAX).contains(v))
            .ok_or(RubricError::InvalidScore { value })?;
        let map = match section {
            Section::A => &mut self.section_a,
            Section::B => &mut self.section_b,
        };
        map.insert(item.key, score);
        Ok(())
    }

    pub fn score(&self, section: Section, key: &str) -> Option<u8> {
        self.map(section).get(key).copied()
    }

    /// Catalog keys of the section that have no score yet, in catalog order.
    pub fn missing(&self, section: Section) -> Vec<&'static str> {
        let map = self.map(section);
        items_for(section)
            .iter()
            .filter(|i| !map.contains_key(i.key))
            .map(|i| i.key)
            .collect()
    }

    pub fn is_complete(&self, section: Section) -> bool {
        self.missing(section).is_empty()
    }

    pub fn scores(&self, section: Section) -> BTreeMap<String, u8> {
        self.map(section)
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}
