//! Form definition model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Question types exposed to clients, mapped from Kobo/XLSForm types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Text,
    Number,
    Decimal,
    Date,
    Datetime,
    Time,
    SingleChoice,
    MultipleChoice,
    Location,
    Line,
    Area,
    Photo,
    Audio,
    Video,
    File,
    Barcode,
    Calculated,
    Acknowledge,
    Range,
}

impl QuestionType {
    /// Map a Kobo type (`select_one species_list` style prefixes included).
    /// Unknown types fall back to `Text`.
    pub fn from_kobo(kobo_type: &str) -> Self {
        let base = kobo_type.split_whitespace().next().unwrap_or_default();
        match base {
            "integer" => Self::Number,
            "decimal" => Self::Decimal,
            "date" => Self::Date,
            "datetime" => Self::Datetime,
            "time" => Self::Time,
            "select_one" => Self::SingleChoice,
            "select_multiple" => Self::MultipleChoice,
            "geopoint" => Self::Location,
            "geotrace" => Self::Line,
            "geoshape" => Self::Area,
            "image" => Self::Photo,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "file" => Self::File,
            "barcode" => Self::Barcode,
            "calculate" => Self::Calculated,
            "acknowledge" => Self::Acknowledge,
            "range" => Self::Range,
            _ => Self::Text,
        }
    }

    pub const fn is_choice(self) -> bool {
        matches!(self, Self::SingleChoice | Self::MultipleChoice)
    }

    pub const fn is_media(self) -> bool {
        matches!(self, Self::Photo | Self::Audio | Self::Video)
    }
}

/// One option of a select question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub name: String,
    pub label: String,
}

/// A single form question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub appearance: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub allow_other: bool,
}

impl Question {
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }

    pub fn accepts_choice(&self, value: &str) -> bool {
        self.allow_other || self.choices.iter().any(|choice| choice.name == value)
    }
}

/// Cached, parsed definition of a remote form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDefinition {
    /// Remote form uid
    pub form_id: String,
    pub name: String,
    pub title: String,
    pub questions: Vec<Question>,
    /// Revision marker (remote version id, or modification time)
    pub version: Option<String>,
    pub deployment_active: bool,
    pub owner: String,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
    /// When this definition was cached locally (Unix ms)
    pub cached_at: i64,
}

impl FormDefinition {
    pub fn question(&self, name: &str) -> Option<&Question> {
        self.questions.iter().find(|question| question.name == name)
    }

    /// First geopoint question, used to derive a submission's location.
    pub fn location_question(&self) -> Option<&Question> {
        self.questions
            .iter()
            .find(|question| question.question_type == QuestionType::Location)
    }

    pub fn summary(&self) -> FormSummary {
        let mut question_types = BTreeMap::new();
        let mut required_questions = 0;
        let mut choice_questions = 0;
        for question in &self.questions {
            *question_types.entry(question.question_type).or_insert(0) += 1;
            if question.required {
                required_questions += 1;
            }
            if question.question_type.is_choice() {
                choice_questions += 1;
            }
        }

        FormSummary {
            form_id: self.form_id.clone(),
            total_questions: self.questions.len(),
            required_questions,
            optional_questions: self.questions.len() - required_questions,
            choice_questions,
            has_location: question_types.contains_key(&QuestionType::Location),
            has_media: question_types.keys().any(|kind| kind.is_media()),
            question_types,
        }
    }
}

/// Counts describing a form's shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormSummary {
    pub form_id: String,
    pub total_questions: usize,
    pub required_questions: usize,
    pub optional_questions: usize,
    pub choice_questions: usize,
    pub question_types: BTreeMap<QuestionType, usize>,
    pub has_location: bool,
    pub has_media: bool,
}
