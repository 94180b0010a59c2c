//! Kobo form parsing.
//!
//! Converts raw Kobo assets into [`FormDefinition`]s and normalizes or
//! validates answer payloads against them.

mod answers;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Choice, FormDefinition, Question, QuestionType};

pub use answers::{extract_location, normalize_answers, validate_answers};

/// Survey rows that carry no answer.
const STRUCTURAL_TYPES: [&str; 7] = [
    "begin_group",
    "end_group",
    "begin_repeat",
    "end_repeat",
    "note",
    "start",
    "end",
];

/// Parse a Kobo asset (`GET /api/v2/assets/{uid}/`) into a form definition.
pub fn parse_form(asset: &Value) -> Result<FormDefinition> {
    let asset = asset
        .as_object()
        .ok_or_else(|| Error::InvalidInput("form asset must be a JSON object".to_string()))?;
    let form_id = asset
        .get("uid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| Error::InvalidInput("form asset is missing `uid`".to_string()))?
        .to_string();

    let empty = Value::Null;
    let content = asset.get("content").unwrap_or(&empty);
    let choices = parse_choices(content.get("choices"));

    let questions = content
        .get("survey")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| parse_question(row, &choices))
                .collect()
        })
        .unwrap_or_default();

    let name = text_field(asset.get("name"));
    let settings_title = content
        .get("settings")
        .map(|settings| {
            let title = text_field(settings.get("form_title"));
            if title.is_empty() {
                label_of(settings)
            } else {
                title
            }
        })
        .unwrap_or_default();
    let title = if settings_title.is_empty() {
        name.clone()
    } else {
        settings_title
    };

    let modified_at = optional_text(asset.get("date_modified"));
    let version = optional_text(asset.get("version_id"))
        .or_else(|| optional_text(asset.get("deployed_version_id")))
        .or_else(|| modified_at.clone());

    Ok(FormDefinition {
        form_id,
        name,
        title,
        questions,
        version,
        deployment_active: asset
            .get("deployment__active")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        owner: text_field(asset.get("owner__username")),
        created_at: optional_text(asset.get("date_created")),
        modified_at,
        cached_at: crate::util::now_millis(),
    })
}

fn parse_choices(choices: Option<&Value>) -> HashMap<String, Vec<Choice>> {
    let mut lists: HashMap<String, Vec<Choice>> = HashMap::new();
    for choice in choices.and_then(Value::as_array).into_iter().flatten() {
        let list_name = text_field(choice.get("list_name"));
        lists.entry(list_name).or_default().push(Choice {
            name: text_field(choice.get("name")),
            label: label_of(choice),
        });
    }
    lists
}

fn parse_question(row: &Value, choices: &HashMap<String, Vec<Choice>>) -> Option<Question> {
    let kobo_type = text_field(row.get("type"));
    let base_type = kobo_type.split_whitespace().next().unwrap_or_default();
    if STRUCTURAL_TYPES.contains(&base_type) {
        return None;
    }

    let name = optional_text(row.get("name")).or_else(|| optional_text(row.get("$autoname")))?;
    let question_type = QuestionType::from_kobo(&kobo_type);
    let appearance = text_field(row.get("appearance"));

    let (choices, allow_other) = if question_type.is_choice() {
        let list_name = optional_text(row.get("select_from_list_name"))
            .or_else(|| kobo_type.split_whitespace().nth(1).map(str::to_string))
            .unwrap_or_default();
        (
            choices.get(&list_name).cloned().unwrap_or_default(),
            appearance.contains("other") || kobo_type.ends_with("or_other"),
        )
    } else {
        (Vec::new(), false)
    };

    Some(Question {
        name,
        label: label_of(row),
        question_type,
        required: flag(row.get("required")),
        hint: localized(row.get("hint")),
        constraint: row.get("constraint").cloned().filter(|value| !value.is_null()),
        relevant: optional_text(row.get("relevant")),
        default: row.get("default").cloned().filter(|value| !value.is_null()),
        readonly: flag(row.get("readonly")),
        appearance,
        choices,
        allow_other,
    })
}

/// Kobo stores labels either as a string, a per-language object, or a list of
/// translations; English wins, then `default`, then the first entry.
fn localized(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(map)) => ["English", "english", "default"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .or_else(|| map.values().find_map(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn label_of(row: &Value) -> String {
    localized(row.get("label"))
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        ),
        _ => false,
    }
}

fn text_field(value: Option<&Value>) -> String {
    optional_text(value).unwrap_or_default()
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => crate::util::normalize_text_option(Some(text.clone())),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
