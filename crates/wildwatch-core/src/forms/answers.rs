use serde_json::{Map, Number, Value};

use crate::error::FieldErrors;
use crate::models::{FormDefinition, GeoPoint, Question, QuestionType};

/// Answer keys that may hold a location when the form has no geopoint question.
const FALLBACK_LOCATION_KEYS: [&str; 3] = ["location", "gps", "_geolocation"];

/// Drop Kobo system fields and coerce answers to their question types.
///
/// Unknown fields are kept as-is. Values that fail to coerce are kept
/// unchanged; [`validate_answers`] is the place that rejects them.
pub fn normalize_answers(answers: &Map<String, Value>, form: Option<&FormDefinition>) -> Map<String, Value> {
    answers
        .iter()
        .filter(|(key, _)| !is_system_field(key))
        .map(|(key, value)| {
            let normalized = match form.and_then(|form| question_for(form, key)) {
                Some(question) => coerce(value, question.question_type),
                None => value.clone(),
            };
            (key.clone(), normalized)
        })
        .collect()
}

/// Check a payload against its form. Returns per-question messages.
pub fn validate_answers(
    answers: &Map<String, Value>,
    form: Option<&FormDefinition>,
) -> Result<(), FieldErrors> {
    let mut errors = FieldErrors::new();

    if answers.keys().all(|key| is_system_field(key)) {
        errors
            .entry("data".to_string())
            .or_default()
            .push("Submission data cannot be empty".to_string());
        return Err(errors);
    }

    let Some(form) = form else {
        return Ok(());
    };

    for question in &form.questions {
        let value = lookup(answers, &question.name);
        let label = question.display_name();
        let mut messages = Vec::new();

        if is_blank(value) {
            if question.required && !question.readonly {
                messages.push(format!("{label} is required"));
            }
        } else if let Some(value) = value {
            check_value(question, value, &mut messages);
        }

        if !messages.is_empty() {
            errors.insert(question.name.clone(), messages);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Derive the incident location from a payload.
pub fn extract_location(answers: &Map<String, Value>, form: Option<&FormDefinition>) -> Option<GeoPoint> {
    if let Some(question) = form.and_then(FormDefinition::location_question) {
        if let Some(point) = lookup(answers, &question.name).and_then(GeoPoint::from_answer) {
            return Some(point);
        }
    }
    FALLBACK_LOCATION_KEYS
        .iter()
        .find_map(|key| answers.get(*key).and_then(GeoPoint::from_answer))
}

fn check_value(question: &Question, value: &Value, messages: &mut Vec<String>) {
    let label = question.display_name();
    match question.question_type {
        QuestionType::Number => {
            if as_integer(value).is_none() {
                messages.push(format!("{label} must be a number"));
            }
        }
        QuestionType::Decimal => {
            if as_decimal(value).is_none() {
                messages.push(format!("{label} must be a decimal number"));
            }
        }
        QuestionType::Location => {
            if GeoPoint::from_answer(value).is_none() {
                messages.push(format!("{label} must be a valid GPS location"));
            }
        }
        QuestionType::SingleChoice => {
            let selected = scalar_text(value);
            if !selected.as_deref().is_some_and(|choice| question.accepts_choice(choice)) {
                messages.push(format!("Invalid choice for {label}"));
            }
        }
        QuestionType::MultipleChoice => {
            for selected in selections(value) {
                if !question.accepts_choice(&selected) {
                    messages.push(format!("Invalid choice '{selected}' for {label}"));
                }
            }
        }
        _ => {}
    }
}

fn coerce(value: &Value, question_type: QuestionType) -> Value {
    if is_blank(Some(value)) {
        return Value::Null;
    }
    match question_type {
        QuestionType::Number => as_integer(value).map_or_else(|| value.clone(), Value::from),
        QuestionType::Decimal => as_decimal(value)
            .and_then(Number::from_f64)
            .map_or_else(|| value.clone(), Value::Number),
        QuestionType::MultipleChoice => {
            Value::Array(selections(value).into_iter().map(Value::String).collect())
        }
        QuestionType::Location => GeoPoint::from_answer(value)
            .and_then(|point| serde_json::to_value(point).ok())
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn is_system_field(key: &str) -> bool {
    key.starts_with('_') || key.starts_with("meta/") || key == "formhub/uuid"
}

/// Match a payload key to a question, ignoring Kobo group prefixes.
fn question_for<'a>(form: &'a FormDefinition, key: &str) -> Option<&'a Question> {
    let name = key.rsplit('/').next().unwrap_or(key);
    form.question(name)
}

fn lookup<'a>(answers: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    answers.get(name).or_else(|| {
        answers
            .iter()
            .find(|(key, _)| key.rsplit('/').next() == Some(name))
            .map(|(_, value)| value)
    })
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok().filter(|float: &f64| float.is_finite()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Kobo encodes multiple selections as a space-separated string.
fn selections(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::String(text) => text.split_whitespace().map(str::to_string).collect(),
        other => scalar_text(other).into_iter().collect(),
    }
}
