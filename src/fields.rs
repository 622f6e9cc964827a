// 🧾 Field Value Parser - One free-text cell → one typed value
//
// Each column declares a widget kind. The widget decides how a raw cell is read:
//   timestamp         → local wall-clock string at a fixed offset → UTC instant
//   enumerated-choice → option label → option id
//   free-text         → trimmed text

use crate::error::FieldError;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock layout used by survey sheets: "2010-07-25 12:27:48"
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layouts accepted on input, tried in order
const ACCEPTED_TIME_FORMATS: [&str; 3] = [LOCAL_TIME_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

// ============================================================================
// COLUMN DEFINITIONS
// ============================================================================

/// Which system field a column feeds, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemRole {
    Zone,
    Station,
    Filename,
    Timestamp,
    Species,
    None,
}

impl SystemRole {
    pub fn name(&self) -> &str {
        match self {
            SystemRole::Zone => "zone",
            SystemRole::Station => "station",
            SystemRole::Filename => "filename",
            SystemRole::Timestamp => "timestamp",
            SystemRole::Species => "species",
            SystemRole::None => "none",
        }
    }
}

/// One selectable option of an enumerated-choice column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

impl ChoiceOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        ChoiceOption {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// How a column's cells are read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "widget", rename_all = "kebab-case")]
pub enum WidgetKind {
    Timestamp,
    EnumeratedChoice { options: Vec<ChoiceOption> },
    FreeText,
}

/// One tabular column, in sheet order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub id: String,
    pub title: String,
    pub system_role: SystemRole,
    pub widget: WidgetKind,
}

impl ColumnDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, system_role: SystemRole, widget: WidgetKind) -> Self {
        ColumnDefinition {
            id: id.into(),
            title: title.into(),
            system_role,
            widget,
        }
    }

    /// Custom (non-system) free-text column
    pub fn text(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(id, title, SystemRole::None, WidgetKind::FreeText)
    }

    /// System column; widget is free-text except for the timestamp role
    pub fn system(id: impl Into<String>, title: impl Into<String>, role: SystemRole) -> Self {
        let widget = match role {
            SystemRole::Timestamp => WidgetKind::Timestamp,
            _ => WidgetKind::FreeText,
        };
        Self::new(id, title, role, widget)
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// Parsed cell, one variant per widget kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum FieldValue {
    Time(DateTime<Utc>),
    Choice(ChoiceOption),
    Text(String),
}

impl FieldValue {
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Value as it would appear in a sheet cell at the given offset
    pub fn display(&self, timezone_offset_minutes: i32) -> String {
        match self {
            FieldValue::Time(t) => format_local_time(*t, timezone_offset_minutes),
            FieldValue::Choice(option) => option.label.clone(),
            FieldValue::Text(text) => text.clone(),
        }
    }
}

/// Custom field entry on an observation, keyed by column id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub column_id: String,
    pub value: FieldValue,
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse one raw sheet cell according to the column's widget kind
pub fn parse_cell(raw: &str, widget: &WidgetKind, timezone_offset_minutes: i32) -> Result<FieldValue, FieldError> {
    let data = raw.trim();

    match widget {
        WidgetKind::Timestamp => parse_local_time(data, timezone_offset_minutes).map(FieldValue::Time),
        WidgetKind::EnumeratedChoice { options } => options
            .iter()
            .find(|option| option.label == data)
            .cloned()
            .map(FieldValue::Choice)
            .ok_or_else(|| FieldError::InvalidOption(data.to_string())),
        WidgetKind::FreeText => Ok(FieldValue::Text(data.to_string())),
    }
}

/// Interpret a wall-clock string as local time at `timezone_offset_minutes`
/// east of UTC and return the absolute instant.
///
/// Example: "2010-07-25 12:27:48" at 480 → 2010-07-25T04:27:48Z
pub fn parse_local_time(text: &str, timezone_offset_minutes: i32) -> Result<DateTime<Utc>, FieldError> {
    let text = text.trim();

    let naive = ACCEPTED_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .ok_or_else(|| FieldError::InvalidTime(text.to_string()))?;

    naive
        .checked_sub_signed(Duration::minutes(i64::from(timezone_offset_minutes)))
        .map(|utc| utc.and_utc())
        .ok_or_else(|| FieldError::InvalidTime(text.to_string()))
}

/// Inverse of `parse_local_time`: render an instant as local wall-clock text
pub fn format_local_time(instant: DateTime<Utc>, timezone_offset_minutes: i32) -> String {
    (instant + Duration::minutes(i64::from(timezone_offset_minutes)))
        .format(LOCAL_TIME_FORMAT)
        .to_string()
}

// ============================================================================
// EDIT PATH
// ============================================================================

/// Raw custom field value submitted by the editing workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInput {
    pub column_id: String,
    pub value: String,
}

impl FieldInput {
    pub fn new(column_id: impl Into<String>, value: impl Into<String>) -> Self {
        FieldInput {
            column_id: column_id.into(),
            value: value.into(),
        }
    }
}

/// Validate edited custom fields against the column definitions.
///
/// Unlike sheet cells, edits carry RFC 3339 instants and option ids, not labels.
/// The first invalid input aborts the conversion.
pub fn convert_field_inputs(
    inputs: &[FieldInput],
    columns: &[ColumnDefinition],
) -> Result<Vec<CustomFieldValue>, FieldError> {
    inputs
        .iter()
        .map(|input| {
            let column = columns
                .iter()
                .find(|c| c.id == input.column_id)
                .ok_or_else(|| FieldError::UnknownColumn(input.column_id.clone()))?;

            let value = match &column.widget {
                WidgetKind::Timestamp => DateTime::parse_from_rfc3339(input.value.trim())
                    .map(|t| FieldValue::Time(t.with_timezone(&Utc)))
                    .map_err(|_| FieldError::InvalidTime(input.value.clone()))?,
                WidgetKind::EnumeratedChoice { options } => options
                    .iter()
                    .find(|option| option.id == input.value)
                    .cloned()
                    .map(FieldValue::Choice)
                    .ok_or_else(|| FieldError::InvalidOption(input.value.clone()))?,
                WidgetKind::FreeText => FieldValue::Text(input.value.clone()),
            };

            Ok(CustomFieldValue {
                column_id: column.id.clone(),
                value,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
