//! Declarative schedule definitions as they appear in configuration files.

use serde::{Deserialize, Serialize};

/// One rule set, either as a crontab line or as keyword fields.
///
/// ```toml
/// schedule = ["30 9 * * *", { hour = "13", minute = 30, day_of_week = "mon-fri" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    Crontab(String),
    Fields(FieldSpec),
}

/// Keyword form. Unset fields follow the defaulting rule in
/// [`super::CronRule::from_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    #[serde(default)]
    pub second: Option<FieldValue>,
    #[serde(default)]
    pub minute: Option<FieldValue>,
    #[serde(default)]
    pub hour: Option<FieldValue>,
    #[serde(default)]
    pub day_of_week: Option<FieldValue>,
}

/// A field given as a bare number or as an expression string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(u32),
    Text(String),
}

impl FieldValue {
    pub fn to_expr(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for ScheduleSpec {
    fn from(line: &str) -> Self {
        ScheduleSpec::Crontab(line.to_string())
    }
}
