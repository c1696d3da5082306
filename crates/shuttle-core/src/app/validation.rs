//! Payload validation rules for workers.
//!
//! ```ignore
//! let rules = PayloadRules::new()
//!     .field("user_id", FieldRule::new().presence().kind(ValueKind::Integer).unless_present("no_user"))
//!     .field("account_id", FieldRule::new().absence().if_present("customer_id"));
//! ```
//!
//! `if`/`unless` はもう一方のフィールドが truthy か（存在し、null でも false でもない）で判定します。
//! 失敗は `"<field>.<option>"` をキーにして全部集めます。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Payload, ValidationErrors};

/// Closed set of payload value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Integer,
    String,
    Number,
    Boolean,
    Hash,
    Array,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Hash => "hash",
            Self::Array => "array",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Hash => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

fn shape_of(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "nil",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(n)) if n.is_f64() => "float",
        Some(Value::Number(_)) => "integer",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "hash",
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    #[serde(default)]
    pub presence: bool,
    #[serde(default)]
    pub absence: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<ValueKind>,
    /// このフィールドが truthy のときだけ検証する
    #[serde(default, rename = "if")]
    pub if_present: Option<String>,
    /// このフィールドが truthy でないときだけ検証する
    #[serde(default, rename = "unless")]
    pub unless_present: Option<String>,
}

impl FieldRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(mut self) -> Self {
        self.presence = true;
        self
    }

    pub fn absence(mut self) -> Self {
        self.absence = true;
        self
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn if_present(mut self, field: impl Into<String>) -> Self {
        self.if_present = Some(field.into());
        self
    }

    pub fn unless_present(mut self, field: impl Into<String>) -> Self {
        self.unless_present = Some(field.into());
        self
    }

    fn applies_to(&self, payload: &Payload) -> bool {
        let gate_if = self
            .if_present
            .as_ref()
            .is_none_or(|key| is_truthy(payload.get(key)));
        let gate_unless = self
            .unless_present
            .as_ref()
            .is_none_or(|key| !is_truthy(payload.get(key)));
        gate_if && gate_unless
    }

    fn check(&self, field: &str, value: Option<&Value>, errors: &mut ValidationErrors) {
        let missing = matches!(value, None | Some(Value::Null));
        if self.presence && missing {
            errors.add(field, "presence", "present", "absent");
        }
        if self.absence && !missing {
            errors.add(field, "absence", "absent", "present");
        }
        if let Some(kind) = self.kind
            && !value.is_some_and(|v| kind.matches(v))
        {
            errors.add(field, "type", kind.as_str(), shape_of(value));
        }
    }
}

/// Per-field rules, keyed by payload field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRules {
    fields: BTreeMap<String, FieldRule>,
}

impl PayloadRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn validate(&self, payload: &Payload) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        for (field, rule) in &self.fields {
            if rule.applies_to(payload) {
                rule.check(field, payload.get(field), &mut errors);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
