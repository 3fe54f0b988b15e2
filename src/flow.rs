// src/flow.rs

use std::collections::HashSet;
use std::fmt;

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative conversational flow: the entry message, the top-level
/// choices a visitor can pick from, and the closing copy. One flow is the
/// whole behaviour of one embedded widget, and it is replaced wholesale
/// whenever the builder saves.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    pub welcome_message: String,
    pub end_message: String,
    #[serde(default)]
    pub show_end_screen: bool,
    #[serde(rename = "proactiveMessages", default)]
    pub proactive: ProactivePolicy,
    pub options: Vec<FlowOption>,
}

/// One top-level choice. Identity is the `id`, which stays stable across
/// builder edits even when the option moves in the list.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowOption {
    pub id: String,
    pub label: String,
    /// Ordered field prompts behind this choice; the stored document calls
    /// this list `flow`. Order is both presentation and collection order.
    #[serde(rename = "flow", default)]
    pub fields: Vec<Field>,
}

/// A single prompt inside an option.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Field {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

/// How a field's answer is checked. Email and phone get a shape check only,
/// not deliverability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Email,
    Phone,
}

/// Scripted nudges shown on a timer while the widget sits closed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProactivePolicy {
    pub enabled: bool,
    /// Cycled in order: message `n` is `messages[n mod len]`.
    pub messages: Vec<String>,
    /// Seconds before the first nudge.
    pub delay: u64,
    /// Seconds between subsequent nudges.
    pub interval: u64,
    pub max_messages: u32,
}

impl ProactivePolicy {
    /// A policy that can actually fire. Disabled or empty policies never do.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.messages.is_empty() && self.max_messages > 0
    }
}

impl Default for ProactivePolicy {
    fn default() -> Self {
        ProactivePolicy {
            enabled: false,
            messages: vec![
                "👋 Need help? I'm here to assist!".into(),
                "Have any questions? Feel free to ask!".into(),
            ],
            delay: 30,
            interval: 60,
            max_messages: 3,
        }
    }
}

impl FlowConfig {
    /// Look up a top-level option by its stable id.
    pub fn option(&self, id: &str) -> Option<&FlowOption> {
        self.options.iter().find(|o| o.id == id)
    }

    /// Parse a flow out of its stored JSON form.
    pub fn from_json_str(json: &str) -> Result<FlowConfig, FlowError> {
        let flow: FlowConfig = serde_json::from_str(json)
            .map_err(|e| FlowError::Serialization(format!("parse error: {}", e)))?;
        flow.validate()?;
        Ok(flow)
    }

    /// Check the structural invariants: at least one option, option ids
    /// unique, field ids unique within their option.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.options.is_empty() {
            return Err(FlowError::NoOptions);
        }
        let mut option_ids = HashSet::new();
        for option in &self.options {
            if !option_ids.insert(option.id.as_str()) {
                return Err(FlowError::DuplicateOption(option.id.clone()));
            }
            let mut field_ids = HashSet::new();
            for field in &option.fields {
                if !field_ids.insert(field.id.as_str()) {
                    return Err(FlowError::DuplicateField(
                        option.id.clone(),
                        field.id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    /// The builder's seed flow: what a fresh chatbot does before its author
    /// has saved anything.
    fn default() -> Self {
        FlowConfig {
            welcome_message: "Hello! 👋 How can I help you today?".into(),
            end_message: "Thank you for your responses! We'll be in touch soon.".into(),
            show_end_screen: false,
            proactive: ProactivePolicy::default(),
            options: vec![
                FlowOption {
                    id: "1".into(),
                    label: "I want an offer".into(),
                    fields: vec![
                        Field {
                            id: "1".into(),
                            kind: FieldType::Text,
                            label: "What is your name?".into(),
                            required: true,
                        },
                        Field {
                            id: "2".into(),
                            kind: FieldType::Email,
                            label: "What is your email?".into(),
                            required: true,
                        },
                        Field {
                            id: "3".into(),
                            kind: FieldType::Phone,
                            label: "What is your phone number?".into(),
                            required: true,
                        },
                    ],
                },
                FlowOption {
                    id: "2".into(),
                    label: "I want a call back".into(),
                    fields: vec![
                        Field {
                            id: "1".into(),
                            kind: FieldType::Text,
                            label: "What is your name?".into(),
                            required: true,
                        },
                        Field {
                            id: "2".into(),
                            kind: FieldType::Email,
                            label: "What is your email?".into(),
                            required: true,
                        },
                        Field {
                            id: "3".into(),
                            kind: FieldType::Phone,
                            label: "What is your phone number?".into(),
                            required: true,
                        },
                        Field {
                            id: "4".into(),
                            kind: FieldType::Text,
                            label: "What is the best time to call you?".into(),
                            required: true,
                        },
                    ],
                },
            ],
        }
    }
}

/// JSON-Schema for the flow document, the contract the builder writes
/// against.
pub fn config_schema() -> Value {
    serde_json::to_value(schema_for!(FlowConfig)).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    NoOptions,
    DuplicateOption(String),
    DuplicateField(String, String),
    Serialization(String),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::NoOptions => write!(f, "flow has no options"),
            FlowError::DuplicateOption(id) => write!(f, "duplicate option id `{}`", id),
            FlowError::DuplicateField(option, field) => {
                write!(f, "duplicate field id `{}` in option `{}`", field, option)
            }
            FlowError::Serialization(msg) => write!(f, "JSON error: {}", msg),
        }
    }
}

impl std::error::Error for FlowError {}
