use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::flow::{Field, FieldType, FlowConfig};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]{5,19}$").expect("phone regex"));

/// Where one conversation currently sits in its flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingOptionChoice,
    CollectingField { option_id: String, field_index: usize },
    Completed,
}

/// Per-conversation state machine.
///
/// A `Session` walks a visitor through the flow: pick an option, answer its
/// fields in order, finish. It holds the collected answers and survives a
/// configuration swap mid-flight: `apply_config` re-resolves the current
/// position by id against the incoming flow instead of resetting, so answers
/// that are still valid under the new schema are kept.
///
/// The machine is synchronous and owns nothing shared; the controller holds
/// exactly one per widget instance.
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    selected_option_id: Option<String>,
    answers: HashMap<String, String>,
}

/// What the controller should surface after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Ask the visitor for this field next.
    Prompt(Field),
    /// The answer was rejected; re-ask the same field. Nothing advanced and
    /// nothing previously collected was discarded.
    Rejected { field: Field, reason: AnswerError },
    /// Every field of the chosen option is collected.
    Done {
        option_id: String,
        answers: HashMap<String, String>,
    },
}

/// How a session position survived a configuration swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Position and answers survived untouched.
    Kept,
    /// The selected option is gone from the new flow; back to the option
    /// list with cleared answers.
    FellBack,
    /// The option shrank below the current field index; the session is
    /// completed with whatever was collected.
    Clamped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("widget is not open")]
    NotOpen,
    #[error("not awaiting an option choice")]
    NotAwaitingChoice,
    #[error("no option `{0}` in the current flow")]
    UnknownOption(String),
    #[error("not collecting a field answer")]
    NotCollecting,
}

/// Field-level rejection. Recoverable: it blocks advancement for one field
/// and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq, Eq)]
pub enum AnswerError {
    #[error("this field is required")]
    Required,
    #[error("that doesn't look like an email address")]
    InvalidEmail,
    #[error("that doesn't look like a phone number")]
    InvalidPhone,
}

impl Session {
    pub fn new() -> Self {
        Session {
            phase: Phase::Idle,
            selected_option_id: None,
            answers: HashMap::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn selected_option_id(&self) -> Option<&str> {
        self.selected_option_id.as_deref()
    }

    pub fn answers(&self) -> &HashMap<String, String> {
        &self.answers
    }

    /// The field the session is waiting on, resolved against `flow`.
    pub fn current_field<'a>(&self, flow: &'a FlowConfig) -> Option<&'a Field> {
        match &self.phase {
            Phase::CollectingField {
                option_id,
                field_index,
            } => flow.option(option_id).and_then(|o| o.fields.get(*field_index)),
            _ => None,
        }
    }

    /// Widget opened. Idle sessions move to the option list; a completed
    /// session is reset first, so reopening starts the conversation over.
    /// A session mid-collection keeps its position across close/open cycles.
    pub fn open(&mut self) {
        match self.phase {
            Phase::Idle => self.phase = Phase::AwaitingOptionChoice,
            Phase::Completed => {
                self.reset();
                self.phase = Phase::AwaitingOptionChoice;
            }
            _ => {}
        }
    }

    /// Drop everything collected and return to Idle.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.selected_option_id = None;
        self.answers.clear();
    }

    /// Visitor picked a top-level option. An option with no fields completes
    /// immediately.
    pub fn choose_option(
        &mut self,
        flow: &FlowConfig,
        option_id: &str,
    ) -> Result<Step, SessionError> {
        if self.phase != Phase::AwaitingOptionChoice {
            return Err(SessionError::NotAwaitingChoice);
        }
        let option = flow
            .option(option_id)
            .ok_or_else(|| SessionError::UnknownOption(option_id.to_string()))?;

        self.selected_option_id = Some(option.id.clone());
        match option.fields.first() {
            Some(first) => {
                self.phase = Phase::CollectingField {
                    option_id: option.id.clone(),
                    field_index: 0,
                };
                Ok(Step::Prompt(first.clone()))
            }
            None => {
                self.phase = Phase::Completed;
                Ok(Step::Done {
                    option_id: option.id.clone(),
                    answers: self.answers.clone(),
                })
            }
        }
    }

    /// Visitor answered the current field. A valid answer advances (or
    /// completes); an invalid one returns `Step::Rejected` and stays put.
    pub fn submit_answer(&mut self, flow: &FlowConfig, raw: &str) -> Result<Step, SessionError> {
        let (option_id, field_index) = match &self.phase {
            Phase::CollectingField {
                option_id,
                field_index,
            } => (option_id.clone(), *field_index),
            _ => return Err(SessionError::NotCollecting),
        };

        let Some(option) = flow.option(&option_id) else {
            // The option vanished under us without an apply_config in
            // between. Same fallback: back to the option list.
            self.fall_back();
            return Err(SessionError::UnknownOption(option_id));
        };
        let Some(field) = option.fields.get(field_index) else {
            self.phase = Phase::Completed;
            return Ok(Step::Done {
                option_id,
                answers: self.answers.clone(),
            });
        };

        if let Err(reason) = validate_answer(field, raw) {
            return Ok(Step::Rejected {
                field: field.clone(),
                reason,
            });
        }

        self.answers
            .insert(field.id.clone(), raw.trim().to_string());

        match option.fields.get(field_index + 1) {
            Some(next) => {
                self.phase = Phase::CollectingField {
                    option_id,
                    field_index: field_index + 1,
                };
                Ok(Step::Prompt(next.clone()))
            }
            None => {
                self.phase = Phase::Completed;
                Ok(Step::Done {
                    option_id,
                    answers: self.answers.clone(),
                })
            }
        }
    }

    /// A new flow arrived while this session may be mid-flight. The current
    /// position is re-resolved by id rather than reset, so in-flight answers
    /// that still fit the new schema survive.
    pub fn apply_config(&mut self, flow: &FlowConfig) -> SwapOutcome {
        let Phase::CollectingField {
            option_id,
            field_index,
        } = self.phase.clone()
        else {
            return SwapOutcome::Kept;
        };

        match flow.option(&option_id) {
            None => {
                debug!(%option_id, "selected option gone after config swap");
                self.fall_back();
                SwapOutcome::FellBack
            }
            Some(option) if option.fields.len() <= field_index => {
                debug!(
                    %option_id,
                    field_index,
                    remaining = option.fields.len(),
                    "option shrank below current field; completing session"
                );
                self.phase = Phase::Completed;
                SwapOutcome::Clamped
            }
            Some(_) => SwapOutcome::Kept,
        }
    }

    fn fall_back(&mut self) {
        self.phase = Phase::AwaitingOptionChoice;
        self.selected_option_id = None;
        self.answers.clear();
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

/// Shape-check one answer against its field. Blank input only fails when the
/// field is required; email and phone get a format check.
pub fn validate_answer(field: &Field, raw: &str) -> Result<(), AnswerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return if field.required {
            Err(AnswerError::Required)
        } else {
            Ok(())
        };
    }
    match field.kind {
        FieldType::Text => Ok(()),
        FieldType::Email if EMAIL_RE.is_match(trimmed) => Ok(()),
        FieldType::Email => Err(AnswerError::InvalidEmail),
        FieldType::Phone if PHONE_RE.is_match(trimmed) => Ok(()),
        FieldType::Phone => Err(AnswerError::InvalidPhone),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Field, FieldType, FlowOption};

    fn one_option_flow() -> FlowConfig {
        FlowConfig {
            welcome_message: "Hi".into(),
            end_message: "Bye".into(),
            show_end_screen: true,
            proactive: Default::default(),
            options: vec![FlowOption {
                id: "1".into(),
                label: "Get offer".into(),
                fields: vec![
                    Field {
                        id: "1".into(),
                        kind: FieldType::Text,
                        label: "Name?".into(),
                        required: true,
                    },
                    Field {
                        id: "2".into(),
                        kind: FieldType::Email,
                        label: "Email?".into(),
                        required: true,
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_open_reaches_awaiting_choice() {
        let mut session = Session::new();
        assert_eq!(*session.phase(), Phase::Idle);
        session.open();
        assert_eq!(*session.phase(), Phase::AwaitingOptionChoice);
    }

    #[test]
    fn test_choose_unknown_option_is_an_error() {
        let flow = one_option_flow();
        let mut session = Session::new();
        session.open();
        let err = session.choose_option(&flow, "nope").unwrap_err();
        assert_eq!(err, SessionError::UnknownOption("nope".into()));
        assert_eq!(*session.phase(), Phase::AwaitingOptionChoice);
    }

    #[test]
    fn test_zero_field_option_completes_immediately() {
        let mut flow = one_option_flow();
        flow.options[0].fields.clear();
        let mut session = Session::new();
        session.open();
        let step = session.choose_option(&flow, "1").unwrap();
        assert!(matches!(step, Step::Done { .. }));
        assert_eq!(*session.phase(), Phase::Completed);
    }

    #[test]
    fn test_full_collection_walkthrough() {
        let flow = one_option_flow();
        let mut session = Session::new();
        session.open();

        let step = session.choose_option(&flow, "1").unwrap();
        assert_eq!(
            *session.phase(),
            Phase::CollectingField {
                option_id: "1".into(),
                field_index: 0
            }
        );
        assert!(matches!(step, Step::Prompt(ref f) if f.id == "1"));

        // blank answer to a required field: rejected, no advance
        let step = session.submit_answer(&flow, "").unwrap();
        assert!(matches!(
            step,
            Step::Rejected {
                reason: AnswerError::Required,
                ..
            }
        ));
        assert_eq!(
            *session.phase(),
            Phase::CollectingField {
                option_id: "1".into(),
                field_index: 0
            }
        );

        let step = session.submit_answer(&flow, "Alice").unwrap();
        assert!(matches!(step, Step::Prompt(ref f) if f.id == "2"));

        let step = session.submit_answer(&flow, "not-an-email").unwrap();
        assert!(matches!(
            step,
            Step::Rejected {
                reason: AnswerError::InvalidEmail,
                ..
            }
        ));

        let step = session.submit_answer(&flow, "a@b.com").unwrap();
        match step {
            Step::Done { option_id, answers } => {
                assert_eq!(option_id, "1");
                assert_eq!(answers.get("1").map(String::as_str), Some("Alice"));
                assert_eq!(answers.get("2").map(String::as_str), Some("a@b.com"));
            }
            other => panic!("expected Done, got {:?}", other),
        }
        assert_eq!(*session.phase(), Phase::Completed);
    }

    #[test]
    fn test_reopen_after_completed_resets() {
        let mut flow = one_option_flow();
        flow.options[0].fields.clear();
        let mut session = Session::new();
        session.open();
        session.choose_option(&flow, "1").unwrap();
        assert_eq!(*session.phase(), Phase::Completed);

        session.open();
        assert_eq!(*session.phase(), Phase::AwaitingOptionChoice);
        assert!(session.answers().is_empty());
        assert!(session.selected_option_id().is_none());
    }

    #[test]
    fn test_swap_keeps_position_when_option_survives() {
        let flow = one_option_flow();
        let mut session = Session::new();
        session.open();
        session.choose_option(&flow, "1").unwrap();
        session.submit_answer(&flow, "Alice").unwrap();

        // same option id, extra field appended
        let mut new_flow = flow.clone();
        new_flow.options[0].fields.push(Field {
            id: "3".into(),
            kind: FieldType::Phone,
            label: "Phone?".into(),
            required: false,
        });

        assert_eq!(session.apply_config(&new_flow), SwapOutcome::Kept);
        assert_eq!(
            *session.phase(),
            Phase::CollectingField {
                option_id: "1".into(),
                field_index: 1
            }
        );
        assert_eq!(session.answers().get("1").map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_swap_falls_back_when_option_removed() {
        let flow = one_option_flow();
        let mut session = Session::new();
        session.open();
        session.choose_option(&flow, "1").unwrap();
        session.submit_answer(&flow, "Alice").unwrap();

        let mut new_flow = flow.clone();
        new_flow.options[0].id = "99".into();

        assert_eq!(session.apply_config(&new_flow), SwapOutcome::FellBack);
        assert_eq!(*session.phase(), Phase::AwaitingOptionChoice);
        assert!(session.answers().is_empty());
        assert!(session.selected_option_id().is_none());
    }

    #[test]
    fn test_swap_clamps_when_option_shrinks() {
        let flow = one_option_flow();
        let mut session = Session::new();
        session.open();
        session.choose_option(&flow, "1").unwrap();
        session.submit_answer(&flow, "Alice").unwrap();
        // now at field_index 1

        let mut new_flow = flow.clone();
        new_flow.options[0].fields.truncate(1);

        assert_eq!(session.apply_config(&new_flow), SwapOutcome::Clamped);
        assert_eq!(*session.phase(), Phase::Completed);
        // collected answers stay with the session
        assert_eq!(session.answers().get("1").map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_swap_is_a_no_op_outside_collection() {
        let flow = one_option_flow();
        let mut session = Session::new();
        assert_eq!(session.apply_config(&flow), SwapOutcome::Kept);
        session.open();
        assert_eq!(session.apply_config(&flow), SwapOutcome::Kept);
        assert_eq!(*session.phase(), Phase::AwaitingOptionChoice);
    }

    #[test]
    fn test_validate_answer_shapes() {
        let email = Field {
            id: "e".into(),
            kind: FieldType::Email,
            label: "Email?".into(),
            required: true,
        };
        assert!(validate_answer(&email, "a@b.com").is_ok());
        assert_eq!(
            validate_answer(&email, "not-an-email"),
            Err(AnswerError::InvalidEmail)
        );
        assert_eq!(validate_answer(&email, "  "), Err(AnswerError::Required));

        let phone = Field {
            id: "p".into(),
            kind: FieldType::Phone,
            label: "Phone?".into(),
            required: false,
        };
        assert!(validate_answer(&phone, "+44 20 7946 0958").is_ok());
        assert_eq!(
            validate_answer(&phone, "call me"),
            Err(AnswerError::InvalidPhone)
        );
        // optional fields may stay blank
        assert!(validate_answer(&phone, "").is_ok());
    }
}
