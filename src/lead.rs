use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// One completed interaction: the option the visitor picked and every
/// collected answer, keyed by field id. Written once when a session
/// completes; the widget never updates or deletes it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Lead {
    pub id: String,
    pub chatbot_id: String,
    pub option_id: String,
    pub answers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        chatbot_id: impl Into<String>,
        option_id: impl Into<String>,
        answers: HashMap<String, String>,
    ) -> Self {
        Lead {
            id: uuid::Uuid::new_v4().to_string(),
            chatbot_id: chatbot_id.into(),
            option_id: option_id.into(),
            answers,
            created_at: Utc::now(),
        }
    }
}

/// Append-only destination for completed interactions. A failed write is
/// the backend's problem: the engine logs it and moves on, and the visitor
/// still sees the end message.
#[async_trait]
pub trait LeadSink: Send + Sync + Debug {
    async fn create(&self, lead: Lead) -> Result<(), StoreError>;
}

/// Collects leads in memory; the test and live-preview sink.
#[derive(Debug, Default)]
pub struct InMemoryLeadSink {
    leads: Mutex<Vec<Lead>>,
}

impl InMemoryLeadSink {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryLeadSink::default())
    }

    pub fn all(&self) -> Vec<Lead> {
        self.leads.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeadSink for InMemoryLeadSink {
    async fn create(&self, lead: Lead) -> Result<(), StoreError> {
        self.leads.lock().unwrap().push(lead);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_appends_in_order() {
        let sink = InMemoryLeadSink::new();
        let mut answers = HashMap::new();
        answers.insert("1".to_string(), "Alice".to_string());

        sink.create(Lead::new("bot-1", "1", answers.clone()))
            .await
            .unwrap();
        sink.create(Lead::new("bot-1", "2", answers)).await.unwrap();

        let all = sink.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].option_id, "1");
        assert_eq!(all[1].option_id, "2");
        assert_eq!(all[0].answers.get("1").map(String::as_str), Some("Alice"));
    }
}
