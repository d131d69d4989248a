use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

pub mod payload {
    pub const QUERY_STR: &str = "query_str";
    pub const NODES: &str = "nodes";
    pub const RESPONSE: &str = "response";
    pub const TEMPLATE: &str = "template";
    pub const PROMPT: &str = "formatted_prompt";
    pub const SUB_QUESTIONS: &str = "sub_questions";
    pub const PROMPT_TOKENS: &str = "formatted_prompt_tokens_count";
    pub const PREDICTION_TOKENS: &str = "prediction_tokens_count";
    pub const TOTAL_TOKENS: &str = "total_tokens_used";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallbackEventType {
    Query,
    Retrieve,
    Synthesize,
    Llm,
    SubQuestions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackEvent {
    pub event_id: String,
    pub event_type: CallbackEventType,
    pub phase: EventPhase,
    pub payload: Option<Value>,
    pub time: DateTime<Utc>,
}

pub trait CallbackHandler: Send + Sync {
    fn on_event_start(&self, event: &CallbackEvent);
    fn on_event_end(&self, event: &CallbackEvent);
}

/// Fans query, retrieval, synthesis and LLM events out to the registered handlers.
#[derive(Clone, Default)]
pub struct CallbackManager {
    handlers: Vec<Arc<dyn CallbackHandler>>,
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl CallbackManager {
    pub fn new(handlers: Vec<Arc<dyn CallbackHandler>>) -> Self {
        Self { handlers }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn CallbackHandler>) {
        self.handlers.push(handler);
    }

    pub fn on_event_start(&self, event_type: CallbackEventType, payload: Option<Value>) -> String {
        let event = CallbackEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            phase: EventPhase::Start,
            payload,
            time: Utc::now(),
        };

        for handler in &self.handlers {
            handler.on_event_start(&event);
        }
        event.event_id
    }

    pub fn on_event_end(
        &self,
        event_type: CallbackEventType,
        payload: Option<Value>,
        event_id: &str,
    ) {
        let event = CallbackEvent {
            event_id: event_id.to_string(),
            event_type,
            phase: EventPhase::End,
            payload,
            time: Utc::now(),
        };

        for handler in &self.handlers {
            handler.on_event_end(&event);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHandler;

impl CallbackHandler for TracingHandler {
    fn on_event_start(&self, event: &CallbackEvent) {
        debug!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            "callback event start"
        );
    }

    fn on_event_end(&self, event: &CallbackEvent) {
        debug!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            has_payload = event.payload.is_some(),
            "callback event end"
        );
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<CallbackEvent>>,
}

impl EventRecorder {
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_of(&self, event_type: CallbackEventType) -> Vec<CallbackEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }

    fn record(&self, event: &CallbackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

impl CallbackHandler for EventRecorder {
    fn on_event_start(&self, event: &CallbackEvent) {
        self.record(event);
    }

    fn on_event_end(&self, event: &CallbackEvent) {
        self.record(event);
    }
}
