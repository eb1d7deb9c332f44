//! Bounded in-memory record window with recency retrieval.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Memory, MemoryError, MemoryQuery, MemoryRecord};
use crate::llm::{ChatMessage, Role};
use crate::state::StateSchema;

/// Keeps the most recent `capacity` records; older ones fall off on append.
pub struct WindowMemory {
    records: Mutex<VecDeque<MemoryRecord>>,
    capacity: usize,
    run_id: Mutex<String>,
}

impl WindowMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            run_id: Mutex::new(String::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, VecDeque<MemoryRecord>>, MemoryError> {
        self.records
            .lock()
            .map_err(|_| MemoryError::Storage("record window poisoned".into()))
    }
}

impl Default for WindowMemory {
    fn default() -> Self {
        Self::new(256)
    }
}

fn chat_message_from_record(record: &MemoryRecord) -> Option<ChatMessage> {
    if record.role != "message" {
        return None;
    }
    let object = record.content.as_object()?;
    let role = match object.get("role").and_then(Value::as_str)? {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    let content = object.get("content").and_then(Value::as_str)?;
    Some(ChatMessage {
        role,
        content: content.to_string(),
    })
}

fn snippet(value: &Value, limit: usize) -> String {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > limit {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}…")
    } else {
        text
    }
}

#[async_trait]
impl Memory for WindowMemory {
    async fn append(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        let mut records = self.lock_records()?;
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        query: &MemoryQuery,
        _state: &StateSchema,
        _observation: Option<&Value>,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let records = self.lock_records()?;
        let filtered: Vec<MemoryRecord> = records
            .iter()
            .filter(|record| query.roles.is_empty() || query.roles.contains(&record.role))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(query.max_items);
        Ok(filtered[start..].to_vec())
    }

    async fn retrieve_messages(
        &self,
        _state: &StateSchema,
        _observation: Option<&Value>,
        query: &MemoryQuery,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        let records = self.lock_records()?;
        let messages: Vec<ChatMessage> =
            records.iter().filter_map(chat_message_from_record).collect();
        let start = messages.len().saturating_sub(query.max_items);
        Ok(messages[start..].to_vec())
    }

    async fn summarize(&self, max_items: usize) -> Result<String, MemoryError> {
        let records = self.lock_records()?;
        if records.is_empty() {
            return Ok(String::new());
        }
        let start = records.len().saturating_sub(max_items.max(1));
        let lines: Vec<String> = records
            .iter()
            .skip(start)
            .map(|record| format!("[{}] {}: {}", record.step_id, record.role, snippet(&record.content, 80)))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn evict(&self) -> Result<usize, MemoryError> {
        let mut records = self.lock_records()?;
        let mut evicted = 0;
        while records.len() > self.capacity {
            records.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    async fn reset(&self, run_id: &str) -> Result<(), MemoryError> {
        self.lock_records()?.clear();
        if let Ok(mut current) = self.run_id.lock() {
            *current = run_id.to_string();
        }
        Ok(())
    }
}
