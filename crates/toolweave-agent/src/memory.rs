//! Conversation memory consulted by the orchestrator.

use async_trait::async_trait;
use parking_lot::Mutex;

use toolweave_core::Message;

/// Ordered message storage that seeds a run and receives its answer.
#[async_trait]
pub trait Memory: Send + Sync {
    /// All stored messages, oldest first.
    async fn get_messages(&self) -> anyhow::Result<Vec<Message>>;

    /// Append a message.
    async fn add_message(&self, message: Message) -> anyhow::Result<()>;
}

/// In-process memory keeping the most recent messages.
#[derive(Debug, Default)]
pub struct BufferMemory {
    messages: Mutex<Vec<Message>>,
    max_messages: Option<usize>,
}

impl BufferMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max` messages, dropping the oldest.
    pub fn with_max_messages(max: usize) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            max_messages: Some(max),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

#[async_trait]
impl Memory for BufferMemory {
    async fn get_messages(&self) -> anyhow::Result<Vec<Message>> {
        Ok(self.messages.lock().clone())
    }

    async fn add_message(&self, message: Message) -> anyhow::Result<()> {
        let mut messages = self.messages.lock();
        messages.push(message);
        if let Some(max) = self.max_messages {
            let excess = messages.len().saturating_sub(max);
            messages.drain(..excess);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolweave_core::Role;

    #[tokio::test]
    async fn test_buffer_memory_keeps_order() {
        let memory = BufferMemory::new();
        memory.add_message(Message::user("hi")).await.unwrap();
        memory.add_message(Message::assistant("hello")).await.unwrap();

        let messages = memory.get_messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_buffer_memory_drops_oldest() {
        let memory = BufferMemory::with_max_messages(2);
        for text in ["one", "two", "three"] {
            memory.add_message(Message::user(text)).await.unwrap();
        }

        let contents: Vec<_> = memory
            .get_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["two", "three"]);

        memory.clear();
        assert!(memory.is_empty());
    }
}
