//! Memory-resident history backend for non-persistent sessions

use super::{HistoryBackend, HistoryError, HistoryEvent, HistoryMessage};

#[derive(Debug, Default)]
pub struct MemoryHistory {
    messages: Vec<HistoryMessage>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryBackend for MemoryHistory {
    fn append(&mut self, message: &HistoryMessage) -> Result<(), HistoryError> {
        self.messages.push(message.clone());
        Ok(())
    }

    fn replace(&mut self, messages: &[HistoryMessage]) -> Result<(), HistoryError> {
        self.messages = messages.to_vec();
        Ok(())
    }

    fn batch(&self, offset: usize) -> Result<Vec<HistoryMessage>, HistoryError> {
        Ok(self.messages.get(offset..).unwrap_or_default().to_vec())
    }

    fn cleanup(&mut self, _before_offset: usize) {}

    fn record(&mut self, _event: &HistoryEvent) -> Result<(), HistoryError> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), HistoryError> {
        Ok(())
    }
}
