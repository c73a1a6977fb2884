//! Lazy, restartable reading of the event log.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::DomainError;
use crate::event::{EventCursor, LogEntry};
use crate::repository::EventStore;

const DEFAULT_PAGE_SIZE: usize = 256;

/// Reads the log forward from a cursor, one page at a time.
///
/// `next` ends at the current head, which suits replay and audit. `next_live`
/// never ends: at the head it waits for the store's append notification.
pub struct EventReader {
    store: Arc<dyn EventStore>,
    cursor: EventCursor,
    page_size: usize,
    buffer: VecDeque<LogEntry>,
    appends: watch::Receiver<u64>,
}

impl EventReader {
    /// Creates a reader that yields entries after `cursor`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, cursor: EventCursor) -> Self {
        let appends = store.append_notifications();
        Self {
            store,
            cursor,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            appends,
        }
    }

    /// Sets how many entries are fetched per round trip.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Cursor after the last entry returned. Pass it to a new reader to
    /// resume.
    #[must_use]
    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    /// Returns the next entry, or `None` once the reader reaches the head.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if a page cannot be read.
    pub async fn next(&mut self) -> Result<Option<LogEntry>, DomainError> {
        if self.buffer.is_empty() {
            let page = self.store.read_from(self.cursor, self.page_size).await?;
            self.buffer.extend(page);
        }
        let entry = self.buffer.pop_front();
        if let Some(entry) = &entry {
            self.cursor = entry.cursor();
        }
        Ok(entry)
    }

    /// Returns the next entry, waiting for new appends at the head.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if a page cannot be read or the store
    /// has shut down.
    pub async fn next_live(&mut self) -> Result<LogEntry, DomainError> {
        loop {
            // Mark the current head as seen before reading so an append that
            // lands between the read and the wait still wakes us.
            let _ = self.appends.borrow_and_update();
            if let Some(entry) = self.next().await? {
                return Ok(entry);
            }
            self.appends
                .changed()
                .await
                .map_err(|_| DomainError::Storage("event store closed".into()))?;
        }
    }
}
