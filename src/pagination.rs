//! A bounded, scrollable view over the newest part of a conversation.
//!
//! The window never touches the conversation itself. It keeps its own copy
//! of the visible tail and grows it one page at a time towards older
//! messages. Scroll-driven loads are spaced by a cooldown so a single fling
//! does not fire a load per tick; a scroll-to-top gesture always loads.

use crate::model::Message;
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// What asked for older messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTrigger {
    Scroll,
    /// Explicit jump to the top; ignores the cooldown
    ScrollToTop,
}

#[derive(Debug, Clone)]
pub struct PaginationWindow {
    page_size: usize,
    cooldown_ms: u64,
    last_load_ms: Option<u64>,
    visible: Vec<Message>,
}

impl PaginationWindow {
    pub fn new(page_size: usize, cooldown: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            cooldown_ms: u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
            last_load_ms: None,
            visible: Vec::new(),
        }
    }

    /// Number of messages currently visible, counted from the newest
    pub fn offset(&self) -> usize {
        self.visible.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn visible(&self) -> &[Message] {
        &self.visible
    }

    pub fn is_complete(&self, history: &[Message]) -> bool {
        self.oldest_index(history) == 0
    }

    /// Prepend the next older page of `history` and return it.
    /// An empty result means nothing was loaded.
    pub fn load_older(&mut self, history: &[Message], trigger: LoadTrigger) -> Vec<Message> {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.load_older_at(history, trigger, now_ms)
    }

    pub fn load_older_at(
        &mut self,
        history: &[Message],
        trigger: LoadTrigger,
        now_ms: u64,
    ) -> Vec<Message> {
        let end = self.oldest_index(history);
        if end == 0 {
            return Vec::new();
        }
        if trigger == LoadTrigger::Scroll && self.cooling_down(now_ms) {
            debug!(offset = self.offset(), "pagination within cooldown; skipping");
            return Vec::new();
        }

        let start = end.saturating_sub(self.page_size);
        let seen: HashSet<_> = self.visible.iter().map(|m| &m.identifier).collect();
        let block: Vec<Message> = history[start..end]
            .iter()
            .filter(|m| !seen.contains(&m.identifier))
            .cloned()
            .collect();

        let mut visible = block.clone();
        visible.append(&mut self.visible);
        self.visible = visible;
        self.last_load_ms = Some(now_ms);
        debug!(loaded = block.len(), offset = self.offset(), "loaded older messages");
        block
    }

    /// Refresh the visible slice from `history`: picks up edits to visible
    /// messages and anything newer than the oldest visible one.
    ///
    /// An empty window shows the newest page. This does not count as a load
    /// for the cooldown.
    pub fn sync(&mut self, history: &[Message]) {
        let start = if self.visible.is_empty() {
            history.len().saturating_sub(self.page_size)
        } else {
            self.oldest_index(history)
        };
        self.visible = history[start..].to_vec();
    }

    pub fn reset(&mut self) {
        self.visible.clear();
        self.last_load_ms = None;
    }

    fn cooling_down(&self, now_ms: u64) -> bool {
        self.last_load_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.cooldown_ms)
    }

    /// Index in `history` of the oldest visible message
    fn oldest_index(&self, history: &[Message]) -> usize {
        let Some(oldest) = self.visible.first() else {
            return history.len();
        };
        history
            .iter()
            .position(|m| m.identifier == oldest.identifier)
            .unwrap_or_else(|| history.len().saturating_sub(self.visible.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::tests::message;

    fn history(count: u32) -> Vec<Message> {
        (0..count).map(|i| message(&format!("m{i:02}"), "ben", i)).collect()
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.identifier.to_string()).collect()
    }

    fn range(from: u32, to: u32) -> Vec<String> {
        (from..=to).map(|i| format!("m{i:02}")).collect()
    }

    #[test]
    fn test_pages_with_cooldown() {
        let history = history(25);
        let mut window = PaginationWindow::new(10, Duration::from_secs(1));

        let first = window.load_older_at(&history, LoadTrigger::Scroll, 10_000);
        assert_eq!(ids(&first), range(15, 24));

        let throttled = window.load_older_at(&history, LoadTrigger::Scroll, 10_400);
        assert!(throttled.is_empty());
        assert_eq!(window.offset(), 10);

        let second = window.load_older_at(&history, LoadTrigger::Scroll, 11_100);
        assert_eq!(ids(&second), range(5, 14));
        assert_eq!(ids(window.visible()), range(5, 24));

        let last = window.load_older_at(&history, LoadTrigger::Scroll, 12_200);
        assert_eq!(ids(&last), range(0, 4));
        assert!(window.is_complete(&history));
        assert!(window.load_older_at(&history, LoadTrigger::ScrollToTop, 20_000).is_empty());
    }

    #[test]
    fn test_scroll_to_top_bypasses_cooldown() {
        let history = history(25);
        let mut window = PaginationWindow::new(10, Duration::from_secs(1));
        window.load_older_at(&history, LoadTrigger::Scroll, 0);
        let forced = window.load_older_at(&history, LoadTrigger::ScrollToTop, 100);
        assert_eq!(ids(&forced), range(5, 14));
    }

    #[test]
    fn test_new_messages_do_not_shift_pages() {
        let mut history = history(25);
        let mut window = PaginationWindow::new(10, Duration::ZERO);
        window.load_older_at(&history, LoadTrigger::Scroll, 0);

        history.push(message("m25", "ana", 25));
        history.push(message("m26", "ana", 26));
        window.sync(&history);
        assert_eq!(ids(window.visible()), range(15, 26));

        let older = window.load_older_at(&history, LoadTrigger::Scroll, 1);
        assert_eq!(ids(&older), range(5, 14));
    }

    #[test]
    fn test_sync_shows_newest_page_then_pages_back() {
        let mut growing: Vec<Message> = Vec::new();
        let mut window = PaginationWindow::new(10, Duration::from_secs(1));
        window.sync(&growing);
        assert!(window.visible().is_empty());

        growing.push(message("m00", "ana", 0));
        window.sync(&growing);
        assert_eq!(ids(window.visible()), range(0, 0));

        let history = history(25);
        let mut window = PaginationWindow::new(10, Duration::from_secs(1));
        window.sync(&history);
        assert_eq!(ids(window.visible()), range(15, 24));
        let older = window.load_older_at(&history, LoadTrigger::Scroll, 10_000);
        assert_eq!(ids(&older), range(5, 14));
        assert!(window.load_older_at(&history, LoadTrigger::Scroll, 10_400).is_empty());
    }

    #[test]
    fn test_short_history() {
        let history = history(3);
        let mut window = PaginationWindow::new(10, Duration::ZERO);
        assert_eq!(window.load_older_at(&history, LoadTrigger::Scroll, 0).len(), 3);
        assert!(window.load_older_at(&history, LoadTrigger::Scroll, 1).is_empty());
        window.reset();
        assert_eq!(window.offset(), 0);
    }
}
