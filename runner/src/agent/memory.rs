//! Per-run agent memory.
//!
//! Pure data, separate from prompt rendering: the agent records one tuple
//! per step and asks for a rendered block when building the next prompt.
//! Never persisted; reconstructed for every run.

use std::collections::VecDeque;

use crate::config::{MemoryConfig, MemoryKind};

/// One remembered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub observation: String,
    pub choices: Vec<String>,
    /// Final 1-based action taken.
    pub action: usize,
    pub reasoning: Option<String>,
}

/// Bounded step memory with an optional rolling summary.
#[derive(Debug, Clone)]
pub struct MemoryState {
    kind: MemoryKind,
    max_history: usize,
    entries: VecDeque<MemoryEntry>,
    summary: Option<String>,
    /// Entries displaced past `max_history`, pending summarization.
    overflow: Vec<MemoryEntry>,
    /// One-shot notes (tool results) surfaced in the next block only.
    pending_notes: Vec<String>,
    steps_recorded: u32,
}

impl MemoryState {
    pub fn new(config: Option<&MemoryConfig>) -> Self {
        let config = config.cloned().unwrap_or_default();
        Self {
            kind: config.kind,
            max_history: config.max_history,
            entries: VecDeque::new(),
            summary: None,
            overflow: Vec::new(),
            pending_notes: Vec::new(),
            steps_recorded: 0,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn steps_recorded(&self) -> u32 {
        self.steps_recorded
    }

    /// Record one completed step.
    pub fn record(&mut self, entry: MemoryEntry) {
        self.steps_recorded += 1;
        if self.kind == MemoryKind::None {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.max_history {
            let displaced = self.entries.pop_front().expect("non-empty");
            match self.kind {
                MemoryKind::Summary => self.overflow.push(displaced),
                MemoryKind::MessageHistory | MemoryKind::None => {}
            }
        }
    }

    /// Queue a one-shot note (e.g. a calculator result) for the next block.
    pub fn push_note(&mut self, note: String) {
        self.pending_notes.push(note);
    }

    /// Entries awaiting summarization. Kept until [`Self::clear_overflow`]
    /// so a failed summarizer call loses nothing.
    pub fn overflow(&self) -> &[MemoryEntry] {
        &self.overflow
    }

    pub fn clear_overflow(&mut self) {
        self.overflow.clear();
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn set_summary(&mut self, summary: String) {
        self.summary = Some(summary);
    }

    /// Render the memory block for the next prompt, or `None` when there is
    /// nothing to show. One-shot notes are consumed by this call.
    pub fn render_block(&mut self) -> Option<String> {
        let notes = std::mem::take(&mut self.pending_notes);
        if self.kind == MemoryKind::None && notes.is_empty() {
            return None;
        }

        let mut sections = Vec::new();
        if let Some(summary) = &self.summary {
            sections.push(format!("Summary so far: {summary}"));
        }
        for entry in &self.entries {
            sections.push(render_entry(entry));
        }
        sections.extend(notes);

        if sections.is_empty() {
            return None;
        }
        Some(sections.join("\n"))
    }
}

fn render_entry(entry: &MemoryEntry) -> String {
    let chosen = entry
        .choices
        .get(entry.action.saturating_sub(1))
        .map(String::as_str)
        .unwrap_or("?");
    match &entry.reasoning {
        Some(reasoning) => format!(
            "- chose {} ({chosen}) because: {reasoning}",
            entry.action
        ),
        None => format!("- chose {} ({chosen})", entry.action),
    }
}

/// Render displaced entries as input for the summarizer call.
pub fn render_for_summary(previous: Option<&str>, overflow: &[MemoryEntry]) -> String {
    let mut buf = String::new();
    if let Some(previous) = previous {
        buf.push_str("Existing summary:\n");
        buf.push_str(previous);
        buf.push_str("\n\n");
    }
    buf.push_str("New steps:\n");
    for entry in overflow {
        buf.push_str(&render_entry(entry));
        buf.push('\n');
        buf.push_str(&entry.observation);
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: usize, reasoning: &str) -> MemoryEntry {
        MemoryEntry {
            observation: format!("obs-{action}"),
            choices: vec!["left".to_string(), "right".to_string()],
            action,
            reasoning: Some(reasoning.to_string()),
        }
    }

    fn config(kind: MemoryKind, max_history: usize) -> MemoryConfig {
        MemoryConfig { kind, max_history }
    }

    #[test]
    fn none_memory_renders_nothing() {
        let mut memory = MemoryState::new(None);
        memory.record(entry(1, "why"));
        assert_eq!(memory.render_block(), None);
    }

    #[test]
    fn message_history_is_bounded() {
        let mut memory = MemoryState::new(Some(&config(MemoryKind::MessageHistory, 2)));
        memory.record(entry(1, "first"));
        memory.record(entry(2, "second"));
        memory.record(entry(1, "third"));

        let block = memory.render_block().expect("block");
        assert!(!block.contains("first"));
        assert!(block.contains("second"));
        assert!(block.contains("third"));
        // History kind drops displaced entries instead of queueing them.
        assert!(!memory.has_overflow());
    }

    #[test]
    fn summary_kind_queues_overflow_and_renders_summary() {
        let mut memory = MemoryState::new(Some(&config(MemoryKind::Summary, 1)));
        memory.record(entry(1, "first"));
        memory.record(entry(2, "second"));
        assert!(memory.has_overflow());

        assert_eq!(memory.overflow().len(), 1);
        memory.clear_overflow();
        memory.set_summary("went left early".to_string());

        let block = memory.render_block().expect("block");
        assert!(block.contains("Summary so far: went left early"));
        assert!(block.contains("second"));
    }

    #[test]
    fn notes_appear_once() {
        let mut memory = MemoryState::new(Some(&config(MemoryKind::MessageHistory, 4)));
        memory.record(entry(1, "first"));
        memory.push_note("Calculator result: 42".to_string());

        let block = memory.render_block().expect("block");
        assert!(block.contains("Calculator result: 42"));
        let block = memory.render_block().expect("block");
        assert!(!block.contains("Calculator result"));
    }
}
