//! Append-only observed-event journal with monotone cursor.
//!
//! The journal is in-process state owned by the dispatcher, bounded only
//! by process lifetime. Subscribers replay entries newer than a cursor and
//! then ride the live feed; both paths go through the same entry sequence,
//! so no gap can open between replay and the live tail.

use serde::{Deserialize, Serialize};

use crate::core::{EventScope, ObservedEvent};

/// One published entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Strictly monotone cursor, starting at 1 for the first entry.
    pub cursor: u64,

    /// Smallest enclosing scope of the mutation.
    pub scope: EventScope,

    /// The event payload.
    pub event: ObservedEvent,
}

/// Conjunctive filter over journal entries.
///
/// Every set field must equal the corresponding field on the entry scope
/// (or a field derivable from the event payload); an entry lacking a field
/// the filter requires does not match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedFilter {
    /// Required tenant id.
    pub tenant_id: Option<String>,

    /// Required user id.
    pub user_id: Option<String>,

    /// Required workspace id.
    pub workspace_id: Option<String>,

    /// Required repository id (derived from the payload).
    pub repository_id: Option<String>,

    /// Required task id (derived from the payload).
    pub task_id: Option<String>,

    /// Required directory id.
    pub directory_id: Option<String>,

    /// Required conversation id.
    pub conversation_id: Option<String>,

    /// Whether raw session-output events are delivered.
    #[serde(default)]
    pub include_output: bool,
}

/// Whether an entry passes a filter.
#[must_use]
pub fn matches_observed_filter(filter: &ObservedFilter, entry: &JournalEntry) -> bool {
    if !filter.include_output && entry.event.is_output() {
        return false;
    }

    if let Some(ref tenant) = filter.tenant_id {
        if entry.scope.tenant_id != *tenant {
            return false;
        }
    }
    if let Some(ref user) = filter.user_id {
        if entry.scope.user_id != *user {
            return false;
        }
    }
    if let Some(ref workspace) = filter.workspace_id {
        if entry.scope.workspace_id != *workspace {
            return false;
        }
    }
    if let Some(ref directory) = filter.directory_id {
        if entry.scope.directory_id.as_deref() != Some(directory.as_str()) {
            return false;
        }
    }
    if let Some(ref conversation) = filter.conversation_id {
        if entry.scope.conversation_id.as_deref() != Some(conversation.as_str()) {
            return false;
        }
    }
    if let Some(ref repository) = filter.repository_id {
        if entry.event.repository_id() != Some(repository.as_str()) {
            return false;
        }
    }
    if let Some(ref task) = filter.task_id {
        if entry.event.task_id() != Some(task.as_str()) {
            return false;
        }
    }

    true
}

/// The append-only journal.
#[derive(Debug, Default)]
pub struct ObservedJournal {
    entries: Vec<JournalEntry>,
    cursor: u64,
}

impl ObservedJournal {
    /// An empty journal with cursor 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cursor of the most recent entry (0 when empty).
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Append an event, assigning the next cursor.
    pub fn publish(&mut self, scope: EventScope, event: ObservedEvent) -> &JournalEntry {
        self.cursor += 1;
        self.entries.push(JournalEntry {
            cursor: self.cursor,
            scope,
            event,
        });
        // Just pushed.
        &self.entries[self.entries.len() - 1]
    }

    /// Entries with `cursor > after_cursor` matching the filter, in cursor
    /// order.
    #[must_use]
    pub fn replay(&self, filter: &ObservedFilter, after_cursor: u64) -> Vec<&JournalEntry> {
        // Cursors equal positions + 1, so the replay start indexes directly.
        let start = usize::try_from(after_cursor).unwrap_or(usize::MAX);
        let tail = self.entries.get(start.min(self.entries.len())..).unwrap_or(&[]);
        tail.iter()
            .filter(|entry| matches_observed_filter(filter, entry))
            .collect()
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RuntimeStatus, Scope};

    fn output_event(session: &str, cursor: u64) -> ObservedEvent {
        ObservedEvent::SessionOutput {
            session_id: session.to_owned(),
            cursor,
            chunk_base64: "aGk=".to_owned(),
        }
    }

    fn status_event(session: &str) -> ObservedEvent {
        ObservedEvent::SessionStatus {
            session_id: session.to_owned(),
            status: RuntimeStatus::Running,
            attention_reason: None,
        }
    }

    #[test]
    fn cursors_are_strictly_monotone() {
        let mut journal = ObservedJournal::new();
        let scope = EventScope::workspace(&Scope::local());
        for i in 1..=5 {
            let entry = journal.publish(scope.clone(), status_event("conversation-1"));
            assert_eq!(entry.cursor, i);
        }
        assert_eq!(journal.cursor(), 5);
    }

    #[test]
    fn replay_filters_output_and_respects_cursor() {
        let mut journal = ObservedJournal::new();
        let scope = EventScope::conversation(&Scope::local(), None, "conversation-1");

        // Entries 1..=10 with output at 7 and 9.
        for i in 1..=10u64 {
            let event = if i == 7 || i == 9 {
                output_event("conversation-1", i)
            } else {
                status_event("conversation-1")
            };
            journal.publish(scope.clone(), event);
        }

        let filter = ObservedFilter {
            tenant_id: Some("tenant-local".to_owned()),
            include_output: false,
            ..ObservedFilter::default()
        };

        let replayed = journal.replay(&filter, 5);
        let cursors: Vec<u64> = replayed.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![6, 8, 10]);
        assert_eq!(journal.cursor(), 10);
    }

    #[test]
    fn filter_requires_fields_present_on_the_entry() {
        let mut journal = ObservedJournal::new();
        let scope = EventScope::workspace(&Scope::local());
        journal.publish(scope, status_event("conversation-1"));

        // The entry has no directory id, so a directory filter excludes it.
        let filter = ObservedFilter {
            directory_id: Some("directory-1".to_owned()),
            ..ObservedFilter::default()
        };
        assert!(journal.replay(&filter, 0).is_empty());
    }

    #[test]
    fn mismatched_tenant_is_excluded() {
        let mut journal = ObservedJournal::new();
        let scope = EventScope::workspace(&Scope::new("tenant-a", "u", "w"));
        journal.publish(scope, status_event("conversation-1"));

        let filter = ObservedFilter {
            tenant_id: Some("tenant-b".to_owned()),
            ..ObservedFilter::default()
        };
        assert!(journal.replay(&filter, 0).is_empty());
    }
}
