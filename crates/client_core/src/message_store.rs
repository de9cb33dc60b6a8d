//! Ordered, deduplicated message sequence for one room. This is the single
//! source of truth the UI renders from; every arrival path (hydration,
//! optimistic echo, relay broadcast, durable confirmation, change-feed poll)
//! funnels through the same id-keyed merge.

use shared::protocol::MessagePayload;

#[derive(Debug, Clone)]
struct Entry {
    message: MessagePayload,
    seq: u64,
}

/// Total order is `(created_at, insertion_seq)`: ascending timestamps with
/// insertion order as the tie-break, so two messages created in the same
/// millisecond keep a stable relative order.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position_of(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&MessagePayload> {
        self.position_of(id).map(|pos| &self.entries[pos].message)
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessagePayload> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Replaces the full contents. Used once on room entry; the caller is
    /// responsible for substituting an empty sequence when the load
    /// operation returned something malformed.
    pub fn hydrate(&mut self, initial: Vec<MessagePayload>) {
        self.entries.clear();
        self.next_seq = 0;
        for message in initial {
            self.append(message);
        }
    }

    /// Inserts by the ordering rule. An entry with the same id is replaced
    /// in place (last-write-wins) instead of duplicated, which is what makes
    /// the sender's own relay echo a no-op merge.
    pub fn append(&mut self, message: MessagePayload) {
        match self.position_of(&message.id) {
            Some(pos) => {
                self.entries[pos].message = message;
                self.resort();
            }
            None => self.insert_new(message),
        }
    }

    /// Swaps a provisional entry for its durably-confirmed version while
    /// preserving the entry's insertion sequence, so the row does not jump
    /// unless the authoritative timestamp materially changes the order.
    ///
    /// If the provisional entry is gone (evicted, or the room was re-entered
    /// while the write was in flight) the confirmed message is appended as a
    /// new entry — never dropped. If the confirmed record already arrived
    /// through the feed, the provisional entry is removed instead of leaving
    /// two rows for one message.
    pub fn replace_provisional(&mut self, temp_id: &str, confirmed: MessagePayload) {
        let Some(pos) = self.position_of(temp_id) else {
            self.append(confirmed);
            return;
        };
        if let Some(existing) = self.position_of(&confirmed.id) {
            self.entries[existing].message = confirmed;
            self.entries.remove(pos);
        } else {
            self.entries[pos].message = confirmed;
        }
        self.resort();
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == id)
    }

    fn insert_new(&mut self, message: MessagePayload) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = (message.created_at, seq);
        let idx = self
            .entries
            .partition_point(|entry| (entry.message.created_at, entry.seq) <= key);
        self.entries.insert(idx, Entry { message, seq });
    }

    fn resort(&mut self) {
        self.entries
            .sort_by_key(|entry| (entry.message.created_at, entry.seq));
    }
}
