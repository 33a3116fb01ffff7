//! Reconstruction of complete tool calls from streamed fragments.
//!
//! Upstream responses deliver tool calls as fragments interleaved with text
//! deltas, and vendors disagree on framing: fragments may be keyed by a
//! numeric `index`, by a stable `id`, by neither, and argument chunks may be
//! incremental suffixes or cumulative full-values-so-far. The accumulator
//! normalizes all of that into ordered `(name, arguments)` calls.
//!
//! State is per streaming turn: build a fresh accumulator for every upstream
//! request.

use std::collections::HashMap;

use relay_types::ToolCallFragment;

/// A reconstructed call, ready for dispatch once the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedToolCall {
    /// Stable id if the vendor supplied one.
    pub id: Option<String>,
    pub name: String,
    /// Raw accumulated argument text, typically a JSON object.
    pub arguments_raw: String,
    pub index: Option<u32>,
}

#[derive(Debug)]
struct Entry {
    index: Option<u32>,
    id: Option<String>,
    name: String,
    arguments: String,
    arrival: usize,
}

/// Merge one streamed chunk into an accumulated value, tolerating both
/// incremental and cumulative delivery.
///
/// A chunk that extends (or equals) the accumulated value and starts with it
/// is the full value so far: replace. Anything else is a suffix: append.
/// Re-delivery of an identical cumulative chunk is therefore a no-op.
pub fn merge_chunk(accumulated: &mut String, chunk: &str) {
    if chunk.len() >= accumulated.len() && chunk.starts_with(accumulated.as_str()) {
        accumulated.clear();
        accumulated.push_str(chunk);
    } else {
        accumulated.push_str(chunk);
    }
}

/// Pure state machine turning tool-call fragments into complete calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: HashMap<String, Entry>,
    index_to_key: HashMap<u32, String>,
    id_to_key: HashMap<String, String>,
    /// Keys of entries that have not been assigned an index yet, in arrival
    /// order.
    unindexed: Vec<String>,
    anon_counter: usize,
    fragments_seen: usize,
    text: String,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a plain assistant text delta (outside tool calls).
    pub fn push_text(&mut self, chunk: &str) {
        merge_chunk(&mut self.text, chunk);
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn push_fragment(&mut self, fragment: &ToolCallFragment) {
        let position = self.fragments_seen;
        self.fragments_seen += 1;

        let key = self.resolve_key(fragment, position);

        let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            index: None,
            id: None,
            name: String::new(),
            arguments: String::new(),
            arrival: position,
        });

        if entry.index.is_none()
            && let Some(index) = fragment.index
        {
            entry.index = Some(index);
            self.unindexed.retain(|k| k != &key);
        }
        if let Some(index) = fragment.index {
            self.index_to_key.insert(index, key.clone());
        }
        if let Some(id) = &fragment.id {
            if entry.id.is_none() {
                entry.id = Some(id.clone());
            }
            self.id_to_key.insert(id.clone(), key.clone());
        }

        // First non-empty name wins.
        if entry.name.is_empty()
            && let Some(name) = &fragment.name
            && !name.is_empty()
        {
            entry.name = name.clone();
        }

        if let Some(arguments) = &fragment.arguments {
            merge_chunk(&mut entry.arguments, arguments);
        }
    }

    /// Resolve a stable key for a fragment, in priority order: existing index
    /// mapping, existing id mapping, the single unindexed entry, then a
    /// freshly minted key.
    ///
    /// The single-unindexed bind is a best-effort heuristic for the common
    /// one-tool-call pattern; a vendor streaming several concurrent calls
    /// with neither index nor id is genuinely ambiguous, and no resolution
    /// order can fix that.
    fn resolve_key(&mut self, fragment: &ToolCallFragment, position: usize) -> String {
        if let Some(index) = fragment.index
            && let Some(key) = self.index_to_key.get(&index)
        {
            return key.clone();
        }

        if let Some(id) = &fragment.id
            && let Some(key) = self.id_to_key.get(id)
        {
            return key.clone();
        }

        // A fresh id names a new call; only id-less fragments may fall back
        // to the lone open entry.
        if fragment.id.is_none() && self.unindexed.len() == 1 {
            return self.unindexed[0].clone();
        }

        if let Some(index) = fragment.index {
            return format!("index:{index}");
        }

        if let Some(id) = &fragment.id {
            let key = format!("id:{id}");
            self.unindexed.push(key.clone());
            return key;
        }

        let key = format!("anon:{}:{}", self.anon_counter, position);
        self.anon_counter += 1;
        self.unindexed.push(key.clone());
        key
    }

    /// Completed calls at stream end: entries with a non-empty name, ordered
    /// by index ascending with index-less entries last, otherwise stable by
    /// arrival.
    ///
    /// Entries whose name never arrived are dropped from the result; that
    /// matches upstream behavior for malformed streams, so the drop is only
    /// logged.
    #[must_use]
    pub fn finish(self) -> Vec<CompletedToolCall> {
        let mut entries: Vec<Entry> = self
            .entries
            .into_values()
            .inspect(|entry| {
                if entry.name.is_empty() {
                    tracing::debug!(
                        arguments_bytes = entry.arguments.len(),
                        "Dropping accumulated tool call with no name"
                    );
                }
            })
            .filter(|entry| !entry.name.is_empty())
            .collect();

        entries.sort_by_key(|entry| {
            (
                entry.index.map_or(u64::from(u32::MAX) + 1, u64::from),
                entry.arrival,
            )
        });

        entries
            .into_iter()
            .map(|entry| CompletedToolCall {
                id: entry.id,
                name: entry.name,
                arguments_raw: entry.arguments,
                index: entry.index,
            })
            .collect()
    }
}
