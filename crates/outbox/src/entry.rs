//! Buffered entries and fragment planning.

use std::fmt;

use {
    herald_common::ChatTarget,
    serde::{Deserialize, Serialize},
};

use crate::limits::OutboxLimits;

/// Identifies an entry for its whole lifetime in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How much of an entry has gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing sent yet.
    Fresh,
    /// A prefix went out and more than one fragment remains.
    Continuing,
    /// A prefix went out and the remainder fits one wrapped send.
    FinalFragment,
}

/// Shape of one planned send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Entire fresh entry, no fences.
    Whole,
    /// First slice of a split entry plus the close fence.
    Head,
    /// Open fence, slice, close fence.
    Middle,
    /// Open fence plus the rest of the entry.
    Tail,
}

impl FragmentKind {
    /// Whether sending this fragment consumes everything planned from the entry.
    #[must_use]
    pub fn finishes_entry(self) -> bool {
        matches!(self, Self::Whole | Self::Tail)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whole => "whole",
            Self::Head => "head",
            Self::Middle => "middle",
            Self::Tail => "tail",
        }
    }
}

/// One outbound unit waiting in the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub id: EntryId,
    pub target: ChatTarget,
    /// Unsent content. Only ever grows at the end or loses a sent prefix.
    pub text: String,
    pub phase: Phase,
}

/// A planned send: the payload and how many chars of entry text it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub payload: String,
    pub consumed: usize,
}

impl PendingEntry {
    pub(crate) fn new(id: EntryId, target: ChatTarget, text: String) -> Self {
        Self {
            id,
            target,
            text,
            phase: Phase::Fresh,
        }
    }

    /// Length of the unsent text in chars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// `true` once part of this entry has been sent.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.phase != Phase::Fresh
    }

    /// Append coalesced text, keeping the phase consistent with the new length.
    pub(crate) fn append(&mut self, text: &str, limits: &OutboxLimits) {
        self.text.push_str(text);
        self.settle_phase(limits);
    }

    /// Plan the next send for this entry.
    pub(crate) fn plan(&self, limits: &OutboxLimits) -> Fragment {
        let len = self.len();
        match self.phase {
            Phase::Fresh if len <= limits.whole_budget() => Fragment {
                kind: FragmentKind::Whole,
                payload: self.text.clone(),
                consumed: len,
            },
            Phase::Fresh => {
                let consumed = escape_safe_len(&self.text, limits.head_budget());
                let mut payload = String::with_capacity(self.text.len() + limits.close_fence.len());
                payload.push_str(char_prefix(&self.text, consumed));
                payload.push_str(&limits.close_fence);
                Fragment {
                    kind: FragmentKind::Head,
                    payload,
                    consumed,
                }
            },
            Phase::FinalFragment => Fragment {
                kind: FragmentKind::Tail,
                payload: format!("{}{}", limits.open_fence, self.text),
                consumed: len,
            },
            Phase::Continuing => {
                let consumed = escape_safe_len(&self.text, limits.middle_budget());
                Fragment {
                    kind: FragmentKind::Middle,
                    payload: format!(
                        "{}{}{}",
                        limits.open_fence,
                        char_prefix(&self.text, consumed),
                        limits.close_fence
                    ),
                    consumed,
                }
            },
        }
    }

    /// Drop the first `consumed` chars after a confirmed send.
    ///
    /// Text coalesced while the send was in flight sits behind the sent prefix
    /// and survives. Returns `true` when nothing is left.
    pub(crate) fn commit(
        &mut self,
        kind: FragmentKind,
        consumed: usize,
        limits: &OutboxLimits,
    ) -> bool {
        let cut = char_boundary(&self.text, consumed);
        self.text.drain(..cut);
        if self.text.is_empty() {
            return true;
        }
        if kind.finishes_entry() {
            // Whatever remains arrived after the snapshot and was never sent.
            self.phase = Phase::Fresh;
        } else {
            self.phase = Phase::Continuing;
            self.settle_phase(limits);
        }
        false
    }

    fn settle_phase(&mut self, limits: &OutboxLimits) {
        if self.phase == Phase::Fresh {
            return;
        }
        self.phase = if self.len() <= limits.tail_budget() {
            Phase::FinalFragment
        } else {
            Phase::Continuing
        };
    }
}

/// Byte offset of the `chars`-th char, or the end of `text`.
fn char_boundary(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(idx, _)| idx)
}

fn char_prefix(text: &str, chars: usize) -> &str {
    &text[..char_boundary(text, chars)]
}

/// Chars to cut at, at most `budget`, so the cut never separates a MarkdownV2
/// `\` from the char it escapes.
fn escape_safe_len(text: &str, budget: usize) -> usize {
    let trailing = char_prefix(text, budget)
        .chars()
        .rev()
        .take_while(|c| *c == '\\')
        .count();
    if trailing % 2 == 1 && budget > 1 {
        budget - 1
    } else {
        budget
    }
}
