//! # Utterance Queue
//!
//! Ordered buffer of agent replies waiting to be spoken. The queue only keeps
//! bookkeeping; the orchestrator drives synthesis and reports back.
//!
//! ## Invariants:
//! - At most one utterance is `speaking`. It lives in its own slot, so two
//!   speaking utterances cannot be represented at all.
//! - `sequence` is strictly increasing in enqueue order and pending items are
//!   drained oldest first (strict FIFO, no priority).
//! - An utterance that reached `spoken` or `aborted` leaves the queue and is
//!   only kept, unchanged, in the bounded `recent` log.

use crate::session::model::{Utterance, UtteranceStatus};
use std::collections::VecDeque;

/// How many finished utterances are kept for snapshots.
const RECENT_CAPACITY: usize = 32;

/// What `interrupt` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptOutcome {
    pub aborted: Option<Utterance>,
    pub discarded: usize,
}

#[derive(Debug)]
pub struct UtteranceQueue {
    next_sequence: u64,
    speaking: Option<Utterance>,
    pending: VecDeque<Utterance>,
    recent: VecDeque<Utterance>,
}

impl Default for UtteranceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceQueue {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            speaking: None,
            pending: VecDeque::new(),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
        }
    }

    /// Append a pending utterance. Returns its sequence number.
    pub fn enqueue(&mut self, text: impl Into<String>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.push_back(Utterance {
            sequence,
            text: text.into(),
            status: UtteranceStatus::Pending,
        });
        sequence
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.is_some()
    }

    pub fn speaking(&self) -> Option<&Utterance> {
        self.speaking.as_ref()
    }

    /// Promote the oldest pending utterance to `speaking`.
    ///
    /// Returns `None` when something is already speaking or nothing is pending.
    pub fn begin_next(&mut self) -> Option<Utterance> {
        if self.speaking.is_some() {
            return None;
        }
        let mut next = self.pending.pop_front()?;
        next.status = UtteranceStatus::Speaking;
        self.speaking = Some(next.clone());
        Some(next)
    }

    /// Mark the speaking utterance `spoken`, if it is `sequence`.
    pub fn complete(&mut self, sequence: u64) -> Option<Utterance> {
        self.finish(sequence, UtteranceStatus::Spoken)
    }

    /// Mark the speaking utterance `aborted` after a synthesis failure.
    pub fn fail(&mut self, sequence: u64) -> Option<Utterance> {
        self.finish(sequence, UtteranceStatus::Aborted)
    }

    fn finish(&mut self, sequence: u64, status: UtteranceStatus) -> Option<Utterance> {
        if self.speaking.as_ref().map(|u| u.sequence) != Some(sequence) {
            return None;
        }
        let mut done = self.speaking.take()?;
        done.status = status;
        self.remember(done.clone());
        Some(done)
    }

    /// Abort the speaking utterance and drop everything pending.
    pub fn interrupt(&mut self) -> InterruptOutcome {
        let aborted = self.speaking.take().map(|mut u| {
            u.status = UtteranceStatus::Aborted;
            self.remember(u.clone());
            u
        });
        let discarded = self.pending.len();
        self.pending.clear();
        InterruptOutcome { aborted, discarded }
    }

    /// Take the speaking utterance off the speaker because the transport went away.
    ///
    /// With `replay` it goes back to the head of the queue as `pending`, full
    /// text intact, so it is spoken again from the start. Without it the
    /// utterance is aborted and playback continues with the next pending item.
    pub fn suspend_speaking(&mut self, replay: bool) -> Option<Utterance> {
        let mut current = self.speaking.take()?;
        if replay {
            current.status = UtteranceStatus::Pending;
            self.pending.push_front(current.clone());
        } else {
            current.status = UtteranceStatus::Aborted;
            self.remember(current.clone());
        }
        Some(current)
    }

    /// Drop all queued content, recent log included. Sequence numbering continues.
    pub fn clear(&mut self) {
        self.speaking = None;
        self.pending.clear();
        self.recent.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queued utterances, the speaking one included.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.speaking.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> impl Iterator<Item = &Utterance> {
        self.pending.iter()
    }

    pub fn recent(&self) -> impl Iterator<Item = &Utterance> {
        self.recent.iter()
    }

    fn remember(&mut self, utterance: Utterance) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(utterance);
    }
}
