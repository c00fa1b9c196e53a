//! Observability events and the bounded queue used in degraded mode.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kilnwatch_traits::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunOpened,
    RampStarted,
    StableReached,
    StageEnded,
    Fault,
    Degraded,
    Anomaly,
    ConfigApplied,
    RunClosed,
}

impl EventKind {
    /// Terminal events must survive queue overflow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::RunClosed)
    }
}

/// One observability record, as appended to the state sink and embedded in
/// the run record. Serializes the wall stamp as `t`; the monotonic stamp
/// rides along for duration math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmEvent {
    #[serde(rename = "t")]
    pub t_wall: DateTime<Utc>,
    pub t_mono_ms: u64,
    pub kind: EventKind,
    pub zone: Option<Zone>,
    pub detail: String,
}

impl FsmEvent {
    pub fn new(
        t_wall: DateTime<Utc>,
        t_mono_ms: u64,
        kind: EventKind,
        zone: Option<Zone>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            t_wall,
            t_mono_ms,
            kind,
            zone,
            detail: detail.into(),
        }
    }
}

/// Bounded FIFO of events awaiting a recovered sink. Overflow drops the
/// oldest non-terminal entry; terminal entries are never dropped.
#[derive(Debug)]
pub struct EventQueue {
    cap: usize,
    buf: VecDeque<FsmEvent>,
    dropped: u64,
}

impl EventQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buf: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: FsmEvent) {
        if self.buf.len() == self.cap {
            let victim = self.buf.iter().position(|e| !e.kind.is_terminal());
            match victim {
                Some(i) => {
                    self.buf.remove(i);
                    self.dropped += 1;
                }
                None => {
                    // every buffered event is terminal; drop the newcomer
                    // unless it is terminal too, in which case grow past cap
                    if !event.kind.is_terminal() {
                        self.dropped += 1;
                        return;
                    }
                }
            }
        }
        self.buf.push_back(event);
    }

    pub fn pop(&mut self) -> Option<FsmEvent> {
        self.buf.pop_front()
    }

    /// Put a popped event back at the head after a failed flush. Bypasses
    /// the overflow policy so ordering is preserved.
    pub fn requeue_front(&mut self, event: FsmEvent) {
        self.buf.push_front(event);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Events discarded by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
