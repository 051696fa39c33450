//! One scanning lane: a shard bitmap plus the state needed to refill a
//! bounded buffer of surviving keys and to resume exactly where a page
//! left off.

use crate::cursor::{LaneSnapshot, NOT_STARTED};
use crate::expand::ExpandState;
use crate::filter::LeafFilter;
use crate::kbit::ShardBitmap;

/// A resume point inside a shard. Every buffered key carries the
/// checkpoint that becomes the lane's resume point once that key is the
/// last one emitted, so a cursor taken mid-buffer never loses or repeats
/// a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Fresh,
    /// Plain scan: the next key examined is `after + 1`.
    Scan { after: u64 },
    /// Expansion: `child` is the next child of `parent` to produce; when
    /// None, the next anchor probed is `parent + 1`.
    Expand {
        parent: u64,
        child: Option<ExpandState>,
    },
}

impl Checkpoint {
    pub(crate) fn from_snapshot(s: LaneSnapshot) -> Checkpoint {
        match s {
            LaneSnapshot::Scan { after: NOT_STARTED } => Checkpoint::Fresh,
            LaneSnapshot::Scan { after } => Checkpoint::Scan { after },
            LaneSnapshot::Expand {
                parent: NOT_STARTED,
                ..
            } => Checkpoint::Fresh,
            LaneSnapshot::Expand { parent, child } => Checkpoint::Expand { parent, child },
        }
    }

    pub(crate) fn to_snapshot(self, expanding: bool) -> LaneSnapshot {
        match self {
            Checkpoint::Fresh => {
                if expanding {
                    LaneSnapshot::Expand {
                        parent: NOT_STARTED,
                        child: None,
                    }
                } else {
                    LaneSnapshot::Scan { after: NOT_STARTED }
                }
            }
            Checkpoint::Scan { after } => LaneSnapshot::Scan { after },
            Checkpoint::Expand { parent, child } => LaneSnapshot::Expand { parent, child },
        }
    }
}

/// Scan parameters shared by every lane of one query.
pub(crate) struct RefillParams {
    pub k0: u32,
    pub kout: u32,
    pub target: usize,
}

pub(crate) struct Lane {
    pub perm_pos: u32,
    start: u64,
    end: u64,
    /// Dropped as soon as the shard is exhausted, freeing the memory
    /// before a replacement shard is opened.
    bitmap: Option<ShardBitmap>,
    /// Where the next refill continues.
    refill_at: Checkpoint,
    /// Checkpoint of the last emitted key.
    emit_at: Checkpoint,
    buf: Vec<(u64, Checkpoint)>,
    buf_pos: usize,
}

impl Lane {
    pub fn resume(
        perm_pos: u32,
        start: u64,
        end: u64,
        bitmap: ShardBitmap,
        at: Checkpoint,
    ) -> Self {
        Lane {
            perm_pos,
            start,
            end,
            bitmap: Some(bitmap),
            refill_at: at,
            emit_at: at,
            buf: Vec::new(),
            buf_pos: 0,
        }
    }

    /// Active means the shard still has unscanned keys under the filters.
    pub fn is_active(&self) -> bool {
        self.bitmap.is_some()
    }

    pub fn has_buffered(&self) -> bool {
        self.buf_pos < self.buf.len()
    }

    pub fn needs_refill(&self) -> bool {
        self.is_active() && !self.has_buffered()
    }

    /// Pops one buffered key and records its resume checkpoint.
    pub fn pop(&mut self) -> Option<u64> {
        if !self.has_buffered() {
            return None;
        }
        let (value, at) = self.buf[self.buf_pos];
        self.buf_pos += 1;
        self.emit_at = at;
        if self.buf_pos == self.buf.len() {
            self.buf.clear();
            self.buf_pos = 0;
        }
        Some(value)
    }

    /// The state a cursor must carry for this lane: the last emitted key's
    /// checkpoint while the buffer still holds unemitted keys (they will
    /// be rediscovered on resume), otherwise the refill's own position,
    /// which strictly advances past every scanned key.
    pub fn cursor_state(&self) -> Checkpoint {
        if self.has_buffered() {
            self.emit_at
        } else {
            self.refill_at
        }
    }

    pub fn refill(&mut self, filter: &LeafFilter, params: &RefillParams) {
        if params.kout == params.k0 {
            self.refill_scan(filter, params.target);
        } else {
            self.refill_expand(filter, params);
        }
    }

    /// Mode 0: walk keys in `[start, end)` in increasing order, keep the
    /// absent ones that pass the leaf test.
    fn refill_scan(&mut self, filter: &LeafFilter, target: usize) {
        let Some(bitmap) = &self.bitmap else { return };

        let mut v = match self.refill_at {
            Checkpoint::Fresh => self.start,
            Checkpoint::Scan { after } => after.saturating_add(1),
            Checkpoint::Expand { .. } => unreachable!("expand state in a plain scan lane"),
        };

        while v < self.end && self.buf.len() < target {
            if !bitmap.contains(v) && filter.accepts(v) {
                self.buf.push((v, Checkpoint::Scan { after: v }));
            }
            v += 1;
        }

        self.refill_at = Checkpoint::Scan { after: v - 1 };
        if v >= self.end {
            self.bitmap = None;
        }
    }

    /// Mode 1: advance to the next absent anchor and stream its children,
    /// persisting the mid-anchor position whenever the buffer fills.
    fn refill_expand(&mut self, filter: &LeafFilter, params: &RefillParams) {
        let Some(bitmap) = &self.bitmap else { return };
        let d = params.kout - params.k0;

        'anchors: while self.buf.len() < params.target {
            let (candidate, resumed) = match self.refill_at {
                Checkpoint::Fresh => (self.start, None),
                Checkpoint::Expand {
                    parent,
                    child: Some(st),
                } => (parent, Some(st)),
                Checkpoint::Expand {
                    parent,
                    child: None,
                } => (parent + 1, None),
                Checkpoint::Scan { .. } => unreachable!("scan state in an expanding lane"),
            };

            let (parent, mut st) = match resumed {
                Some(st) => (candidate, st),
                None => {
                    let mut p = candidate;
                    while p < self.end && bitmap.contains(p) {
                        p += 1;
                    }
                    if p >= self.end {
                        self.bitmap = None;
                        break 'anchors;
                    }
                    (p, ExpandState::first(d))
                }
            };

            loop {
                if self.buf.len() >= params.target {
                    self.refill_at = Checkpoint::Expand {
                        parent,
                        child: Some(st),
                    };
                    break 'anchors;
                }
                let value = st.value(parent, params.k0, params.kout);
                let more = st.advance(d);
                if filter.accepts(value) {
                    let at = Checkpoint::Expand {
                        parent,
                        child: if more { Some(st) } else { None },
                    };
                    self.buf.push((value, at));
                }
                if !more {
                    self.refill_at = Checkpoint::Expand {
                        parent,
                        child: None,
                    };
                    break;
                }
            }
        }
    }
}
