//! The windowed multi-shard streaming scan.
//!
//! `window` lanes each scan one shard; lane buffers are refilled in
//! parallel, then drained round-robin `burst` keys at a time, so one page
//! interleaves keys from many shards instead of draining one shard at a
//! time. Shards are visited in a seed-determined permutation order, and
//! the whole engine state round-trips through a [`WindowCursor`] so a
//! page boundary can fall anywhere, including mid-expansion.
//!
//! Parallelism only touches refills; emission is single-threaded, so the
//! output is a function of `(seed, window, burst, filters, limit)` alone.

mod lane;

use std::time::Instant;

use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};

use crate::cursor::{LaneCursor, WindowCursor};
use crate::error::{KbitError, Result};
use crate::filter::LeafFilter;
use crate::kbit::load_shard;
use crate::perm::{build_perm, identity_perm};
use crate::shard_index::{GcHistogram, ShardIndex, MAX_K};

use lane::{Checkpoint, Lane, RefillParams};

/// Everything the streaming query needs beyond the shard directory.
/// Validation of the k-compatibility rules happens in
/// [`StreamEngine::new`], so the fields are plain values.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Output k; None means "same as the index k".
    pub construct_k: Option<u64>,
    pub gc_min_pct: u32,
    pub gc_max_pct: u32,
    pub substring: Option<String>,
    pub reverse_complement: bool,
    pub limit: u64,
    pub threads: usize,
    pub window: u16,
    pub burst: u16,
    pub refill_chunk: u32,
    pub random_access: bool,
    /// Permutation seed when `random_access` is set; ignored (and taken
    /// from the cursor) on resume.
    pub ra_seed: u64,
    pub cursor: Option<String>,
}

impl Default for StreamParams {
    fn default() -> Self {
        StreamParams {
            construct_k: None,
            gc_min_pct: 0,
            gc_max_pct: 100,
            substring: None,
            reverse_complement: false,
            limit: 200,
            threads: 4,
            window: 16,
            burst: 1,
            refill_chunk: 256,
            random_access: false,
            ra_seed: 0,
            cursor: None,
        }
    }
}

/// One page of results.
#[derive(Debug)]
pub struct StreamPage {
    pub keys: Vec<u64>,
    pub kout: u64,
    pub has_more: bool,
    /// Serialized resume cursor; None when the stream is finished.
    pub cursor: Option<String>,
    pub shards_loaded: u64,
    pub scan_seconds: f64,
}

pub struct StreamEngine {
    index: ShardIndex,
    filter: LeafFilter,
    k0: u64,
    kout: u64,
    limit: u64,
    window: u16,
    burst: u16,
    refill_chunk: u32,
    random_access: bool,
    seed: u64,
    perm: Vec<u32>,
    next_perm_pos: u32,
    slots: Vec<Option<Lane>>,
    pool: rayon::ThreadPool,
    shards_loaded: u64,
}

impl StreamEngine {
    /// Builds a fresh engine, or restores one from the cursor carried in
    /// `params`. The GC histogram is required by the on-disk layout and
    /// validated against the index even though the scan itself does not
    /// consult it.
    pub fn new(index: ShardIndex, gc_hist: &GcHistogram, params: StreamParams) -> Result<Self> {
        gc_hist.check_k(index.k)?;

        let k0 = index.k;
        let kout = params.construct_k.unwrap_or(k0);
        check_k_rules(k0, kout)?;

        if params.limit < 1 {
            return Err(KbitError::BadInput("limit must be >= 1".to_string()));
        }
        if params.window < 1 || params.burst < 1 {
            return Err(KbitError::BadInput(
                "window and burst must be >= 1".to_string(),
            ));
        }
        if params.refill_chunk < 1 {
            return Err(KbitError::BadInput("refill_chunk must be >= 1".to_string()));
        }

        let filter = LeafFilter::new(
            kout as usize,
            params.gc_min_pct,
            params.gc_max_pct,
            params.substring.as_deref(),
            params.reverse_complement,
        )?;

        let num_shards = index.num_shards() as u32;
        let threads = params.threads.max(1).min(params.window as usize);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| KbitError::BadInput(format!("cannot build thread pool: {}", e)))?;

        let restored = match &params.cursor {
            Some(token) => {
                let cursor = WindowCursor::decode(token)?;
                cursor.check_request(
                    num_shards,
                    k0,
                    kout,
                    params.window,
                    params.burst,
                    params.random_access,
                )?;
                Some(cursor)
            }
            None => None,
        };

        let seed = if params.random_access {
            let s = restored.as_ref().map(|c| c.seed).unwrap_or(params.ra_seed);
            if s == 0 {
                1
            } else {
                s
            }
        } else {
            0
        };
        let perm = if params.random_access {
            build_perm(num_shards, seed)
        } else {
            identity_perm(num_shards)
        };
        let next_perm_pos = restored.as_ref().map(|c| c.next_perm_pos).unwrap_or(0);

        let mut engine = StreamEngine {
            index,
            filter,
            k0,
            kout,
            limit: params.limit,
            window: params.window,
            burst: params.burst,
            refill_chunk: params.refill_chunk,
            random_access: params.random_access,
            seed,
            perm,
            next_perm_pos,
            slots: Vec::new(),
            pool,
            shards_loaded: 0,
        };

        match restored {
            Some(cursor) => {
                for state in &cursor.lanes {
                    let lane = match state {
                        None => None,
                        Some(lc) => Some(engine.reopen_lane(lc)?),
                    };
                    engine.slots.push(lane);
                }
            }
            None => engine.slots.resize_with(params.window as usize, || None),
        }

        // Pull shards from the permutation head into any idle slot.
        for i in 0..engine.slots.len() {
            if engine.slots[i].is_none() {
                engine.slots[i] = engine.next_lane()?;
            }
        }

        Ok(engine)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn open_lane(&mut self, perm_pos: u32, at: Checkpoint) -> Result<Lane> {
        let shard_id = self.perm[perm_pos as usize] as usize;
        let meta = &self.index.shards[shard_id];
        let (start, end) = (meta.start, meta.end);
        let path = self.index.shard_path(shard_id);
        let (_, bitmap) = load_shard(&path)?;
        self.shards_loaded += 1;
        log::debug!(
            "lane perm_pos {} -> shard {} [{}, {})",
            perm_pos,
            shard_id,
            start,
            end
        );
        Ok(Lane::resume(perm_pos, start, end, bitmap, at))
    }

    fn reopen_lane(&mut self, lc: &LaneCursor) -> Result<Lane> {
        self.open_lane(lc.perm_pos, Checkpoint::from_snapshot(lc.state))
    }

    /// The next shard from the permutation head, if any remain.
    fn next_lane(&mut self) -> Result<Option<Lane>> {
        if self.next_perm_pos >= self.perm.len() as u32 {
            return Ok(None);
        }
        let perm_pos = self.next_perm_pos;
        self.next_perm_pos += 1;
        Ok(Some(self.open_lane(perm_pos, Checkpoint::Fresh)?))
    }

    /// Runs one page: collects up to `limit + 1` surviving keys, truncates
    /// to `limit`, and serializes a resume cursor when anything remains.
    pub fn run(mut self) -> Result<StreamPage> {
        let started = Instant::now();
        let need = self.limit.saturating_add(1) as usize;
        let mut out: Vec<u64> = Vec::with_capacity(need.min(1 << 20));

        let refill = RefillParams {
            k0: self.k0 as u32,
            kout: self.kout as u32,
            target: self.refill_chunk as usize,
        };

        while out.len() < need {
            let any_active = self.slots.iter().flatten().any(Lane::is_active);
            let any_buffered = self.slots.iter().flatten().any(Lane::has_buffered);
            if !any_active && !any_buffered {
                break;
            }

            // Parallel refill of drained lanes; each worker owns a
            // distinct slot, emission below stays single-threaded.
            let filter = &self.filter;
            let slots = &mut self.slots;
            self.pool.install(|| {
                slots.par_iter_mut().for_each(|slot| {
                    if let Some(lane) = slot {
                        if lane.needs_refill() {
                            lane.refill(filter, &refill);
                        }
                    }
                });
            });

            // Slots whose shard is exhausted and drained move on to the
            // next shard in permutation order.
            for i in 0..self.slots.len() {
                let retire = match &self.slots[i] {
                    Some(lane) => !lane.is_active() && !lane.has_buffered(),
                    None => true,
                };
                if retire {
                    let replacement = self.next_lane()?;
                    self.slots[i] = replacement;
                }
            }

            // Round-robin drain, at most `burst` keys per lane per round.
            let mut emitted_any = false;
            for slot in self.slots.iter_mut() {
                if out.len() >= need {
                    break;
                }
                let Some(lane) = slot else { continue };
                let mut took = 0;
                while took < self.burst && out.len() < need {
                    match lane.pop() {
                        Some(v) => {
                            out.push(v);
                            took += 1;
                            emitted_any = true;
                        }
                        None => break,
                    }
                }
            }

            if !emitted_any && !self.slots.iter().flatten().any(Lane::is_active) {
                break;
            }
        }

        let mut has_more = false;
        if out.len() > self.limit as usize {
            out.truncate(self.limit as usize);
            has_more = true;
        } else {
            for lane in self.slots.iter().flatten() {
                if lane.has_buffered() || (self.kout > self.k0 && lane.is_active()) {
                    has_more = true;
                    break;
                }
            }
            if !has_more && self.next_perm_pos < self.perm.len() as u32 {
                has_more = true;
            }
        }

        let cursor = has_more.then(|| self.make_cursor().encode());

        Ok(StreamPage {
            keys: out,
            kout: self.kout,
            has_more,
            cursor,
            shards_loaded: self.shards_loaded,
            scan_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn make_cursor(&self) -> WindowCursor {
        let expanding = self.kout > self.k0;
        let lanes = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .filter(|lane| lane.is_active() || lane.has_buffered())
                    .map(|lane| LaneCursor {
                        perm_pos: lane.perm_pos,
                        state: lane.cursor_state().to_snapshot(expanding),
                    })
            })
            .collect();

        WindowCursor {
            random_access: self.random_access,
            k0: self.k0 as u8,
            kout: self.kout as u8,
            d: (self.kout - self.k0) as u8,
            num_shards: self.index.num_shards() as u32,
            seed: self.seed,
            next_perm_pos: self.next_perm_pos,
            window: self.window,
            burst: self.burst,
            lanes,
        }
    }
}

/// The k-compatibility rules: expansion exists only on top of 18-mer
/// shards, and the 16/17 databases only answer `kout == k0`.
fn check_k_rules(k0: u64, kout: u64) -> Result<()> {
    if kout > MAX_K {
        return Err(KbitError::BadInput(format!(
            "construct_k {} not representable in a 64-bit key",
            kout
        )));
    }
    if kout < k0 {
        return Err(KbitError::BadInput(format!(
            "construct_k {} is smaller than the database k {}",
            kout, k0
        )));
    }
    if kout > 18 && k0 != 18 {
        return Err(KbitError::ConfigConflict(format!(
            "construct_k > 18 requires an 18-mer database, got k={}",
            k0
        )));
    }
    if k0 < 18 && kout != k0 {
        return Err(KbitError::ConfigConflict(format!(
            "expansion is disabled for k={} databases, use construct_k={}",
            k0, k0
        )));
    }
    Ok(())
}
