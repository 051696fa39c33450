//! The shard directory index and the GC histogram sidecar.
//!
//! `index.json` describes how the key universe `[0, 4^k)` is partitioned
//! into shard files. Shards are contiguous half-open ranges sorted by
//! start; the partition is invariant across releases for a given k, so a
//! key can always be routed by binary search on `start`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KbitError, Result};
use crate::kbit::universe_bits;

pub const MAX_K: u64 = 32;

#[derive(Debug, Clone)]
pub struct ShardMeta {
    pub file: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct ShardIndex {
    dir: PathBuf,
    pub k: u64,
    pub total_bits: u64,
    pub shards: Vec<ShardMeta>,
}

#[derive(Deserialize)]
struct RawIndex {
    num_shards: usize,
    k: u64,
    total_bits: Option<u64>,
    #[serde(default)]
    shards: Vec<RawShard>,
}

#[derive(Deserialize)]
struct RawShard {
    file: Option<String>,
    start: Option<u64>,
    end: Option<u64>,
}

impl ShardIndex {
    /// Reads `<dir>/index.json` and normalizes it: absent shard entries
    /// fall back to the `shard_NNNN.kbit` naming convention, absent
    /// ranges to equal widths. The result always partitions the universe.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("index.json");
        let file = File::open(&path).map_err(|e| {
            KbitError::BadIndex(format!("cannot open {}: {}", path.display(), e))
        })?;
        let raw: RawIndex = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| KbitError::BadIndex(format!("cannot parse {}: {}", path.display(), e)))?;

        if raw.k == 0 || raw.k > MAX_K {
            return Err(KbitError::BadIndex(format!("invalid k in index: {}", raw.k)));
        }
        if raw.num_shards == 0 {
            return Err(KbitError::BadIndex("num_shards is zero".to_string()));
        }
        let total_bits = raw.total_bits.unwrap_or_else(|| universe_bits(raw.k));

        let mut shards = Vec::with_capacity(raw.num_shards);
        let explicit = raw.shards.len() == raw.num_shards;
        let ranged = explicit
            && raw
                .shards
                .iter()
                .all(|s| s.start.is_some() && s.end.is_some());
        let width = total_bits.div_ceil(raw.num_shards as u64);

        for i in 0..raw.num_shards {
            let file = if explicit {
                raw.shards[i]
                    .file
                    .clone()
                    .unwrap_or_else(|| default_shard_name(i))
            } else {
                default_shard_name(i)
            };
            let (start, end) = if ranged {
                (raw.shards[i].start.unwrap(), raw.shards[i].end.unwrap())
            } else {
                let start = i as u64 * width;
                (start, total_bits.min(start + width))
            };
            shards.push(ShardMeta { file, start, end });
        }

        let index = ShardIndex {
            dir: dir.to_path_buf(),
            k: raw.k,
            total_bits,
            shards,
        };
        index.check_coverage()?;
        Ok(index)
    }

    fn check_coverage(&self) -> Result<()> {
        let mut expect = 0u64;
        for (i, s) in self.shards.iter().enumerate() {
            if s.start != expect || s.end <= s.start {
                return Err(KbitError::BadIndex(format!(
                    "shards do not cover the universe: shard {} spans [{}, {})",
                    i, s.start, s.end
                )));
            }
            expect = s.end;
        }
        if expect != self.total_bits {
            return Err(KbitError::BadIndex(format!(
                "shards cover [0, {}) but the universe has {} keys",
                expect, self.total_bits
            )));
        }
        Ok(())
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The unique shard with `start <= key < end`, or None for a key
    /// outside the universe.
    pub fn find_shard(&self, key: u64) -> Option<usize> {
        let mut lo = 0;
        let mut hi = self.shards.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let s = &self.shards[mid];
            if key < s.start {
                hi = mid;
            } else if key >= s.end {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    pub fn shard_path(&self, shard_id: usize) -> PathBuf {
        self.dir.join(&self.shards[shard_id].file)
    }
}

fn default_shard_name(i: usize) -> String {
    format!("shard_{:04}.kbit", i)
}

/// Per-shard GC bucket counts, `k + 1` buckets per shard. Only used as a
/// diagnostic today: skipping shards by GC band is sound solely for
/// `kout == k0`, and even then the scan does not rely on it.
#[derive(Debug, Clone)]
pub struct GcHistogram {
    pub k: u64,
    pub hists: Vec<Vec<u64>>,
}

#[derive(Deserialize)]
struct RawGcHistogram {
    k: u64,
    num_shards: Option<usize>,
    hists: Vec<RawGcEntry>,
}

#[derive(Deserialize)]
struct RawGcEntry {
    shard: usize,
    gc_hist: Vec<u64>,
}

impl GcHistogram {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            KbitError::BadIndex(format!("cannot open {}: {}", path.display(), e))
        })?;
        let raw: RawGcHistogram = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| KbitError::BadIndex(format!("cannot parse {}: {}", path.display(), e)))?;

        if raw.k == 0 || raw.k > MAX_K {
            return Err(KbitError::BadIndex(format!(
                "invalid k in GC histogram: {}",
                raw.k
            )));
        }

        let num_shards = raw.num_shards.unwrap_or(raw.hists.len());
        let mut hists = vec![vec![0u64; raw.k as usize + 1]; num_shards];
        for entry in raw.hists {
            if entry.gc_hist.len() != raw.k as usize + 1 {
                return Err(KbitError::BadIndex(format!(
                    "GC histogram for shard {} has {} buckets, expected {}",
                    entry.shard,
                    entry.gc_hist.len(),
                    raw.k + 1
                )));
            }
            if entry.shard >= hists.len() {
                hists.resize(entry.shard + 1, vec![0u64; raw.k as usize + 1]);
            }
            hists[entry.shard] = entry.gc_hist;
        }

        Ok(GcHistogram { k: raw.k, hists })
    }

    /// Hard check used by the stream engine: the histogram must describe
    /// the same k as the shard index.
    pub fn check_k(&self, index_k: u64) -> Result<()> {
        if self.k != index_k {
            return Err(KbitError::BadIndex(format!(
                "GC histogram k ({}) != index k ({})",
                self.k, index_k
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_index(dir: &Path, body: &str) {
        let mut f = File::create(dir.join("index.json")).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn explicit_ranges_are_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            r#"{
                "num_shards": 2,
                "k": 4,
                "total_bits": 256,
                "shards": [
                    {"file": "a.kbit", "start": 0, "end": 100},
                    {"file": "b.kbit", "start": 100, "end": 256}
                ]
            }"#,
        );
        let idx = ShardIndex::load(dir.path()).unwrap();
        assert_eq!(idx.k, 4);
        assert_eq!(idx.num_shards(), 2);
        assert_eq!(idx.find_shard(0), Some(0));
        assert_eq!(idx.find_shard(99), Some(0));
        assert_eq!(idx.find_shard(100), Some(1));
        assert_eq!(idx.find_shard(255), Some(1));
        assert_eq!(idx.find_shard(256), None);
        assert!(idx.shard_path(1).ends_with("b.kbit"));
    }

    #[test]
    fn missing_entries_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), r#"{"num_shards": 4, "k": 4}"#);
        let idx = ShardIndex::load(dir.path()).unwrap();
        assert_eq!(idx.num_shards(), 4);
        assert_eq!(idx.shards[0].file, "shard_0000.kbit");
        assert_eq!(idx.shards[0].start, 0);
        assert_eq!(idx.shards[3].end, 256);
        // Equal widths
        assert_eq!(idx.shards[1].start, 64);
    }

    #[test]
    fn gaps_in_coverage_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            r#"{
                "num_shards": 2,
                "k": 4,
                "shards": [
                    {"file": "a.kbit", "start": 0, "end": 100},
                    {"file": "b.kbit", "start": 128, "end": 256}
                ]
            }"#,
        );
        assert!(matches!(
            ShardIndex::load(dir.path()),
            Err(KbitError::BadIndex(_))
        ));
    }

    #[test]
    fn missing_index_is_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShardIndex::load(dir.path()),
            Err(KbitError::BadIndex(_))
        ));
    }

    #[test]
    fn gc_histogram_round_trip_and_k_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.json");
        std::fs::write(
            &path,
            r#"{
                "k": 4,
                "num_shards": 2,
                "hists": [
                    {"shard": 0, "gc_hist": [1, 2, 3, 4, 5]},
                    {"shard": 1, "gc_hist": [5, 4, 3, 2, 1]}
                ]
            }"#,
        )
        .unwrap();
        let hist = GcHistogram::load(&path).unwrap();
        assert_eq!(hist.hists[1][0], 5);
        assert!(hist.check_k(4).is_ok());
        assert!(matches!(hist.check_k(18), Err(KbitError::BadIndex(_))));
    }

    #[test]
    fn gc_histogram_bucket_count_must_match_k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.json");
        std::fs::write(
            &path,
            r#"{"k": 4, "hists": [{"shard": 0, "gc_hist": [1, 2]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            GcHistogram::load(&path),
            Err(KbitError::BadIndex(_))
        ));
    }
}
