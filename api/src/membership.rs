//! Batched membership lookup over a sharded database.
//!
//! Query keys are bucketed by owning shard, then each non-empty shard is
//! loaded exactly once and probed by a worker. Shards with no queries are
//! never opened, and the answers come back in input order regardless of
//! thread count.

use std::path::Path;

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::{KbitError, Result};
use crate::kbit::load_shard;
use crate::kmer::encode_kmer;
use crate::shard_index::ShardIndex;

/// One hit flag per input k-mer, in input order.
pub fn query_sharded(index: &ShardIndex, kmers: &[String], threads: usize) -> Result<Vec<bool>> {
    let k = index.k as usize;
    let mut values = Vec::with_capacity(kmers.len());
    for kmer in kmers {
        values.push(encode_kmer(kmer.as_bytes(), k)?);
    }

    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); index.num_shards()];
    for (i, &v) in values.iter().enumerate() {
        let shard = index.find_shard(v).ok_or_else(|| KbitError::OutOfRange {
            kmer: kmers[i].clone(),
        })?;
        buckets[shard].push(i);
    }

    let loaded: Vec<usize> = (0..buckets.len())
        .filter(|&s| !buckets[s].is_empty())
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1).min(loaded.len().max(1)))
        .build()
        .map_err(|e| KbitError::BadInput(format!("cannot build thread pool: {}", e)))?;

    let per_shard: Vec<Vec<(usize, bool)>> = pool.install(|| {
        loaded
            .into_par_iter()
            .map(|shard| -> Result<Vec<(usize, bool)>> {
                let (_, bitmap) = load_shard(&index.shard_path(shard))?;
                Ok(buckets[shard]
                    .iter()
                    .map(|&i| (i, bitmap.contains(values[i])))
                    .collect())
            })
            .collect::<Result<_>>()
    })?;

    let mut hits = vec![false; kmers.len()];
    for answers in per_shard {
        for (i, hit) in answers {
            hits[i] = hit;
        }
    }
    Ok(hits)
}

/// Legacy single-file mode: every key is probed against one bitmap whose
/// k comes from its own header.
pub fn query_single(bitmap_path: &Path, expect_k: Option<u64>, kmers: &[String]) -> Result<Vec<bool>> {
    let (header, bitmap) = load_shard(bitmap_path)?;
    check_query_k(header.k, expect_k)?;

    let k = header.k as usize;
    let mut hits = Vec::with_capacity(kmers.len());
    for kmer in kmers {
        hits.push(bitmap.contains(encode_kmer(kmer.as_bytes(), k)?));
    }
    Ok(hits)
}

/// Membership serves the fixed shard sets only; `expect_k` is the `--k`
/// the caller demanded, if any.
pub fn check_query_k(k: u64, expect_k: Option<u64>) -> Result<()> {
    if let Some(expect) = expect_k {
        if k != expect {
            return Err(KbitError::BadInput(format!(
                "database k={} does not match requested --k {}",
                k, expect
            )));
        }
    }
    if !(16..=18).contains(&k) {
        return Err(KbitError::BadInput(format!(
            "unsupported database k={} (expected 16, 17, or 18)",
            k
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_k_rules() {
        assert!(check_query_k(18, None).is_ok());
        assert!(check_query_k(17, Some(17)).is_ok());
        assert!(matches!(
            check_query_k(18, Some(16)),
            Err(KbitError::BadInput(_))
        ));
        assert!(matches!(
            check_query_k(8, None),
            Err(KbitError::BadInput(_))
        ));
    }
}
