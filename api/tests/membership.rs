//! Ground-truth membership scenarios over real shard directories.

use std::path::Path;

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use roaring::RoaringTreemap;

use kbit::membership::{query_sharded, query_single};
use kbit::{decode_kmer, encode_kmer, universe_bits, write_portable, ShardIndex};

/// Writes an index.json plus one portable shard file per equal-width
/// range, holding the subset of `present` keys that each range owns.
fn build_shard_dir(dir: &Path, k: u64, num_shards: u64, present: &[u64]) -> ShardIndex {
    let total = universe_bits(k);
    let width = total.div_ceil(num_shards);

    let mut shards_json = Vec::new();
    for i in 0..num_shards {
        let start = i * width;
        let end = total.min(start + width);
        let file = format!("shard_{:04}.kbit", i);

        let mut set = RoaringTreemap::new();
        for &v in present.iter().filter(|&&v| v >= start && v < end) {
            set.insert(v);
        }
        write_portable(&dir.join(&file), k, 0, &set).unwrap();

        shards_json.push(serde_json::json!({
            "file": file,
            "start": start,
            "end": end,
        }));
    }

    let index_json = serde_json::json!({
        "num_shards": num_shards,
        "k": k,
        "total_bits": total,
        "shards": shards_json,
    });
    std::fs::write(
        dir.join("index.json"),
        serde_json::to_string_pretty(&index_json).unwrap(),
    )
    .unwrap();

    ShardIndex::load(dir).unwrap()
}

#[test]
fn single_barcode_database() {
    let dir = tempfile::tempdir().unwrap();
    let barcode = encode_kmer(b"CGCGCCAAAATTTTGGGG", 18).unwrap();
    let index = build_shard_dir(dir.path(), 18, 4, &[barcode]);

    let queries = vec![
        "CGCGCCAAAATTTTGGGG".to_string(),
        "AAAAAAAAAAAAAAAAAA".to_string(),
    ];
    let hits = query_sharded(&index, &queries, 2).unwrap();
    assert_eq!(hits, vec![true, false]);
}

#[test]
fn random_database_matches_ground_truth_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(4242);
    let total = universe_bits(18);

    let present: Vec<u64> = (0..500).map(|_| rng.next_u64() % total).collect();
    let index = build_shard_dir(dir.path(), 18, 8, &present);

    // Interleave in-set and out-of-set queries.
    let mut queries = Vec::new();
    let mut expected = Vec::new();
    for i in 0..400 {
        let v = if i % 2 == 0 {
            present[i % present.len()]
        } else {
            // Out-of-set with overwhelming probability; skip collisions.
            let mut v = rng.next_u64() % total;
            while present.contains(&v) {
                v = rng.next_u64() % total;
            }
            v
        };
        queries.push(decode_kmer(v, 18));
        expected.push(present.contains(&v));
    }

    for threads in [1, 4, 16] {
        let hits = query_sharded(&index, &queries, threads).unwrap();
        assert_eq!(hits, expected, "threads={}", threads);
    }
}

#[test]
fn mixed_length_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let index = build_shard_dir(dir.path(), 18, 2, &[]);
    let queries = vec!["CGCGCCAAAATTTTGGGG".to_string(), "ACGT".to_string()];
    assert!(matches!(
        query_sharded(&index, &queries, 1),
        Err(kbit::KbitError::BadInput(_))
    ));
}

#[test]
fn legacy_single_file_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.kbit");
    let barcode = encode_kmer(b"CGCGCCAAAATTTTGGGG", 18).unwrap();
    let mut set = RoaringTreemap::new();
    set.insert(barcode);
    write_portable(&path, 18, 0, &set).unwrap();

    let queries = vec![
        "CGCGCCAAAATTTTGGGG".to_string(),
        "TTTTTTTTTTTTTTTTTT".to_string(),
    ];
    assert_eq!(
        query_single(&path, None, &queries).unwrap(),
        vec![true, false]
    );
    // Header k wins over a contradictory --k.
    assert!(query_single(&path, Some(16), &queries).is_err());
}
