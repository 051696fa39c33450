//! The KBITv1 on-disk shard format.
//!
//! A shard file is a 64-byte little-endian header followed by a payload:
//! either a dense LSB-first bit array (`flags = 1`, written by the offline
//! generator) or a portable 64-bit roaring bitmap (`flags = 2`, the usual
//! sharded form). The header records the key universe size, the number of
//! set bits, the k the file was built for, the generator seed, and the
//! payload length; the final 8 bytes are reserved and zero.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringTreemap;

use crate::error::{KbitError, Result, ShardIoKind};

/// `"KBITv1\0"` padded with its NUL terminator to 8 bytes.
pub const KBIT_MAGIC: [u8; 8] = *b"KBITv1\0\0";

pub const FLAG_DENSE: u64 = 1;
pub const FLAG_PORTABLE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KbitHeader {
    pub total_bits: u64,
    pub ones: u64,
    pub k: u64,
    pub seed: u64,
    pub flags: u64,
    pub payload_len: u64,
}

impl KbitHeader {
    pub fn read_from<R: Read>(input: &mut R) -> std::result::Result<Self, ShardIoKind> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if magic != KBIT_MAGIC {
            return Err(ShardIoKind::BadMagic);
        }
        let header = KbitHeader {
            total_bits: input.read_u64::<LittleEndian>()?,
            ones: input.read_u64::<LittleEndian>()?,
            k: input.read_u64::<LittleEndian>()?,
            seed: input.read_u64::<LittleEndian>()?,
            flags: input.read_u64::<LittleEndian>()?,
            payload_len: input.read_u64::<LittleEndian>()?,
        };
        let mut reserved = [0u8; 8];
        input.read_exact(&mut reserved)?;
        Ok(header)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&KBIT_MAGIC)?;
        out.write_u64::<LittleEndian>(self.total_bits)?;
        out.write_u64::<LittleEndian>(self.ones)?;
        out.write_u64::<LittleEndian>(self.k)?;
        out.write_u64::<LittleEndian>(self.seed)?;
        out.write_u64::<LittleEndian>(self.flags)?;
        out.write_u64::<LittleEndian>(self.payload_len)?;
        out.write_all(&[0u8; 8])
    }
}

/// An in-memory key set loaded from one shard file.
#[derive(Debug, Clone)]
pub enum ShardBitmap {
    /// Bit `i` of the universe lives at byte `i >> 3`, bit `i & 7`.
    Dense { total_bits: u64, bytes: Vec<u8> },
    Portable(RoaringTreemap),
}

impl ShardBitmap {
    /// Membership probe for an absolute key value.
    pub fn contains(&self, key: u64) -> bool {
        match self {
            ShardBitmap::Dense { total_bits, bytes } => {
                key < *total_bits && (bytes[(key >> 3) as usize] >> (key & 7)) & 1 == 1
            }
            ShardBitmap::Portable(map) => map.contains(key),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            ShardBitmap::Dense { bytes, .. } => {
                bytes.iter().map(|b| b.count_ones() as u64).sum()
            }
            ShardBitmap::Portable(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads one shard file, rejecting anything that is not well-formed
/// KBITv1 with a distinct error per failure mode.
pub fn load_shard(path: &Path) -> Result<(KbitHeader, ShardBitmap)> {
    let file = File::open(path).map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))?;
    let mut input = BufReader::new(file);

    let header =
        KbitHeader::read_from(&mut input).map_err(|kind| KbitError::shard_io(path, kind))?;

    let payload = read_payload(&mut input, header.payload_len)
        .map_err(|kind| KbitError::shard_io(path, kind))?;

    let bitmap = match header.flags {
        FLAG_DENSE => {
            let want = header.total_bits.div_ceil(8);
            if header.payload_len != want {
                return Err(KbitError::shard_io(
                    path,
                    ShardIoKind::Truncated {
                        got: header.payload_len,
                        want,
                    },
                ));
            }
            ShardBitmap::Dense {
                total_bits: header.total_bits,
                bytes: payload,
            }
        }
        FLAG_PORTABLE => {
            let map = RoaringTreemap::deserialize_from(&payload[..])
                .map_err(|_| KbitError::DecodeFail {
                    path: path.to_path_buf(),
                })?;
            ShardBitmap::Portable(map)
        }
        other => {
            return Err(KbitError::shard_io(path, ShardIoKind::UnsupportedFlags(other)));
        }
    };

    Ok((header, bitmap))
}

fn read_payload<R: Read>(input: &mut R, want: u64) -> std::result::Result<Vec<u8>, ShardIoKind> {
    let mut payload = Vec::with_capacity(want as usize);
    let got = input.take(want).read_to_end(&mut payload)? as u64;
    if got != want {
        return Err(ShardIoKind::Truncated { got, want });
    }
    Ok(payload)
}

/// Writes a portable (`flags = 2`) shard holding `set`. The inverse of
/// [`load_shard`] for the compressed form; used by offline tooling and the
/// test suite.
pub fn write_portable(path: &Path, k: u64, seed: u64, set: &RoaringTreemap) -> Result<()> {
    let mut payload = Vec::new();
    set.serialize_into(&mut payload)
        .map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))?;

    let header = KbitHeader {
        total_bits: universe_bits(k),
        ones: set.len(),
        k,
        seed,
        flags: FLAG_PORTABLE,
        payload_len: payload.len() as u64,
    };

    let file = File::create(path).map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))?;
    let mut out = BufWriter::new(file);
    header
        .write_to(&mut out)
        .and_then(|_| out.write_all(&payload))
        .and_then(|_| out.flush())
        .map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))
}

/// Writes a dense (`flags = 1`) bitmap containing exactly `keys`. Only
/// sensible for small k; the streaming generator in the CLI handles the
/// full-universe case.
pub fn write_dense(path: &Path, k: u64, seed: u64, keys: &[u64]) -> Result<()> {
    let total_bits = universe_bits(k);
    let mut bytes = vec![0u8; total_bits.div_ceil(8) as usize];
    let mut ones = 0u64;
    for &key in keys {
        debug_assert!(key < total_bits);
        let byte = &mut bytes[(key >> 3) as usize];
        let mask = 1u8 << (key & 7);
        if *byte & mask == 0 {
            *byte |= mask;
            ones += 1;
        }
    }

    let header = KbitHeader {
        total_bits,
        ones,
        k,
        seed,
        flags: FLAG_DENSE,
        payload_len: bytes.len() as u64,
    };

    let file = File::create(path).map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))?;
    let mut out = BufWriter::new(file);
    header
        .write_to(&mut out)
        .and_then(|_| out.write_all(&bytes))
        .and_then(|_| out.flush())
        .map_err(|e| KbitError::shard_io(path, ShardIoKind::Open(e)))
}

/// `4^k` as a bit count.
pub fn universe_bits(k: u64) -> u64 {
    1u64 << (2 * k)
}
