//! The BCW2 resumable window cursor.
//!
//! The cursor is the only persisted state in the system: a little-endian
//! byte layout wrapped in unpadded base64url, handed to untrusted clients
//! and replayed verbatim. The byte layout is frozen; changing it breaks
//! every cursor in the wild.
//!
//! Layout:
//!
//! ```text
//! 'B' 'C' 'W' '2'
//! flags:u8                  bit 0 = random_access
//! k0:u8 kout:u8 d:u8
//! num_shards:u32
//! seed:u64                  0 when not random_access
//! next_perm_pos:u32
//! window:u16 burst:u16
//! lane_count:u16            == window
//! per lane:
//!   active:u8
//!   if active:
//!     perm_pos:u32
//!     mode:u8               0 = plain scan, 1 = expand
//!     mode 0: after:u64                 (u64::MAX = not started)
//!     mode 1: parent:u64                (u64::MAX = not started)
//!             child_present:u8
//!             if child_present: l:u8 left:u64 right:u64
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{KbitError, Result};
use crate::expand::ExpandState;

pub const CURSOR_MAGIC: [u8; 4] = *b"BCW2";

/// Sentinel for "this lane has not produced anything from its shard yet".
pub const NOT_STARTED: u64 = u64::MAX;

const FLAG_RANDOM_ACCESS: u8 = 0x01;

/// Where a lane stands inside its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneSnapshot {
    /// `kout == k0`: the scan resumes at `after + 1`.
    Scan { after: u64 },
    /// `kout > k0`: mid-expansion when `child` is set, otherwise the next
    /// anchor probed is `parent + 1`.
    Expand {
        parent: u64,
        child: Option<ExpandState>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneCursor {
    pub perm_pos: u32,
    pub state: LaneSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCursor {
    pub random_access: bool,
    pub k0: u8,
    pub kout: u8,
    pub d: u8,
    pub num_shards: u32,
    pub seed: u64,
    pub next_perm_pos: u32,
    pub window: u16,
    pub burst: u16,
    /// One entry per lane slot; None marks an inactive lane.
    pub lanes: Vec<Option<LaneCursor>>,
}

impl WindowCursor {
    pub fn encode(&self) -> String {
        let mut b = Vec::with_capacity(32 + self.lanes.len() * 32);
        b.extend_from_slice(&CURSOR_MAGIC);
        b.push(if self.random_access { FLAG_RANDOM_ACCESS } else { 0 });
        b.push(self.k0);
        b.push(self.kout);
        b.push(self.d);
        b.extend_from_slice(&self.num_shards.to_le_bytes());
        b.extend_from_slice(&self.seed.to_le_bytes());
        b.extend_from_slice(&self.next_perm_pos.to_le_bytes());
        b.extend_from_slice(&self.window.to_le_bytes());
        b.extend_from_slice(&self.burst.to_le_bytes());
        b.extend_from_slice(&(self.lanes.len() as u16).to_le_bytes());

        for lane in &self.lanes {
            match lane {
                None => b.push(0),
                Some(lc) => {
                    b.push(1);
                    b.extend_from_slice(&lc.perm_pos.to_le_bytes());
                    match lc.state {
                        LaneSnapshot::Scan { after } => {
                            b.push(0);
                            b.extend_from_slice(&after.to_le_bytes());
                        }
                        LaneSnapshot::Expand { parent, child } => {
                            b.push(1);
                            b.extend_from_slice(&parent.to_le_bytes());
                            match child {
                                None => b.push(0),
                                Some(st) => {
                                    b.push(1);
                                    b.push(st.l);
                                    b.extend_from_slice(&st.left.to_le_bytes());
                                    b.extend_from_slice(&st.right.to_le_bytes());
                                }
                            }
                        }
                    }
                }
            }
        }
        URL_SAFE_NO_PAD.encode(b)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| KbitError::BadCursor("not base64url"))?;
        let mut r = ByteReader::new(&bytes);

        if r.take::<4>()? != CURSOR_MAGIC {
            return Err(KbitError::BadCursor("bad magic"));
        }
        let flags = r.u8()?;
        let k0 = r.u8()?;
        let kout = r.u8()?;
        let d = r.u8()?;
        let num_shards = r.u32()?;
        let seed = r.u64()?;
        let next_perm_pos = r.u32()?;
        let window = r.u16()?;
        let burst = r.u16()?;
        let lane_count = r.u16()?;

        let mut lanes = Vec::with_capacity(lane_count as usize);
        for _ in 0..lane_count {
            if r.u8()? == 0 {
                lanes.push(None);
                continue;
            }
            let perm_pos = r.u32()?;
            let state = match r.u8()? {
                0 => LaneSnapshot::Scan { after: r.u64()? },
                1 => {
                    let parent = r.u64()?;
                    let child = if r.u8()? != 0 {
                        Some(ExpandState {
                            l: r.u8()?,
                            left: r.u64()?,
                            right: r.u64()?,
                        })
                    } else {
                        None
                    };
                    LaneSnapshot::Expand { parent, child }
                }
                _ => return Err(KbitError::BadCursor("unknown lane mode")),
            };
            lanes.push(Some(LaneCursor { perm_pos, state }));
        }

        Ok(WindowCursor {
            random_access: flags & FLAG_RANDOM_ACCESS != 0,
            k0,
            kout,
            d,
            num_shards,
            seed,
            next_perm_pos,
            window,
            burst,
            lanes,
        })
    }

    /// A replayed cursor must match the request it resumes; any drift in
    /// the sharding or windowing parameters makes its state meaningless.
    pub fn check_request(
        &self,
        num_shards: u32,
        k0: u64,
        kout: u64,
        window: u16,
        burst: u16,
        random_access: bool,
    ) -> Result<()> {
        if self.num_shards != num_shards {
            return Err(KbitError::BadCursor("num_shards mismatch"));
        }
        if self.k0 as u64 != k0 || self.kout as u64 != kout {
            return Err(KbitError::BadCursor("k mismatch"));
        }
        if self.window != window {
            return Err(KbitError::BadCursor("window mismatch"));
        }
        if self.burst != burst {
            return Err(KbitError::BadCursor("burst mismatch"));
        }
        if self.random_access != random_access {
            return Err(KbitError::BadCursor("random_access mismatch"));
        }
        if self.lanes.len() != window as usize {
            return Err(KbitError::BadCursor("lane count mismatch"));
        }
        for lane in self.lanes.iter().flatten() {
            if lane.perm_pos >= num_shards {
                return Err(KbitError::BadCursor("lane perm_pos out of range"));
            }
            let expand = matches!(lane.state, LaneSnapshot::Expand { .. });
            if expand != (kout > k0) {
                return Err(KbitError::BadCursor("lane mode does not match k"));
            }
        }
        Ok(())
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(KbitError::BadCursor("truncated"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cursor() -> WindowCursor {
        WindowCursor {
            random_access: true,
            k0: 18,
            kout: 20,
            d: 2,
            num_shards: 64,
            seed: 12345,
            next_perm_pos: 7,
            window: 4,
            burst: 1,
            lanes: vec![
                Some(LaneCursor {
                    perm_pos: 3,
                    state: LaneSnapshot::Expand {
                        parent: 42,
                        child: Some(ExpandState {
                            l: 1,
                            left: 2,
                            right: 3,
                        }),
                    },
                }),
                None,
                Some(LaneCursor {
                    perm_pos: 5,
                    state: LaneSnapshot::Expand {
                        parent: NOT_STARTED,
                        child: None,
                    },
                }),
                Some(LaneCursor {
                    perm_pos: 6,
                    state: LaneSnapshot::Expand {
                        parent: 99,
                        child: None,
                    },
                }),
            ],
        }
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let c = sample_cursor();
        let token = c.encode();
        assert_eq!(WindowCursor::decode(&token).unwrap(), c);

        let mut plain = sample_cursor();
        plain.random_access = false;
        plain.kout = 18;
        plain.d = 0;
        plain.seed = 0;
        plain.lanes = vec![
            Some(LaneCursor {
                perm_pos: 0,
                state: LaneSnapshot::Scan { after: 1234 },
            }),
            Some(LaneCursor {
                perm_pos: 1,
                state: LaneSnapshot::Scan { after: NOT_STARTED },
            }),
            None,
            None,
        ];
        let token = plain.encode();
        assert_eq!(WindowCursor::decode(&token).unwrap(), plain);
    }

    #[test]
    fn token_is_base64url_without_padding() {
        let token = sample_cursor().encode();
        assert!(token
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }

    #[test]
    fn bad_magic_and_truncation_rejected() {
        assert!(matches!(
            WindowCursor::decode("????"),
            Err(KbitError::BadCursor(_))
        ));
        assert!(matches!(
            WindowCursor::decode(&URL_SAFE_NO_PAD.encode(b"XXXX")),
            Err(KbitError::BadCursor(_))
        ));
        let token = sample_cursor().encode();
        let truncated = &token[..token.len() / 2];
        assert!(matches!(
            WindowCursor::decode(truncated),
            Err(KbitError::BadCursor(_))
        ));
    }

    #[test]
    fn check_request_flags_every_mismatch() {
        let c = sample_cursor();
        assert!(c.check_request(64, 18, 20, 4, 1, true).is_ok());
        assert!(c.check_request(63, 18, 20, 4, 1, true).is_err());
        assert!(c.check_request(64, 18, 18, 4, 1, true).is_err());
        assert!(c.check_request(64, 18, 20, 16, 1, true).is_err());
        assert!(c.check_request(64, 18, 20, 4, 2, true).is_err());
        assert!(c.check_request(64, 18, 20, 4, 1, false).is_err());
    }

    #[test]
    fn scan_mode_lane_rejected_for_expanding_query() {
        let mut c = sample_cursor();
        c.lanes[1] = Some(LaneCursor {
            perm_pos: 1,
            state: LaneSnapshot::Scan { after: 5 },
        });
        let reencoded = WindowCursor::decode(&c.encode()).unwrap();
        assert!(reencoded.check_request(64, 18, 20, 4, 1, true).is_err());
    }

    #[test]
    fn byte_layout_is_frozen() {
        // Header bytes of a minimal cursor, decoded from base64url.
        let c = WindowCursor {
            random_access: false,
            k0: 18,
            kout: 18,
            d: 0,
            num_shards: 2,
            seed: 0,
            next_perm_pos: 1,
            window: 1,
            burst: 1,
            lanes: vec![Some(LaneCursor {
                perm_pos: 0,
                state: LaneSnapshot::Scan { after: 0x0102 },
            })],
        };
        let bytes = URL_SAFE_NO_PAD.decode(c.encode()).unwrap();
        let expect: &[u8] = &[
            b'B', b'C', b'W', b'2', // magic
            0,    // flags
            18, 18, 0, // k0, kout, d
            2, 0, 0, 0, // num_shards
            0, 0, 0, 0, 0, 0, 0, 0, // seed
            1, 0, 0, 0, // next_perm_pos
            1, 0, // window
            1, 0, // burst
            1, 0, // lane_count
            1, // lane 0 active
            0, 0, 0, 0, // perm_pos
            0, // mode 0
            0x02, 0x01, 0, 0, 0, 0, 0, 0, // after
        ];
        assert_eq!(bytes, expect);
    }
}
