//! Lock-free transposition table.
//!
//! A contiguous array of two-entry clusters. Each entry is two atomic words:
//!
//! ```text
//! word0: key16 | move16 | value16 | eval16
//! word1: depth8 | gen_bound8   (gen 5 bits, pv 1 bit, bound 2 bits)
//! ```
//!
//! Entries are read and written with relaxed atomics and no locks. A torn
//! word pair can at worst mix the age/depth byte of a neighboring write; the
//! key fragment guards against using another position's move, and the bound
//! and depth are validated before any cutoff, so a race only wastes a little
//! work.

use chess::{ChessMove, Piece, Square};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::types::{
    Bound, Depth, Value, DEPTH_NONE, DEPTH_OFFSET, VALUE_MATED_IN_MAX_PLY, VALUE_MATE,
    VALUE_MATE_IN_MAX_PLY, VALUE_NONE, VALUE_TB, VALUE_TB_LOSS_IN_MAX_PLY,
    VALUE_TB_WIN_IN_MAX_PLY,
};

pub const CLUSTER_SIZE: usize = 2;

const GENERATION_BITS: u32 = 3;
const GENERATION_DELTA: u8 = 1 << GENERATION_BITS;
const GENERATION_CYCLE: u16 = 255 + GENERATION_DELTA as u16;
const GENERATION_MASK: u16 = (0xFF << GENERATION_BITS) & 0xFF;

/// Decoded view of a table entry.
#[derive(Clone, Copy, Debug)]
pub struct TTData {
    pub mv: Option<ChessMove>,
    pub value: Value,
    pub eval: Value,
    pub depth: Depth,
    pub is_pv: bool,
    pub bound: Bound,
}

#[derive(Default)]
struct Entry {
    word0: AtomicU64,
    word1: AtomicU64,
}

struct Cluster {
    entry: [Entry; CLUSTER_SIZE],
}

pub struct TranspositionTable {
    table: Vec<Cluster>,
    generation: AtomicU8,
}

fn encode_move(mv: Option<ChessMove>) -> u16 {
    let Some(m) = mv else { return 0 };
    let promo = match m.get_promotion() {
        Some(Piece::Knight) => 1u16,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        _ => 0,
    };
    let from = m.get_source().to_index() as u16;
    let to = m.get_dest().to_index() as u16;
    // from == to never encodes a real move, so 0 doubles as "none".
    (promo << 12) | (to << 6) | from
}

fn decode_move(bits: u16) -> Option<ChessMove> {
    if bits == 0 {
        return None;
    }
    let from = unsafe {
        // SAFETY: bits & 0x3F is always 0-63, valid for Square
        Square::new((bits & 0x3F) as u8)
    };
    let to = unsafe {
        // SAFETY: (bits >> 6) & 0x3F is always 0-63, valid for Square
        Square::new(((bits >> 6) & 0x3F) as u8)
    };
    let promo = match (bits >> 12) & 0x7 {
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        _ => None,
    };
    Some(ChessMove::new(from, to, promo))
}

#[inline]
fn pack_depth(d: Depth) -> u8 {
    debug_assert!(d >= DEPTH_OFFSET);
    (d - DEPTH_OFFSET) as u8
}

#[inline]
fn unpack_depth(d8: u8) -> Depth {
    d8 as Depth + DEPTH_OFFSET
}

impl Entry {
    fn load(&self) -> (u64, u64) {
        (
            self.word0.load(Ordering::Relaxed),
            self.word1.load(Ordering::Relaxed),
        )
    }

    fn decode(word0: u64, word1: u64) -> TTData {
        TTData {
            mv: decode_move(((word0 >> 16) & 0xFFFF) as u16),
            value: ((word0 >> 32) & 0xFFFF) as u16 as i16 as Value,
            eval: ((word0 >> 48) & 0xFFFF) as u16 as i16 as Value,
            depth: unpack_depth((word1 & 0xFF) as u8),
            is_pv: (word1 >> 8) & 0x4 != 0,
            bound: Bound::from_u8(((word1 >> 8) & 0x3) as u8),
        }
    }

    #[inline]
    fn gen8(word1: u64) -> u8 {
        ((word1 >> 8) & GENERATION_MASK as u64) as u8
    }

    /// Age of an entry relative to the current generation, in generations.
    /// The cycle offset keeps the subtraction positive across wraparound.
    #[inline]
    fn relative_age(word1: u64, generation: u8) -> i32 {
        ((GENERATION_CYCLE + generation as u16 - Self::gen8(word1) as u16) & GENERATION_MASK)
            as i32
            / GENERATION_DELTA as i32
    }
}

impl TranspositionTable {
    pub fn new(mb: usize) -> TranspositionTable {
        let mut tt = TranspositionTable {
            table: Vec::new(),
            generation: AtomicU8::new(0),
        };
        tt.resize(mb);
        tt
    }

    /// Free and reallocate. Must not be called while a search is running.
    pub fn resize(&mut self, mb: usize) {
        let bytes = mb.max(1) * 1024 * 1024;
        let count = bytes / std::mem::size_of::<Cluster>();
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            table.push(Cluster {
                entry: [Entry::default(), Entry::default()],
            });
        }
        self.table = table;
        self.generation.store(0, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        for cluster in &self.table {
            for e in &cluster.entry {
                e.word0.store(0, Ordering::Relaxed);
                e.word1.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Bump the generation for a new root search. The lower three bits of
    /// the byte hold the pv flag and bound, so the delta is 8.
    pub fn new_search(&self) {
        self.generation
            .fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    #[inline]
    fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed) & GENERATION_MASK as u8
    }

    /// Map a key onto a cluster without modulo bias: (key * count) >> 64.
    #[inline]
    fn cluster_index(&self, key: u64) -> usize {
        ((key as u128 * self.table.len() as u128) >> 64) as usize
    }

    /// Find the entry for `key`, or the replacement victim if absent.
    /// Returns a slot handle to pass back to `save`, plus the decoded entry
    /// when the key matched.
    pub fn probe(&self, key: u64) -> (TTSlot, Option<TTData>) {
        let ci = self.cluster_index(key);
        let key16 = key as u16;
        let cluster = &self.table[ci];
        let gen = self.generation();

        let mut victim = 0usize;
        let mut victim_score = Depth::MAX;
        for (i, e) in cluster.entry.iter().enumerate() {
            let (w0, w1) = e.load();
            if (w0 & 0xFFFF) as u16 == key16 && w1 != 0 {
                return (
                    TTSlot { cluster: ci, entry: i },
                    Some(Entry::decode(w0, w1)),
                );
            }
            // Replacement: smallest depth after the age penalty loses.
            let score = unpack_depth((w1 & 0xFF) as u8) - Entry::relative_age(w1, gen) * 2;
            if score < victim_score {
                victim_score = score;
                victim = i;
            }
        }
        (TTSlot { cluster: ci, entry: victim }, None)
    }

    /// Store an entry. Keeps the slot's move when the caller has none and the
    /// key matches; refuses to replace deeper same-key data unless the new
    /// bound is exact.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        slot: TTSlot,
        key: u64,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Option<ChessMove>,
        eval: Value,
    ) {
        debug_assert!(depth >= DEPTH_NONE);
        let e = &self.table[slot.cluster].entry[slot.entry];
        let key16 = key as u16;
        let (w0, w1) = e.load();
        let same_key = (w0 & 0xFFFF) as u16 == key16 && w1 != 0;

        let move16 = if mv.is_none() && same_key {
            ((w0 >> 16) & 0xFFFF) as u16
        } else {
            encode_move(mv)
        };

        let gen = self.generation();
        if bound != Bound::Exact
            && same_key
            && depth + 2 * is_pv as Depth + 4
                <= unpack_depth((w1 & 0xFF) as u8) - Entry::relative_age(w1, gen) * 2
        {
            // The stored data is still more useful than what we have.
            return;
        }

        let word0 = key16 as u64
            | (move16 as u64) << 16
            | ((value as i16 as u16) as u64) << 32
            | ((eval as i16 as u16) as u64) << 48;
        let gen_bound = gen | (is_pv as u8) << 2 | bound as u8;
        let word1 = pack_depth(depth) as u64 | (gen_bound as u64) << 8;

        e.word0.store(word0, Ordering::Relaxed);
        e.word1.store(word1, Ordering::Relaxed);
    }

    /// Approximate fill rate in permille: first thousand clusters, first
    /// entry each, counted when stamped with the current generation.
    pub fn hashfull(&self) -> u32 {
        let gen = self.generation();
        let sample = self.table.len().min(1000);
        let mut filled = 0;
        for cluster in &self.table[..sample] {
            let w1 = cluster.entry[0].word1.load(Ordering::Relaxed);
            if Entry::gen8(w1) == gen && (w1 >> 8) & 0x3 != 0 {
                filled += 1;
            }
        }
        (filled * 1000 / sample.max(1)) as u32
    }
}

/// Opaque handle naming the entry a probe resolved to.
#[derive(Clone, Copy, Debug)]
pub struct TTSlot {
    cluster: usize,
    entry: usize,
}

/// Adjust mate and TB scores from "plies from the root" to "plies from this
/// node" before storing.
pub fn value_to_tt(v: Value, ply: usize) -> Value {
    debug_assert!(v != VALUE_NONE);
    if v >= VALUE_TB_WIN_IN_MAX_PLY {
        v + ply as Value
    } else if v <= VALUE_TB_LOSS_IN_MAX_PLY {
        v - ply as Value
    } else {
        v
    }
}

/// Inverse of `value_to_tt`. Mate and TB scores that the fifty-move counter
/// could invalidate are downgraded to the edge of the TB range.
pub fn value_from_tt(v: Value, ply: usize, rule50: u32) -> Value {
    if v == VALUE_NONE {
        return VALUE_NONE;
    }
    let r50 = rule50.min(100) as Value;
    if v >= VALUE_TB_WIN_IN_MAX_PLY {
        if v >= VALUE_MATE_IN_MAX_PLY && VALUE_MATE - v > 100 - r50 {
            return VALUE_TB_WIN_IN_MAX_PLY - 1;
        }
        if VALUE_TB - v > 100 - r50 {
            return VALUE_TB_WIN_IN_MAX_PLY - 1;
        }
        return v - ply as Value;
    }
    if v <= VALUE_TB_LOSS_IN_MAX_PLY {
        if v <= VALUE_MATED_IN_MAX_PLY && VALUE_MATE + v > 100 - r50 {
            return VALUE_TB_LOSS_IN_MAX_PLY + 1;
        }
        if VALUE_TB + v > 100 - r50 {
            return VALUE_TB_LOSS_IN_MAX_PLY + 1;
        }
        return v + ply as Value;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mate_in;

    #[test]
    fn move_codec_round_trip() {
        let mv = ChessMove::new(chess::Square::E2, chess::Square::E4, None);
        assert_eq!(decode_move(encode_move(Some(mv))), Some(mv));
        let promo = ChessMove::new(chess::Square::A7, chess::Square::A8, Some(Piece::Queen));
        assert_eq!(decode_move(encode_move(Some(promo))), Some(promo));
        assert_eq!(decode_move(encode_move(None)), None);
    }

    #[test]
    fn mate_scores_pack_relative_to_node() {
        let v = mate_in(7);
        let stored = value_to_tt(v, 3);
        assert_eq!(stored, VALUE_MATE - 4);
        assert_eq!(value_from_tt(stored, 3, 0), v);
    }

    #[test]
    fn stale_mate_scores_downgrade_near_fifty_moves() {
        let stored = value_to_tt(mate_in(5), 0);
        let v = value_from_tt(stored, 0, 97);
        assert_eq!(v, VALUE_TB_WIN_IN_MAX_PLY - 1);
    }
}
