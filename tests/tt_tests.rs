use chess::{ChessMove, Square};
use vanta::search::tt::{value_from_tt, value_to_tt, TranspositionTable};
use vanta::types::*;

#[test]
fn test_tt_store_probe_round_trip() {
    let tt = TranspositionTable::new(1);
    let key = 0xdeadbeef_12345678u64;
    let mv = ChessMove::new(Square::E2, Square::E4, None);

    let (slot, found) = tt.probe(key);
    assert!(found.is_none());
    tt.save(slot, key, 42, true, Bound::Exact, 5, Some(mv), 50);

    let (_, entry) = tt.probe(key);
    let entry = entry.expect("entry should be found");
    assert_eq!(entry.value, 42);
    assert_eq!(entry.eval, 50);
    assert_eq!(entry.depth, 5);
    assert_eq!(entry.mv, Some(mv));
    assert_eq!(entry.bound, Bound::Exact);
    assert!(entry.is_pv);
}

#[test]
fn test_tt_static_eval_round_trip() {
    let tt = TranspositionTable::new(1);

    for &eval in &[0, 100, -100, 500, -500, 32002, -31000] {
        let key = 0x12345678u64
            .wrapping_add(eval as u64)
            .wrapping_mul(0x9E3779B97F4A7C15);
        let (slot, _) = tt.probe(key);
        tt.save(slot, key, 42, false, Bound::Exact, 10, None, eval);
        let (_, entry) = tt.probe(key);
        let entry = entry.expect("entry should be found");
        assert_eq!(entry.eval, eval, "static eval mismatch for {}", eval);
        assert_eq!(entry.value, 42, "score corrupted for eval={}", eval);
        assert_eq!(entry.depth, 10, "depth corrupted for eval={}", eval);
    }
}

#[test]
fn test_tt_clear() {
    let tt = TranspositionTable::new(1);
    let key = 0xabcu64;
    let (slot, _) = tt.probe(key);
    tt.save(slot, key, 10, false, Bound::Lower, 2, None, 15);
    assert!(tt.probe(key).1.is_some());
    tt.clear();
    assert!(tt.probe(key).1.is_none());
}

#[test]
fn test_tt_all_bounds_survive() {
    let tt = TranspositionTable::new(1);
    for (i, &bound) in [Bound::Exact, Bound::Lower, Bound::Upper].iter().enumerate() {
        let key = 0xfeed0000u64 + ((i as u64) << 32);
        let (slot, _) = tt.probe(key);
        tt.save(slot, key, -200, false, bound, 5, None, -150);
        let (_, entry) = tt.probe(key);
        let entry = entry.expect("should be found");
        assert_eq!(entry.bound, bound);
        assert_eq!(entry.value, -200);
        assert_eq!(entry.eval, -150);
    }
}

#[test]
fn test_tt_keeps_move_when_caller_has_none() {
    let tt = TranspositionTable::new(1);
    let key = 0x5555_6666_7777u64;
    let mv = ChessMove::new(Square::G1, Square::F3, None);

    let (slot, _) = tt.probe(key);
    tt.save(slot, key, 10, false, Bound::Lower, 4, Some(mv), 0);
    // A later save without a move must not wipe the stored one.
    let (slot, _) = tt.probe(key);
    tt.save(slot, key, 20, false, Bound::Exact, 6, None, 0);

    let (_, entry) = tt.probe(key);
    assert_eq!(entry.expect("entry").mv, Some(mv));
}

#[test]
fn test_tt_shallow_write_does_not_evict_deep_entry() {
    let tt = TranspositionTable::new(1);
    let key = 0x1234_9999_0001u64;

    let (slot, _) = tt.probe(key);
    tt.save(slot, key, 77, false, Bound::Lower, 20, None, 0);
    // A much shallower non-exact result of the same generation loses.
    let (slot, _) = tt.probe(key);
    tt.save(slot, key, -5, false, Bound::Upper, 1, None, 0);

    let (_, entry) = tt.probe(key);
    let entry = entry.expect("entry");
    assert_eq!(entry.depth, 20);
    assert_eq!(entry.value, 77);
}

#[test]
fn test_tt_generation_ages_entries_out() {
    let tt = TranspositionTable::new(1);
    let key = 0xaaaa_bbbb_ccccu64;

    let (slot, _) = tt.probe(key);
    tt.save(slot, key, 77, false, Bound::Lower, 20, None, 0);
    // Several searches later the same shallow write goes through.
    for _ in 0..8 {
        tt.new_search();
    }
    let (slot, _) = tt.probe(key);
    tt.save(slot, key, -5, false, Bound::Upper, 1, None, 0);

    let (_, entry) = tt.probe(key);
    assert_eq!(entry.expect("entry").depth, 1);
}

#[test]
fn test_mate_score_round_trip() {
    // Plies-from-root scores convert to plies-from-node and back exactly.
    for ply in [0usize, 3, 10, 40] {
        for v in [mate_in(ply + 2), mated_in(ply + 2), 120, -4000, 0] {
            let stored = value_to_tt(v, ply);
            assert_eq!(value_from_tt(stored, ply, 0), v, "v={} ply={}", v, ply);
        }
    }
}

#[test]
fn test_hashfull_reflects_usage() {
    let tt = TranspositionTable::new(1);
    tt.new_search();
    assert_eq!(tt.hashfull(), 0);
    for i in 0..200_000u64 {
        let key = i.wrapping_mul(0x9E3779B97F4A7C15);
        let (slot, _) = tt.probe(key);
        tt.save(slot, key, 1, false, Bound::Lower, 3, None, 0);
    }
    assert!(tt.hashfull() > 0);
    assert!(tt.hashfull() <= 1000);
}
