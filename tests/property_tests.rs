//! Random-position fuzzing: the search must stay inside its value bounds
//! and behave deterministically on one thread, whatever the position.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use vanta::position::Position;
use vanta::search::history::HistoryTables;
use vanta::search::syzygy::SyzygyTb;
use vanta::search::time::TimeManager;
use vanta::search::tt::TranspositionTable;
use vanta::search::{Limits, NodeType, RootMove, SharedSearch, Worker};
use vanta::types::*;

fn fresh_worker(hash_mb: usize) -> Worker {
    let limits = Limits::default();
    let time = TimeManager::unmanaged(&limits);
    Worker::new(
        0,
        Arc::new(TranspositionTable::new(hash_mb)),
        Arc::new(SyzygyTb::empty()),
        Arc::new(SharedSearch::new(1)),
        HistoryTables::new(),
        limits,
        time,
    )
}

/// One full-window root search with a fresh worker and table.
fn search_value(pos: &mut Position, depth: Depth) -> Value {
    let mut worker = fresh_worker(8);
    worker.root_moves = pos.legal_moves().into_iter().map(RootMove::new).collect();
    if worker.root_moves.is_empty() {
        return if pos.in_check() { mated_in(0) } else { VALUE_DRAW };
    }
    worker.pv_idx = 0;
    worker.pv_last = worker.root_moves.len();
    worker.root_depth = depth;
    worker.search(
        pos,
        NodeType::Root,
        0,
        -VALUE_INFINITE,
        VALUE_INFINITE,
        depth,
        false,
    )
}

/// Random playout from the start position; length is capped, terminal
/// positions end it early.
fn random_position(rng: &mut StdRng) -> Position {
    let mut pos = Position::startpos();
    let plies = rng.gen_range(0..60);
    for _ in 0..plies {
        let moves = pos.legal_moves();
        if moves.is_empty() || pos.is_draw(0) {
            break;
        }
        let mv = moves[rng.gen_range(0..moves.len())];
        pos.play_game_move(mv).unwrap();
    }
    pos
}

#[test]
fn search_values_stay_inside_the_infinite_bounds() {
    let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);
    for i in 0..80 {
        let mut pos = random_position(&mut rng);
        let depth = rng.gen_range(1..=4);
        let v = search_value(&mut pos, depth);
        assert!(
            v > -VALUE_INFINITE && v < VALUE_INFINITE,
            "case {}: value {} out of bounds at depth {}",
            i,
            v,
            depth
        );
    }
}

#[test]
fn single_threaded_search_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(0xD1CE_0001);
    for _ in 0..25 {
        let pos = random_position(&mut rng);
        let depth = rng.gen_range(2..=4);
        let v1 = search_value(&mut pos.clone(), depth);
        let v2 = search_value(&mut pos.clone(), depth);
        assert_eq!(v1, v2, "same input, same thread count, different score");
    }
}

#[test]
fn narrow_windows_never_escape_the_bounds() {
    let mut rng = StdRng::seed_from_u64(0xBEEF_0002);
    for _ in 0..40 {
        let mut pos = random_position(&mut rng);
        if pos.legal_moves().is_empty() {
            continue;
        }
        let depth = rng.gen_range(1..=3);
        let alpha: Value = rng.gen_range(-400..=300);
        let beta = alpha + rng.gen_range(1..=200);

        let mut worker = fresh_worker(8);
        worker.root_moves = pos.legal_moves().into_iter().map(RootMove::new).collect();
        worker.pv_idx = 0;
        worker.pv_last = worker.root_moves.len();
        worker.root_depth = depth;
        let v = worker.search(&mut pos, NodeType::Root, 0, alpha, beta, depth, false);
        assert!(v > -VALUE_INFINITE && v < VALUE_INFINITE);
    }
}

#[test]
fn deeper_iterations_complete_one_by_one() {
    // Iterative deepening through the driver: completed depth must track
    // the requested depth when nothing interrupts the search.
    use std::sync::mpsc;
    use std::time::Duration;
    use vanta::search::lazy_smp::SearchPool;

    let mut pool = SearchPool::new(8);
    pool.options.threads = 1;
    let (tx, rx) = mpsc::channel();
    pool.start_search(
        Position::startpos(),
        Limits {
            depth: Some(6),
            ..Limits::default()
        },
        tx,
    );

    let mut seen_depths = Vec::new();
    loop {
        let line = rx.recv_timeout(Duration::from_secs(120)).unwrap();
        if line.starts_with("bestmove") {
            break;
        }
        if let Some(rest) = line.strip_prefix("info depth ") {
            if let Some(d) = rest.split_whitespace().next().and_then(|d| d.parse::<i32>().ok())
            {
                if line.contains(" pv ") {
                    seen_depths.push(d);
                }
            }
        }
    }
    pool.wait();

    assert!(!seen_depths.is_empty());
    // Depths are reported in nondecreasing order and reach the limit.
    for w in seen_depths.windows(2) {
        assert!(w[1] >= w[0], "depth regressed: {:?}", seen_depths);
    }
    assert_eq!(*seen_depths.last().unwrap(), 6);
}
