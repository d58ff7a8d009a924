//! End-to-end search scenarios driven through the full pool, plus a few
//! direct quiescence checks.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use vanta::position::Position;
use vanta::search::history::HistoryTables;
use vanta::search::lazy_smp::SearchPool;
use vanta::search::syzygy::SyzygyTb;
use vanta::search::time::TimeManager;
use vanta::search::tt::TranspositionTable;
use vanta::search::{Limits, SharedSearch, Worker};
use vanta::types::*;

/// Run a search to a fixed depth and return (all info lines, bestmove line).
fn run_to_depth(fen: &str, depth: Depth, threads: usize) -> (Vec<String>, String) {
    let pos = Position::from_fen(fen).expect("valid fen");
    let mut pool = SearchPool::new(16);
    pool.options.threads = threads;
    let limits = Limits {
        depth: Some(depth),
        ..Limits::default()
    };
    let (tx, rx) = mpsc::channel();
    pool.start_search(pos, limits, tx);

    let mut info = Vec::new();
    loop {
        let line = rx
            .recv_timeout(Duration::from_secs(120))
            .expect("search should finish");
        if line.starts_with("bestmove") {
            pool.wait();
            return (info, line);
        }
        info.push(line);
    }
}

fn last_score_line(info: &[String]) -> &str {
    info.iter()
        .rev()
        .find(|l| l.contains(" score "))
        .map(|l| l.as_str())
        .unwrap_or("")
}

#[test]
fn fools_mate_is_found() {
    let (info, best) = run_to_depth(
        "rnbqkbnr/pppp1ppp/8/4p3/6P1/5P2/PPPPP2P/RNBQKBNR b KQkq - 0 2",
        5,
        1,
    );
    assert_eq!(best, "bestmove d8h4");
    assert!(
        last_score_line(&info).contains("mate 1"),
        "expected mate 1 in '{}'",
        last_score_line(&info)
    );
}

#[test]
fn back_rank_mate_is_found() {
    let (info, best) = run_to_depth("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1", 5, 1);
    assert_eq!(best, "bestmove a1a8");
    assert!(last_score_line(&info).contains("mate 1"));
}

#[test]
fn scholars_mate_attack_is_found() {
    let (info, best) = run_to_depth(
        "r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5Q2/PPPP1PPP/RNB1K1NR w KQkq - 4 4",
        6,
        1,
    );
    assert_eq!(best, "bestmove f3f7");
    // Mate in one; anything >= +300 cp satisfies the contract.
    let line = last_score_line(&info);
    assert!(
        line.contains("mate 1") || score_at_least(line, 300),
        "unexpected score line '{}'",
        line
    );
}

fn score_at_least(line: &str, cp: i32) -> bool {
    line.split(" cp ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse::<i32>().ok())
        .map(|v| v >= cp)
        .unwrap_or(false)
}

#[test]
fn stalemate_has_no_bestmove() {
    let (info, best) = run_to_depth("7k/8/6Q1/8/8/8/8/K7 b - - 0 1", 4, 1);
    assert_eq!(best, "bestmove (none)");
    assert!(last_score_line(&info).contains("cp 0"));
}

#[test]
fn shuffle_history_scores_as_draw() {
    use chess::{ChessMove, Square};
    let mut pos = Position::from_fen("8/8/8/8/3k4/8/3K4/8 w - - 0 1").unwrap();
    // Two full shuffles already played: one more pair repeats threefold.
    for (f, t) in [
        (Square::D2, Square::C2),
        (Square::D4, Square::C4),
        (Square::C2, Square::D2),
        (Square::C4, Square::D4),
        (Square::D2, Square::C2),
        (Square::D4, Square::C4),
    ] {
        pos.play_game_move(ChessMove::new(f, t, None)).unwrap();
    }

    let mut pool = SearchPool::new(16);
    pool.options.threads = 1;
    let limits = Limits {
        depth: Some(6),
        ..Limits::default()
    };
    let (tx, rx) = mpsc::channel();
    pool.start_search(pos, limits, tx);
    let mut last_info = String::new();
    let best;
    loop {
        let line = rx.recv_timeout(Duration::from_secs(120)).unwrap();
        if line.starts_with("bestmove") {
            best = line;
            break;
        }
        if line.contains(" score ") {
            last_info = line;
        }
    }
    pool.wait();
    assert!(best.starts_with("bestmove "));
    let cp: i32 = last_info
        .split(" cp ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .expect("cp score expected");
    assert!(cp.abs() <= 5, "draw expected, got {} cp", cp);
}

#[test]
fn stop_interrupts_an_infinite_search() {
    let pos = Position::startpos();
    let mut pool = SearchPool::new(16);
    pool.options.threads = 1;
    let limits = Limits {
        infinite: true,
        ..Limits::default()
    };
    let (tx, rx) = mpsc::channel();
    pool.start_search(pos, limits, tx);
    std::thread::sleep(Duration::from_millis(100));
    pool.stop();

    loop {
        let line = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("stop must produce a bestmove promptly");
        if line.starts_with("bestmove ") {
            break;
        }
    }
    pool.wait();
}

#[test]
fn two_threads_produce_a_legal_bestmove() {
    let (_, best) = run_to_depth(
        "r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
        6,
        2,
    );
    let pos = Position::from_fen("r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4")
        .unwrap();
    let mv = best.trim_start_matches("bestmove ").split(' ').next().unwrap().to_string();
    assert!(
        pos.legal_moves().iter().any(|m| m.to_string() == mv),
        "bestmove {} not legal",
        mv
    );
}

// ---- direct quiescence checks ----

fn fresh_worker() -> Worker {
    let limits = Limits::default();
    let time = TimeManager::unmanaged(&limits);
    Worker::new(
        0,
        Arc::new(TranspositionTable::new(8)),
        Arc::new(SyzygyTb::empty()),
        Arc::new(SharedSearch::new(1)),
        HistoryTables::new(),
        limits,
        time,
    )
}

#[test]
fn qsearch_on_quiet_position_is_static_eval() {
    let mut pos = Position::startpos();
    let mut worker = fresh_worker();
    let v = worker.qsearch(&mut pos, true, 0, -VALUE_INFINITE, VALUE_INFINITE, 0);
    let eval = vanta::search::eval::evaluate(pos.board(), 0);
    assert_eq!(v, eval);
}

#[test]
fn qsearch_sees_the_recapture_behind_a_pawn_grab() {
    // exd5 looks like it wins a pawn until e6xd5 takes back; the true
    // outcome of the exchange is that White stays a pawn down.
    let mut pos = Position::from_fen("4k3/8/4p3/3p4/4P3/8/8/4K3 w - - 0 1").unwrap();
    let mut worker = fresh_worker();
    let v = worker.qsearch(&mut pos, true, 0, -VALUE_INFINITE, VALUE_INFINITE, 0);
    assert!(v < -40, "expected roughly -pawn, got {}", v);
    assert!(v > -200, "expected roughly -pawn, got {}", v);
}

#[test]
fn qsearch_detects_mate_when_cornered() {
    // Black to move, already checkmated.
    let mut pos =
        Position::from_fen("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3")
            .unwrap();
    assert!(pos.in_check());
    let mut worker = fresh_worker();
    let v = worker.qsearch(&mut pos, true, 0, -VALUE_INFINITE, VALUE_INFINITE, 0);
    assert_eq!(v, mated_in(0));
}
