//! Lazy-SMP search driver.
//!
//! `SearchPool` launches one worker per configured thread on a clone of the
//! root position. Workers run the same iterative deepening loop and
//! cooperate only through the shared transposition table and the stop flag.
//! The main worker additionally owns time management, UCI output and the
//! final best-move choice.

use chess::ChessMove;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::position::Position;
use crate::search::history::HistoryTables;
use crate::search::syzygy::SyzygyTb;
use crate::search::time::TimeManager;
use crate::search::tt::TranspositionTable;
use crate::search::{Limits, NodeType, RootMove, SharedSearch, Worker};
use crate::types::*;
use crate::uci;

static EVAL_LEVEL: [f64; 10] = [
    1.043, 1.017, 0.952, 1.009, 0.971, 1.002, 0.992, 0.947, 1.046, 1.001,
];

/// Stack size for every thread that runs the recursive search.
const SEARCH_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Main-thread state that survives from one search to the next.
#[derive(Clone, Copy)]
pub struct MainPersist {
    pub best_previous_score: Value,
    pub best_previous_average_score: Value,
    pub previous_time_reduction: f64,
}

impl Default for MainPersist {
    fn default() -> MainPersist {
        MainPersist {
            best_previous_score: VALUE_INFINITE,
            best_previous_average_score: VALUE_INFINITE,
            previous_time_reduction: 1.0,
        }
    }
}

/// Strength limiter. Below level 20 the search keeps a few PV lines around
/// and deliberately picks a move a bit off the top by a weakness-weighted
/// statistical rule.
pub struct Skill {
    level: f64,
    pub best: Option<ChessMove>,
}

impl Skill {
    pub fn new(skill_level: i32, uci_elo: i32) -> Skill {
        let level = if uci_elo != 0 {
            let e = (uci_elo - 1320) as f64 / (3190 - 1320) as f64;
            (((37.2473 * e - 40.8525) * e + 22.2943) * e - 0.311438).clamp(0.0, 19.0)
        } else {
            skill_level as f64
        };
        Skill { level, best: None }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.level < 20.0
    }

    #[inline]
    pub fn time_to_pick(&self, depth: Depth) -> bool {
        depth == 1 + self.level as Depth
    }

    pub fn pick_best(&mut self, root_moves: &[RootMove], multi_pv: usize) -> Option<ChessMove> {
        let mut rng = rand::thread_rng();
        let top_score = root_moves[0].score;
        let delta = (top_score - root_moves[multi_pv - 1].score).min(PAWN_VALUE);
        let weakness = 120.0 - 2.0 * self.level;
        let mut max_score = -VALUE_INFINITE;

        for rm in root_moves.iter().take(multi_pv) {
            let push = ((weakness * (top_score - rm.score) as f64
                + delta as f64 * rng.gen_range(0.0..weakness))
                / 128.0) as Value;
            if rm.score + push >= max_score {
                max_score = rm.score + push;
                self.best = Some(rm.pv[0]);
            }
        }
        self.best
    }
}

/// Options the pool needs at `go` time.
#[derive(Clone)]
pub struct SearchOptions {
    pub threads: usize,
    pub multi_pv: usize,
    pub skill_level: i32,
    pub limit_strength: bool,
    pub uci_elo: i32,
    pub move_overhead: u64,
    pub show_wdl: bool,
}

impl Default for SearchOptions {
    fn default() -> SearchOptions {
        SearchOptions {
            threads: 1,
            multi_pv: 1,
            skill_level: 20,
            limit_strength: false,
            uci_elo: 0,
            move_overhead: 30,
            show_wdl: false,
        }
    }
}

pub struct SearchPool {
    pub tt: Arc<TranspositionTable>,
    pub tb: Arc<SyzygyTb>,
    pub options: SearchOptions,
    shared: Option<Arc<SharedSearch>>,
    coordinator: Option<thread::JoinHandle<()>>,
    /// Per-thread histories, kept across searches and zeroed on clear().
    states: Arc<Mutex<Vec<HistoryTables>>>,
    main_persist: Arc<Mutex<MainPersist>>,
}

impl SearchPool {
    pub fn new(hash_mb: usize) -> SearchPool {
        SearchPool {
            tt: Arc::new(TranspositionTable::new(hash_mb)),
            tb: Arc::new(SyzygyTb::empty()),
            options: SearchOptions::default(),
            shared: None,
            coordinator: None,
            states: Arc::new(Mutex::new(Vec::new())),
            main_persist: Arc::new(Mutex::new(MainPersist::default())),
        }
    }

    /// Zero all histories and start a fresh TT generation cycle.
    pub fn clear(&mut self) {
        self.wait();
        for h in self.states.lock().iter_mut() {
            h.clear();
        }
        self.tt.clear();
        *self.main_persist.lock() = MainPersist::default();
    }

    pub fn stop(&self) {
        if let Some(shared) = &self.shared {
            shared.request_stop();
        }
    }

    /// `ponderhit`: our pondered move was played. Keep searching on our own
    /// clock, unless the time manager had already decided to stop.
    pub fn ponderhit(&self) {
        if let Some(shared) = &self.shared {
            shared.ponder.store(false, Ordering::Release);
            if shared.stop_on_ponderhit.load(Ordering::Relaxed) {
                shared.request_stop();
            }
        }
    }

    /// Block until the current search (if any) has fully finished.
    pub fn wait(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }

    /// Launch a search. Results and `bestmove` go to `tx` as UCI lines.
    pub fn start_search(&mut self, pos: Position, limits: Limits, tx: Sender<String>) {
        // A previous search must have drained before state is handed out;
        // a still-running one (e.g. an unstopped `go infinite`) is cut short.
        self.stop();
        self.wait();

        let thread_count = self.options.threads.max(1);
        let shared = Arc::new(SharedSearch::new(thread_count));
        shared.ponder.store(limits.ponder, Ordering::Relaxed);
        self.shared = Some(Arc::clone(&shared));

        self.tt.new_search();

        {
            // Grow the persistent history pool to the thread count.
            let mut states = self.states.lock();
            while states.len() < thread_count {
                states.push(HistoryTables::new());
            }
        }

        let tt = Arc::clone(&self.tt);
        let tb = Arc::clone(&self.tb);
        let states = Arc::clone(&self.states);
        let main_persist = Arc::clone(&self.main_persist);
        let options = self.options.clone();

        // Deep recursions with per-frame move lists need more than the
        // default thread stack.
        let coordinator = thread::Builder::new()
            .name("vanta-main".into())
            .stack_size(SEARCH_STACK_SIZE)
            .spawn(move || {
                run_search(pos, limits, options, tt, tb, shared, states, main_persist, tx);
            })
            .expect("failed to spawn search thread");
        self.coordinator = Some(coordinator);
    }
}

impl Drop for SearchPool {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

/// Everything the coordinator thread does: build root moves, run workers,
/// pick the most trustworthy result, emit `bestmove`.
#[allow(clippy::too_many_arguments)]
fn run_search(
    pos: Position,
    mut limits: Limits,
    options: SearchOptions,
    tt: Arc<TranspositionTable>,
    tb: Arc<SyzygyTb>,
    shared: Arc<SharedSearch>,
    states: Arc<Mutex<Vec<HistoryTables>>>,
    main_persist: Arc<Mutex<MainPersist>>,
    tx: Sender<String>,
) {
    limits.move_overhead = options.move_overhead;

    // Root move list, honoring "searchmoves".
    let mut root_moves: Vec<RootMove> = pos
        .legal_moves()
        .into_iter()
        .filter(|m| limits.searchmoves.is_empty() || limits.searchmoves.contains(m))
        .map(RootMove::new)
        .collect();

    if root_moves.is_empty() {
        // Checkmate or stalemate at the root: report and bail out the way
        // the protocol expects.
        let score = if pos.in_check() { "mate 0" } else { "cp 0" };
        let _ = tx.send(format!("info depth 0 score {}", score));
        let _ = tx.send("bestmove (none)".to_string());
        return;
    }

    // Rank root moves with the tablebases when the position is small enough.
    let mut tb_cardinality = tb.effective_cardinality();
    let mut root_in_tb = false;
    if tb.enabled()
        && pos.piece_count() <= tb_cardinality
        && !pos.has_castling_rights()
        && pos.rule50() == 0
    {
        root_in_tb = rank_root_moves(&tb, &pos, &mut root_moves);
        if root_in_tb {
            // The ranking already decided the endgame; searching with
            // in-tree probes as well only burns cache.
            tb_cardinality = 0;
            shared
                .tb_hits
                .fetch_add(root_moves.len() as u64, Ordering::Relaxed);
        }
    }

    let time = if limits.use_time_management() {
        TimeManager::new(&limits, pos.side_to_move() == chess::Color::White, pos.game_ply())
    } else {
        TimeManager::unmanaged(&limits)
    };

    let thread_count = shared.thread_count;
    let mut histories: Vec<HistoryTables> = {
        let mut guard = states.lock();
        std::mem::take(&mut *guard)
    };

    let mut skill = Skill::new(
        options.skill_level,
        if options.limit_strength { options.uci_elo } else { 0 },
    );
    let mut multi_pv = options.multi_pv.max(1);
    if skill.enabled() {
        multi_pv = multi_pv.max(4);
    }
    multi_pv = multi_pv.min(root_moves.len());

    // Helper workers first, main worker runs on this thread.
    let mut handles = Vec::new();
    for id in (1..thread_count).rev() {
        let hist = histories.pop().unwrap_or_else(HistoryTables::new);
        let mut worker = Worker::new(
            id,
            Arc::clone(&tt),
            Arc::clone(&tb),
            Arc::clone(&shared),
            hist,
            limits.clone(),
            time,
        );
        worker.root_moves = root_moves.clone();
        worker.multi_pv = multi_pv;
        worker.tb_cardinality = tb_cardinality;
        worker.root_in_tb = root_in_tb;
        worker.root_game_ply = pos.game_ply();
        let mut worker_pos = pos.clone();
        let handle = thread::Builder::new()
            .name(format!("vanta-{}", id))
            .stack_size(SEARCH_STACK_SIZE)
            .spawn(move || {
                iterative_deepening(&mut worker, &mut worker_pos, None, &mut None);
                worker.flush_counters();
                worker
            })
            .expect("failed to spawn search thread");
        handles.push(handle);
    }

    let main_hist = histories.pop().unwrap_or_else(HistoryTables::new);
    let mut main = Worker::new(
        0,
        Arc::clone(&tt),
        Arc::clone(&tb),
        Arc::clone(&shared),
        main_hist,
        limits.clone(),
        time,
    );
    main.root_moves = root_moves;
    main.multi_pv = multi_pv;
    main.tb_cardinality = tb_cardinality;
    main.root_in_tb = root_in_tb;
    main.root_game_ply = pos.game_ply();
    main.info = Some(tx.clone());

    let mut persist = *main_persist.lock();
    let mut main_pos = pos.clone();
    let mut skill_opt = if skill.enabled() { Some(&mut skill) } else { None };
    iterative_deepening(
        &mut main,
        &mut main_pos,
        Some((&mut persist, options.show_wdl)),
        &mut skill_opt,
    );
    main.flush_counters();

    // In infinite or ponder mode the GUI owns the clock: hold the best move
    // back until it says stop (or the pondered move gets played).
    while !shared.stopped() && (shared.ponder.load(Ordering::Relaxed) || limits.infinite) {
        thread::sleep(Duration::from_millis(1));
    }

    // The main worker is done; everyone else must wind down too.
    shared.request_stop();
    let mut workers: Vec<Worker> = handles.into_iter().filter_map(|h| h.join().ok()).collect();

    // If the skill level is enabled, swap the best PV line with the chosen
    // sub-optimal one.
    if skill.enabled() {
        let pick = skill
            .best
            .or_else(|| skill.pick_best(&main.root_moves, multi_pv));
        if let Some(mv) = pick {
            if let Some(idx) = main.root_moves.iter().position(|rm| rm.pv[0] == mv) {
                main.root_moves.swap(0, idx);
            }
        }
    }

    // Choose the most trustworthy worker: deepest completed iteration,
    // score as tie-break, except that a proven mate at sufficient depth
    // always wins.
    let mut best: &Worker = &main;
    for w in workers.iter() {
        if w.root_moves.is_empty() {
            continue;
        }
        let (bd, bs) = (best.completed_depth, best.root_moves[0].score);
        let (wd, ws) = (w.completed_depth, w.root_moves[0].score);
        let w_proves_mate =
            ws >= VALUE_MATE_IN_MAX_PLY && wd >= main.completed_depth && ws > bs;
        let best_keeps_mate = bs >= VALUE_MATE_IN_MAX_PLY && ws < bs;
        if w_proves_mate || (!best_keeps_mate && (wd > bd || (wd == bd && ws > bs))) {
            best = w;
        }
    }

    let mut persist_out = persist;
    persist_out.best_previous_score = best.root_moves[0].score;
    persist_out.best_previous_average_score = best.root_moves[0].average_score;
    *main_persist.lock() = persist_out;

    // Re-announce the PV if a helper out-searched the main thread.
    if best.id != main.id {
        let _ = tx.send(uci::pv_lines(best, best.completed_depth, options.show_wdl));
    }

    let best_rm = &best.root_moves[0];
    let mut ponder_mv = best_rm.pv.get(1).copied();
    if ponder_mv.is_none() {
        ponder_mv = extract_ponder_from_tt(&tt, &pos, best_rm.pv[0]);
    }
    let bestmove = match ponder_mv {
        Some(p) => format!("bestmove {} ponder {}", best_rm.pv[0], p),
        None => format!("bestmove {}", best_rm.pv[0]),
    };
    let _ = tx.send(bestmove);

    // Return the histories to the pool for the next search.
    let mut returned: Vec<HistoryTables> = Vec::with_capacity(thread_count);
    returned.push(main.hist);
    for w in workers.drain(..) {
        returned.push(w.hist);
    }
    *states.lock() = returned;
}

/// Rank every root move through a WDL probe of its child. Returns false if
/// any child was missing from the tables.
fn rank_root_moves(tb: &SyzygyTb, pos: &Position, root_moves: &mut [RootMove]) -> bool {
    for rm in root_moves.iter_mut() {
        match tb.rank_move(pos, rm.pv[0]) {
            Some(rank) => {
                rm.tb_rank = rank;
                let (score, _) = crate::search::syzygy::wdl_to_value(
                    match rank {
                        2 => crate::search::syzygy::TbWdl::Win,
                        1 => crate::search::syzygy::TbWdl::CursedWin,
                        0 => crate::search::syzygy::TbWdl::Draw,
                        -1 => crate::search::syzygy::TbWdl::BlessedLoss,
                        _ => crate::search::syzygy::TbWdl::Loss,
                    },
                    1,
                    tb.use_rule50,
                );
                rm.tb_score = score;
            }
            None => return false,
        }
    }
    root_moves.sort_by_key(|rm| -rm.tb_rank);
    true
}

/// Try to dig a ponder move out of the TT when the PV is only one deep.
fn extract_ponder_from_tt(
    tt: &TranspositionTable,
    pos: &Position,
    best: ChessMove,
) -> Option<ChessMove> {
    let mut p = pos.clone();
    p.do_move(best);
    let (_, entry) = tt.probe(p.key());
    let mv = entry.and_then(|e| e.mv)?;
    if p.board().legal(mv) {
        Some(mv)
    } else {
        None
    }
}

/// The iterative deepening loop every worker runs. The main worker passes
/// its persistent state and drives time management and output; helpers pass
/// `None` and just search.
pub fn iterative_deepening(
    worker: &mut Worker,
    pos: &mut Position,
    mut main_ctx: Option<(&mut MainPersist, bool)>,
    skill: &mut Option<&mut Skill>,
) {
    worker.reset_stack();
    worker.completed_depth = 0;
    worker.root_depth = 0;
    worker.nmp_min_ply = 0;

    let us = pos.side_to_move().to_index();
    let mut last_best_move: Option<ChessMove> = None;
    let mut last_best_move_depth: Depth = 0;
    let mut time_reduction = 1.0f64;
    let mut tot_best_move_changes = 0.0f64;
    let mut iter_value = [VALUE_ZERO; 4];
    let mut iter_idx = 0usize;
    let mut search_again_counter = 0;

    if let Some((persist, _)) = &main_ctx {
        let seed = if persist.best_previous_score == VALUE_INFINITE {
            VALUE_ZERO
        } else {
            persist.best_previous_score
        };
        iter_value = [seed; 4];
    }

    let multi_pv = worker.multi_pv.min(worker.root_moves.len());

    loop {
        worker.root_depth += 1;
        if worker.root_depth >= MAX_PLY as Depth || worker.shared.stopped() {
            break;
        }
        if let Some(limit) = worker.limits.depth {
            if worker.is_main() && worker.root_depth > limit {
                break;
            }
        }

        // Age out the PV variability metric.
        if main_ctx.is_some() {
            tot_best_move_changes /= 2.0;
        }

        for rm in &mut worker.root_moves {
            rm.previous_score = rm.score;
        }

        if !worker.shared.increase_depth.load(Ordering::Relaxed) {
            search_again_counter += 1;
        }

        let mut pv_first = 0;
        worker.pv_last = 0;

        worker.pv_idx = 0;
        while worker.pv_idx < multi_pv && !worker.shared.stopped() {
            if worker.pv_idx == worker.pv_last {
                pv_first = worker.pv_last;
                worker.pv_last += 1;
                while worker.pv_last < worker.root_moves.len()
                    && worker.root_moves[worker.pv_last].tb_rank
                        == worker.root_moves[pv_first].tb_rank
                {
                    worker.pv_last += 1;
                }
            }

            worker.sel_depth = 0;

            // Aspiration window around the running average score. On the
            // first iteration the average is still -infinite, which degrades
            // naturally to a full window.
            let avg = worker.root_moves[worker.pv_idx].average_score;
            let mut delta = 10 + avg * avg / 12493;
            let mut alpha = (avg - delta).max(-VALUE_INFINITE);
            let mut beta = (avg + delta).min(VALUE_INFINITE);

            // Root-side optimism scales with how well we think we stand.
            worker.optimism[us] = 132 * avg / (avg.abs() + 89);
            worker.optimism[1 - us] = -worker.optimism[us];

            let mut failed_high_cnt = 0;
            let mut best_value;
            loop {
                let adjusted_depth = 1.max(
                    worker.root_depth - failed_high_cnt - 3 * (search_again_counter + 1) / 4,
                );
                best_value =
                    worker.search(pos, NodeType::Root, 0, alpha, beta, adjusted_depth, false);

                worker.root_moves[worker.pv_idx..worker.pv_last]
                    .sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

                if worker.shared.stopped() {
                    break;
                }

                if let Some((_, show_wdl)) = &main_ctx {
                    if multi_pv == 1
                        && (best_value <= alpha || best_value >= beta)
                        && worker.time.elapsed_ms() > 3000
                    {
                        if let Some(tx) = &worker.info {
                            let _ =
                                tx.send(uci::pv_lines(worker, worker.root_depth, *show_wdl));
                        }
                    }
                }

                if best_value <= alpha {
                    beta = (alpha + beta) / 2;
                    alpha = (best_value - delta).max(-VALUE_INFINITE);
                    failed_high_cnt = 0;
                    if main_ctx.is_some() {
                        worker
                            .shared
                            .stop_on_ponderhit
                            .store(false, Ordering::Relaxed);
                    }
                } else if best_value >= beta {
                    beta = (best_value + delta).min(VALUE_INFINITE);
                    failed_high_cnt += 1;
                } else {
                    break;
                }

                delta += delta / 3;
            }

            worker.root_moves[pv_first..=worker.pv_idx]
                .sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

            if let Some((_, show_wdl)) = &main_ctx {
                if worker.shared.stopped()
                    || worker.pv_idx + 1 == multi_pv
                    || worker.time.elapsed_ms() > 3000
                {
                    if let Some(tx) = &worker.info {
                        let _ = tx.send(uci::pv_lines(worker, worker.root_depth, *show_wdl));
                    }
                }
            }

            worker.pv_idx += 1;
        }

        if !worker.shared.stopped() {
            worker.completed_depth = worker.root_depth;
        }

        if Some(worker.root_moves[0].pv[0]) != last_best_move {
            last_best_move = Some(worker.root_moves[0].pv[0]);
            last_best_move_depth = worker.root_depth;
        }

        let Some((persist, _)) = &mut main_ctx else {
            continue;
        };

        // A proven mate within the requested length stops the search.
        if let Some(mate) = worker.limits.mate {
            let rm = &worker.root_moves[0];
            if rm.score == rm.uci_score
                && ((rm.score >= VALUE_MATE_IN_MAX_PLY && VALUE_MATE - rm.score <= 2 * mate)
                    || (rm.score != -VALUE_INFINITE
                        && rm.score <= VALUE_MATED_IN_MAX_PLY
                        && VALUE_MATE + rm.score <= 2 * mate))
            {
                worker.shared.request_stop();
            }
        }

        if let Some(sk) = skill.as_deref_mut() {
            if sk.time_to_pick(worker.root_depth) {
                sk.pick_best(&worker.root_moves, multi_pv);
            }
        }

        tot_best_move_changes +=
            worker.shared.best_move_changes.swap(0, Ordering::Relaxed) as f64;

        let best_value = worker.root_moves[0].score;

        if worker.limits.use_time_management()
            && !worker.shared.stopped()
            && !worker.shared.stop_on_ponderhit.load(Ordering::Relaxed)
        {
            let falling_eval = ((1067
                + 223 * (persist.best_previous_average_score.min(VALUE_INFINITE) - best_value)
                + 97 * (iter_value[iter_idx] - best_value)) as f64
                / 10000.0)
                .clamp(0.580, 1.667);

            time_reduction = if last_best_move_depth + 8 < worker.completed_depth {
                1.495
            } else {
                0.687
            };
            let reduction =
                (1.48 + persist.previous_time_reduction) / (2.17 * time_reduction);
            let instability =
                1.0 + 1.88 * tot_best_move_changes / worker.shared.thread_count as f64;
            let el = ((best_value + 750) / 150).clamp(0, 9) as usize;

            let mut total_time = worker.time.optimum()
                * falling_eval
                * reduction
                * instability
                * EVAL_LEVEL[el];

            // One legal move: no point burning the clock.
            if worker.root_moves.len() == 1 {
                total_time = total_time.min(500.0);
            }

            let elapsed = worker.time.elapsed_ms() as f64;
            if elapsed > total_time {
                if worker.shared.ponder.load(Ordering::Relaxed) {
                    worker
                        .shared
                        .stop_on_ponderhit
                        .store(true, Ordering::Relaxed);
                } else {
                    worker.shared.request_stop();
                }
            } else {
                worker.shared.increase_depth.store(
                    worker.shared.ponder.load(Ordering::Relaxed)
                        || elapsed <= total_time * 0.506,
                    Ordering::Relaxed,
                );
            }
        }

        iter_value[iter_idx] = best_value;
        iter_idx = (iter_idx + 1) & 3;
    }

    if let Some((persist, _)) = &mut main_ctx {
        persist.previous_time_reduction = time_reduction;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_level_maps_elo_range() {
        assert!(!Skill::new(20, 0).enabled());
        assert!(Skill::new(10, 0).enabled());
        let low = Skill::new(20, 1320);
        assert!(low.enabled());
        assert!(low.level < 1.0);
        let high = Skill::new(20, 3190);
        assert!(high.level > 18.0);
    }

    #[test]
    fn skill_pick_stays_within_candidates() {
        use chess::Square;
        let mut skill = Skill::new(5, 0);
        let mut rms = Vec::new();
        for (i, (f, t)) in [
            (Square::E2, Square::E4),
            (Square::D2, Square::D4),
            (Square::G1, Square::F3),
            (Square::C2, Square::C4),
        ]
        .iter()
        .enumerate()
        {
            let mut rm = RootMove::new(ChessMove::new(*f, *t, None));
            rm.score = 100 - 30 * i as Value;
            rms.push(rm);
        }
        let pick = skill.pick_best(&rms, 4).unwrap();
        assert!(rms.iter().any(|rm| rm.pv[0] == pick));
    }
}
