// src/search/mod.rs
//
// Alpha-beta search with quiescence. One `Worker` per thread; workers share
// the transposition table and the stop flag, nothing else. The iterative
// deepening driver lives in lazy_smp.rs, this file is the per-node search.

pub mod eval;
pub mod history;
pub mod lazy_smp;
pub mod movepick;
pub mod syzygy;
pub mod time;
pub mod tt;

use chess::{ChessMove, Piece};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use crate::position::Position;
use crate::types::*;
use history::{ContHistIndex, HistoryTables};
use movepick::{see_ge, MovePicker, PickerContext};
use syzygy::SyzygyTb;
use time::TimeManager;
use tt::{value_from_tt, value_to_tt, TranspositionTable};

/// Everything a `go` command can constrain.
#[derive(Clone, Debug)]
pub struct Limits {
    pub wtime: u64,
    pub btime: u64,
    pub winc: u64,
    pub binc: u64,
    pub movestogo: u32,
    pub depth: Option<Depth>,
    pub nodes: Option<u64>,
    pub movetime: Option<u64>,
    pub mate: Option<i32>,
    pub infinite: bool,
    pub ponder: bool,
    pub searchmoves: Vec<ChessMove>,
    pub start_time: Option<Instant>,
    pub move_overhead: u64,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            wtime: 0,
            btime: 0,
            winc: 0,
            binc: 0,
            movestogo: 0,
            depth: None,
            nodes: None,
            movetime: None,
            mate: None,
            infinite: false,
            ponder: false,
            searchmoves: Vec::new(),
            start_time: None,
            move_overhead: 30,
        }
    }
}

impl Limits {
    pub fn use_time_management(&self) -> bool {
        self.wtime > 0 || self.btime > 0
    }
}

/// One root move with everything the driver tracks about it.
#[derive(Clone, Debug)]
pub struct RootMove {
    pub pv: Vec<ChessMove>,
    pub score: Value,
    pub previous_score: Value,
    pub average_score: Value,
    pub uci_score: Value,
    pub sel_depth: i32,
    pub tb_rank: i32,
    pub tb_score: Value,
    pub score_lowerbound: bool,
    pub score_upperbound: bool,
}

impl RootMove {
    pub fn new(mv: ChessMove) -> RootMove {
        RootMove {
            pv: vec![mv],
            score: -VALUE_INFINITE,
            previous_score: -VALUE_INFINITE,
            average_score: -VALUE_INFINITE,
            uci_score: -VALUE_INFINITE,
            sel_depth: 0,
            tb_rank: 0,
            tb_score: 0,
            score_lowerbound: false,
            score_upperbound: false,
        }
    }

    /// Sort key: score first, last iteration's score as tie break.
    #[inline]
    pub fn sort_key(&self) -> (Value, Value) {
        (self.score, self.previous_score)
    }
}

/// Per-ply search state. The stack has a zeroed guard prefix so that
/// negative offsets (up to ss-7) are always in bounds.
#[derive(Clone)]
pub struct StackFrame {
    pub current_move: Option<ChessMove>,
    pub was_null: bool,
    pub excluded_move: Option<ChessMove>,
    pub killers: [Option<ChessMove>; 2],
    pub static_eval: Value,
    pub stat_score: i32,
    pub move_count: i32,
    pub in_check: bool,
    pub tt_hit: bool,
    pub tt_pv: bool,
    pub multiple_extensions: i32,
    pub cutoff_cnt: i32,
    pub cont_hist: Option<ContHistIndex>,
    pub pv: Vec<ChessMove>,
}

impl Default for StackFrame {
    fn default() -> StackFrame {
        StackFrame {
            current_move: None,
            was_null: false,
            excluded_move: None,
            killers: [None; 2],
            static_eval: VALUE_NONE,
            stat_score: 0,
            move_count: 0,
            in_check: false,
            tt_hit: false,
            tt_pv: false,
            multiple_extensions: 0,
            cutoff_cnt: 0,
            cont_hist: None,
            pv: Vec::new(),
        }
    }
}

/// Offset of ply 0 inside the stack array; frames below it are sentinels for
/// the (ss - 1) .. (ss - 7) history lookups.
const STACK_OFFSET: usize = 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeType {
    Root,
    Pv,
    NonPv,
}

impl NodeType {
    #[inline]
    pub fn is_pv(self) -> bool {
        self != NodeType::NonPv
    }
}

// History and stats update bonus/malus, based on depth.
pub fn stat_bonus(d: Depth) -> i32 {
    (245 * d - 320).clamp(0, 1296)
}

pub fn stat_malus(d: Depth) -> i32 {
    if d < 4 {
        554 * d - 303
    } else {
        1203
    }
}

fn futility_margin(d: Depth, no_tt_cut_node: bool, improving: bool, opp_worsening: bool) -> Value {
    let futility_mult = 118 - 44 * no_tt_cut_node as Value;
    let improving_deduction = 53 * improving as Value * futility_mult / 32;
    let worsening_deduction =
        (309 + 47 * improving as Value) * futility_mult * opp_worsening as Value / 1024;
    futility_mult * d - improving_deduction - worsening_deduction
}

#[inline]
fn futility_move_count(improving: bool, depth: Depth) -> i32 {
    if improving {
        3 + depth * depth
    } else {
        (3 + depth * depth) / 2
    }
}

/// Base reduction magnitudes, filled once at startup.
static REDUCTIONS: Lazy<[i32; MAX_MOVES]> = Lazy::new(|| {
    let mut r = [0i32; MAX_MOVES];
    for (i, slot) in r.iter_mut().enumerate().skip(1) {
        *slot = (20.37 * (i as f64).ln()) as i32;
    }
    r
});

/// A small random component on draw scores avoids threefold blindness.
#[inline]
pub fn value_draw(nodes: u64) -> Value {
    VALUE_DRAW - 1 + (nodes & 0x2) as Value
}

/// State shared by every worker of one search.
pub struct SharedSearch {
    pub stop: AtomicBool,
    pub ponder: AtomicBool,
    pub stop_on_ponderhit: AtomicBool,
    pub increase_depth: AtomicBool,
    pub nodes: AtomicU64,
    pub tb_hits: AtomicU64,
    /// Root best-move changes across all workers, drained by the time
    /// manager once per iteration.
    pub best_move_changes: AtomicU64,
    pub thread_count: usize,
}

impl SharedSearch {
    pub fn new(thread_count: usize) -> SharedSearch {
        SharedSearch {
            stop: AtomicBool::new(false),
            ponder: AtomicBool::new(false),
            stop_on_ponderhit: AtomicBool::new(false),
            increase_depth: AtomicBool::new(true),
            nodes: AtomicU64::new(0),
            tb_hits: AtomicU64::new(0),
            best_move_changes: AtomicU64::new(0),
            thread_count,
        }
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// A single search thread: its own histories, stack and root move list,
/// shared TT and stop flag.
pub struct Worker {
    pub id: usize,
    pub tt: Arc<TranspositionTable>,
    pub tb: Arc<SyzygyTb>,
    pub shared: Arc<SharedSearch>,
    pub hist: HistoryTables,
    pub stack: Vec<StackFrame>,
    pub root_moves: Vec<RootMove>,
    pub limits: Limits,
    pub time: TimeManager,
    pub multi_pv: usize,

    pub nodes: u64,
    pub tb_hits: u64,
    pub root_depth: Depth,
    pub completed_depth: Depth,
    pub sel_depth: i32,
    pub pv_idx: usize,
    pub pv_last: usize,
    pub root_delta: Value,
    pub nmp_min_ply: i32,
    pub optimism: [Value; 2],
    pub tb_cardinality: u32,
    pub root_in_tb: bool,
    pub root_game_ply: u32,
    calls_cnt: i32,

    /// UCI output channel; only the main worker holds one.
    pub info: Option<Sender<String>>,
}

impl Worker {
    pub fn new(
        id: usize,
        tt: Arc<TranspositionTable>,
        tb: Arc<SyzygyTb>,
        shared: Arc<SharedSearch>,
        hist: HistoryTables,
        limits: Limits,
        time: TimeManager,
    ) -> Worker {
        Worker {
            id,
            tt,
            tb,
            shared,
            hist,
            stack: vec![StackFrame::default(); MAX_PLY + 10],
            root_moves: Vec::new(),
            limits,
            time,
            multi_pv: 1,
            nodes: 0,
            tb_hits: 0,
            root_depth: 0,
            completed_depth: 0,
            sel_depth: 0,
            pv_idx: 0,
            pv_last: 0,
            root_delta: 2 * VALUE_INFINITE,
            nmp_min_ply: 0,
            optimism: [0; 2],
            tb_cardinality: 0,
            root_in_tb: false,
            root_game_ply: 0,
            calls_cnt: 0,
            info: None,
        }
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.id == 0
    }

    #[inline]
    fn sp(ply: usize) -> usize {
        ply + STACK_OFFSET
    }

    #[inline]
    fn spo(ply: usize, off: i32) -> usize {
        (ply as i32 + STACK_OFFSET as i32 + off) as usize
    }

    pub fn reset_stack(&mut self) {
        for frame in &mut self.stack {
            *frame = StackFrame::default();
        }
    }

    /// Total nodes this worker has searched (shared counter is batched).
    #[inline]
    fn bump_nodes(&mut self) {
        self.nodes += 1;
        if self.nodes % 1024 == 0 {
            self.shared.nodes.fetch_add(1024, Ordering::Relaxed);
        }
    }

    pub fn flush_counters(&mut self) {
        self.shared
            .nodes
            .fetch_add(self.nodes % 1024, Ordering::Relaxed);
        self.shared.tb_hits.fetch_add(self.tb_hits, Ordering::Relaxed);
        self.tb_hits = 0;
    }

    /// Periodic deadline check, main thread only. The sampling rate drops to
    /// 0.1% of the node limit when one is set.
    fn check_time(&mut self) {
        self.calls_cnt -= 1;
        if self.calls_cnt > 0 {
            return;
        }
        self.calls_cnt = match self.limits.nodes {
            Some(n) => 512.min((n / 1024).max(1) as i32),
            None => 512,
        };

        if self.shared.ponder.load(Ordering::Relaxed) {
            return;
        }

        let elapsed = self.time.elapsed_ms();
        let node_limit_hit = self
            .limits
            .nodes
            .map(|n| self.shared.nodes.load(Ordering::Relaxed) >= n)
            .unwrap_or(false);
        if (self.limits.use_time_management()
            && (self.time.past_maximum()
                || self.shared.stop_on_ponderhit.load(Ordering::Relaxed)))
            || self.limits.movetime.map(|mt| elapsed >= mt).unwrap_or(false)
            || node_limit_hit
        {
            self.shared.request_stop();
        }
    }

    fn reduction(&self, improving: bool, depth: Depth, move_count: i32, delta: Value) -> Depth {
        let d = (depth as usize).min(MAX_MOVES - 1);
        let mn = (move_count as usize).min(MAX_MOVES - 1);
        let scale = REDUCTIONS[d] * REDUCTIONS[mn];
        let mut r = (scale + 1346 - delta * 896 / self.root_delta.max(1)) / 1024;
        if !improving && scale > 880 {
            r += 1;
        }
        r
    }

    /// Continuation-history context for the move picker and pruning at
    /// `ply`: hooks for plies -1, -2 and -4.
    fn picker_context(&self, pos: &Position, ply: usize) -> PickerContext {
        PickerContext {
            side: pos.side_to_move(),
            pawn_index: history::pawn_history_index(pos.pawn_key()),
            cont: [
                self.stack[Self::spo(ply, -1)].cont_hist,
                self.stack[Self::spo(ply, -2)].cont_hist,
                self.stack[Self::spo(ply, -4)].cont_hist,
            ],
        }
    }

    fn update_pv(&mut self, ply: usize, mv: ChessMove) {
        let child = self.stack[Self::sp(ply + 1)].pv.clone();
        let frame = &mut self.stack[Self::sp(ply)];
        frame.pv.clear();
        frame.pv.push(mv);
        frame.pv.extend(child);
    }

    /// Apply a bonus to the continuation histories of the moves leading
    /// here, at the usual ply offsets.
    fn update_continuation_histories(&mut self, ply: usize, pc: usize, to: usize, bonus: i32) {
        const WEIGHT: [i32; 7] = [0, 6, 8, 8, 9, 0, 6];
        let in_check = self.stack[Self::sp(ply)].in_check;
        for i in [1usize, 2, 3, 4, 6] {
            if in_check && i > 2 {
                break;
            }
            let prior = &self.stack[Self::spo(ply, -(i as i32))];
            if prior.current_move.is_some() {
                if let Some(idx) = prior.cont_hist {
                    let w = bonus * WEIGHT[i] / (8 + 24 * (i == 3) as i32);
                    self.hist.update_cont(idx, pc, to, w);
                }
            }
        }
    }

    /// Killers, main history, continuation histories and the counter move,
    /// rewarded together on a quiet fail-high.
    fn update_quiet_stats(&mut self, pos: &Position, ply: usize, mv: ChessMove, bonus: i32) {
        let frame = &mut self.stack[Self::sp(ply)];
        if frame.killers[0] != Some(mv) {
            frame.killers[1] = frame.killers[0];
            frame.killers[0] = Some(mv);
        }

        let us = pos.side_to_move();
        self.hist.update_main(us, mv, bonus);
        let piece = pos.board().piece_on(mv.get_source()).unwrap();
        let pc = piece_index(us, piece);
        self.update_continuation_histories(ply, pc, mv.get_dest().to_index(), bonus);

        let prev = &self.stack[Self::spo(ply, -1)];
        if let (Some(prev_mv), Some(idx)) = (prev.current_move, prev.cont_hist) {
            let prev_to = prev_mv.get_dest().to_index();
            self.hist.set_counter_move(idx.piece, prev_to, mv);
        }
    }

    /// End-of-node statistics: reward the cutoff move, punish the losers.
    #[allow(clippy::too_many_arguments)]
    fn update_all_stats(
        &mut self,
        pos: &Position,
        ply: usize,
        best_move: ChessMove,
        best_value: Value,
        beta: Value,
        depth: Depth,
        quiets: &[ChessMove],
        captures: &[ChessMove],
    ) {
        let us = pos.side_to_move();
        let quiet_bonus = stat_bonus(depth + 1);
        let quiet_malus = stat_malus(depth);
        let pawn_idx = history::pawn_history_index(pos.pawn_key());

        if !pos.is_capture(best_move) {
            let best_bonus = if best_value > beta + 173 {
                quiet_bonus
            } else {
                stat_bonus(depth)
            };
            self.update_quiet_stats(pos, ply, best_move, best_bonus);
            let piece = pos.board().piece_on(best_move.get_source()).unwrap();
            let pc = piece_index(us, piece);
            self.hist
                .update_pawn(pawn_idx, pc, best_move.get_dest().to_index(), quiet_bonus);

            for &q in quiets {
                let piece = pos.board().piece_on(q.get_source()).unwrap();
                let pc = piece_index(us, piece);
                let to = q.get_dest().to_index();
                self.hist.update_pawn(pawn_idx, pc, to, -quiet_malus);
                self.hist.update_main(us, q, -quiet_malus);
                self.update_continuation_histories(ply, pc, to, -quiet_malus);
            }
        } else {
            let piece = pos.board().piece_on(best_move.get_source()).unwrap();
            let pc = piece_index(us, piece);
            let captured = pos.captured_on(best_move).unwrap_or(Piece::Pawn);
            self.hist.update_capture(
                pc,
                best_move.get_dest().to_index(),
                captured.to_index(),
                quiet_bonus,
            );
        }

        // Extra penalty for an early refuted quiet on the previous ply.
        let prev = &self.stack[Self::spo(ply, -1)];
        if let Some(prev_mv) = prev.current_move {
            let early = prev.move_count == 1 + prev.tt_hit as i32
                || prev.killers[0] == Some(prev_mv);
            if early && pos.captured_piece().is_none() {
                let prev_to = prev_mv.get_dest().to_index();
                if let Some(pc_prev) = pos.board().piece_on(prev_mv.get_dest()) {
                    let pidx = piece_index(!us, pc_prev);
                    self.update_continuation_histories_at(ply, 1, pidx, prev_to, -quiet_malus);
                }
            }
        }

        for &c in captures {
            let piece = pos.board().piece_on(c.get_source()).unwrap();
            let pc = piece_index(us, piece);
            let captured = pos.captured_on(c).unwrap_or(Piece::Pawn);
            self.hist
                .update_capture(pc, c.get_dest().to_index(), captured.to_index(), -quiet_malus);
        }
    }

    /// Continuation update anchored one ply back instead of at this node.
    fn update_continuation_histories_at(
        &mut self,
        ply: usize,
        back: i32,
        pc: usize,
        to: usize,
        bonus: i32,
    ) {
        const WEIGHT: [i32; 7] = [0, 6, 8, 8, 9, 0, 6];
        let in_check = self.stack[Self::spo(ply, -back)].in_check;
        for i in [1usize, 2, 3, 4, 6] {
            if in_check && i > 2 {
                break;
            }
            let prior = &self.stack[Self::spo(ply, -back - i as i32)];
            if prior.current_move.is_some() {
                if let Some(idx) = prior.cont_hist {
                    let w = bonus * WEIGHT[i] / (8 + 24 * (i == 3) as i32);
                    self.hist.update_cont(idx, pc, to, w);
                }
            }
        }
    }

    // ================= main search =================

    pub fn search(
        &mut self,
        pos: &mut Position,
        nt: NodeType,
        ply: usize,
        mut alpha: Value,
        mut beta: Value,
        mut depth: Depth,
        cut_node: bool,
    ) -> Value {
        let pv_node = nt.is_pv();
        let root_node = nt == NodeType::Root;

        // Dive into quiescence when the remaining depth is gone.
        if depth <= 0 {
            return self.qsearch(pos, pv_node, ply, alpha, beta, 0);
        }

        debug_assert!(-VALUE_INFINITE <= alpha && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(!(pv_node && cut_node));

        let us = pos.side_to_move();
        let in_check = pos.in_check();
        self.stack[Self::sp(ply)].in_check = in_check;
        self.stack[Self::sp(ply)].move_count = 0;
        let prior_capture = pos.captured_piece();

        if self.is_main() {
            self.check_time();
        }
        if pv_node && self.sel_depth < ply as i32 + 1 {
            self.sel_depth = ply as i32 + 1;
        }

        if !root_node {
            // Step 2. Aborted search and immediate draw.
            if self.shared.stopped() || pos.is_draw(ply) || ply >= MAX_PLY - 1 {
                return if ply >= MAX_PLY - 1 && !in_check {
                    eval::evaluate(pos.board(), self.optimism[us.to_index()])
                } else {
                    value_draw(self.nodes)
                };
            }

            // Step 3. Mate distance pruning.
            alpha = alpha.max(mated_in(ply));
            beta = beta.min(mate_in(ply + 1));
            if alpha >= beta {
                return alpha;
            }
        } else {
            self.root_delta = beta - alpha;
        }

        self.stack[Self::sp(ply + 1)].excluded_move = None;
        self.stack[Self::sp(ply + 2)].killers = [None; 2];
        self.stack[Self::sp(ply + 2)].cutoff_cnt = 0;
        self.stack[Self::sp(ply)].multiple_extensions =
            self.stack[Self::spo(ply, -1)].multiple_extensions;
        self.stack[Self::sp(ply)].stat_score = 0;

        let prev_frame_move = self.stack[Self::spo(ply, -1)].current_move;
        let prev_sq = prev_frame_move.map(|m| m.get_dest());

        // Step 4. Transposition table lookup.
        let excluded_move = self.stack[Self::sp(ply)].excluded_move;
        let pos_key = pos.key();
        let (tt_slot, tt_entry) = self.tt.probe(pos_key);
        let tt_hit = tt_entry.is_some();
        self.stack[Self::sp(ply)].tt_hit = tt_hit;
        let tt_value = tt_entry
            .map(|e| value_from_tt(e.value, ply, pos.rule50()))
            .unwrap_or(VALUE_NONE);
        let mut tt_move = if root_node {
            self.root_moves[self.pv_idx].pv.first().copied()
        } else {
            tt_entry.and_then(|e| e.mv)
        };
        // A stored move must at least be legal here to be trusted.
        if let Some(m) = tt_move {
            if !pos.board().legal(m) {
                tt_move = None;
            }
        }
        let tt_capture = tt_move.map(|m| pos.is_capture(m)).unwrap_or(false);

        if excluded_move.is_none() {
            self.stack[Self::sp(ply)].tt_pv =
                pv_node || tt_entry.map(|e| e.is_pv).unwrap_or(false);
        }
        let tt_pv = self.stack[Self::sp(ply)].tt_pv;

        // At non-PV nodes we check for an early TT cutoff.
        if !pv_node
            && excluded_move.is_none()
            && tt_value != VALUE_NONE
            && tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) > depth
            && tt_entry
                .map(|e| e.bound.admits(tt_value >= beta))
                .unwrap_or(false)
        {
            if let Some(m) = tt_move {
                if tt_value >= beta {
                    if !tt_capture {
                        self.update_quiet_stats(pos, ply, m, stat_bonus(depth));
                    }
                    // Extra penalty for early quiets of the previous ply.
                    let prev = &self.stack[Self::spo(ply, -1)];
                    if prev.move_count <= 2 && prior_capture.is_none() {
                        if let Some(psq) = prev_sq {
                            if let Some(pp) = pos.board().piece_on(psq) {
                                let pidx = piece_index(!us, pp);
                                self.update_continuation_histories_at(
                                    ply,
                                    1,
                                    pidx,
                                    psq.to_index(),
                                    -stat_malus(depth + 1),
                                );
                            }
                        }
                    }
                }
            }

            // High rule50 counts poison transpositions; skip the cutoff.
            if pos.rule50() < 90 {
                return if tt_value >= beta && tt_value.abs() < VALUE_TB_WIN_IN_MAX_PLY {
                    (tt_value * 3 + beta) / 4
                } else {
                    tt_value
                };
            }
        }

        // Step 5. Tablebase probe.
        let mut max_value = VALUE_INFINITE;
        let mut best_value = -VALUE_INFINITE;
        if !root_node && excluded_move.is_none() && self.tb_cardinality > 0 {
            let pieces = pos.piece_count();
            if pieces <= self.tb_cardinality
                && (pieces < self.tb_cardinality || depth >= self.tb.probe_depth)
                && pos.rule50() == 0
                && !pos.has_castling_rights()
            {
                if let Some(wdl) = self.tb.probe_wdl(pos.board()) {
                    self.tb_hits += 1;
                    if self.is_main() {
                        self.calls_cnt = 0;
                    }
                    let (value, bound) = syzygy::wdl_to_value(wdl, ply, self.tb.use_rule50);
                    let cutoff = match bound {
                        Bound::Exact => true,
                        Bound::Lower => value >= beta,
                        _ => value <= alpha,
                    };
                    if cutoff {
                        self.tt.save(
                            tt_slot,
                            pos_key,
                            value_to_tt(value, ply),
                            tt_pv,
                            bound,
                            (depth + 6).min(MAX_PLY as Depth - 1),
                            None,
                            VALUE_NONE,
                        );
                        return value;
                    }
                    if pv_node {
                        if bound == Bound::Lower {
                            best_value = value;
                            alpha = alpha.max(value);
                        } else {
                            max_value = value;
                        }
                    }
                }
            }
        }

        // Step 6. Static evaluation.
        let mut unadjusted_static_eval = VALUE_NONE;
        let mut eval_v = VALUE_NONE;
        let mut improving = false;
        let mut opponent_worsening = false;

        if !in_check {
            if excluded_move.is_some() {
                unadjusted_static_eval = self.stack[Self::sp(ply)].static_eval;
                eval_v = unadjusted_static_eval;
            } else if let Some(e) = tt_entry {
                unadjusted_static_eval = if e.eval == VALUE_NONE {
                    eval::evaluate(pos.board(), self.optimism[us.to_index()])
                } else {
                    e.eval
                };
                let corrected =
                    unadjusted_static_eval + self.hist.correction(us, pos.pawn_key());
                eval_v = clamp_to_static(corrected);
                self.stack[Self::sp(ply)].static_eval = eval_v;
                // ttValue is usually a better estimate than the static eval.
                if tt_value != VALUE_NONE && e.bound.admits(tt_value > eval_v) {
                    eval_v = tt_value;
                }
            } else {
                unadjusted_static_eval =
                    eval::evaluate(pos.board(), self.optimism[us.to_index()]);
                let corrected =
                    unadjusted_static_eval + self.hist.correction(us, pos.pawn_key());
                eval_v = clamp_to_static(corrected);
                self.stack[Self::sp(ply)].static_eval = eval_v;
                self.tt.save(
                    tt_slot,
                    pos_key,
                    VALUE_NONE,
                    tt_pv,
                    Bound::None,
                    DEPTH_NONE,
                    None,
                    unadjusted_static_eval,
                );
            }
            if excluded_move.is_some() {
                self.stack[Self::sp(ply)].static_eval = eval_v;
            }

            // Use the eval swing to improve quiet ordering of the previous
            // move.
            let prev = &self.stack[Self::spo(ply, -1)];
            if let Some(prev_mv) = prev.current_move {
                if !prev.in_check && prior_capture.is_none() {
                    let prev_se = prev.static_eval;
                    if prev_se != VALUE_NONE {
                        let mut bonus =
                            (-13 * (prev_se + self.stack[Self::sp(ply)].static_eval))
                                .clamp(-1578, 1291);
                        bonus = if bonus > 0 { 2 * bonus } else { bonus / 2 };
                        self.hist.update_main(!us, prev_mv, bonus);
                        let psq = prev_mv.get_dest();
                        if let Some(pp) = pos.board().piece_on(psq) {
                            if pp != Piece::Pawn && prev_mv.get_promotion().is_none() {
                                let pidx = piece_index(!us, pp);
                                self.hist.update_pawn(
                                    history::pawn_history_index(pos.pawn_key()),
                                    pidx,
                                    psq.to_index(),
                                    bonus / 2,
                                );
                            }
                        }
                    }
                }
            }

            let se = self.stack[Self::sp(ply)].static_eval;
            let se2 = self.stack[Self::spo(ply, -2)].static_eval;
            let se4 = self.stack[Self::spo(ply, -4)].static_eval;
            improving = if se2 != VALUE_NONE {
                se > se2
            } else {
                se4 != VALUE_NONE && se > se4
            };
            let prev_se = self.stack[Self::spo(ply, -1)].static_eval;
            opponent_worsening = prev_se != VALUE_NONE && se + prev_se > 2;
        }

        if !in_check {
            let next_cutoff_hot = self.stack[Self::sp(ply + 1)].cutoff_cnt > 3;

            // Step 7. Razoring: hopeless evals drop straight to quiescence.
            if eval_v < alpha - 488 - (289 - 142 * next_cutoff_hot as Value) * depth * depth {
                let value = self.qsearch(pos, false, ply, alpha - 1, alpha, 0);
                if value < alpha {
                    return value;
                }
            }

            // Step 8. Reverse futility pruning.
            let prev_stat_score = self.stack[Self::spo(ply, -1)].stat_score;
            if !tt_pv
                && depth < 12
                && eval_v
                    - futility_margin(depth, cut_node && !tt_hit, improving, opponent_worsening)
                    - prev_stat_score / 267
                    >= beta
                && eval_v >= beta
                && eval_v < 30016
                && (tt_move.is_none() || tt_capture)
            {
                return if beta > VALUE_TB_LOSS_IN_MAX_PLY {
                    (eval_v + beta) / 2
                } else {
                    eval_v
                };
            }

            // Step 9. Null move search with verification.
            let prev = &self.stack[Self::spo(ply, -1)];
            if !pv_node
                && !prev.was_null
                && prev.stat_score < 16878
                && eval_v >= beta
                && self.stack[Self::sp(ply)].static_eval >= beta - 20 * depth + 314
                && excluded_move.is_none()
                && pos.non_pawn_material(us)
                && ply as i32 >= self.nmp_min_ply
                && beta > VALUE_TB_LOSS_IN_MAX_PLY
            {
                let r = ((eval_v - beta) / 144).min(6) + depth / 3 + 4;

                self.stack[Self::sp(ply)].current_move = None;
                self.stack[Self::sp(ply)].was_null = true;
                self.stack[Self::sp(ply)].cont_hist = Some(ContHistIndex {
                    in_check: false,
                    capture: false,
                    piece: NO_PIECE,
                    to: 0,
                });

                if let Some(st) = pos.do_null_move() {
                    let null_value = -self.search(
                        pos,
                        NodeType::NonPv,
                        ply + 1,
                        -beta,
                        -beta + 1,
                        depth - r,
                        !cut_node,
                    );
                    pos.undo_move(st);
                    self.stack[Self::sp(ply)].was_null = false;

                    if null_value >= beta && null_value < VALUE_TB_WIN_IN_MAX_PLY {
                        if self.nmp_min_ply != 0 || depth < 16 {
                            return null_value;
                        }
                        // Verification search with null moves disabled along
                        // the first part of the remaining tree.
                        self.nmp_min_ply = ply as i32 + 3 * (depth - r) / 4;
                        let v = self.search(
                            pos,
                            NodeType::NonPv,
                            ply,
                            beta - 1,
                            beta,
                            depth - r,
                            false,
                        );
                        self.nmp_min_ply = 0;
                        if v >= beta {
                            return null_value;
                        }
                    }
                } else {
                    self.stack[Self::sp(ply)].was_null = false;
                }
            }

            // Step 10. Internal iterative reductions.
            if pv_node && tt_move.is_none() {
                depth -= 2
                    + 2 * (tt_hit
                        && tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) >= depth)
                        as Depth
                    + 2 * (next_cutoff_hot && depth < 5) as Depth;
            }
            if depth <= 0 {
                return self.qsearch(pos, true, ply, alpha, beta, 0);
            }
            if cut_node && depth >= 6 && tt_move.is_none() {
                depth -= 2;
            }

            // Step 11. ProbCut.
            let probcut_beta = beta + 170 - 64 * improving as Value
                + 150 * next_cutoff_hot as Value;
            let tt_blocks_probcut = tt_entry
                .map(|e| e.depth >= depth - 3 && tt_value != VALUE_NONE && tt_value < probcut_beta)
                .unwrap_or(false);
            if !pv_node && depth > 3 && beta.abs() < VALUE_TB_WIN_IN_MAX_PLY && !tt_blocks_probcut
            {
                let static_eval = self.stack[Self::sp(ply)].static_eval;
                let threshold = probcut_beta - static_eval;
                let captures: Vec<ChessMove> = pos
                    .legal_moves()
                    .into_iter()
                    .filter(|&m| {
                        Some(m) != excluded_move
                            && (pos.is_capture(m) || m.get_promotion() == Some(Piece::Queen))
                            && see_ge(pos, m, threshold)
                    })
                    .collect();
                for mv in captures {
                    let capture = pos.is_capture(mv);
                    let piece = pos.board().piece_on(mv.get_source()).unwrap();
                    self.stack[Self::sp(ply)].current_move = Some(mv);
                    self.stack[Self::sp(ply)].cont_hist = Some(ContHistIndex {
                        in_check,
                        capture,
                        piece: piece_index(us, piece),
                        to: mv.get_dest().to_index(),
                    });

                    let st = pos.do_move(mv);
                    self.bump_nodes();
                    let mut value = -self.qsearch(
                        pos,
                        false,
                        ply + 1,
                        -probcut_beta,
                        -probcut_beta + 1,
                        0,
                    );
                    if value >= probcut_beta {
                        value = -self.search(
                            pos,
                            NodeType::NonPv,
                            ply + 1,
                            -probcut_beta,
                            -probcut_beta + 1,
                            depth - 4,
                            !cut_node,
                        );
                    }
                    pos.undo_move(st);

                    if value >= probcut_beta {
                        self.tt.save(
                            tt_slot,
                            pos_key,
                            value_to_tt(value, ply),
                            tt_pv,
                            Bound::Lower,
                            depth - 3,
                            Some(mv),
                            unadjusted_static_eval,
                        );
                        return if value.abs() < VALUE_TB_WIN_IN_MAX_PLY {
                            value - (probcut_beta - beta)
                        } else {
                            value
                        };
                    }
                    if self.shared.stopped() {
                        return VALUE_ZERO;
                    }
                }
            }
        }

        // Step 12. Small probcut when in check: a deep TT capture already
        // proved a score far above beta.
        let probcut_beta = beta + 409;
        if in_check
            && !pv_node
            && tt_capture
            && tt_value != VALUE_NONE
            && tt_entry
                .map(|e| e.bound.admits(true) && e.depth >= depth - 4)
                .unwrap_or(false)
            && tt_value >= probcut_beta
            && tt_value.abs() < VALUE_TB_WIN_IN_MAX_PLY
            && beta.abs() < VALUE_TB_WIN_IN_MAX_PLY
        {
            return probcut_beta;
        }

        // Step 13. The moves loop.
        let counter = prev_sq
            .and_then(|sq| {
                pos.board()
                    .piece_on(sq)
                    .map(|p| (piece_index(!us, p), sq.to_index()))
            })
            .and_then(|(pc, to)| self.hist.counter_move(pc, to));
        let killers = self.stack[Self::sp(ply)].killers;
        let ctx = self.picker_context(pos, ply);
        let mut picker = MovePicker::new(pos, tt_move, killers, counter, depth);

        let mut value;
        let mut best_move: Option<ChessMove> = None;
        let mut move_count = 0;
        let mut skip_quiets = false;
        let mut quiets_searched: Vec<ChessMove> = Vec::with_capacity(32);
        let mut captures_searched: Vec<ChessMove> = Vec::with_capacity(16);

        while let Some(mv) = picker.next_move(pos, &self.hist, &ctx, skip_quiets) {
            if Some(mv) == excluded_move {
                continue;
            }
            // At root obey searchmoves and the MultiPV exclusion window.
            if root_node
                && !self.root_moves[self.pv_idx..self.pv_last]
                    .iter()
                    .any(|rm| rm.pv[0] == mv)
            {
                continue;
            }

            move_count += 1;
            self.stack[Self::sp(ply)].move_count = move_count;

            if root_node && self.is_main() && self.time.elapsed_ms() > 3000 {
                if let Some(tx) = &self.info {
                    let _ = tx.send(format!(
                        "info depth {} currmove {} currmovenumber {}",
                        depth,
                        mv,
                        move_count + self.pv_idx as i32
                    ));
                }
            }
            if pv_node {
                self.stack[Self::sp(ply + 1)].pv.clear();
            }

            let capture = pos.is_capture(mv);
            let moved_piece = pos.board().piece_on(mv.get_source()).unwrap();
            let pc = piece_index(us, moved_piece);
            let to_idx = mv.get_dest().to_index();
            let gives_check = pos.gives_check(mv);
            let mut new_depth = depth - 1;
            let delta = beta - alpha;
            let mut r = self.reduction(improving, depth, move_count, delta);

            // Step 14. Pruning at shallow depth.
            if !root_node && pos.non_pawn_material(us) && best_value > VALUE_TB_LOSS_IN_MAX_PLY {
                if !skip_quiets {
                    skip_quiets = move_count >= futility_move_count(improving, depth);
                }
                let lmr_depth = new_depth - r;

                if capture || gives_check {
                    // Futility pruning for captures.
                    if !gives_check && lmr_depth < 7 && !in_check {
                        let captured = pos.captured_on(mv).unwrap_or(Piece::Pawn);
                        let futility_eval = self.stack[Self::sp(ply)].static_eval
                            + 297
                            + 284 * lmr_depth
                            + piece_value(captured)
                            + self.hist.capture_history(pc, to_idx, captured.to_index()) / 7;
                        if futility_eval < alpha {
                            continue;
                        }
                    }
                    // SEE pruning for captures and checks.
                    if !see_ge(pos, mv, -203 * depth) {
                        continue;
                    }
                } else {
                    let mut hist = ctx.cont[0]
                        .map(|c| self.hist.cont_history(c, pc, to_idx))
                        .unwrap_or(0)
                        + ctx.cont[1]
                            .map(|c| self.hist.cont_history(c, pc, to_idx))
                            .unwrap_or(0)
                        + ctx.cont[2]
                            .map(|c| self.hist.cont_history(c, pc, to_idx))
                            .unwrap_or(0)
                        + self.hist.pawn_history(ctx.pawn_index, pc, to_idx);

                    // Continuation history pruning.
                    if lmr_depth < 6 && hist < -4040 * depth {
                        continue;
                    }

                    hist += 2 * self.hist.main_history(us, mv);
                    let mut lmr_depth = lmr_depth + hist / 5637;

                    let futility_value = self.stack[Self::sp(ply)].static_eval
                        + if best_value < self.stack[Self::sp(ply)].static_eval - 59 {
                            141
                        } else {
                            58
                        }
                        + 125 * lmr_depth;

                    // Parent-node futility pruning.
                    if !in_check && lmr_depth < 15 && futility_value <= alpha {
                        if best_value <= futility_value
                            && best_value.abs() < VALUE_TB_WIN_IN_MAX_PLY
                            && futility_value < VALUE_TB_WIN_IN_MAX_PLY
                        {
                            best_value = (best_value + futility_value * 3) / 4;
                        }
                        continue;
                    }

                    lmr_depth = lmr_depth.max(0);

                    // Negative SEE pruning for quiets.
                    if !see_ge(pos, mv, -27 * lmr_depth * lmr_depth) {
                        continue;
                    }
                }
            }

            // Step 15. Extensions, kept in careful bounds.
            let mut extension: Depth = 0;
            if (ply as i32) < self.root_depth * 2 {
                if !root_node
                    && Some(mv) == tt_move
                    && excluded_move.is_none()
                    && depth
                        >= 4 - (self.completed_depth > 30) as Depth + tt_pv as Depth
                    && tt_value.abs() < VALUE_TB_WIN_IN_MAX_PLY
                    && tt_entry.map(|e| e.bound.admits(true)).unwrap_or(false)
                    && tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) >= depth - 3
                {
                    // Singular extension: exclude the TT move and see whether
                    // anything else reaches a slightly lowered bound.
                    let singular_beta =
                        tt_value - (58 + 58 * (tt_pv && !pv_node) as Value) * depth / 64;
                    let singular_depth = new_depth / 2;

                    self.stack[Self::sp(ply)].excluded_move = Some(mv);
                    value = self.search(
                        pos,
                        NodeType::NonPv,
                        ply,
                        singular_beta - 1,
                        singular_beta,
                        singular_depth,
                        cut_node,
                    );
                    self.stack[Self::sp(ply)].excluded_move = None;

                    let multiple_extensions = self.stack[Self::sp(ply)].multiple_extensions;
                    if value < singular_beta {
                        extension = 1;
                        if !pv_node && multiple_extensions <= 16 {
                            extension = 2 + (value < singular_beta - 22 && !tt_capture) as Depth;
                            if depth < 14 {
                                depth += 1;
                            }
                        }
                        if pv_node
                            && !tt_capture
                            && multiple_extensions <= 5
                            && value < singular_beta - 37
                        {
                            extension = 2;
                        }
                    } else if singular_beta >= beta {
                        // Multi-cut: several moves fail high without the TT
                        // move, prune the whole subtree on a soft bound.
                        return singular_beta;
                    } else if tt_value >= beta {
                        extension = -3;
                    } else if cut_node {
                        extension = -2;
                    } else if tt_value <= value {
                        extension = -1;
                    }
                } else if self.stack[Self::spo(ply, -1)].was_null
                    && self.stack[Self::sp(ply)].static_eval != VALUE_NONE
                    && self.stack[Self::spo(ply, -1)].static_eval != VALUE_NONE
                    && (self.stack[Self::sp(ply)].static_eval
                        - self.stack[Self::spo(ply, -1)].static_eval)
                        .abs()
                        > 900
                {
                    // A wild eval swing right after a null move smells of
                    // zugzwang or a deep tactic.
                    extension = 1;
                } else if pv_node
                    && Some(mv) == tt_move
                    && prev_sq == Some(mv.get_dest())
                    && capture
                {
                    let captured = pos.captured_on(mv).unwrap_or(Piece::Pawn);
                    if self.hist.capture_history(pc, to_idx, captured.to_index()) > 4026 {
                        extension = 1;
                    }
                }
            }

            new_depth += extension;
            self.stack[Self::sp(ply)].multiple_extensions =
                self.stack[Self::spo(ply, -1)].multiple_extensions
                    + (extension >= 2) as i32;

            self.stack[Self::sp(ply)].current_move = Some(mv);
            self.stack[Self::sp(ply)].was_null = false;
            self.stack[Self::sp(ply)].cont_hist = Some(ContHistIndex {
                in_check,
                capture,
                piece: pc,
                to: to_idx,
            });

            // Step 16. Make the move.
            let st = pos.do_move(mv);
            self.bump_nodes();

            // Late move reduction adjustments.
            if tt_pv {
                r -= 1
                    + (tt_value != VALUE_NONE && tt_value > alpha) as Depth
                    + (tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) >= depth) as Depth;
            }
            if cut_node {
                r += 2
                    - (tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) >= depth && tt_pv)
                        as Depth;
            }
            if tt_capture {
                r += 1;
            }
            if pv_node {
                r -= 1;
            }
            // Increase reduction when the move just shuffles back into a
            // line the path has already repeated.
            if Some(mv) == self.stack[Self::spo(ply, -4)].current_move && pos.has_repeated() {
                r += 2;
            }
            if self.stack[Self::sp(ply + 1)].cutoff_cnt > 3 {
                r += 1;
            } else if Some(mv) == tt_move {
                r = 0;
            }

            let stat_score = 2 * self.hist.main_history(us, mv)
                + ctx.cont[0]
                    .map(|c| self.hist.cont_history(c, pc, to_idx))
                    .unwrap_or(0)
                + ctx.cont[1]
                    .map(|c| self.hist.cont_history(c, pc, to_idx))
                    .unwrap_or(0)
                + ctx.cont[2]
                    .map(|c| self.hist.cont_history(c, pc, to_idx))
                    .unwrap_or(0)
                - 3817;
            self.stack[Self::sp(ply)].stat_score = stat_score;
            r -= stat_score / 13659;

            // Step 17. Late move reductions.
            if depth >= 2 && move_count > 1 + root_node as i32 {
                let d = 1.max((new_depth - r).min(new_depth + 1));
                value =
                    -self.search(pos, NodeType::NonPv, ply + 1, -(alpha + 1), -alpha, d, true);

                if value > alpha && d < new_depth {
                    let do_deeper = value > best_value + 47 + 2 * new_depth;
                    let do_shallower = value < best_value + new_depth;
                    new_depth += do_deeper as Depth - do_shallower as Depth;
                    if new_depth > d {
                        value = -self.search(
                            pos,
                            NodeType::NonPv,
                            ply + 1,
                            -(alpha + 1),
                            -alpha,
                            new_depth,
                            !cut_node,
                        );
                    }
                    let bonus = if value <= alpha {
                        -stat_malus(new_depth)
                    } else if value >= beta {
                        stat_bonus(new_depth)
                    } else {
                        0
                    };
                    self.update_continuation_histories(ply, pc, to_idx, bonus);
                }
            } else if !pv_node || move_count > 1 {
                // Step 18. Full-depth null-window search when LMR is skipped.
                if tt_move.is_none() {
                    r += 2;
                }
                value = -self.search(
                    pos,
                    NodeType::NonPv,
                    ply + 1,
                    -(alpha + 1),
                    -alpha,
                    new_depth - (r > 3) as Depth,
                    !cut_node,
                );
            } else {
                value = alpha + 1; // Force the PV search below.
            }

            // Full PV search for the first move and for fail highs.
            if pv_node && (move_count == 1 || value > alpha) {
                self.stack[Self::sp(ply + 1)].pv.clear();
                value = -self.search(
                    pos,
                    NodeType::Pv,
                    ply + 1,
                    -beta,
                    -alpha,
                    new_depth,
                    false,
                );
            }

            // Step 19. Undo.
            pos.undo_move(st);

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 20. A stopped search cannot trust its partial results.
            if self.shared.stopped() {
                return VALUE_ZERO;
            }

            if root_node {
                let child_pv = self.stack[Self::sp(ply + 1)].pv.clone();
                let sel_depth = self.sel_depth;
                let rm = self
                    .root_moves
                    .iter_mut()
                    .find(|rm| rm.pv[0] == mv)
                    .expect("move came from the root list");
                rm.average_score = if rm.average_score == -VALUE_INFINITE {
                    value
                } else {
                    (2 * value + rm.average_score) / 3
                };

                if move_count == 1 || value > alpha {
                    rm.score = value;
                    rm.uci_score = value;
                    rm.sel_depth = sel_depth;
                    rm.score_lowerbound = false;
                    rm.score_upperbound = false;
                    if value >= beta {
                        rm.score_lowerbound = true;
                        rm.uci_score = beta;
                    } else if value <= alpha {
                        rm.score_upperbound = true;
                        rm.uci_score = alpha;
                    }
                    rm.pv.truncate(1);
                    rm.pv.extend(child_pv);
                    if move_count > 1 && self.pv_idx == 0 {
                        self.shared.best_move_changes.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    // Keep stable ordering: unsearched moves sink.
                    rm.score = -VALUE_INFINITE;
                }
            }

            if value > best_value {
                best_value = value;

                if value > alpha {
                    best_move = Some(mv);

                    if pv_node && !root_node {
                        self.update_pv(ply, mv);
                    }

                    if value >= beta {
                        let inc = 1 + tt_move.is_none() as i32 - (extension >= 2) as i32;
                        self.stack[Self::sp(ply)].cutoff_cnt += inc;
                        break; // Fail high.
                    }

                    // Lower the remaining depth a little once the node has
                    // produced an improvement.
                    if depth > 2 && depth < 12 && beta < 14206 && value > -12077 {
                        depth -= 1 + tt_pv as Depth;
                    }
                    alpha = value;
                }
            }

            if Some(mv) != best_move && move_count <= 32 {
                if capture {
                    captures_searched.push(mv);
                } else {
                    quiets_searched.push(mv);
                }
            }
        }

        // Step 21. Mate and stalemate.
        if move_count == 0 {
            best_value = if excluded_move.is_some() {
                alpha
            } else if in_check {
                mated_in(ply)
            } else {
                VALUE_DRAW
            };
        } else {
            // Soften fail highs at non-PV nodes.
            if !pv_node
                && best_value >= beta
                && best_value.abs() < VALUE_TB_WIN_IN_MAX_PLY
                && beta.abs() < VALUE_TB_WIN_IN_MAX_PLY
                && alpha.abs() < VALUE_TB_WIN_IN_MAX_PLY
            {
                best_value = (best_value * (depth + 2) + beta) / (depth + 3);
            }

            if let Some(bm) = best_move {
                self.update_all_stats(
                    pos,
                    ply,
                    bm,
                    best_value,
                    beta,
                    depth,
                    &quiets_searched,
                    &captures_searched,
                );
            } else if prior_capture.is_none() && prev_sq.is_some() {
                // The whole node failed low: the previous move deserves some
                // of the credit.
                let prev = &self.stack[Self::spo(ply, -1)];
                let weight = (depth > 5) as i32
                    + (pv_node || cut_node) as i32
                    + (prev.stat_score < -14963) as i32
                    + (prev.move_count > 11) as i32
                    + (!in_check
                        && self.stack[Self::sp(ply)].static_eval != VALUE_NONE
                        && best_value <= self.stack[Self::sp(ply)].static_eval - 150)
                        as i32;
                let psq = prev_sq.unwrap();
                if let Some(pp) = pos.board().piece_on(psq) {
                    let pidx = piece_index(!us, pp);
                    self.update_continuation_histories_at(
                        ply,
                        1,
                        pidx,
                        psq.to_index(),
                        stat_bonus(depth) * weight,
                    );
                }
                if let Some(prev_mv) = prev_frame_move {
                    self.hist
                        .update_main(!us, prev_mv, stat_bonus(depth) * weight / 2);
                }
            }
        }

        if pv_node {
            best_value = best_value.min(max_value);
        }

        // A fail low in a former PV line keeps the flag alive upstream.
        if best_value <= alpha {
            let prev_tt_pv = self.stack[Self::spo(ply, -1)].tt_pv;
            self.stack[Self::sp(ply)].tt_pv = tt_pv || (prev_tt_pv && depth > 3);
        }

        // Step 22. Store the node.
        if excluded_move.is_none() && !(root_node && self.pv_idx > 0) {
            let bound = if best_value >= beta {
                Bound::Lower
            } else if pv_node && best_move.is_some() {
                Bound::Exact
            } else {
                Bound::Upper
            };
            self.tt.save(
                tt_slot,
                pos_key,
                value_to_tt(best_value, ply),
                self.stack[Self::sp(ply)].tt_pv,
                bound,
                depth,
                best_move,
                unadjusted_static_eval,
            );
        }

        // Step 23. Correction history learns from quiet eval errors.
        let static_eval = self.stack[Self::sp(ply)].static_eval;
        let best_is_quiet = best_move.map(|m| !pos.is_capture(m)).unwrap_or(true);
        if !in_check
            && static_eval != VALUE_NONE
            && best_is_quiet
            && !(best_value >= beta && best_value <= static_eval)
            && !(best_move.is_none() && best_value >= static_eval)
        {
            let bonus = ((best_value - static_eval) * depth / 8).clamp(
                -history::CORRECTION_HISTORY_LIMIT / 4,
                history::CORRECTION_HISTORY_LIMIT / 4,
            );
            self.hist.update_correction(us, pos.pawn_key(), bonus);
        }

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    // ================= quiescence =================

    pub fn qsearch(
        &mut self,
        pos: &mut Position,
        pv_node: bool,
        ply: usize,
        mut alpha: Value,
        beta: Value,
        depth: Depth,
    ) -> Value {
        debug_assert!(alpha >= -VALUE_INFINITE && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(depth <= 0);

        if pv_node {
            self.stack[Self::sp(ply)].pv.clear();
        }

        let us = pos.side_to_move();
        let in_check = pos.in_check();
        self.stack[Self::sp(ply)].in_check = in_check;
        if pv_node && self.sel_depth < ply as i32 + 1 {
            self.sel_depth = ply as i32 + 1;
        }

        // Step 2. Draws and the ply ceiling.
        if pos.is_draw(ply) || ply >= MAX_PLY - 1 {
            return if ply >= MAX_PLY - 1 && !in_check {
                eval::evaluate(pos.board(), self.optimism[us.to_index()])
            } else {
                VALUE_DRAW
            };
        }

        // Replacement priority of qsearch entries depends on whether checks
        // were included.
        let tt_depth = if in_check || depth >= DEPTH_QS_CHECKS {
            DEPTH_QS_CHECKS
        } else {
            DEPTH_QS_NO_CHECKS
        };

        // Step 3. TT lookup.
        let pos_key = pos.key();
        let (tt_slot, tt_entry) = self.tt.probe(pos_key);
        let tt_hit = tt_entry.is_some();
        let tt_value = tt_entry
            .map(|e| value_from_tt(e.value, ply, pos.rule50()))
            .unwrap_or(VALUE_NONE);
        let mut tt_move = tt_entry.and_then(|e| e.mv);
        if let Some(m) = tt_move {
            if !pos.board().legal(m) {
                tt_move = None;
            }
        }
        let pv_hit = tt_entry.map(|e| e.is_pv).unwrap_or(false);

        if !pv_node
            && tt_value != VALUE_NONE
            && tt_entry.map(|e| e.depth).unwrap_or(DEPTH_NONE) >= tt_depth
            && tt_entry
                .map(|e| e.bound.admits(tt_value >= beta))
                .unwrap_or(false)
        {
            return tt_value;
        }

        // Step 4. Stand pat.
        let mut unadjusted_static_eval = VALUE_NONE;
        let mut best_value;
        let mut futility_base = -VALUE_INFINITE;
        if in_check {
            best_value = -VALUE_INFINITE;
        } else {
            if let Some(e) = tt_entry {
                unadjusted_static_eval = if e.eval == VALUE_NONE {
                    eval::evaluate(pos.board(), self.optimism[us.to_index()])
                } else {
                    e.eval
                };
                let corrected =
                    unadjusted_static_eval + self.hist.correction(us, pos.pawn_key());
                best_value = clamp_to_static(corrected);
                self.stack[Self::sp(ply)].static_eval = best_value;
                if tt_value != VALUE_NONE && e.bound.admits(tt_value > best_value) {
                    best_value = tt_value;
                }
            } else {
                // After a null move the sign-flipped parent eval is free.
                unadjusted_static_eval = if self.stack[Self::spo(ply, -1)].was_null
                    && self.stack[Self::spo(ply, -1)].static_eval != VALUE_NONE
                {
                    -self.stack[Self::spo(ply, -1)].static_eval
                } else {
                    eval::evaluate(pos.board(), self.optimism[us.to_index()])
                };
                let corrected =
                    unadjusted_static_eval + self.hist.correction(us, pos.pawn_key());
                best_value = clamp_to_static(corrected);
                self.stack[Self::sp(ply)].static_eval = best_value;
            }

            if best_value >= beta {
                if !tt_hit {
                    self.tt.save(
                        tt_slot,
                        pos_key,
                        value_to_tt(best_value, ply),
                        false,
                        Bound::Lower,
                        DEPTH_NONE,
                        None,
                        unadjusted_static_eval,
                    );
                }
                return best_value;
            }
            if best_value > alpha {
                alpha = best_value;
            }
            futility_base = self.stack[Self::sp(ply)].static_eval + 226;
        }

        let prev_sq = self.stack[Self::spo(ply, -1)]
            .current_move
            .map(|m| m.get_dest());
        let ctx = self.picker_context(pos, ply);
        let mut picker = MovePicker::new_qsearch(pos, tt_move, depth);

        let mut best_move = None;
        let mut move_count = 0;
        let mut quiet_check_evasions = 0;

        // Step 5. Search captures, promotions, evasions and (near the
        // surface) quiet checks.
        while let Some(mv) = picker.next_move(pos, &self.hist, &ctx, false) {
            let gives_check = pos.gives_check(mv);
            let capture = pos.is_capture(mv);
            move_count += 1;

            // Step 6. Pruning.
            if best_value > VALUE_TB_LOSS_IN_MAX_PLY && pos.non_pawn_material(us) {
                if !gives_check
                    && Some(mv.get_dest()) != prev_sq
                    && futility_base > VALUE_TB_LOSS_IN_MAX_PLY
                    && mv.get_promotion().is_none()
                {
                    if move_count > 2 {
                        continue;
                    }
                    let futility_value = futility_base
                        + pos
                            .board()
                            .piece_on(mv.get_dest())
                            .map(piece_value)
                            .unwrap_or(0);
                    if futility_value <= alpha {
                        best_value = best_value.max(futility_value);
                        continue;
                    }
                    if futility_base <= alpha && !see_ge(pos, mv, 1) {
                        best_value = best_value.max(futility_base);
                        continue;
                    }
                    if futility_base > alpha && !see_ge(pos, mv, (alpha - futility_base) * 2 - 20)
                    {
                        best_value = alpha;
                        continue;
                    }
                }

                // Only the first couple of quiet ways out of check deserve
                // nodes; the rest almost never save the day.
                if quiet_check_evasions > 1 {
                    break;
                }

                if !capture {
                    let piece = pos.board().piece_on(mv.get_source()).unwrap();
                    let pc = piece_index(us, piece);
                    let to = mv.get_dest().to_index();
                    let c0 = ctx.cont[0]
                        .map(|c| self.hist.cont_history(c, pc, to))
                        .unwrap_or(0);
                    let c1 = ctx.cont[1]
                        .map(|c| self.hist.cont_history(c, pc, to))
                        .unwrap_or(0);
                    if c0 < 0 && c1 < 0 {
                        continue;
                    }
                }

                if !see_ge(pos, mv, -78) {
                    continue;
                }
            }

            let piece = pos.board().piece_on(mv.get_source()).unwrap();
            self.stack[Self::sp(ply)].current_move = Some(mv);
            self.stack[Self::sp(ply)].was_null = false;
            self.stack[Self::sp(ply)].cont_hist = Some(ContHistIndex {
                in_check,
                capture,
                piece: piece_index(us, piece),
                to: mv.get_dest().to_index(),
            });

            if !capture && in_check {
                quiet_check_evasions += 1;
            }

            // Step 7. Make and search.
            let st = pos.do_move(mv);
            self.bump_nodes();
            let value = -self.qsearch(pos, pv_node, ply + 1, -beta, -alpha, depth - 1);
            pos.undo_move(st);

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 8. New best move.
            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(mv);
                    if pv_node {
                        self.update_pv(ply, mv);
                    }
                    if value < beta {
                        alpha = value;
                    } else {
                        break; // Fail high.
                    }
                }
            }
        }

        // Step 9. Mated and nobody home.
        if in_check && best_value == -VALUE_INFINITE {
            return mated_in(ply);
        }

        if best_value.abs() < VALUE_TB_WIN_IN_MAX_PLY && best_value >= beta {
            best_value = (3 * best_value + beta) / 4;
        }

        self.tt.save(
            tt_slot,
            pos_key,
            value_to_tt(best_value, ply),
            pv_hit,
            if best_value >= beta {
                Bound::Lower
            } else {
                Bound::Upper
            },
            tt_depth,
            best_move,
            unadjusted_static_eval,
        );

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }
}
