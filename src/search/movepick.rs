//! Staged move picker.
//!
//! Emits pseudo-legal moves (all moves here are fully legal, the generator
//! only produces legal ones) in an order designed to cut off early: TT move,
//! winning captures, killer/counter refutations, quiets by history, losing
//! captures last. Quiescence skips the quiet stages and falls back to
//! evasions when in check.
//!
//! Moves are held in fixed arrays and extracted by selection sort, so only
//! the moves actually reached pay for their ordering.

use chess::{ChessMove, Color, MoveGen, Piece};

use crate::position::Position;
use crate::search::history::{ContHistIndex, HistoryTables};
use crate::types::{piece_index, piece_value, Depth, Value, DEPTH_QS_CHECKS};

/// Fixed-capacity scored move list.
struct MoveList {
    moves: [Option<ChessMove>; crate::types::MAX_MOVES],
    scores: [i32; crate::types::MAX_MOVES],
    len: usize,
}

impl MoveList {
    fn new() -> MoveList {
        MoveList {
            moves: [None; crate::types::MAX_MOVES],
            scores: [0; crate::types::MAX_MOVES],
            len: 0,
        }
    }

    #[inline]
    fn push(&mut self, mv: ChessMove, score: i32) {
        if self.len < self.moves.len() {
            self.moves[self.len] = Some(mv);
            self.scores[self.len] = score;
            self.len += 1;
        }
    }

    /// Selection sort step: swap the best remaining move to `index` and
    /// return it.
    fn pick(&mut self, index: usize) -> Option<(ChessMove, i32)> {
        if index >= self.len {
            return None;
        }
        let mut best = index;
        for i in index + 1..self.len {
            if self.scores[i] > self.scores[best] {
                best = i;
            }
        }
        if best != index {
            self.moves.swap(index, best);
            self.scores.swap(index, best);
        }
        Some((self.moves[index].unwrap(), self.scores[index]))
    }
}

/// Move loop context the picker cannot carry itself: which continuation
/// histories apply at this node.
#[derive(Clone, Copy)]
pub struct PickerContext {
    pub side: Color,
    pub pawn_index: usize,
    /// Continuation history hooks for plies -1, -2 and -4.
    pub cont: [Option<ContHistIndex>; 3],
}

impl Default for PickerContext {
    fn default() -> PickerContext {
        PickerContext {
            side: Color::White,
            pawn_index: 0,
            cont: [None; 3],
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    TtMove,
    CaptureInit,
    GoodCapture,
    Refutation,
    QuietInit,
    Quiet,
    BadCapture,
    EvasionInit,
    Evasion,
    QsCaptureInit,
    QsCapture,
    QsCheckInit,
    QsCheck,
    Done,
}

pub struct MovePicker {
    stage: Stage,
    tt_move: Option<ChessMove>,
    refutations: [Option<ChessMove>; 3],
    refutation_idx: usize,
    list: MoveList,
    bad_captures: MoveList,
    idx: usize,
    depth: Depth,
}

impl MovePicker {
    /// Picker for the main search.
    pub fn new(
        pos: &Position,
        tt_move: Option<ChessMove>,
        killers: [Option<ChessMove>; 2],
        counter: Option<ChessMove>,
        depth: Depth,
    ) -> MovePicker {
        let stage = if pos.in_check() {
            if tt_move.is_some() { Stage::TtMove } else { Stage::EvasionInit }
        } else if tt_move.is_some() {
            Stage::TtMove
        } else {
            Stage::CaptureInit
        };
        MovePicker {
            stage,
            tt_move,
            refutations: [killers[0], killers[1], counter],
            refutation_idx: 0,
            list: MoveList::new(),
            bad_captures: MoveList::new(),
            idx: 0,
            depth,
        }
    }

    /// Picker for the quiescence search. `depth` decides whether quiet
    /// checks are included.
    pub fn new_qsearch(pos: &Position, tt_move: Option<ChessMove>, depth: Depth) -> MovePicker {
        let stage = if pos.in_check() {
            if tt_move.is_some() { Stage::TtMove } else { Stage::EvasionInit }
        } else if tt_move.is_some() && Self::qs_tt_acceptable(pos, tt_move.unwrap(), depth) {
            Stage::TtMove
        } else {
            Stage::QsCaptureInit
        };
        MovePicker {
            stage,
            tt_move: if stage == Stage::TtMove { tt_move } else { None },
            refutations: [None; 3],
            refutation_idx: 0,
            list: MoveList::new(),
            bad_captures: MoveList::new(),
            idx: 0,
            depth,
        }
    }

    fn qs_tt_acceptable(pos: &Position, mv: ChessMove, depth: Depth) -> bool {
        pos.is_capture(mv) || mv.get_promotion().is_some() || depth >= DEPTH_QS_CHECKS
    }

    fn after_tt(&self, pos: &Position) -> Stage {
        if pos.in_check() {
            Stage::EvasionInit
        } else {
            match self.depth {
                d if d > 0 => Stage::CaptureInit,
                _ => Stage::QsCaptureInit,
            }
        }
    }

    pub fn next_move(
        &mut self,
        pos: &Position,
        hist: &HistoryTables,
        ctx: &PickerContext,
        skip_quiets: bool,
    ) -> Option<ChessMove> {
        loop {
            match self.stage {
                Stage::TtMove => {
                    self.stage = self.after_tt(pos);
                    let mv = self.tt_move?;
                    if pos.board().legal(mv) {
                        return Some(mv);
                    }
                    self.tt_move = None;
                }

                Stage::CaptureInit | Stage::QsCaptureInit => {
                    let next = if self.stage == Stage::CaptureInit {
                        Stage::GoodCapture
                    } else {
                        Stage::QsCapture
                    };
                    self.init_captures(pos, hist);
                    self.idx = 0;
                    self.stage = next;
                }

                Stage::GoodCapture => {
                    while let Some((mv, _)) = self.list.pick(self.idx) {
                        self.idx += 1;
                        if Some(mv) == self.tt_move {
                            continue;
                        }
                        if see_ge(pos, mv, 0) {
                            return Some(mv);
                        }
                        // Losers wait until everything else has been tried.
                        self.bad_captures.push(mv, 0);
                    }
                    self.refutation_idx = 0;
                    self.stage = Stage::Refutation;
                }

                Stage::Refutation => {
                    while self.refutation_idx < 3 {
                        let mv = self.refutations[self.refutation_idx];
                        self.refutation_idx += 1;
                        if let Some(mv) = mv {
                            if Some(mv) != self.tt_move
                                && !pos.is_capture(mv)
                                && mv.get_promotion().is_none()
                                && pos.board().legal(mv)
                                && !self.refutations[..self.refutation_idx - 1]
                                    .contains(&Some(mv))
                            {
                                return Some(mv);
                            }
                        }
                    }
                    self.stage = Stage::QuietInit;
                }

                Stage::QuietInit => {
                    if skip_quiets {
                        self.stage = Stage::BadCapture;
                        self.idx = 0;
                        continue;
                    }
                    self.init_quiets(pos, hist, ctx);
                    self.idx = 0;
                    self.stage = Stage::Quiet;
                }

                Stage::Quiet => {
                    if !skip_quiets {
                        while let Some((mv, _)) = self.list.pick(self.idx) {
                            self.idx += 1;
                            // Refutations were already emitted, but only the
                            // plain quiet ones; underpromotions stay here.
                            if Some(mv) == self.tt_move
                                || (mv.get_promotion().is_none() && self.is_refutation(mv))
                            {
                                continue;
                            }
                            return Some(mv);
                        }
                    }
                    self.stage = Stage::BadCapture;
                    self.idx = 0;
                }

                Stage::BadCapture => {
                    while self.idx < self.bad_captures.len {
                        let mv = self.bad_captures.moves[self.idx].unwrap();
                        self.idx += 1;
                        return Some(mv);
                    }
                    self.stage = Stage::Done;
                }

                Stage::EvasionInit => {
                    self.init_evasions(pos, hist, ctx);
                    self.idx = 0;
                    self.stage = Stage::Evasion;
                }

                Stage::Evasion => {
                    while let Some((mv, _)) = self.list.pick(self.idx) {
                        self.idx += 1;
                        if Some(mv) == self.tt_move {
                            continue;
                        }
                        return Some(mv);
                    }
                    self.stage = Stage::Done;
                }

                Stage::QsCapture => {
                    while let Some((mv, _)) = self.list.pick(self.idx) {
                        self.idx += 1;
                        if Some(mv) == self.tt_move {
                            continue;
                        }
                        return Some(mv);
                    }
                    if self.depth >= DEPTH_QS_CHECKS {
                        self.stage = Stage::QsCheckInit;
                    } else {
                        self.stage = Stage::Done;
                    }
                }

                Stage::QsCheckInit => {
                    self.init_quiet_checks(pos);
                    self.idx = 0;
                    self.stage = Stage::QsCheck;
                }

                Stage::QsCheck => {
                    while let Some((mv, _)) = self.list.pick(self.idx) {
                        self.idx += 1;
                        if Some(mv) == self.tt_move {
                            continue;
                        }
                        return Some(mv);
                    }
                    self.stage = Stage::Done;
                }

                Stage::Done => return None,
            }
        }
    }

    #[inline]
    fn is_refutation(&self, mv: ChessMove) -> bool {
        self.refutations.contains(&Some(mv))
    }

    /// Captures and queen promotions, scored by victim value plus capture
    /// history.
    fn init_captures(&mut self, pos: &Position, hist: &HistoryTables) {
        self.list = MoveList::new();
        for mv in MoveGen::new_legal(pos.board()) {
            let promo = mv.get_promotion();
            let capture = pos.is_capture(mv);
            if !capture && promo != Some(Piece::Queen) {
                continue;
            }
            let victim = pos.captured_on(mv);
            let piece = pos.board().piece_on(mv.get_source()).unwrap();
            let pc = piece_index(pos.side_to_move(), piece);
            let victim_idx = victim.unwrap_or(Piece::Pawn).to_index();
            let mut score = 7 * victim.map(piece_value).unwrap_or(0)
                + hist.capture_history(pc, mv.get_dest().to_index(), victim_idx);
            if promo == Some(Piece::Queen) {
                score += piece_value(Piece::Queen);
            }
            self.list.push(mv, score);
        }
    }

    /// Quiet moves scored by the blended history the search also prunes by.
    fn init_quiets(&mut self, pos: &Position, hist: &HistoryTables, ctx: &PickerContext) {
        self.list = MoveList::new();
        for mv in MoveGen::new_legal(pos.board()) {
            if pos.is_capture(mv) || mv.get_promotion() == Some(Piece::Queen) {
                continue;
            }
            self.list.push(mv, quiet_score(pos, hist, ctx, mv));
        }
    }

    /// All legal moves out of check. Captures first by victim value, quiets
    /// by main history.
    fn init_evasions(&mut self, pos: &Position, hist: &HistoryTables, ctx: &PickerContext) {
        self.list = MoveList::new();
        for mv in MoveGen::new_legal(pos.board()) {
            let score = if pos.is_capture(mv) {
                let victim = pos.captured_on(mv).unwrap_or(Piece::Pawn);
                1_000_000 + piece_value(victim)
            } else {
                hist.main_history(ctx.side, mv)
                    + ctx.cont[0]
                        .map(|c| {
                            let piece = pos.board().piece_on(mv.get_source()).unwrap();
                            hist.cont_history(
                                c,
                                piece_index(ctx.side, piece),
                                mv.get_dest().to_index(),
                            )
                        })
                        .unwrap_or(0)
            };
            self.list.push(mv, score);
        }
    }

    /// Non-capture checking moves for the deepest quiescence layer.
    fn init_quiet_checks(&mut self, pos: &Position) {
        self.list = MoveList::new();
        for mv in MoveGen::new_legal(pos.board()) {
            if pos.is_capture(mv) || mv.get_promotion().is_some() {
                continue;
            }
            if pos.gives_check(mv) {
                self.list.push(mv, 0);
            }
        }
    }
}

/// History blend used both for quiet ordering and for pruning decisions:
/// main + 2*cont[-1] + cont[-2] + cont[-4] + pawn structure history.
pub fn quiet_score(
    pos: &Position,
    hist: &HistoryTables,
    ctx: &PickerContext,
    mv: ChessMove,
) -> i32 {
    let piece = pos.board().piece_on(mv.get_source()).unwrap();
    let pc = piece_index(ctx.side, piece);
    let to = mv.get_dest().to_index();
    let mut score = hist.main_history(ctx.side, mv);
    if let Some(c) = ctx.cont[0] {
        score += 2 * hist.cont_history(c, pc, to);
    }
    if let Some(c) = ctx.cont[1] {
        score += hist.cont_history(c, pc, to);
    }
    if let Some(c) = ctx.cont[2] {
        score += hist.cont_history(c, pc, to);
    }
    score + hist.pawn_history(ctx.pawn_index, pc, to)
}

/// Static exchange evaluation: does this move win at least `threshold`
/// centipawns of material, assuming optimal recaptures on the target square?
///
/// Castling, promotions and en passant short-circuit to a material-neutral
/// answer; their exchanges are rare enough not to matter for ordering.
pub fn see_ge(pos: &Position, mv: ChessMove, threshold: Value) -> bool {
    use chess::{BitBoard, EMPTY};

    if mv.get_promotion().is_some() || pos.is_en_passant(mv) {
        return 0 >= threshold;
    }

    let board = pos.board();
    let from = mv.get_source();
    let to = mv.get_dest();

    let mut swap = board.piece_on(to).map(piece_value).unwrap_or(0) - threshold;
    if swap < 0 {
        return false;
    }
    swap = piece_value(board.piece_on(from).unwrap()) - swap;
    if swap <= 0 {
        return true;
    }

    let mut occupied =
        *board.combined() ^ BitBoard::from_square(from) ^ BitBoard::from_square(to);
    let mut stm = board.side_to_move();
    let mut attackers = pos.attackers_to(to, Color::White, occupied)
        | pos.attackers_to(to, Color::Black, occupied);
    let mut res = true;

    let diag = *board.pieces(Piece::Bishop) | *board.pieces(Piece::Queen);
    let line = *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);

    loop {
        stm = !stm;
        attackers &= occupied;
        let stm_attackers = attackers & *board.color_combined(stm);
        if stm_attackers == EMPTY {
            break;
        }
        res = !res;

        // Least valuable attacker recaptures; sliders behind it x-ray in.
        let mut captured = None;
        for piece in [
            Piece::Pawn,
            Piece::Knight,
            Piece::Bishop,
            Piece::Rook,
            Piece::Queen,
            Piece::King,
        ] {
            let bb = stm_attackers & *board.pieces(piece);
            if bb != EMPTY {
                captured = Some((piece, bb.to_square()));
                break;
            }
        }
        let (piece, sq) = captured.unwrap();

        if piece == Piece::King {
            // The king can only recapture if the opponent has run out.
            if attackers & *board.color_combined(!stm) != EMPTY {
                res = !res;
            }
            break;
        }

        swap = piece_value(piece) - swap;
        if swap < res as Value {
            break;
        }

        occupied ^= BitBoard::from_square(sq);
        match piece {
            Piece::Pawn | Piece::Bishop => {
                attackers |= chess::get_bishop_moves(to, occupied) & diag;
            }
            Piece::Rook => {
                attackers |= chess::get_rook_moves(to, occupied) & line;
            }
            Piece::Queen => {
                attackers |= (chess::get_bishop_moves(to, occupied) & diag)
                    | (chess::get_rook_moves(to, occupied) & line);
            }
            _ => {}
        }
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::Square;

    fn ctx() -> PickerContext {
        PickerContext::default()
    }

    #[test]
    fn tt_move_comes_first() {
        let pos = Position::startpos();
        let hist = HistoryTables::new();
        let tt = ChessMove::new(Square::E2, Square::E4, None);
        let mut picker = MovePicker::new(&pos, Some(tt), [None; 2], None, 4);
        let first = picker.next_move(&pos, &hist, &ctx(), false);
        assert_eq!(first, Some(tt));
    }

    #[test]
    fn picker_emits_every_legal_move_once() {
        let pos = Position::startpos();
        let hist = HistoryTables::new();
        let mut picker = MovePicker::new(&pos, None, [None; 2], None, 4);
        let mut seen = Vec::new();
        while let Some(mv) = picker.next_move(&pos, &hist, &ctx(), false) {
            assert!(!seen.contains(&mv), "{} emitted twice", mv);
            seen.push(mv);
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn skip_quiets_keeps_captures() {
        // A position with both captures and quiets available.
        let pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2")
                .unwrap();
        let hist = HistoryTables::new();
        let mut picker = MovePicker::new(&pos, None, [None; 2], None, 4);
        let mut any_quiet = false;
        while let Some(mv) = picker.next_move(&pos, &hist, &ctx(), true) {
            any_quiet |= !pos.is_capture(mv);
        }
        assert!(!any_quiet);
    }

    #[test]
    fn see_judges_simple_exchanges() {
        // Pawn takes defended pawn: even exchange, loses nothing.
        let pos = Position::from_fen("4k3/8/3p4/4p3/3P4/8/8/4K3 w - - 0 1").unwrap();
        let pxp = ChessMove::new(Square::D4, Square::E5, None);
        assert!(see_ge(&pos, pxp, 0));
        assert!(!see_ge(&pos, pxp, 50));

        // Queen takes defended pawn: loses the queen.
        let pos = Position::from_fen("4k3/8/3p4/4p3/8/8/8/3QK3 w - - 0 1").unwrap();
        let qxp = ChessMove::new(Square::D1, Square::E5, None);
        assert!(!see_ge(&pos, qxp, 0));
    }

    #[test]
    fn evasions_cover_all_legal_replies() {
        let pos =
            Position::from_fen("rnbqkbnr/ppp2ppp/8/1B1pp3/4P3/8/PPPP1PPP/RNBQK1NR b KQkq - 1 3")
                .unwrap();
        assert!(pos.in_check());
        let hist = HistoryTables::new();
        let mut picker = MovePicker::new(&pos, None, [None; 2], None, 4);
        let mut count = 0;
        while picker.next_move(&pos, &hist, &ctx(), false).is_some() {
            count += 1;
        }
        assert_eq!(count, pos.legal_moves().len());
    }
}
