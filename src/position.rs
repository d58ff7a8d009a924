//! Thin game-state wrapper around `chess::Board`.
//!
//! The `chess` crate gives us legal move generation, copy-make and zobrist
//! hashing, but it does not track the halfmove clock or earlier positions.
//! Search needs both (fifty-move rule, repetition detection, tablebase
//! gating), so `Position` carries them alongside the board.

use anyhow::{anyhow, Result};
use chess::{BitBoard, Board, ChessMove, Color, MoveGen, Piece, Square, EMPTY};
use std::str::FromStr;

/// Saved state for undoing a move. Copy-make: the whole board is kept.
#[derive(Clone, Copy)]
pub struct StateInfo {
    board: Board,
    rule50: u32,
    captured: Option<Piece>,
}

#[derive(Clone)]
pub struct Position {
    board: Board,
    rule50: u32,
    game_ply: u32,
    /// Zobrist keys of all positions played before the search root, oldest
    /// first. Used for threefold detection across the game.
    game_keys: Vec<u64>,
    /// Keys of positions reached on the current search path, root included.
    path_keys: Vec<u64>,
    /// Piece captured by the last move, if any.
    captured: Option<Piece>,
}

impl Position {
    pub fn startpos() -> Position {
        Position::from_board(Board::default(), 0, 0)
    }

    pub fn from_board(board: Board, rule50: u32, game_ply: u32) -> Position {
        Position {
            board,
            rule50,
            game_ply,
            game_keys: Vec::new(),
            path_keys: vec![board.get_hash()],
            captured: None,
        }
    }

    /// Parse a FEN, keeping the halfmove clock and fullmove number that
    /// `chess::Board` itself discards.
    pub fn from_fen(fen: &str) -> Result<Position> {
        let board = Board::from_str(fen).map_err(|e| anyhow!("bad fen '{}': {}", fen, e))?;
        let mut fields = fen.split_whitespace();
        let rule50 = fields.nth(4).and_then(|f| f.parse().ok()).unwrap_or(0);
        let fullmove: u32 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(1);
        let game_ply =
            2 * fullmove.saturating_sub(1) + (board.side_to_move() == Color::Black) as u32;
        Ok(Position::from_board(board, rule50, game_ply))
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.board.get_hash()
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    #[inline]
    pub fn rule50(&self) -> u32 {
        self.rule50
    }

    #[inline]
    pub fn game_ply(&self) -> u32 {
        self.game_ply
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        *self.board.checkers() != EMPTY
    }

    #[inline]
    pub fn piece_count(&self) -> u32 {
        self.board.combined().popcnt()
    }

    #[inline]
    pub fn has_castling_rights(&self) -> bool {
        self.board.castle_rights(Color::White) != chess::CastleRights::NoRights
            || self.board.castle_rights(Color::Black) != chess::CastleRights::NoRights
    }

    /// Piece captured by the previous `do_move`, if any.
    #[inline]
    pub fn captured_piece(&self) -> Option<Piece> {
        self.captured
    }

    /// True if `side` has anything besides pawns and the king. Null move and
    /// several pruning heuristics are unsound in pawn endings.
    pub fn non_pawn_material(&self, side: Color) -> bool {
        let us = self.board.color_combined(side);
        let pawns_kings = self.board.pieces(Piece::Pawn) | self.board.pieces(Piece::King);
        us & !pawns_kings != EMPTY
    }

    /// A capture or a queen promotion; the moves the quiescence search keeps.
    #[inline]
    pub fn is_capture(&self, mv: ChessMove) -> bool {
        self.board.piece_on(mv.get_dest()).is_some() || self.is_en_passant(mv)
    }

    #[inline]
    pub fn is_en_passant(&self, mv: ChessMove) -> bool {
        self.board.piece_on(mv.get_source()) == Some(Piece::Pawn)
            && mv.get_source().get_file() != mv.get_dest().get_file()
            && self.board.piece_on(mv.get_dest()).is_none()
    }

    /// Piece sitting on the capture square (the pawn itself for en passant).
    #[inline]
    pub fn captured_on(&self, mv: ChessMove) -> Option<Piece> {
        if self.is_en_passant(mv) {
            Some(Piece::Pawn)
        } else {
            self.board.piece_on(mv.get_dest())
        }
    }

    /// Does this move give check? Resolved by making the move; the chess
    /// crate keeps this cheap enough for move loops.
    #[inline]
    pub fn gives_check(&self, mv: ChessMove) -> bool {
        *self.board.make_move_new(mv).checkers() != EMPTY
    }

    pub fn do_move(&mut self, mv: ChessMove) -> StateInfo {
        let st = StateInfo {
            board: self.board,
            rule50: self.rule50,
            captured: self.captured,
        };
        let capture = self.is_capture(mv);
        let pawn_move = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        self.captured = self.captured_on(mv);
        self.board = self.board.make_move_new(mv);
        self.rule50 = if capture || pawn_move { 0 } else { self.rule50 + 1 };
        self.game_ply += 1;
        self.path_keys.push(self.board.get_hash());
        st
    }

    /// Pass the turn. Only valid when not in check.
    pub fn do_null_move(&mut self) -> Option<StateInfo> {
        let next = self.board.null_move()?;
        let st = StateInfo {
            board: self.board,
            rule50: self.rule50,
            captured: self.captured,
        };
        self.board = next;
        self.rule50 += 1;
        self.game_ply += 1;
        self.captured = None;
        self.path_keys.push(self.board.get_hash());
        Some(st)
    }

    pub fn undo_move(&mut self, st: StateInfo) {
        self.board = st.board;
        self.rule50 = st.rule50;
        self.captured = st.captured;
        self.game_ply -= 1;
        self.path_keys.pop();
    }

    /// Record a move played on the game timeline (UCI `position ... moves`).
    /// Unlike `do_move` the previous key moves into the game history.
    pub fn play_game_move(&mut self, mv: ChessMove) -> Result<()> {
        if !self.board.legal(mv) {
            return Err(anyhow!("illegal move {}", mv));
        }
        self.game_keys.push(self.board.get_hash());
        let capture = self.is_capture(mv);
        let pawn_move = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        self.board = self.board.make_move_new(mv);
        self.rule50 = if capture || pawn_move { 0 } else { self.rule50 + 1 };
        self.game_ply += 1;
        if capture || pawn_move {
            // Irreversible: nothing before this point can repeat.
            self.game_keys.clear();
        }
        self.path_keys.clear();
        self.path_keys.push(self.board.get_hash());
        self.captured = None;
        Ok(())
    }

    /// Draw by insufficient material, repetition or the fifty-move rule.
    ///
    /// A single repetition within the search path counts (the repeated line
    /// can be forced), while positions from the pre-root game must occur
    /// twice more to make an actual threefold.
    pub fn is_draw(&self, ply: usize) -> bool {
        if self.insufficient_material() {
            return true;
        }
        if self.rule50 >= 100 && (!self.in_check() || self.has_legal_moves()) {
            return true;
        }
        self.is_repetition(ply)
    }

    /// Bare kings, or kings plus a single minor piece. Nobody can ever mate.
    pub fn insufficient_material(&self) -> bool {
        let b = &self.board;
        let heavy =
            b.pieces(Piece::Queen) | b.pieces(Piece::Rook) | b.pieces(Piece::Pawn);
        if heavy != EMPTY {
            return false;
        }
        (b.pieces(Piece::Knight) | b.pieces(Piece::Bishop)).popcnt() <= 1
    }

    pub fn is_repetition(&self, _ply: usize) -> bool {
        let key = self.key();
        let last = self.path_keys.len() - 1;
        let span = (self.rule50 as usize).min(last);
        // Twofold inside the search tree is already a draw for us: the line
        // leading back here can be forced again.
        let mut i = 4;
        while i <= span {
            if self.path_keys[last - i] == key {
                return true;
            }
            i += 2;
        }
        // Positions from before the root must occur twice more for a real
        // threefold. game_keys only holds positions since the last
        // irreversible move, so every entry is still reachable.
        let mut reps = 0;
        for k in self.game_keys.iter().rev() {
            if *k == key {
                reps += 1;
                if reps >= 2 {
                    return true;
                }
            }
        }
        false
    }

    /// True if any position on the current search path, back to the last
    /// irreversible move, has already occurred before. Keys carry the side
    /// to move, so stepping two plies at a time is purely an optimization.
    pub fn has_repeated(&self) -> bool {
        let last = self.path_keys.len() - 1;
        let mut window = (self.rule50 as usize).min(last);
        let mut j = last;
        while window >= 4 {
            let key = self.path_keys[j];
            let mut i = 4;
            while i <= window {
                if self.path_keys[j - i] == key {
                    return true;
                }
                i += 2;
            }
            if self.game_keys.iter().rev().any(|k| *k == key) {
                return true;
            }
            j -= 1;
            window -= 1;
        }
        false
    }

    pub fn has_legal_moves(&self) -> bool {
        MoveGen::new_legal(&self.board).next().is_some()
    }

    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    /// Small mixing hash over the pawn structure. Indexes the pawn history
    /// and the correction history, so it only needs to spread well over a few
    /// thousand buckets.
    pub fn pawn_key(&self) -> u64 {
        let w = (self.board.pieces(Piece::Pawn) & self.board.color_combined(Color::White)).0;
        let b = (self.board.pieces(Piece::Pawn) & self.board.color_combined(Color::Black)).0;
        let mut h = w.wrapping_mul(0x9E3779B97F4A7C15) ^ b.rotate_left(32).wrapping_mul(0xC2B2AE3D27D4EB4F);
        h ^= h >> 29;
        h = h.wrapping_mul(0xBF58476D1CE4E5B9);
        h ^= h >> 32;
        h
    }

    /// All pieces of `side` attacking `sq`, given `occupied` blockers.
    /// Used by the static exchange evaluation.
    pub fn attackers_to(&self, sq: Square, side: Color, occupied: BitBoard) -> BitBoard {
        let b = &self.board;
        let pawns = *b.pieces(Piece::Pawn) & *b.color_combined(side);
        let mut att = chess::get_pawn_attacks(sq, !side, pawns);
        att |= chess::get_knight_moves(sq) & *b.pieces(Piece::Knight);
        att |= chess::get_king_moves(sq) & *b.pieces(Piece::King);
        let diag = *b.pieces(Piece::Bishop) | *b.pieces(Piece::Queen);
        att |= chess::get_bishop_moves(sq, occupied) & diag;
        let line = *b.pieces(Piece::Rook) | *b.pieces(Piece::Queen);
        att |= chess::get_rook_moves(sq, occupied) & line;
        att & *b.color_combined(side) & occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fen_keeps_rule50_and_ply() {
        let pos = Position::from_fen("8/8/8/8/3k4/8/3K4/8 w - - 12 34").unwrap();
        assert_eq!(pos.rule50(), 12);
        assert_eq!(pos.game_ply(), 66);
    }

    #[test]
    fn do_undo_round_trip() {
        let mut pos = Position::startpos();
        let key = pos.key();
        let mv = ChessMove::new(Square::E2, Square::E4, None);
        let st = pos.do_move(mv);
        assert_ne!(pos.key(), key);
        assert_eq!(pos.rule50(), 0);
        pos.undo_move(st);
        assert_eq!(pos.key(), key);
    }

    #[test]
    fn repetition_detected_on_shuffle() {
        let mut pos = Position::from_fen("8/8/8/8/3k4/8/3K4/8 w - - 0 1").unwrap();
        let d2c2 = ChessMove::new(Square::D2, Square::C2, None);
        let d4c4 = ChessMove::new(Square::D4, Square::C4, None);
        let c2d2 = ChessMove::new(Square::C2, Square::D2, None);
        let c4d4 = ChessMove::new(Square::C4, Square::D4, None);
        pos.do_move(d2c2);
        pos.do_move(d4c4);
        assert!(!pos.has_repeated());
        pos.do_move(c2d2);
        pos.do_move(c4d4);
        // Back to the root position after four reversible plies.
        assert!(pos.is_repetition(4));
        assert!(pos.has_repeated());
    }

    #[test]
    fn en_passant_is_a_capture() {
        let mut pos = Position::from_fen(
            "rnbqkbnr/pppp1ppp/8/8/4pP2/8/PPPPP1PP/RNBQKBNR b KQkq f3 0 3",
        )
        .unwrap();
        let ep = ChessMove::new(Square::E4, Square::F3, None);
        assert!(pos.is_en_passant(ep));
        assert!(pos.is_capture(ep));
        assert_eq!(pos.captured_on(ep), Some(Piece::Pawn));
        pos.do_move(ep);
        assert_eq!(pos.rule50(), 0);
    }

    #[test]
    fn non_pawn_material_flags_pawn_endings() {
        let pos = Position::from_fen("4k3/8/8/3p4/4P3/8/8/4K3 w - - 0 1").unwrap();
        assert!(!pos.non_pawn_material(Color::White));
        let pos = Position::startpos();
        assert!(pos.non_pawn_material(Color::White));
    }
}
