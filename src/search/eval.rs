// src/search/eval.rs
//
// Static evaluation oracle. The search treats this as a black box: a
// deterministic score from the side to move's viewpoint, clamped outside the
// tablebase range. Material plus piece-square tables plus a light king
// safety term, with an optimism nudge supplied by the caller.

use chess::{BitBoard, Board, Color, Piece, Square};

use crate::types::{clamp_to_static, Value};

pub const EVAL_PAWN: Value = 100;
pub const EVAL_KNIGHT: Value = 320;
pub const EVAL_BISHOP: Value = 330;
pub const EVAL_ROOK: Value = 500;
pub const EVAL_QUEEN: Value = 900;

const PAWN_PST: [Value; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0, 50, 50, 50, 50, 50, 50, 50, 50, 10, 10, 20, 30, 30, 20, 10, 10, 5, 5,
    10, 25, 25, 10, 5, 5, 0, 0, 0, 20, 20, 0, 0, 0, 5, -5, -10, 0, 0, -10, -5, 5, 5, 10, 10, -20,
    -20, 10, 10, 5, 0, 0, 0, 0, 0, 0, 0, 0,
];

const KNIGHT_PST: [Value; 64] = [
    -50, -40, -30, -30, -30, -30, -40, -50, -40, -20, 0, 0, 0, 0, -20, -40, -30, 0, 10, 15, 15,
    10, 0, -30, -30, 5, 15, 20, 20, 15, 5, -30, -30, 0, 15, 20, 20, 15, 0, -30, -30, 5, 10, 15,
    15, 10, 5, -30, -40, -20, 0, 5, 5, 0, -20, -40, -50, -40, -30, -30, -30, -30, -40, -50,
];

const BISHOP_PST: [Value; 64] = [
    -20, -10, -10, -10, -10, -10, -10, -20, -10, 0, 0, 0, 0, 0, 0, -10, -10, 0, 5, 10, 10, 5, 0,
    -10, -10, 5, 5, 10, 10, 5, 5, -10, -10, 0, 10, 10, 10, 10, 0, -10, -10, 10, 10, 10, 10, 10,
    10, -10, -10, 5, 0, 0, 0, 0, 5, -10, -20, -10, -10, -10, -10, -10, -10, -20,
];

const ROOK_PST: [Value; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0, 5, 10, 10, 10, 10, 10, 10, 5, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0,
    0, 0, 0, -5, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0, 0, 0, 0, -5, 0,
    0, 0, 5, 5, 0, 0, 0,
];

const QUEEN_PST: [Value; 64] = [
    -20, -10, -10, -5, -5, -10, -10, -20, -10, 0, 0, 0, 0, 0, 0, -10, -10, 0, 5, 5, 5, 5, 0, -10,
    -5, 0, 5, 5, 5, 5, 0, -5, 0, 0, 5, 5, 5, 5, 0, -5, -10, 5, 5, 5, 5, 5, 0, -10, -10, 0, 5, 0,
    0, 0, 0, -10, -20, -10, -10, -5, -5, -10, -10, -20,
];

const KING_PST: [Value; 64] = [
    -30, -40, -40, -50, -50, -40, -40, -30, -30, -40, -40, -50, -50, -40, -40, -30, -30, -40,
    -40, -50, -50, -40, -40, -30, -30, -40, -40, -50, -50, -40, -40, -30, -20, -30, -30, -40,
    -40, -30, -30, -20, -10, -20, -20, -20, -20, -20, -20, -10, 20, 20, 0, 0, 0, 0, 20, 20, 20,
    30, 10, 0, 0, 10, 30, 20,
];

/// Full static evaluation, white-relative internally, returned from the side
/// to move's viewpoint. `optimism` is the root-side bias the searcher keeps
/// per color; it leans the score toward the side we are optimistic for.
pub fn evaluate(board: &Board, optimism: Value) -> Value {
    let mut score = 0;

    for sq in *board.combined() {
        let piece = board.piece_on(sq).unwrap();
        let color = board.color_on(sq).unwrap();
        let idx = pst_index(sq, color);

        let val = match piece {
            Piece::Pawn => EVAL_PAWN + PAWN_PST[idx],
            Piece::Knight => EVAL_KNIGHT + KNIGHT_PST[idx],
            Piece::Bishop => EVAL_BISHOP + BISHOP_PST[idx],
            Piece::Rook => EVAL_ROOK + ROOK_PST[idx],
            Piece::Queen => EVAL_QUEEN + QUEEN_PST[idx],
            Piece::King => KING_PST[idx],
        };

        if color == Color::White {
            score += val;
        } else {
            score -= val;
        }
    }

    score += king_safety(board, Color::White);
    score -= king_safety(board, Color::Black);

    let mut v = if board.side_to_move() == Color::White {
        score + 10
    } else {
        -score + 10
    };
    v += optimism * (100 + v.abs().min(400)) / 512;

    clamp_to_static(v)
}

/// Cheap material-only estimate, side to move's viewpoint.
pub fn simple_eval(board: &Board) -> Value {
    let mut score = 0;
    let material = [
        (Piece::Pawn, EVAL_PAWN),
        (Piece::Knight, EVAL_KNIGHT),
        (Piece::Bishop, EVAL_BISHOP),
        (Piece::Rook, EVAL_ROOK),
        (Piece::Queen, EVAL_QUEEN),
    ];
    for &(piece, val) in &material {
        let bb = board.pieces(piece);
        score += val * (bb & board.color_combined(Color::White)).popcnt() as Value;
        score -= val * (bb & board.color_combined(Color::Black)).popcnt() as Value;
    }
    if board.side_to_move() == Color::White {
        score
    } else {
        -score
    }
}

fn king_safety(board: &Board, color: Color) -> Value {
    let king_sq = board.king_square(color);
    let enemy = board.color_combined(!color);
    let zone = king_zone(king_sq);
    let attackers = (zone & enemy).popcnt() as Value;
    -attackers * 12
}

fn king_zone(sq: Square) -> BitBoard {
    let mut mask = 0u64;
    let r = sq.get_rank().to_index() as i32;
    let f = sq.get_file().to_index() as i32;
    for dr in -1..=1 {
        for df in -1..=1 {
            let nr = r + dr;
            let nf = f + df;
            if (0..8).contains(&nr) && (0..8).contains(&nf) {
                mask |= 1 << (nr * 8 + nf);
            }
        }
    }
    BitBoard::new(mask)
}

fn pst_index(sq: Square, color: Color) -> usize {
    let rank = sq.get_rank().to_index();
    let file = sq.get_file().to_index();
    if color == Color::White {
        (7 - rank) * 8 + file
    } else {
        rank * 8 + file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn startpos_is_balanced() {
        let board = Board::default();
        let v = evaluate(&board, 0);
        assert!(v.abs() <= 20, "startpos eval {} too far from zero", v);
        assert_eq!(simple_eval(&board), 0);
    }

    #[test]
    fn eval_is_side_symmetric() {
        // Color-mirrored position with the mover swapped scores identically
        // from the mover's viewpoint.
        let white_up = Board::from_str("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
        let mirrored = Board::from_str("4k3/4p3/8/8/8/8/8/4K3 b - - 0 1").unwrap();
        assert_eq!(evaluate(&white_up, 0), evaluate(&mirrored, 0));
        assert!(simple_eval(&white_up) > 0);
    }

    #[test]
    fn extra_queen_dominates() {
        let board = Board::from_str("4k3/8/8/8/8/8/8/3QK3 w - - 0 1").unwrap();
        assert!(evaluate(&board, 0) > 700);
        assert!(evaluate(&board, 0) < crate::types::VALUE_TB_WIN_IN_MAX_PLY);
    }
}
