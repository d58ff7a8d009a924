//! Syzygy endgame tablebase probing.
//!
//! Uses shakmaty-syzygy to probe WDL (and DTZ at the root) when few enough
//! pieces remain. Conversion goes chess::Board → FEN → shakmaty::Chess; the
//! cost is irrelevant at the piece counts where tables apply.

use chess::Board;
use shakmaty::fen::Fen;
use shakmaty::CastlingMode;
use shakmaty_syzygy::{Tablebase, Wdl};
use std::path::Path;

use crate::position::Position;
use crate::types::{Bound, Value, VALUE_DRAW, VALUE_TB};

/// Result of a WDL probe from the side to move's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbWdl {
    Win,
    CursedWin,
    Draw,
    BlessedLoss,
    Loss,
}

impl TbWdl {
    fn from_shakmaty(wdl: Wdl) -> TbWdl {
        match wdl {
            Wdl::Win => TbWdl::Win,
            Wdl::CursedWin => TbWdl::CursedWin,
            Wdl::Draw => TbWdl::Draw,
            Wdl::BlessedLoss => TbWdl::BlessedLoss,
            Wdl::Loss => TbWdl::Loss,
        }
    }

    /// Signed WDL in -2..=2, the way probe results are compared.
    #[inline]
    pub fn signum(self) -> i32 {
        match self {
            TbWdl::Win => 2,
            TbWdl::CursedWin => 1,
            TbWdl::Draw => 0,
            TbWdl::BlessedLoss => -1,
            TbWdl::Loss => -2,
        }
    }
}

/// Tablebase adapter plus the probing policy options.
pub struct SyzygyTb {
    tb: Option<Tablebase<shakmaty::Chess>>,
    max_pieces: usize,
    /// Probe only positions with at most this many pieces.
    pub cardinality: u32,
    /// Below this depth, equal-cardinality positions are not probed.
    pub probe_depth: i32,
    /// Honor the fifty-move rule when scoring cursed wins/blessed losses.
    pub use_rule50: bool,
}

impl SyzygyTb {
    pub fn empty() -> SyzygyTb {
        SyzygyTb {
            tb: None,
            max_pieces: 0,
            cardinality: 0,
            probe_depth: 1,
            use_rule50: true,
        }
    }

    /// Load tables from a directory. Keeps previously loaded tables on top.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<usize> {
        let mut tb = self.tb.take().unwrap_or_else(Tablebase::new);
        let count = tb.add_directory(path.as_ref())?;
        self.max_pieces = tb.max_pieces();
        self.cardinality = self.cardinality.max(self.max_pieces as u32);
        self.tb = Some(tb);
        Ok(count)
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.tb.is_some() && self.cardinality >= 3
    }

    #[inline]
    pub fn effective_cardinality(&self) -> u32 {
        (self.cardinality).min(self.max_pieces as u32)
    }

    fn to_shakmaty(board: &Board) -> Option<shakmaty::Chess> {
        let fen: Fen = board.to_string().parse().ok()?;
        fen.into_position(CastlingMode::Standard).ok()
    }

    /// WDL after the last zeroing move, for the side to move.
    pub fn probe_wdl(&self, board: &Board) -> Option<TbWdl> {
        let tb = self.tb.as_ref()?;
        let pos = Self::to_shakmaty(board)?;
        tb.probe_wdl_after_zeroing(&pos)
            .ok()
            .map(TbWdl::from_shakmaty)
    }

    /// Rank for root move ordering: WDL of the position after the move, from
    /// our side. None if the child cannot be probed.
    pub fn rank_move(&self, pos: &Position, mv: chess::ChessMove) -> Option<i32> {
        let child = pos.board().make_move_new(mv);
        // WDL comes back from the opponent's view.
        self.probe_wdl(&child).map(|w| -w.signum())
    }
}

/// Translate a signed WDL into a search score and the bound it proves.
/// Wins and losses land in the dedicated TB range just below mate scores so
/// that shorter paths to conversion still order first.
pub fn wdl_to_value(wdl: TbWdl, ply: usize, use_rule50: bool) -> (Value, Bound) {
    let draw_score = use_rule50 as i32;
    let tb_value = VALUE_TB - ply as Value;
    let w = wdl.signum();
    if w < -draw_score {
        (-tb_value, Bound::Upper)
    } else if w > draw_score {
        (tb_value, Bound::Lower)
    } else {
        (VALUE_DRAW + 2 * w * draw_score, Bound::Exact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VALUE_TB_WIN_IN_MAX_PLY;

    #[test]
    fn wdl_scores_stay_in_tb_range() {
        let (win, b) = wdl_to_value(TbWdl::Win, 12, true);
        assert!(win > VALUE_TB_WIN_IN_MAX_PLY);
        assert!(win < crate::types::VALUE_MATE_IN_MAX_PLY);
        assert_eq!(b, Bound::Lower);

        let (loss, b) = wdl_to_value(TbWdl::Loss, 12, true);
        assert_eq!(loss, -win);
        assert_eq!(b, Bound::Upper);

        // Cursed win scores as a nominal draw when the rule is honored, and
        // as a full win when it is not.
        let (cursed, b) = wdl_to_value(TbWdl::CursedWin, 12, true);
        assert_eq!(cursed, 2);
        assert_eq!(b, Bound::Exact);
        let (cursed_off, _) = wdl_to_value(TbWdl::CursedWin, 12, false);
        assert!(cursed_off > VALUE_TB_WIN_IN_MAX_PLY);
    }

    #[test]
    fn empty_adapter_is_disabled() {
        let tb = SyzygyTb::empty();
        assert!(!tb.enabled());
        assert!(tb.probe_wdl(&Board::default()).is_none());
    }
}
