// src/uci/mod.rs
//
// UCI protocol front-end. Commands come in on stdin, search output flows
// back through an mpsc channel so a single printer thread owns stdout.

use chess::ChessMove;
use std::io::{self, BufRead};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};

use crate::position::Position;
use crate::search::lazy_smp::SearchPool;
use crate::search::tt::TranspositionTable;
use crate::search::{Limits, Worker};
use crate::types::*;

const ENGINE_NAME: &str = "Vanta 0.3.1";
const DEFAULT_HASH_MB: usize = 64;

pub struct UciHandler {
    pool: SearchPool,
    position: Position,
    tx: mpsc::Sender<String>,
    hash_mb: usize,
}

impl UciHandler {
    pub fn new() -> anyhow::Result<UciHandler> {
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                println!("{}", msg);
            }
        });

        Ok(UciHandler {
            pool: SearchPool::new(DEFAULT_HASH_MB),
            position: Position::startpos(),
            tx,
            hash_mb: DEFAULT_HASH_MB,
        })
    }

    pub fn run(&mut self) {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(cmd) = line else { break };
            let cmd = cmd.trim();
            if cmd.is_empty() {
                continue;
            }
            if !self.handle_command(cmd) {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("uci") => {
                println!("id name {}", ENGINE_NAME);
                println!("id author the Vanta developers");
                println!("option name Hash type spin default {} min 1 max 33554432", DEFAULT_HASH_MB);
                println!("option name Threads type spin default 1 min 1 max 1024");
                println!("option name MultiPV type spin default 1 min 1 max 256");
                println!("option name Move Overhead type spin default 30 min 0 max 5000");
                println!("option name Skill Level type spin default 20 min 0 max 20");
                println!("option name UCI_LimitStrength type check default false");
                println!("option name UCI_Elo type spin default 1320 min 1320 max 3190");
                println!("option name UCI_ShowWDL type check default false");
                println!("option name SyzygyPath type string default <empty>");
                println!("option name SyzygyProbeLimit type spin default 7 min 0 max 7");
                println!("option name SyzygyProbeDepth type spin default 1 min 1 max 100");
                println!("option name Syzygy50MoveRule type check default true");
                println!("uciok");
            }
            Some("isready") => println!("readyok"),
            Some("ucinewgame") => {
                self.pool.clear();
                self.position = Position::startpos();
            }
            Some("setoption") => self.handle_setoption(&parts[1..]),
            Some("position") => self.handle_position(&parts[1..]),
            Some("go") => self.handle_go(&parts[1..]),
            Some("stop") => self.pool.stop(),
            Some("ponderhit") => self.pool.ponderhit(),
            Some("quit") => {
                self.pool.stop();
                return false;
            }
            _ => {}
        }
        true
    }

    fn handle_setoption(&mut self, parts: &[&str]) {
        let Some(value_idx) = parts.iter().position(|&p| p == "value") else {
            return;
        };
        if parts.first() != Some(&"name") || value_idx + 1 > parts.len() {
            return;
        }
        let name = parts[1..value_idx].join(" ").to_lowercase();
        let value = parts[(value_idx + 1)..].join(" ");

        match name.as_str() {
            "hash" => {
                if let Ok(mb) = value.parse::<usize>() {
                    // Reallocation is only safe with no search in flight.
                    self.pool.wait();
                    self.hash_mb = mb.max(1);
                    self.pool.tt = Arc::new(TranspositionTable::new(self.hash_mb));
                }
            }
            "threads" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.pool.options.threads = n.clamp(1, 1024);
                }
            }
            "multipv" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.pool.options.multi_pv = n.clamp(1, 256);
                }
            }
            "move overhead" => {
                if let Ok(ov) = value.parse::<u64>() {
                    self.pool.options.move_overhead = ov;
                }
            }
            "skill level" => {
                if let Ok(level) = value.parse::<i32>() {
                    self.pool.options.skill_level = level.clamp(0, 20);
                }
            }
            "uci_limitstrength" => {
                self.pool.options.limit_strength = value == "true";
            }
            "uci_elo" => {
                if let Ok(elo) = value.parse::<i32>() {
                    self.pool.options.uci_elo = elo.clamp(1320, 3190);
                }
            }
            "uci_showwdl" => {
                self.pool.options.show_wdl = value == "true";
            }
            "syzygypath" => {
                if value.is_empty() || value == "<empty>" {
                    return;
                }
                self.pool.wait();
                if let Some(tb) = Arc::get_mut(&mut self.pool.tb) {
                    match tb.load(&value) {
                        Ok(n) => println!("info string {} tablebase files found in {}", n, value),
                        Err(e) => println!("info string tablebase load failed: {}", e),
                    }
                }
            }
            "syzygyprobelimit" => {
                if let Ok(n) = value.parse::<u32>() {
                    self.pool.wait();
                    if let Some(tb) = Arc::get_mut(&mut self.pool.tb) {
                        tb.cardinality = n;
                    }
                }
            }
            "syzygyprobedepth" => {
                if let Ok(n) = value.parse::<i32>() {
                    self.pool.wait();
                    if let Some(tb) = Arc::get_mut(&mut self.pool.tb) {
                        tb.probe_depth = n;
                    }
                }
            }
            "syzygy50moverule" => {
                self.pool.wait();
                if let Some(tb) = Arc::get_mut(&mut self.pool.tb) {
                    tb.use_rule50 = value == "true";
                }
            }
            _ => {}
        }
    }

    fn handle_position(&mut self, parts: &[&str]) {
        let mut i = 0;
        let mut pos = if parts.first() == Some(&"startpos") {
            i = 1;
            Position::startpos()
        } else if parts.first() == Some(&"fen") {
            let mut fen_parts = Vec::new();
            i = 1;
            while i < parts.len() && parts[i] != "moves" {
                fen_parts.push(parts[i]);
                i += 1;
            }
            match Position::from_fen(&fen_parts.join(" ")) {
                Ok(p) => p,
                Err(_) => return,
            }
        } else {
            return;
        };

        if parts.get(i) == Some(&"moves") {
            for token in &parts[(i + 1)..] {
                let Some(mv) = parse_move(&pos, token) else { break };
                if pos.play_game_move(mv).is_err() {
                    break;
                }
            }
        }
        self.position = pos;
    }

    fn handle_go(&mut self, parts: &[&str]) {
        let mut limits = Limits {
            start_time: Some(std::time::Instant::now()),
            ..Limits::default()
        };

        let mut i = 0;
        while i < parts.len() {
            match parts[i] {
                "wtime" => limits.wtime = parse_next(parts, &mut i),
                "btime" => limits.btime = parse_next(parts, &mut i),
                "winc" => limits.winc = parse_next(parts, &mut i),
                "binc" => limits.binc = parse_next(parts, &mut i),
                "movestogo" => limits.movestogo = parse_next(parts, &mut i),
                "depth" => limits.depth = Some(parse_next::<Depth>(parts, &mut i)),
                "nodes" => limits.nodes = Some(parse_next(parts, &mut i)),
                "movetime" => limits.movetime = Some(parse_next(parts, &mut i)),
                "mate" => limits.mate = Some(parse_next(parts, &mut i)),
                "infinite" => limits.infinite = true,
                "ponder" => limits.ponder = true,
                "searchmoves" => {
                    while let Some(token) = parts.get(i + 1) {
                        match parse_move(&self.position, token) {
                            Some(mv) => {
                                limits.searchmoves.push(mv);
                                i += 1;
                            }
                            None => break,
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }

        self.pool
            .start_search(self.position.clone(), limits, self.tx.clone());
    }
}

fn parse_next<T: FromStr + Default>(parts: &[&str], i: &mut usize) -> T {
    *i += 1;
    parts
        .get(*i)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

/// Parse a UCI move string against the current position; promotion suffix
/// and castling come straight from the move generator's encoding.
pub fn parse_move(pos: &Position, token: &str) -> Option<ChessMove> {
    let mv = ChessMove::from_str(token).ok()?;
    if pos.board().legal(mv) {
        return Some(mv);
    }
    // Castling as king-takes-rook style inputs, or anything else unusual:
    // fall back to matching the generated legal moves textually.
    pos.legal_moves()
        .into_iter()
        .find(|m| m.to_string() == token)
}

/// "cp 23" or "mate 4" as UCI wants scores.
pub fn score_string(v: Value) -> String {
    if v.abs() >= VALUE_MATE_IN_MAX_PLY {
        let moves = (VALUE_MATE - v.abs() + 1) / 2;
        format!("mate {}", if v > 0 { moves } else { -moves })
    } else {
        format!("cp {}", v)
    }
}

/// Win probability in per mille for one side, from the eval and game ply.
/// Third-order polynomial fit from large fishtest-style data sets.
fn win_rate_model(v: Value, ply: u32) -> i32 {
    let m = ply.min(240) as f64 / 64.0;

    const AS: [f64; 4] = [0.38036525, -2.82015070, 23.17882135, 307.36768407];
    const BS: [f64; 4] = [-2.29434733, 13.27689788, -14.26828904, 63.45318330];

    let a = ((AS[0] * m + AS[1]) * m + AS[2]) * m + AS[3];
    let b = ((BS[0] * m + BS[1]) * m + BS[2]) * m + BS[3];

    let x = (v as f64).clamp(-4000.0, 4000.0);
    (0.5 + 1000.0 / (1.0 + ((a - x) / b).exp())) as i32
}

/// " wdl W D L" triple appended to info lines when UCI_ShowWDL is on.
pub fn wdl_string(v: Value, ply: u32) -> String {
    let w = win_rate_model(v, ply);
    let l = win_rate_model(-v, ply);
    let d = 1000 - w - l;
    format!(" wdl {} {} {}", w, d, l)
}

/// Format the full multipv info block for the current state of a worker.
/// Unsearched lines are reported with the previous iteration's score.
pub fn pv_lines(worker: &Worker, depth: Depth, show_wdl: bool) -> String {
    let elapsed = worker.time.elapsed_ms().max(1);
    let nodes = worker.shared.nodes.load(Ordering::Relaxed);
    let nps = nodes * 1000 / elapsed;
    let tb_hits = worker.shared.tb_hits.load(Ordering::Relaxed);
    let hashfull = worker.tt.hashfull();
    let multi_pv = worker.multi_pv.min(worker.root_moves.len());

    let mut out = String::new();
    for i in 0..multi_pv {
        let rm = &worker.root_moves[i];
        let updated = rm.score != -VALUE_INFINITE;
        if depth == 1 && !updated && i > 0 {
            continue;
        }

        let d = if updated { depth } else { (depth - 1).max(1) };
        let mut v = if updated { rm.uci_score } else { rm.previous_score };
        if v == -VALUE_INFINITE {
            v = VALUE_ZERO;
        }
        let tb = worker.root_in_tb && v.abs() <= VALUE_TB;
        let v = if tb { rm.tb_score } else { v };

        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "info depth {} seldepth {} multipv {} score {}",
            d,
            rm.sel_depth,
            i + 1,
            score_string(v)
        ));
        if show_wdl {
            out.push_str(&wdl_string(v, worker.root_game_ply));
        }
        if i == worker.pv_idx && !tb && updated {
            if rm.score_lowerbound {
                out.push_str(" lowerbound");
            } else if rm.score_upperbound {
                out.push_str(" upperbound");
            }
        }
        out.push_str(&format!(
            " nodes {} nps {} hashfull {} tbhits {} time {} pv",
            nodes, nps, hashfull, tb_hits, elapsed
        ));
        for mv in &rm.pv {
            out.push(' ');
            out.push_str(&mv.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_format_like_uci_expects() {
        assert_eq!(score_string(23), "cp 23");
        assert_eq!(score_string(mate_in(3)), "mate 2");
        assert_eq!(score_string(mated_in(4)), "mate -2");
    }

    #[test]
    fn win_rate_is_even_at_zero_eval() {
        // A zero eval in the early middlegame is close to a coin flip
        // between the draw and either side winning.
        let w = win_rate_model(0, 30);
        let l = win_rate_model(0, 30);
        assert_eq!(w, l);
        assert!(w < 500);
        // A crushing eval converts nearly always.
        assert!(win_rate_model(3000, 64) > 900);
    }

    #[test]
    fn moves_parse_against_position() {
        let pos = Position::startpos();
        assert!(parse_move(&pos, "e2e4").is_some());
        assert!(parse_move(&pos, "e2e5").is_none());
        let promo =
            Position::from_fen("8/4P3/8/8/8/7k/8/4K3 w - - 0 1").unwrap();
        let mv = parse_move(&promo, "e7e8q").unwrap();
        assert_eq!(mv.get_promotion(), Some(chess::Piece::Queen));
    }
}
