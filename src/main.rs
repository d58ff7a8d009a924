//! Vanta - Main Entry Point
//!
//! Sets up the UCI handler (which owns the transposition table and the
//! search pool) and hands control to the protocol loop.

use anyhow::Result;
use vanta::uci::UciHandler;

fn main() -> Result<()> {
    let mut handler = UciHandler::new()?;
    handler.run();
    Ok(())
}
