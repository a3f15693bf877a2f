//! Board collaborator.
//!
//! Chess rules live behind the [`Board`] trait; the crate itself only moves text around.
//! Moves are exchanged with a board in coordinate notation (`e2e4`, `e7e8q`, castling as
//! king-to-destination `e1g1`), which is also how a [`Game`](crate::game::Game) records
//! them.

use std::fmt::Display;

mod chess_board;

pub use chess_board::ChessBoard;

/// Color of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// 0 for white, 1 for black
    pub fn index(self) -> usize {
        match self {
            Side::White => 0,
            Side::Black => 1,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::White => write!(f, "White"),
            Side::Black => write!(f, "Black"),
        }
    }
}

/// Textual move format an engine wants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveNotation {
    /// Long algebraic / coordinate notation (`e2e4`)
    #[default]
    Long,
    /// Standard algebraic notation (`Nf3`)
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawRule {
    FiftyMoves,
    ThreefoldRepetition,
    InsufficientMaterial,
}

/// What the board says about the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardStatus {
    Ongoing,
    /// the side to move is mated
    Checkmate,
    Stalemate,
    Draw(DrawRule),
}

/// Move legality, notation conversion and game-end detection.
pub trait Board: Send {
    fn side_to_move(&self) -> Side;

    /// Start position as FEN, `None` for the standard start position.
    fn start_fen(&self) -> Option<&str>;

    /// Validate `text` (in `notation`) against the current position.
    ///
    /// Returns the move in coordinate notation, or `None` when the text is not a legal move.
    fn parse_move(&self, text: &str, notation: MoveNotation) -> Option<String>;

    /// Render a legal coordinate move in `notation`.
    fn move_to_string(&self, coordinate: &str, notation: MoveNotation) -> Option<String>;

    /// Play a legal coordinate move.
    fn make_move(&mut self, coordinate: &str) -> anyhow::Result<()>;

    fn status(&self) -> BoardStatus;

    /// Polyglot Zobrist key of the current position.
    fn key(&self) -> u64;

    /// Number of half-moves played since the start position.
    fn ply_count(&self) -> u32;
}
