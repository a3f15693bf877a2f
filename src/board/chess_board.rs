use anyhow::{anyhow, Context};
use shakmaty::{
    fen::Fen,
    san::SanPlus,
    uci::UciMove,
    zobrist::{Zobrist64, ZobristHash},
    CastlingMode, Chess, Color, EnPassantMode, Move, Position, Role,
};

use super::{Board, BoardStatus, DrawRule, MoveNotation, Side};

/// [`Board`] backed by `shakmaty`.
#[derive(Debug, Clone)]
pub struct ChessBoard {
    pos: Chess,
    start_fen: Option<String>,
    /// keys since the last irreversible move, current position included
    history: Vec<u64>,
    ply_count: u32,
}

impl ChessBoard {
    pub fn new() -> Self {
        Self::with_position(Chess::default(), None)
    }

    pub fn from_fen(fen: &str) -> anyhow::Result<Self> {
        let setup = Fen::from_ascii(fen.trim().as_bytes())
            .with_context(|| format!("invalid FEN '{fen}'"))?;
        let pos: Chess = setup
            .into_position(CastlingMode::Standard)
            .map_err(|e| anyhow!("illegal position '{fen}': {e}"))?;
        Ok(Self::with_position(pos, Some(fen.trim().to_string())))
    }

    /// Standard start position when `fen` is `None`.
    pub fn from_optional_fen(fen: Option<&str>) -> anyhow::Result<Self> {
        match fen {
            Some(fen) => Self::from_fen(fen),
            None => Ok(Self::new()),
        }
    }

    fn with_position(pos: Chess, start_fen: Option<String>) -> Self {
        let mut board = ChessBoard {
            pos,
            start_fen,
            history: Vec::new(),
            ply_count: 0,
        };
        board.history.push(board.key());
        board
    }

    fn to_move(&self, coordinate: &str) -> Option<Move> {
        let coordinate = self.normalize_castling(coordinate);
        let uci = UciMove::from_ascii(coordinate.as_bytes()).ok()?;
        uci.to_move(&self.pos).ok()
    }

    /// King-takes-own-rook castling (`e1h1`, as stored in Polyglot books) becomes
    /// king-to-destination (`e1g1`).
    fn normalize_castling(&self, coordinate: &str) -> String {
        let bytes = coordinate.as_bytes();
        if bytes.len() != 4 {
            return coordinate.to_string();
        }
        let Ok(uci) = UciMove::from_ascii(bytes) else {
            return coordinate.to_string();
        };
        let UciMove::Normal { from, to, .. } = uci else {
            return coordinate.to_string();
        };
        let board = self.pos.board();
        let is_castle = board.role_at(from) == Some(Role::King)
            && board.role_at(to) == Some(Role::Rook)
            && board.color_at(from) == board.color_at(to)
            && from.rank() == to.rank();
        if !is_castle {
            return coordinate.to_string();
        }
        let dest_file = if to.file() > from.file() { 'g' } else { 'c' };
        format!("{}{}{}", &coordinate[..2], dest_file, &coordinate[3..4])
    }
}

impl Default for ChessBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for ChessBoard {
    fn side_to_move(&self) -> Side {
        match self.pos.turn() {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }

    fn start_fen(&self) -> Option<&str> {
        self.start_fen.as_deref()
    }

    fn parse_move(&self, text: &str, notation: MoveNotation) -> Option<String> {
        let text = text.trim();
        let m = match notation {
            MoveNotation::Long => self.to_move(text)?,
            MoveNotation::Standard => {
                let san = SanPlus::from_ascii(text.as_bytes()).ok()?;
                san.san.to_move(&self.pos).ok()?
            }
        };
        Some(m.to_uci(CastlingMode::Standard).to_string())
    }

    fn move_to_string(&self, coordinate: &str, notation: MoveNotation) -> Option<String> {
        let m = self.to_move(coordinate)?;
        match notation {
            MoveNotation::Long => Some(m.to_uci(CastlingMode::Standard).to_string()),
            MoveNotation::Standard => {
                let mut scratch = self.pos.clone();
                Some(SanPlus::from_move_and_play_unchecked(&mut scratch, &m).to_string())
            }
        }
    }

    fn make_move(&mut self, coordinate: &str) -> anyhow::Result<()> {
        let m = self
            .to_move(coordinate)
            .with_context(|| format!("illegal move '{coordinate}'"))?;
        if m.is_zeroing() {
            self.history.clear();
        }
        self.pos.play_unchecked(&m);
        self.ply_count += 1;
        let key = self.key();
        self.history.push(key);
        Ok(())
    }

    fn status(&self) -> BoardStatus {
        if self.pos.is_checkmate() {
            return BoardStatus::Checkmate;
        }
        if self.pos.is_stalemate() {
            return BoardStatus::Stalemate;
        }
        if self.pos.is_insufficient_material() {
            return BoardStatus::Draw(DrawRule::InsufficientMaterial);
        }
        if let Some(current) = self.history.last() {
            if self.history.iter().filter(|k| *k == current).count() >= 3 {
                return BoardStatus::Draw(DrawRule::ThreefoldRepetition);
            }
        }
        if self.pos.halfmoves() >= 100 {
            return BoardStatus::Draw(DrawRule::FiftyMoves);
        }
        BoardStatus::Ongoing
    }

    fn key(&self) -> u64 {
        let hash: Zobrist64 = self.pos.zobrist_hash(EnPassantMode::Legal);
        hash.0
    }

    fn ply_count(&self) -> u32 {
        self.ply_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notation_conversion() {
        let board = ChessBoard::new();
        assert_eq!(
            board.parse_move("Nf3", MoveNotation::Standard).as_deref(),
            Some("g1f3")
        );
        assert_eq!(
            board.move_to_string("e2e4", MoveNotation::Standard).as_deref(),
            Some("e4")
        );
        assert_eq!(board.parse_move("e2e5", MoveNotation::Long), None);
        assert_eq!(board.parse_move("garbage", MoveNotation::Long), None);
    }

    #[test]
    fn polyglot_castling_is_normalized() {
        let board =
            ChessBoard::from_fen("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1").unwrap();
        assert_eq!(
            board.parse_move("e1h1", MoveNotation::Long).as_deref(),
            Some("e1g1")
        );
        assert_eq!(
            board.parse_move("e1a1", MoveNotation::Long).as_deref(),
            Some("e1c1")
        );
        assert_eq!(
            board.move_to_string("e1g1", MoveNotation::Standard).as_deref(),
            Some("O-O")
        );
    }

    #[test]
    fn start_position_key_matches_polyglot() {
        assert_eq!(ChessBoard::new().key(), 0x463b96181691fc9c);
    }

    #[test]
    fn fools_mate() {
        let mut board = ChessBoard::new();
        for m in ["f2f3", "e7e5", "g2g4", "d8h4"] {
            assert_eq!(board.status(), BoardStatus::Ongoing);
            board.make_move(m).unwrap();
        }
        assert_eq!(board.status(), BoardStatus::Checkmate);
        assert_eq!(board.side_to_move(), Side::White);
        assert_eq!(board.ply_count(), 4);
    }

    #[test]
    fn threefold_repetition() {
        let mut board = ChessBoard::new();
        for _ in 0..2 {
            for m in ["g1f3", "g8f6", "f3g1", "f6g8"] {
                board.make_move(m).unwrap();
            }
        }
        assert_eq!(
            board.status(),
            BoardStatus::Draw(DrawRule::ThreefoldRepetition)
        );
    }

    #[test]
    fn bare_kings() {
        let board = ChessBoard::from_fen("8/8/4k3/8/8/4K3/8/8 w - - 0 1").unwrap();
        assert_eq!(
            board.status(),
            BoardStatus::Draw(DrawRule::InsufficientMaterial)
        );
        assert!(ChessBoard::from_fen("not a fen").is_err());
    }
}
