//! Game results.

use std::fmt::Display;

use crate::board::{DrawRule, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameResult {
    /// Result of a game lost by `side`.
    pub fn loss_for(side: Side) -> GameResult {
        match side {
            Side::White => GameResult::BlackWin,
            Side::Black => GameResult::WhiteWin,
        }
    }

    pub fn winner(self) -> Option<Side> {
        match self {
            GameResult::WhiteWin => Some(Side::White),
            GameResult::BlackWin => Some(Side::Black),
            GameResult::Draw => None,
        }
    }

    /// 1, ½ or 0 from the point of view of `side`.
    pub fn score_for(self, side: Side) -> f64 {
        match self.winner() {
            None => 0.5,
            Some(winner) if winner == side => 1.0,
            Some(_) => 0.0,
        }
    }
}

impl Display for GameResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameResult::WhiteWin => write!(f, "1-0"),
            GameResult::BlackWin => write!(f, "0-1"),
            GameResult::Draw => write!(f, "1/2-1/2"),
        }
    }
}

/// Why a game was ended by the match runner rather than on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjudication {
    IllegalMove,
    /// the engine answered a legal move with "Illegal move"
    RejectedMove,
    Disconnection,
    StartFailure,
    ProtocolErrors,
    /// score-based resign adjudication
    ScoreResign,
    /// score-based draw adjudication
    ScoreDraw,
    MaxMoves,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Checkmate,
    Stalemate,
    Resignation,
    Timeout,
    Agreement,
    DrawRule(DrawRule),
    Adjudication(Adjudication),
}

/// Immutable result of one finished game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub result: GameResult,
    pub reason: Reason,
    /// full moves played
    pub move_count: u32,
}

impl Outcome {
    pub fn new(result: GameResult, reason: Reason, move_count: u32) -> Self {
        Outcome {
            result,
            reason,
            move_count,
        }
    }

    pub fn loss(loser: Side, reason: Reason, move_count: u32) -> Self {
        Self::new(GameResult::loss_for(loser), reason, move_count)
    }

    pub fn draw(reason: Reason, move_count: u32) -> Self {
        Self::new(GameResult::Draw, reason, move_count)
    }

    pub fn winner(&self) -> Option<Side> {
        self.result.winner()
    }

    pub fn is_draw(&self) -> bool {
        self.result == GameResult::Draw
    }

    /// Human readable explanation, e.g. "Black loses on time".
    pub fn description(&self) -> String {
        let winner = self.winner().unwrap_or(Side::White);
        let loser = winner.opposite();
        match self.reason {
            Reason::Checkmate => format!("{winner} mates"),
            Reason::Stalemate => "Draw by stalemate".to_string(),
            Reason::Resignation => format!("{loser} resigns"),
            Reason::Timeout => format!("{loser} loses on time"),
            Reason::Agreement => "Draw by mutual agreement".to_string(),
            Reason::DrawRule(DrawRule::FiftyMoves) => "Draw by fifty moves rule".to_string(),
            Reason::DrawRule(DrawRule::ThreefoldRepetition) => {
                "Draw by 3-fold repetition".to_string()
            }
            Reason::DrawRule(DrawRule::InsufficientMaterial) => {
                "Draw by insufficient mating material".to_string()
            }
            Reason::Adjudication(cause) => match cause {
                Adjudication::IllegalMove => format!("{loser} makes an illegal move"),
                Adjudication::RejectedMove => format!("{loser} rejects a legal move"),
                Adjudication::Disconnection => format!("{loser} disconnects"),
                Adjudication::StartFailure => format!("{loser}'s engine fails to start"),
                Adjudication::ProtocolErrors => format!("{loser} exceeds the protocol error limit"),
                Adjudication::ScoreResign => format!("{winner} wins by adjudication"),
                Adjudication::ScoreDraw => "Draw by adjudication".to_string(),
                Adjudication::MaxMoves => "Draw by maximum game length".to_string(),
            },
        }
    }
}

impl Display for Outcome {
    /// `1-0 {White mates}`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{{}}}", self.result, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_results() {
        let outcome = Outcome::loss(Side::Black, Reason::Timeout, 31);
        assert_eq!(outcome.to_string(), "1-0 {Black loses on time}");
        assert_eq!(outcome.result.score_for(Side::White), 1.0);
        assert_eq!(outcome.result.score_for(Side::Black), 0.0);

        let outcome = Outcome::loss(Side::White, Reason::Checkmate, 2);
        assert_eq!(outcome.to_string(), "0-1 {Black mates}");

        let outcome = Outcome::draw(Reason::DrawRule(DrawRule::ThreefoldRepetition), 40);
        assert_eq!(outcome.to_string(), "1/2-1/2 {Draw by 3-fold repetition}");
        assert!(outcome.is_draw());
        assert_eq!(outcome.result.score_for(Side::Black), 0.5);
    }
}
