//! One game between two players.
//!
//! [`Game::play`] runs on its own thread (see [`GameManager`](crate::game_manager::GameManager)):
//! it waits for both players to be ready, forces the opening, then alternates `go` and
//! [`PlayerEvent::Move`] until the board, the clock, a player or an adjudication rule ends
//! the game. Waiting for a move is the only place the game blocks, and it never waits
//! longer than the mover's clock allows.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, instrument, warn};

use crate::{
    board::{Board, BoardStatus, MoveNotation, Side},
    opening_book::OpeningBook,
    outcome::{Adjudication, GameResult, Outcome, Reason},
    player::{Player, PlayedMove, PlayerEvent},
};

/// Poll interval while a player with an infinite clock thinks.
const INFINITE_POLL: Duration = Duration::from_millis(500);

/// Draw when both sides evaluate the position within `score` centipawns of zero for
/// `move_count` consecutive moves, from move `move_number` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawAdjudication {
    pub move_number: u32,
    pub move_count: u32,
    pub score: i32,
}

/// A player loses when its own evaluation stays at or below `-score` centipawns for
/// `move_count` consecutive moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResignAdjudication {
    pub move_count: u32,
    pub score: i32,
}

/// Settings shared by both players of a game.
#[derive(Debug, Clone)]
pub struct GameSettings {
    start_fen: Option<String>,
    opening: Vec<String>,
    startup_timeout: Duration,
    draw_adjudication: Option<DrawAdjudication>,
    resign_adjudication: Option<ResignAdjudication>,
    max_moves: Option<u32>,
    max_protocol_errors: u32,
    seed: u64,
}

impl GameSettings {
    pub fn new() -> Self {
        GameSettings {
            start_fen: None,
            opening: vec![],
            startup_timeout: Duration::from_secs(10),
            draw_adjudication: None,
            resign_adjudication: None,
            max_moves: None,
            max_protocol_errors: 3,
            seed: 0,
        }
    }

    pub fn with_start_fen(mut self, fen: Option<String>) -> Self {
        self.start_fen = fen;
        self
    }

    /// Coordinate moves forced on both players before they think for themselves.
    pub fn with_opening(mut self, moves: Vec<String>) -> Self {
        self.opening = moves;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_draw_adjudication(mut self, rule: Option<DrawAdjudication>) -> Self {
        self.draw_adjudication = rule;
        self
    }

    pub fn with_resign_adjudication(mut self, rule: Option<ResignAdjudication>) -> Self {
        self.resign_adjudication = rule;
        self
    }

    /// Draw after this many full moves.
    pub fn with_max_moves(mut self, max_moves: Option<u32>) -> Self {
        self.max_moves = max_moves;
        self
    }

    /// A player exceeding this many soft protocol errors in one game loses.
    pub fn with_max_protocol_errors(mut self, count: u32) -> Self {
        self.max_protocol_errors = count;
        self
    }

    /// Seed of the per-player book choices.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn start_fen(&self) -> Option<&str> {
        self.start_fen.as_deref()
    }

    pub fn opening(&self) -> &[String] {
        &self.opening
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-player settings: a private opening book.
#[derive(Debug, Clone, Default)]
pub struct PlayerSettings {
    pub book: Option<Arc<dyn OpeningBook>>,
    /// in plies from the start of the game
    pub book_depth: u32,
}

/// What remains of a finished game.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub white: String,
    pub black: String,
    /// `None` when the game could not be played at all
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
    pub start_fen: Option<String>,
    /// coordinate notation
    pub moves: Vec<String>,
}

enum Turn {
    Moved(String),
    Over(Outcome),
}

pub struct Game {
    board: Box<dyn Board>,
    players: [Box<dyn Player>; 2],
    player_settings: [PlayerSettings; 2],
    settings: GameSettings,
    rng: StdRng,
    moves: Vec<String>,
    out_of_book: [bool; 2],
    draw_offers: [Option<usize>; 2],
    last_score: [Option<i32>; 2],
    resign_streak: [u32; 2],
    draw_streak: u32,
}

impl Game {
    /// `board` must be set to the start position of `settings`.
    pub fn new(
        board: Box<dyn Board>,
        white: Box<dyn Player>,
        black: Box<dyn Player>,
        settings: GameSettings,
    ) -> Self {
        Game {
            board,
            players: [white, black],
            player_settings: [PlayerSettings::default(), PlayerSettings::default()],
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            moves: vec![],
            out_of_book: [false; 2],
            draw_offers: [None; 2],
            last_score: [None; 2],
            resign_streak: [0; 2],
            draw_streak: 0,
        }
    }

    pub fn with_player_settings(mut self, side: Side, settings: PlayerSettings) -> Self {
        self.player_settings[side.index()] = settings;
        self
    }

    fn player(&mut self, side: Side) -> &mut dyn Player {
        self.players[side.index()].as_mut()
    }

    fn move_count(&self) -> u32 {
        (self.moves.len() as u32).div_ceil(2)
    }

    /// Play the game to its end. The players are handed back for reuse or reclamation.
    #[instrument(skip_all)]
    pub fn play(mut self) -> (GameRecord, [Box<dyn Player>; 2]) {
        let (outcome, error) = match self.start() {
            Ok(()) => (Some(self.run()), None),
            Err(failed) => self.start_failure(failed),
        };

        if let Some(outcome) = &outcome {
            info!("{} vs {}: {outcome}", self.players[0].name(), self.players[1].name());
            for player in self.players.iter_mut() {
                player.end_game(outcome);
            }
        }

        let record = GameRecord {
            white: self.players[0].name().to_string(),
            black: self.players[1].name().to_string(),
            outcome,
            error,
            start_fen: self.board.start_fen().map(String::from),
            moves: self.moves,
        };
        (record, self.players)
    }

    fn start_failure(&self, failed: Vec<Side>) -> (Option<Outcome>, Option<String>) {
        match failed.as_slice() {
            [side] => (
                Some(Outcome::loss(
                    *side,
                    Reason::Adjudication(Adjudication::StartFailure),
                    0,
                )),
                None,
            ),
            _ => (
                None,
                Some(format!(
                    "neither {} nor {} could be started",
                    self.players[0].name(),
                    self.players[1].name()
                )),
            ),
        }
    }

    /// Readiness, new game, readiness again. Returns the sides that failed.
    fn start(&mut self) -> Result<(), Vec<Side>> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        self.wait_until_ready(deadline)?;

        let fen = self.settings.start_fen.clone();
        let mut failed = vec![];
        for side in [Side::White, Side::Black] {
            let opponent = self.players[side.opposite().index()].name().to_string();
            if let Err(e) = self.player(side).new_game(side, &opponent, fen.as_deref()) {
                warn!("{side} could not start a new game: {e}");
                failed.push(side);
            }
        }
        if !failed.is_empty() {
            return Err(failed);
        }

        let deadline = Instant::now() + self.settings.startup_timeout;
        self.wait_until_ready(deadline)
    }

    fn wait_until_ready(&mut self, deadline: Instant) -> Result<(), Vec<Side>> {
        let mut failed = vec![];
        for side in [Side::White, Side::Black] {
            let player = self.player(side);
            while !player.is_ready() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("{} is not ready in time", player.name());
                    failed.push(side);
                    break;
                }
                match player.next_event(remaining) {
                    Some(PlayerEvent::Disconnected) => {
                        warn!("{} exited during startup", player.name());
                        failed.push(side);
                        break;
                    }
                    Some(event) => debug!("{} during startup: {event:?}", player.name()),
                    None => {}
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }

    fn run(&mut self) -> Outcome {
        if let Some(outcome) = self.force_opening() {
            return outcome;
        }
        loop {
            if let Some(outcome) = self.board_outcome() {
                return outcome;
            }
            if let Some(max) = self.settings.max_moves {
                if self.moves.len() as u32 >= max * 2 {
                    return Outcome::draw(
                        Reason::Adjudication(Adjudication::MaxMoves),
                        self.move_count(),
                    );
                }
            }

            let side = self.board.side_to_move();
            if let Some(mv) = self.player_book_move(side) {
                if let Some(outcome) = self.apply_move(side, &mv, true) {
                    return outcome;
                }
                continue;
            }

            let text = match self.think(side) {
                Turn::Moved(text) => text,
                Turn::Over(outcome) => return outcome,
            };
            let notation = self.player(side).notation();
            let Some(mv) = self.board.parse_move(&text, notation) else {
                warn!("{side} played an illegal move: '{text}'");
                return Outcome::loss(
                    side,
                    Reason::Adjudication(Adjudication::IllegalMove),
                    self.move_count(),
                );
            };
            if let Some(outcome) = self.apply_move(side, &mv, false) {
                return outcome;
            }
            if let Some(outcome) = self.adjudicate(side) {
                return outcome;
            }
        }
    }

    fn force_opening(&mut self) -> Option<Outcome> {
        for text in self.settings.opening.clone() {
            let side = self.board.side_to_move();
            let Some(mv) = self.board.parse_move(&text, MoveNotation::Long) else {
                warn!("opening move '{text}' is illegal, leaving the book");
                break;
            };
            if let Some(outcome) = self.apply_move(side, &mv, true) {
                return Some(outcome);
            }
        }
        None
    }

    fn player_book_move(&mut self, side: Side) -> Option<String> {
        let i = side.index();
        if self.out_of_book[i] {
            return None;
        }
        let settings = &self.player_settings[i];
        let book = match &settings.book {
            Some(book) if (self.moves.len() as u32) < settings.book_depth => book.clone(),
            _ => {
                self.out_of_book[i] = true;
                return None;
            }
        };
        let mv = book
            .book_move(self.board.key(), &mut self.rng)
            .and_then(|mv| self.board.parse_move(&mv, MoveNotation::Long));
        if mv.is_none() {
            self.out_of_book[i] = true;
        }
        mv
    }

    /// Play a legal coordinate move and tell the players who did not choose it.
    fn apply_move(&mut self, side: Side, mv: &str, forced: bool) -> Option<Outcome> {
        let san = self
            .board
            .move_to_string(mv, MoveNotation::Standard)
            .unwrap_or_else(|| mv.to_string());
        let played = PlayedMove {
            coordinate: mv.to_string(),
            san,
        };
        if let Err(e) = self.board.make_move(mv) {
            warn!("{e:#}");
            return Some(Outcome::loss(
                side,
                Reason::Adjudication(Adjudication::IllegalMove),
                self.move_count(),
            ));
        }
        self.moves.push(played.coordinate.clone());

        let receivers = if forced {
            vec![Side::White, Side::Black]
        } else {
            vec![side.opposite()]
        };
        for receiver in receivers {
            if let Err(e) = self.player(receiver).send_move(&played) {
                warn!("{receiver} could not receive move {mv}: {e}");
                return Some(Outcome::loss(
                    receiver,
                    Reason::Adjudication(Adjudication::Disconnection),
                    self.move_count(),
                ));
            }
        }
        None
    }

    fn board_outcome(&self) -> Option<Outcome> {
        let side = self.board.side_to_move();
        let moves = self.move_count();
        match self.board.status() {
            BoardStatus::Ongoing => None,
            BoardStatus::Checkmate => Some(Outcome::loss(side, Reason::Checkmate, moves)),
            BoardStatus::Stalemate => Some(Outcome::draw(Reason::Stalemate, moves)),
            BoardStatus::Draw(rule) => Some(Outcome::draw(Reason::DrawRule(rule), moves)),
        }
    }

    /// Ask `side` for a move and wait for it within its clock.
    fn think(&mut self, side: Side) -> Turn {
        let i = side.index();
        let moves = self.move_count();
        let ply = self.moves.len();
        let loss = |reason| Turn::Over(Outcome::loss(side, reason, moves));

        let opponent_time = self.players[side.opposite().index()].time_control().clone();
        self.last_score[i] = None;
        let player = self.players[i].as_mut();
        if let Err(e) = player.go(&opponent_time) {
            warn!("{}: {e}", player.name());
            return loss(Reason::Adjudication(Adjudication::Disconnection));
        }
        let started = Instant::now();
        let budget = player.time_control().available();

        loop {
            let wait = match budget {
                Some(budget) => budget.saturating_sub(started.elapsed()),
                None => INFINITE_POLL,
            };
            if budget.is_some() && wait.is_zero() {
                info!("{} ran out of time", player.name());
                return loss(Reason::Timeout);
            }
            let Some(event) = player.next_event(wait) else {
                continue;
            };
            match event {
                PlayerEvent::Move(text) => {
                    let elapsed = started.elapsed();
                    if !player.time_control_mut().finish_move(elapsed) {
                        info!("{} moved after its flag fell", player.name());
                        return loss(Reason::Timeout);
                    }
                    return Turn::Moved(text);
                }
                PlayerEvent::Score(score) => self.last_score[i] = Some(score.centipawns()),
                PlayerEvent::Resign => return loss(Reason::Resignation),
                PlayerEvent::DrawOffer => {
                    self.draw_offers[i] = Some(ply);
                    let opponent_offer = self.draw_offers[side.opposite().index()];
                    if ply > 0 && opponent_offer == Some(ply - 1) {
                        return Turn::Over(Outcome::draw(Reason::Agreement, moves));
                    }
                }
                PlayerEvent::ClaimResult { result, comment } => {
                    if result == GameResult::loss_for(side) {
                        info!("{} resigns by claiming {result} {{{comment}}}", player.name());
                        return loss(Reason::Resignation);
                    }
                    info!("{} claims {result} {{{comment}}}, ignored", player.name());
                }
                PlayerEvent::RejectedMove(mv) => {
                    warn!("{} rejects move '{mv}'", player.name());
                    return loss(Reason::Adjudication(Adjudication::RejectedMove));
                }
                PlayerEvent::ProtocolError(_) => {
                    if player.protocol_error_count() > self.settings.max_protocol_errors {
                        return loss(Reason::Adjudication(Adjudication::ProtocolErrors));
                    }
                }
                PlayerEvent::Disconnected => {
                    return loss(Reason::Adjudication(Adjudication::Disconnection))
                }
                PlayerEvent::Ready => {}
            }
        }
    }

    /// Score-based adjudication after `side` moved.
    fn adjudicate(&mut self, side: Side) -> Option<Outcome> {
        let i = side.index();
        let score = self.last_score[i];
        let moves = self.move_count();

        if let Some(rule) = self.settings.resign_adjudication {
            match score {
                Some(score) if score <= rule.score.saturating_neg() => self.resign_streak[i] += 1,
                _ => self.resign_streak[i] = 0,
            }
            if rule.move_count > 0 && self.resign_streak[i] >= rule.move_count {
                return Some(Outcome::loss(
                    side,
                    Reason::Adjudication(Adjudication::ScoreResign),
                    moves,
                ));
            }
        }

        if let Some(rule) = self.settings.draw_adjudication {
            match score {
                Some(score)
                    if moves >= rule.move_number
                        && score.unsigned_abs() <= rule.score.unsigned_abs() =>
                {
                    self.draw_streak += 1
                }
                _ => self.draw_streak = 0,
            }
            // the streak counts plies, both sides must agree
            if rule.move_count > 0 && self.draw_streak >= rule.move_count * 2 {
                return Some(Outcome::draw(
                    Reason::Adjudication(Adjudication::ScoreDraw),
                    moves,
                ));
            }
        }
        None
    }
}
