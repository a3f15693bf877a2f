//! A tournament: who plays next, with which opening, and how everybody is doing.
//!
//! The [`Tournament`] owns the [`GameManager`] it schedules into and keeps at most
//! `concurrency` of its games there, so a stop request never leaves a backlog behind.
//! Tallies are only touched from [`Tournament::next_event`], one finished game at a time.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    board::{Board, ChessBoard},
    engine_match::SharedOutput,
    game::{GameRecord, GameSettings, PlayerSettings},
    game_manager::{GameManager, GameRequest, ManagerEvent},
    opening_book::{opening_line, OpeningBook},
    outcome::GameResult,
    player::PlayerBuilder,
    tournament_strategy::{Pairing, TournamentStrategy},
};

/// A participant and its results so far.
#[derive(Debug, Clone)]
pub struct PlayerData {
    pub builder: Arc<dyn PlayerBuilder>,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
}

impl PlayerData {
    fn new(builder: Arc<dyn PlayerBuilder>) -> Self {
        PlayerData {
            builder,
            wins: 0,
            losses: 0,
            draws: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.builder.name()
    }

    pub fn games(&self) -> u32 {
        self.wins + self.losses + self.draws
    }

    /// Points: one per win, half per draw.
    pub fn score(&self) -> f64 {
        f64::from(self.wins) + f64::from(self.draws) / 2.0
    }
}

#[derive(Debug, Clone)]
pub enum TournamentEvent {
    GameStarted {
        number: usize,
        white: usize,
        black: usize,
    },
    GameFinished {
        number: usize,
        white: usize,
        black: usize,
        record: GameRecord,
    },
    /// No game runs and none will be started.
    Finished,
}

pub struct Tournament {
    players: Vec<PlayerData>,
    strategy: Box<dyn TournamentStrategy>,
    manager: GameManager,
    game_settings: GameSettings,
    book: Option<(Arc<dyn OpeningBook>, u32)>,
    repeat_openings: bool,
    rng: StdRng,
    start_board: Option<ChessBoard>,
    last_opening: Vec<String>,
    pairings: HashMap<usize, Pairing>,
    next_game: usize,
    started: usize,
    finished: usize,
    error: Option<String>,
    stopping: Arc<AtomicBool>,
    done: bool,
}

impl Tournament {
    pub fn new(
        players: Vec<Arc<dyn PlayerBuilder>>,
        strategy: Box<dyn TournamentStrategy>,
        manager: GameManager,
    ) -> Self {
        Tournament {
            players: players.into_iter().map(PlayerData::new).collect(),
            strategy,
            manager,
            game_settings: GameSettings::new(),
            book: None,
            repeat_openings: false,
            rng: StdRng::from_entropy(),
            start_board: None,
            last_opening: vec![],
            pairings: HashMap::new(),
            next_game: 0,
            started: 0,
            finished: 0,
            error: None,
            stopping: Arc::new(AtomicBool::new(false)),
            done: false,
        }
    }

    /// Settings every game starts from. The opening is chosen per game.
    pub fn with_game_settings(mut self, settings: GameSettings) -> Self {
        self.game_settings = settings;
        self
    }

    /// Opening book shared by all games, played up to `depth` plies.
    pub fn with_opening_book(mut self, book: Arc<dyn OpeningBook>, depth: u32) -> Self {
        self.book = Some((book, depth));
        self
    }

    /// Play each opening twice within an encounter, colors reversed.
    pub fn with_repeat_openings(mut self, repeat: bool) -> Self {
        self.repeat_openings = repeat;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn set_opening_book(&mut self, book: Arc<dyn OpeningBook>, depth: u32) {
        self.book = Some((book, depth));
    }

    pub fn player_at(&self, index: usize) -> &PlayerData {
        &self.players[index]
    }

    pub fn players(&self) -> &[PlayerData] {
        &self.players
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Where engines echo their traffic in debug mode.
    pub fn output(&self) -> &SharedOutput {
        self.manager.output()
    }

    pub fn final_game_count(&self) -> usize {
        self.strategy.final_game_count()
    }

    pub fn finished_game_count(&self) -> usize {
        self.finished
    }

    pub fn started_game_count(&self) -> usize {
        self.started
    }

    pub fn error_string(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn active_engine_count(&self) -> usize {
        self.manager.active_engine_count()
    }

    #[instrument(skip_all)]
    pub fn start(&mut self) {
        if self.players.len() < 2 {
            self.fail("a tournament needs at least two players".to_string());
            return;
        }
        self.strategy.init(self.players.len());
        match ChessBoard::from_optional_fen(self.game_settings.start_fen()) {
            Ok(board) => self.start_board = Some(board),
            Err(e) => {
                self.fail(format!("{e:#}"));
                return;
            }
        }
        info!(
            "{} tournament of {} players, {} games",
            self.strategy.name(),
            self.players.len(),
            self.final_game_count()
        );
        self.schedule();
    }

    /// No game is started after this; running games finish normally.
    pub fn stop(&mut self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            debug!("stopping after {} started games", self.started);
        }
    }

    /// A flag that stops the tournament when raised from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn fail(&mut self, error: String) {
        error!("{error}");
        self.error.get_or_insert(error);
        self.stop();
    }

    /// Wait for the next event. `None` after [`TournamentEvent::Finished`].
    pub fn next_event(&mut self) -> Option<TournamentEvent> {
        loop {
            match self.manager.next_event() {
                Some(ManagerEvent::GameStarted { number, .. }) => {
                    self.started += 1;
                    let Some(pairing) = self.pairings.get(&number) else {
                        warn!("start of unknown game {number}");
                        continue;
                    };
                    return Some(TournamentEvent::GameStarted {
                        number,
                        white: pairing.white,
                        black: pairing.black,
                    });
                }
                Some(ManagerEvent::GameFinished { number, record }) => {
                    let Some(pairing) = self.pairings.remove(&number) else {
                        warn!("result of unknown game {number}");
                        continue;
                    };
                    self.finished += 1;
                    self.tally(&pairing, &record);
                    self.schedule();
                    return Some(TournamentEvent::GameFinished {
                        number,
                        white: pairing.white,
                        black: pairing.black,
                        record,
                    });
                }
                // shut down through finish_manager only
                Some(ManagerEvent::Finished) => continue,
                None if self.done => return None,
                None => {
                    self.done = true;
                    return Some(TournamentEvent::Finished);
                }
            }
        }
    }

    fn tally(&mut self, pairing: &Pairing, record: &GameRecord) {
        let Some(outcome) = record.outcome else {
            let error = record
                .error
                .clone()
                .unwrap_or_else(|| format!("game {} vs {} had no result", record.white, record.black));
            self.fail(error);
            return;
        };
        let (white, black) = (pairing.white, pairing.black);
        match outcome.result {
            GameResult::WhiteWin => {
                self.players[white].wins += 1;
                self.players[black].losses += 1;
            }
            GameResult::BlackWin => {
                self.players[white].losses += 1;
                self.players[black].wins += 1;
            }
            GameResult::Draw => {
                self.players[white].draws += 1;
                self.players[black].draws += 1;
            }
        }
    }

    /// Keep the manager busy, never queueing beyond its concurrency.
    fn schedule(&mut self) {
        while !self.is_stopping()
            && self.pairings.len() < self.manager.concurrency()
            && self.next_game < self.final_game_count()
        {
            let number = self.next_game;
            self.next_game += 1;
            let Some(pairing) = self.strategy.next_pair(number) else {
                break;
            };
            let Some(request) = self.request(number, pairing) else {
                break;
            };
            self.pairings.insert(number, pairing);
            self.manager.start(request);
        }
    }

    fn request(&mut self, number: usize, pairing: Pairing) -> Option<GameRequest> {
        let board = self.start_board.clone()?;
        let opening = self.opening_for(&pairing, &board);
        let settings = self
            .game_settings
            .clone()
            .with_opening(opening)
            .with_seed(self.rng.gen());

        let builders = [
            self.players[pairing.white].builder.clone(),
            self.players[pairing.black].builder.clone(),
        ];
        let player_settings = builders.clone().map(|builder| match builder.book() {
            Some((book, book_depth)) => PlayerSettings {
                book: Some(book),
                book_depth,
            },
            None => PlayerSettings::default(),
        });
        Some(GameRequest {
            number,
            board: Box::new(board),
            players: builders,
            player_settings,
            settings,
        })
    }

    fn opening_for(&mut self, pairing: &Pairing, board: &ChessBoard) -> Vec<String> {
        if self.repeat_openings && pairing.encounter_game % 2 == 1 {
            return self.last_opening.clone();
        }
        let mut line = self.game_settings.opening().to_vec();
        if let Some((book, depth)) = &self.book {
            let mut scratch = board.clone();
            for mv in &line {
                if scratch.make_move(mv).is_err() {
                    break;
                }
            }
            line.extend(opening_line(&mut scratch, book.as_ref(), *depth, &mut self.rng));
        }
        self.last_opening = line.clone();
        line
    }

    /// Shut the manager down and wait until every player has been reclaimed.
    pub fn finish_manager(&mut self) {
        self.stop();
        self.manager.finish();
        while let Some(event) = self.manager.next_event() {
            if let ManagerEvent::Finished = event {
                break;
            }
        }
        debug!("all players reclaimed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        game_manager::test_players::{Census, ResignerBuilder},
        player::LaunchOptions,
        tournament_strategy::RoundRobinTournament,
    };

    fn resigners(names: &[&str], census: &Arc<Census>) -> Vec<Arc<dyn PlayerBuilder>> {
        names
            .iter()
            .map(|name| ResignerBuilder::new(name, Duration::from_millis(5), census))
            .collect()
    }

    fn drain(tournament: &mut Tournament) -> Vec<TournamentEvent> {
        let mut events = vec![];
        while let Some(event) = tournament.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn tallies_add_up() {
        let census = Arc::new(Census::default());
        let mut tournament = Tournament::new(
            resigners(&["a", "b", "c"], &census),
            Box::new(RoundRobinTournament::new(2, 1)),
            GameManager::new(2, LaunchOptions::default()),
        )
        .with_seed(1);
        tournament.start();
        let events = drain(&mut tournament);
        assert!(matches!(events.last(), Some(TournamentEvent::Finished)));

        let finished = events
            .iter()
            .filter(|e| matches!(e, TournamentEvent::GameFinished { .. }))
            .count();
        assert_eq!(finished, 6);
        assert_eq!(tournament.finished_game_count(), 6);
        assert_eq!(tournament.started_game_count(), 6);
        for player in tournament.players() {
            // white always resigns
            assert_eq!((player.wins, player.losses, player.draws), (2, 2, 0));
            assert_eq!(player.games(), 4);
        }
        assert!(tournament.error_string().is_none());

        tournament.finish_manager();
        assert_eq!(tournament.active_engine_count(), 0);
    }

    #[test]
    fn stop_lets_running_games_finish() {
        let census = Arc::new(Census::default());
        let mut tournament = Tournament::new(
            resigners(&["a", "b"], &census),
            Box::new(RoundRobinTournament::new(2, 5)),
            GameManager::new(1, LaunchOptions::default()),
        );
        tournament.start();
        assert!(matches!(
            tournament.next_event(),
            Some(TournamentEvent::GameStarted { number: 0, white: 0, black: 1 })
        ));
        tournament.stop();
        let events = drain(&mut tournament);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TournamentEvent::GameFinished { number: 0, .. }));
        assert_eq!(tournament.finished_game_count(), 1);
        assert_eq!(tournament.player_at(1).wins, 1);
    }

    #[test]
    fn a_game_without_result_stops_the_tournament() {
        let census = Arc::new(Census::default());
        let broken: Arc<dyn PlayerBuilder> = Arc::new(ResignerBuilder {
            name: "broken".into(),
            delay: Duration::ZERO,
            quit_delay: Duration::ZERO,
            broken: true,
            census: census.clone(),
        });
        let mut tournament = Tournament::new(
            vec![broken.clone(), broken],
            Box::new(RoundRobinTournament::new(2, 2)),
            GameManager::new(1, LaunchOptions::default()),
        );
        tournament.start();
        drain(&mut tournament);
        assert_eq!(tournament.started_game_count(), 1);
        assert!(tournament.error_string().unwrap().contains("broken"));
        assert_eq!(tournament.player_at(0).games(), 0);

        let mut lonely = Tournament::new(
            resigners(&["a"], &census),
            Box::new(RoundRobinTournament::new(1, 1)),
            GameManager::new(1, LaunchOptions::default()),
        );
        lonely.start();
        assert!(matches!(lonely.next_event(), Some(TournamentEvent::Finished)));
        assert!(lonely.error_string().is_some());
    }
}
