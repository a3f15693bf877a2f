//! Concurrent execution of games.
//!
//! The [`GameManager`] is driven from a single thread (the tournament's). It queues
//! [`GameRequest`]s, starts them in submission order while fewer than `concurrency` games
//! run, and runs each one on its own OS thread. Completions come back over an `mpsc`
//! channel and are turned into [`ManagerEvent`]s by [`GameManager::next_event`], which is
//! the only place the manager blocks. Players that are done are quit on a reaper thread,
//! which reports back over the same channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    board::{Board, Side},
    engine_match::SharedOutput,
    game::{Game, GameRecord, GameSettings, PlayerSettings},
    outcome::{Adjudication, Outcome, Reason},
    player::{EngineState, LaunchOptions, Player, PlayerBuilder},
};

/// One game to play: its board at the start position, who plays it and how.
pub struct GameRequest {
    /// sequence number, reported back with every event of this game
    pub number: usize,
    pub board: Box<dyn Board>,
    /// white, black
    pub players: [Arc<dyn PlayerBuilder>; 2],
    pub player_settings: [PlayerSettings; 2],
    pub settings: GameSettings,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    GameStarted {
        number: usize,
        white: String,
        black: String,
    },
    GameFinished {
        number: usize,
        record: GameRecord,
    },
    /// Emitted once after [`GameManager::finish`], when no game runs and every player
    /// has been reclaimed.
    Finished,
}

/// A game between its dispatch and its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningGame {
    pub number: usize,
    pub slot: usize,
    pub white: String,
    pub black: String,
    players: usize,
}

struct Completion {
    number: usize,
    record: GameRecord,
    players: Vec<Box<dyn Player>>,
}

enum Message {
    Completion(Completion),
    /// this many players were quit and dropped
    Reaped(usize),
}

/// Reports reaped players once dropped, after the players it was created with.
struct ReapGuard {
    count: usize,
    tx: Sender<Message>,
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Reaped(self.count));
    }
}

/// Reports the completion of a game thread, even when it unwinds.
struct CompletionGuard {
    number: usize,
    white: String,
    black: String,
    tx: Option<Sender<Message>>,
}

impl CompletionGuard {
    fn complete(mut self, record: GameRecord, players: Vec<Box<dyn Player>>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Message::Completion(Completion {
                number: self.number,
                record,
                players,
            }));
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            error!("game {} was aborted", self.number);
            let record = GameRecord {
                white: std::mem::take(&mut self.white),
                black: std::mem::take(&mut self.black),
                outcome: None,
                error: Some(format!("game {} was aborted", self.number)),
                start_fen: None,
                moves: vec![],
            };
            let _ = tx.send(Message::Completion(Completion {
                number: self.number,
                record,
                players: vec![],
            }));
        }
    }
}

pub struct GameManager {
    concurrency: usize,
    reuse_engines: bool,
    options: LaunchOptions,
    queue: VecDeque<GameRequest>,
    running: Vec<RunningGame>,
    pool: HashMap<String, Vec<Box<dyn Player>>>,
    events: VecDeque<ManagerEvent>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    accepting: bool,
    finished: bool,
    active_players: usize,
    /// players handed to a reaper and not yet dropped
    pending_reaps: usize,
}

impl GameManager {
    pub fn new(concurrency: usize, options: LaunchOptions) -> Self {
        let (tx, rx) = mpsc::channel();
        GameManager {
            concurrency: concurrency.max(1),
            reuse_engines: false,
            options,
            queue: VecDeque::new(),
            running: vec![],
            pool: HashMap::new(),
            events: VecDeque::new(),
            tx,
            rx,
            accepting: true,
            finished: false,
            active_players: 0,
            pending_reaps: 0,
        }
    }

    /// Keep players alive between games instead of restarting them.
    pub fn with_reuse_engines(mut self, reuse: bool) -> Self {
        self.reuse_engines = reuse;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Where engines echo their traffic in debug mode.
    pub fn output(&self) -> &SharedOutput {
        &self.options.output
    }

    pub fn running(&self) -> &[RunningGame] {
        &self.running
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Players created and not yet reclaimed, pooled ones included.
    pub fn active_engine_count(&self) -> usize {
        self.active_players
    }

    /// Queue a game. Ignored once [`finish`](Self::finish) was called.
    pub fn start(&mut self, request: GameRequest) {
        if !self.accepting {
            warn!("game {} submitted after finish, dropped", request.number);
            return;
        }
        self.queue.push_back(request);
        self.dispatch();
    }

    /// Stop accepting games and drop the queued ones. Running games finish normally.
    pub fn finish(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        if !self.queue.is_empty() {
            debug!("discarding {} queued games", self.queue.len());
            self.queue.clear();
        }
    }

    /// Wait for the next event. `None` when nothing runs and nothing will happen.
    pub fn next_event(&mut self) -> Option<ManagerEvent> {
        while let Ok(message) = self.rx.try_recv() {
            self.on_message(message);
        }
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.running.is_empty() {
                if self.accepting || self.finished {
                    return None;
                }
                let pooled: Vec<_> = self.pool.drain().flat_map(|(_, players)| players).collect();
                self.reap(pooled);
                if self.pending_reaps == 0 {
                    self.finished = true;
                    return Some(ManagerEvent::Finished);
                }
            }
            // self.tx keeps the channel open
            let message = self.rx.recv().ok()?;
            self.on_message(message);
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Completion(completion) => self.on_completion(completion),
            Message::Reaped(count) => {
                self.active_players -= count;
                self.pending_reaps -= count;
            }
        }
    }

    fn dispatch(&mut self) {
        while self.running.len() < self.concurrency {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.launch(request);
        }
    }

    fn take_player(&mut self, builder: &dyn PlayerBuilder) -> anyhow::Result<Box<dyn Player>> {
        if let Some(player) = self.pool.get_mut(builder.name()).and_then(Vec::pop) {
            debug!("reusing {}", builder.name());
            return Ok(player);
        }
        let player = builder.create(&self.options)?;
        self.active_players += 1;
        Ok(player)
    }

    #[instrument(skip_all, fields(number = request.number))]
    fn launch(&mut self, request: GameRequest) {
        let GameRequest {
            number,
            board,
            players: [white_builder, black_builder],
            player_settings,
            settings,
        } = request;

        let slot = (0..self.concurrency)
            .find(|s| self.running.iter().all(|r| r.slot != *s))
            .unwrap_or(self.running.len());
        let white = self.take_player(white_builder.as_ref());
        let black = self.take_player(black_builder.as_ref());
        let running = RunningGame {
            number,
            slot,
            white: white_builder.name().to_string(),
            black: black_builder.name().to_string(),
            players: usize::from(white.is_ok()) + usize::from(black.is_ok()),
        };
        info!("game {number} in slot {slot}: {} vs {}", running.white, running.black);
        self.events.push_back(ManagerEvent::GameStarted {
            number,
            white: running.white.clone(),
            black: running.black.clone(),
        });

        let guard = CompletionGuard {
            number,
            white: running.white.clone(),
            black: running.black.clone(),
            tx: Some(self.tx.clone()),
        };
        self.running.push(running);

        let spawned = thread::Builder::new()
            .name(format!("game-{number}"))
            .spawn(move || {
                let (record, players) = play_game(board, white, black, player_settings, settings);
                guard.complete(record, players);
            });
        // the guard went down with the closure and reports the game as aborted
        if let Err(e) = spawned {
            error!("could not start a thread for game {number}: {e}");
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion {
            number,
            record,
            players,
        } = completion;
        let Some(index) = self.running.iter().position(|r| r.number == number) else {
            error!("completion of unknown game {number}");
            return;
        };
        let running = self.running.remove(index);
        self.active_players -= running.players;

        let mut done = vec![];
        for player in players {
            self.active_players += 1;
            let reusable = self.reuse_engines
                && self.accepting
                && player.can_be_reused()
                && player.state() != EngineState::Terminated;
            if reusable {
                self.pool
                    .entry(player.name().to_string())
                    .or_default()
                    .push(player);
            } else {
                done.push(player);
            }
        }
        self.reap(done);

        self.events
            .push_back(ManagerEvent::GameFinished { number, record });
        self.dispatch();
    }

    /// Quit `players` on a thread of their own. They stay counted as active until dropped.
    fn reap(&mut self, players: Vec<Box<dyn Player>>) {
        if players.is_empty() {
            return;
        }
        let count = players.len();
        self.pending_reaps += count;
        let guard = ReapGuard {
            count,
            tx: self.tx.clone(),
        };
        let spawned = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                for mut player in players {
                    debug!("quitting {}", player.name());
                    player.quit();
                }
                drop(guard);
            });
        // the players are dropped, and killed, with the closure
        if let Err(e) = spawned {
            error!("could not start a reaper thread: {e}");
        }
    }
}

impl Drop for GameManager {
    fn drop(&mut self) {
        for (_, players) in self.pool.drain() {
            for mut player in players {
                player.quit();
            }
        }
    }
}

fn play_game(
    board: Box<dyn Board>,
    white: anyhow::Result<Box<dyn Player>>,
    black: anyhow::Result<Box<dyn Player>>,
    [white_settings, black_settings]: [PlayerSettings; 2],
    settings: GameSettings,
) -> (GameRecord, Vec<Box<dyn Player>>) {
    let start_fen = board.start_fen().map(String::from);
    let failed_record = |white: String, black: String, outcome, error| GameRecord {
        white,
        black,
        outcome,
        error,
        start_fen: start_fen.clone(),
        moves: vec![],
    };
    let start_failure = |side| {
        Some(Outcome::loss(
            side,
            Reason::Adjudication(Adjudication::StartFailure),
            0,
        ))
    };

    match (white, black) {
        (Ok(white), Ok(black)) => {
            let (record, players) = Game::new(board, white, black, settings)
                .with_player_settings(Side::White, white_settings)
                .with_player_settings(Side::Black, black_settings)
                .play();
            (record, players.into_iter().collect())
        }
        (Err(e), Ok(black)) => {
            warn!("{e:#}");
            let record = failed_record(
                String::new(),
                black.name().to_string(),
                start_failure(Side::White),
                None,
            );
            (record, vec![black])
        }
        (Ok(white), Err(e)) => {
            warn!("{e:#}");
            let record = failed_record(
                white.name().to_string(),
                String::new(),
                start_failure(Side::Black),
                None,
            );
            (record, vec![white])
        }
        (Err(white), Err(black)) => {
            let error = format!("{white:#}; {black:#}");
            warn!("{error}");
            (
                failed_record(String::new(), String::new(), None, Some(error)),
                vec![],
            )
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::Ordering,
        time::{Duration, Instant},
    };

    use super::{test_players::*, *};
    use crate::{board::ChessBoard, outcome::GameResult};

    fn request(number: usize, white: &Arc<dyn PlayerBuilder>, black: &Arc<dyn PlayerBuilder>) -> GameRequest {
        GameRequest {
            number,
            board: Box::new(ChessBoard::new()),
            players: [white.clone(), black.clone()],
            player_settings: Default::default(),
            settings: GameSettings::new(),
        }
    }

    #[test]
    fn concurrency_is_bounded_and_order_is_fifo() {
        let census = Arc::new(Census::default());
        let a = ResignerBuilder::new("a", Duration::from_millis(30), &census);
        let b = ResignerBuilder::new("b", Duration::from_millis(30), &census);
        let mut manager = GameManager::new(3, LaunchOptions::default());
        for number in 0..8 {
            manager.start(request(number, &a, &b));
            assert!(manager.running().len() <= 3);
        }

        let mut started = vec![];
        let mut finished = 0;
        while let Some(event) = manager.next_event() {
            assert!(manager.running().len() <= 3);
            match event {
                ManagerEvent::GameStarted { number, .. } => started.push(number),
                ManagerEvent::GameFinished { record, .. } => {
                    assert_eq!(record.outcome.unwrap().result, GameResult::BlackWin);
                    finished += 1;
                    if finished == 8 {
                        manager.finish();
                    }
                }
                ManagerEvent::Finished => break,
            }
        }
        assert_eq!(started, (0..8).collect::<Vec<_>>());
        assert_eq!(finished, 8);
        assert_eq!(census.created.load(Ordering::SeqCst), 16);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_engine_count(), 0);
        assert!(manager.next_event().is_none());
    }

    #[test]
    fn finish_discards_queued_games() {
        let census = Arc::new(Census::default());
        let a = ResignerBuilder::new("a", Duration::from_millis(20), &census);
        let b = ResignerBuilder::new("b", Duration::from_millis(20), &census);
        let mut manager = GameManager::new(1, LaunchOptions::default());
        for number in 0..5 {
            manager.start(request(number, &a, &b));
        }
        assert_eq!(manager.queued_count(), 4);

        assert!(matches!(
            manager.next_event(),
            Some(ManagerEvent::GameStarted { number: 0, .. })
        ));
        manager.finish();
        manager.start(request(9, &a, &b));
        assert_eq!(manager.queued_count(), 0);

        assert!(matches!(
            manager.next_event(),
            Some(ManagerEvent::GameFinished { number: 0, .. })
        ));
        assert!(matches!(manager.next_event(), Some(ManagerEvent::Finished)));
        assert!(manager.next_event().is_none());
        assert_eq!(census.created.load(Ordering::SeqCst), 2);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pooled_players_are_reused() {
        let census = Arc::new(Census::default());
        let a = ResignerBuilder::new("a", Duration::ZERO, &census);
        let b = ResignerBuilder::new("b", Duration::ZERO, &census);
        let mut manager =
            GameManager::new(1, LaunchOptions::default()).with_reuse_engines(true);
        for number in 0..3 {
            manager.start(request(number, &a, &b));
        }
        let mut finished = 0;
        while let Some(event) = manager.next_event() {
            if let ManagerEvent::GameFinished { .. } = event {
                finished += 1;
                if finished == 3 {
                    assert_eq!(manager.active_engine_count(), 2);
                    manager.finish();
                }
            }
        }
        assert_eq!(census.created.load(Ordering::SeqCst), 2);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_engine_count(), 0);
    }

    #[test]
    fn creation_failures() {
        let census = Arc::new(Census::default());
        let good = ResignerBuilder::new("good", Duration::ZERO, &census);
        let broken: Arc<dyn PlayerBuilder> = Arc::new(ResignerBuilder {
            name: "broken".into(),
            delay: Duration::ZERO,
            quit_delay: Duration::ZERO,
            broken: true,
            census: census.clone(),
        });
        let mut manager = GameManager::new(2, LaunchOptions::default());
        manager.start(request(0, &good, &broken));
        manager.start(request(1, &broken, &broken));

        let mut records = HashMap::new();
        while records.len() < 2 {
            if let Some(ManagerEvent::GameFinished { number, record }) = manager.next_event() {
                records.insert(number, record);
            }
        }
        let outcome = records[&0].outcome.unwrap();
        assert_eq!(outcome.result, GameResult::WhiteWin);
        assert_eq!(
            outcome.reason,
            Reason::Adjudication(Adjudication::StartFailure)
        );
        assert!(records[&1].outcome.is_none());
        assert!(records[&1].error.is_some());
    }

    #[test]
    fn slow_quits_do_not_hold_up_other_games() {
        let census = Arc::new(Census::default());
        let stubborn: Arc<dyn PlayerBuilder> = Arc::new(ResignerBuilder {
            name: "stubborn".into(),
            delay: Duration::ZERO,
            quit_delay: Duration::from_millis(600),
            broken: false,
            census: census.clone(),
        });
        let quick = ResignerBuilder::new("quick", Duration::from_millis(200), &census);
        let mut manager = GameManager::new(2, LaunchOptions::default());
        let start = Instant::now();
        manager.start(request(0, &stubborn, &stubborn));
        manager.start(request(1, &quick, &quick));
        manager.finish();

        let mut second_game = None;
        while let Some(event) = manager.next_event() {
            match event {
                ManagerEvent::GameFinished { number: 1, .. } => second_game = Some(start.elapsed()),
                ManagerEvent::Finished => break,
                _ => {}
            }
        }
        let second_game = second_game.unwrap();
        assert!(second_game < Duration::from_millis(900), "{second_game:?}");
        // both stubborn players were quit before the end was reported
        assert!(start.elapsed() >= Duration::from_millis(1200));
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_engine_count(), 0);
    }
}
