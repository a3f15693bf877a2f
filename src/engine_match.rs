//! Orchestration of one match or tournament run.
//!
//! [`EngineMatch`] wires a [`Tournament`] to an optional [`Sprt`] and prints progress:
//!
//! - one line per started and finished game,
//! - with two players, the running score after every game,
//! - a ranking every `rating_interval` finished games and at the end.
//!
//! [`EngineMatch::start`] moves everything onto an orchestrator thread and returns a
//! [`MatchHandle`] right away. All tallies and the SPRT statistic are updated on that thread
//! only, one finished game at a time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine_tournament::prelude::*;
//!
//! let config = Configuration::from_env();
//! let tc: TimeControl = "40/60+0.5".parse().unwrap();
//! let players: Vec<Arc<dyn PlayerBuilder>> = vec![
//!     Arc::new(EngineBuilder::new("new", "./engine-new", Protocol::Uci).with_time_control(tc.clone())),
//!     Arc::new(EngineBuilder::new("old", "./engine-old", Protocol::Uci).with_time_control(tc)),
//! ];
//! let tournament = Tournament::new(
//!     players,
//!     Box::new(RoundRobinTournament::new(2, 50)),
//!     config.game_manager(),
//! )
//! .with_game_settings(config.game_settings());
//! let summary = EngineMatch::new(tournament, config)
//!     .unwrap()
//!     .with_sprt(Sprt::new(0.0, 5.0, 0.05, 0.05).unwrap())
//!     .start()
//!     .unwrap()
//!     .join()
//!     .unwrap();
//! println!("{summary:?}");
//! ```

use std::{
    fmt,
    io::{self, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context};
use tracing::{info, instrument, trace, warn};

use crate::{
    board::Side,
    configuration::Configuration,
    engine_collector::{collect_engines, MatchFile},
    game::GameRecord,
    logger::init_logger,
    opening_book::{BookCache, OpeningBook},
    sprt::{Sprt, SprtResult, SprtStatus},
    tournament::{PlayerData, Tournament, TournamentEvent},
};

/// A line sink shared by the progress printer and the engines' debug echo.
///
/// Clones write to the same place, so lines from different threads never interleave.
#[derive(Clone)]
pub struct SharedOutput(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedOutput {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        SharedOutput(Arc::new(Mutex::new(writer)))
    }

    /// Redirect every clone to `writer`.
    pub fn replace(&self, writer: Box<dyn Write + Send>) {
        *self.lock() = writer;
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        writeln!(self.lock(), "{line}")
    }

    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        // a panic mid-line leaves nothing worth protecting
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SharedOutput {
    fn default() -> Self {
        SharedOutput::new(Box::new(io::stdout()))
    }
}

impl fmt::Debug for SharedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedOutput").finish_non_exhaustive()
    }
}

/// Results of one player at the end of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSummary {
    pub name: String,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
}

#[derive(Debug, Clone)]
pub struct MatchSummary {
    pub players: Vec<PlayerSummary>,
    pub finished_games: usize,
    pub final_game_count: usize,
    pub error: Option<String>,
    pub sprt: Option<SprtStatus>,
}

/// Control over a running match.
pub struct MatchHandle {
    stop: Arc<AtomicBool>,
    finished: Receiver<()>,
    thread: JoinHandle<MatchSummary>,
}

impl MatchHandle {
    /// Start no more games. Running games are played to the end.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Receives one message once every game is over and every engine reclaimed.
    pub fn finished(&self) -> &Receiver<()> {
        &self.finished
    }

    pub fn join(self) -> anyhow::Result<MatchSummary> {
        self.thread
            .join()
            .map_err(|_| anyhow!("the match thread panicked"))
    }
}

pub struct EngineMatch {
    tournament: Tournament,
    sprt: Option<Sprt>,
    rating_interval: usize,
    books: BookCache,
    output: SharedOutput,
}

impl EngineMatch {
    /// Starts logging to file when the configuration asks for it.
    #[instrument(skip_all)]
    pub fn new(tournament: Tournament, config: Configuration) -> anyhow::Result<Self> {
        if config.log {
            init_logger()?;
        }
        trace!(?config);

        // engines echo through the same sink
        let output = tournament.output().clone();
        if !config.verbose {
            output.replace(Box::new(io::sink()));
        }
        Ok(EngineMatch {
            tournament,
            sprt: None,
            rating_interval: config.rating_interval,
            books: BookCache::new(),
            output,
        })
    }

    /// A match described by a match file. Relative paths in the file are taken from the
    /// file's directory.
    #[instrument(skip(config))]
    pub fn from_match_file(path: &Path, config: Configuration) -> anyhow::Result<Self> {
        let file = MatchFile::read(path)?;
        let config = file.apply(config);
        let base_dir = path.parent().unwrap_or(Path::new("."));

        let players = collect_engines(&file, base_dir, config)?;
        if players.is_empty() {
            bail!("no engine of '{}' could be collected", path.display());
        }

        let mut tournament = Tournament::new(players, file.strategy(), config.game_manager())
            .with_game_settings(file.game_settings(config.game_settings()))
            .with_repeat_openings(file.repeat);
        if let Some(seed) = file.seed {
            tournament = tournament.with_seed(seed);
        }

        let mut engine_match = EngineMatch::new(tournament, config)?;
        if let Some(book) = &file.book {
            let book = engine_match.add_opening_book(base_dir.join(book));
            if let Some(book) = book {
                engine_match
                    .tournament_mut()
                    .set_opening_book(book, file.book_depth);
            }
        }
        if let Some(sprt) = file.sprt()? {
            engine_match = engine_match.with_sprt(sprt);
        }
        Ok(engine_match)
    }

    pub fn with_sprt(mut self, sprt: Sprt) -> Self {
        let (elo0, elo1) = sprt.hypotheses();
        let (alpha, beta) = sprt.error_rates();
        info!("SPRT: elo0 {elo0}, elo1 {elo1}, alpha {alpha}, beta {beta}");
        self.sprt = Some(sprt);
        self
    }

    /// Print the ranking every `interval` finished games, `0` for only at the end.
    pub fn with_rating_interval(mut self, interval: usize) -> Self {
        self.rating_interval = interval;
        self
    }

    /// Where progress lines and debug echo go.
    pub fn with_output(self, output: Box<dyn Write + Send>) -> Self {
        self.output.replace(output);
        self
    }

    /// Load a book once per path. A book that cannot be read is reported and skipped.
    pub fn add_opening_book(&mut self, path: impl AsRef<Path>) -> Option<Arc<dyn OpeningBook>> {
        self.books.add(path)
    }

    pub fn tournament(&self) -> &Tournament {
        &self.tournament
    }

    pub fn tournament_mut(&mut self) -> &mut Tournament {
        &mut self.tournament
    }

    /// Run the match on its own thread.
    pub fn start(self) -> anyhow::Result<MatchHandle> {
        let stop = self.tournament.stop_handle();
        let (finished_tx, finished) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("engine-match".to_string())
            .spawn(move || self.run(finished_tx))
            .context("could not start the match thread")?;
        Ok(MatchHandle {
            stop,
            finished,
            thread,
        })
    }

    /// Run the match on the calling thread.
    pub fn run(mut self, finished: Sender<()>) -> MatchSummary {
        info!(
            "{} with {} players, {} games",
            self.tournament.strategy_name(),
            self.tournament.player_count(),
            self.tournament.final_game_count()
        );
        self.tournament.start();
        while let Some(event) = self.tournament.next_event() {
            match event {
                TournamentEvent::GameStarted {
                    number,
                    white,
                    black,
                } => self.on_game_started(number, white, black),
                TournamentEvent::GameFinished {
                    number,
                    white,
                    black,
                    record,
                } => self.on_game_finished(number, white, black, &record),
                TournamentEvent::Finished => {
                    self.on_tournament_finished();
                    break;
                }
            }
        }
        let summary = self.summary();
        let _ = finished.send(());
        summary
    }

    fn print(&mut self, line: &str) {
        if self.output.write_line(line).is_err() {
            warn!("could not write progress output");
        }
    }

    fn on_game_started(&mut self, number: usize, white: usize, black: usize) {
        let line = format!(
            "Started game {} of {} ({} vs {})",
            number + 1,
            self.tournament.final_game_count(),
            self.tournament.player_at(white).name(),
            self.tournament.player_at(black).name()
        );
        info!("{line}");
        self.print(&line);
    }

    fn on_game_finished(&mut self, number: usize, white: usize, black: usize, record: &GameRecord) {
        let result = match &record.outcome {
            Some(outcome) => outcome.to_string(),
            None => "* {No result}".to_string(),
        };
        let line = format!(
            "Finished game {} ({} vs {}): {result}",
            number + 1,
            self.tournament.player_at(white).name(),
            self.tournament.player_at(black).name()
        );
        info!("{line}");
        self.print(&line);

        if self.tournament.player_count() == 2 {
            let line = score_line(self.tournament.player_at(0), self.tournament.player_at(1));
            self.print(&line);

            if let (Some(sprt), Some(outcome)) = (&mut self.sprt, record.outcome) {
                let side = if white == 0 { Side::White } else { Side::Black };
                sprt.add_game_result(outcome.result.score_for(side));
                if sprt.is_finished() {
                    info!("SPRT finished: {:?}", sprt.status().result);
                    self.tournament.stop();
                }
            }
        }

        let finished = self.tournament.finished_game_count();
        if self.rating_interval != 0 && finished % self.rating_interval == 0 {
            self.print_ranking();
        }
    }

    fn on_tournament_finished(&mut self) {
        let finished = self.tournament.finished_game_count();
        if self.rating_interval == 0 || finished % self.rating_interval != 0 {
            self.print_ranking();
        }
        if let Some(error) = self.tournament.error_string().map(String::from) {
            warn!("{error}");
            self.print(&error);
        }
        self.print("Finished match");
        self.tournament.finish_manager();
        let _ = self.output.flush();
    }

    fn print_ranking(&mut self) {
        let sprt = self.sprt.as_ref().map(Sprt::status);
        for line in ranking_lines(self.tournament.players(), sprt) {
            self.print(&line);
        }
    }

    fn summary(&self) -> MatchSummary {
        MatchSummary {
            players: self
                .tournament
                .players()
                .iter()
                .map(|p| PlayerSummary {
                    name: p.name().to_string(),
                    wins: p.wins,
                    losses: p.losses,
                    draws: p.draws,
                })
                .collect(),
            finished_games: self.tournament.finished_game_count(),
            final_game_count: self.tournament.final_game_count(),
            error: self.tournament.error_string().map(String::from),
            sprt: self.sprt.as_ref().map(Sprt::status),
        }
    }
}

/// `Score of A vs B: wins - losses - draws  [ratio] games`, from the first player's view.
fn score_line(first: &PlayerData, second: &PlayerData) -> String {
    let total = first.games();
    let ratio = if total == 0 {
        0.0
    } else {
        f64::from(first.wins * 2 + first.draws) / f64::from(total * 2)
    };
    format!(
        "Score of {} vs {}: {} - {} - {}  [{ratio:.3}] {total}",
        first.name(),
        second.name(),
        first.wins,
        second.wins,
        first.draws
    )
}

/// Elo difference of a score ratio, infinite at 0 and 1.
pub fn elo_difference(ratio: f64) -> f64 {
    let elo = -400.0 * (1.0 / ratio - 1.0).log10();
    // no "-0" for an even score
    if elo == 0.0 {
        0.0
    } else {
        elo
    }
}

/// With two players, the Elo difference of the first player that has games, and nothing
/// else. With more, a table sorted by Elo.
pub fn ranking_lines(players: &[PlayerData], sprt: Option<SprtStatus>) -> Vec<String> {
    struct Row<'a> {
        name: &'a str,
        games: u32,
        score: f64,
        draws: f64,
        elo: f64,
    }

    let mut lines = vec![];
    let mut rows = vec![];
    for player in players {
        let score = player.wins * 2 + player.draws;
        let total = player.games() * 2;
        if total == 0 {
            continue;
        }
        let ratio = f64::from(score) / f64::from(total);
        let elo = elo_difference(ratio);
        if players.len() == 2 {
            lines.push(format!("ELO difference: {elo:.0}"));
            break;
        }
        rows.push(Row {
            name: player.name(),
            games: total / 2,
            score: ratio,
            draws: f64::from(player.draws * 2) / f64::from(total),
            elo,
        });
    }

    // stable: equal ratings keep the player order
    rows.sort_by(|a, b| b.elo.total_cmp(&a.elo));
    if !rows.is_empty() {
        lines.push(format!(
            "{:>4} {:<25.25} {:>7} {:>7} {:>7} {:>7}",
            "Rank", "Name", "ELO", "Games", "Score", "Draws"
        ));
    }
    for (rank, row) in rows.iter().enumerate() {
        lines.push(format!(
            "{:>4} {:<25.25} {:>7.0} {:>7} {:>6.0}% {:>6.0}%",
            rank + 1,
            row.name,
            row.elo,
            row.games,
            row.score * 100.0,
            row.draws * 100.0
        ));
    }

    if let Some(status) = sprt {
        if status.llr != 0.0 || status.lower != 0.0 || status.upper != 0.0 {
            let mut line = format!(
                "SPRT: llr {}, lbound {}, ubound {}",
                format_general(status.llr, 3),
                format_general(status.lower, 3),
                format_general(status.upper, 3)
            );
            match status.result {
                SprtResult::AcceptH0 => line.push_str(" - H0 was accepted"),
                SprtResult::AcceptH1 => line.push_str(" - H1 was accepted"),
                SprtResult::Continue => {}
            }
            lines.push(line);
        }
    }
    lines
}

/// `%g`-style formatting with `precision` significant digits.
fn format_general(value: f64, precision: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }
    let trim = |s: String| {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    };
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let formatted = format!("{:.*e}", precision.saturating_sub(1), value);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            trim(mantissa.to_string()),
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim(format!("{value:.decimals$}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        game_manager::{
            test_players::{Census, ResignerBuilder},
            GameManager,
        },
        player::{LaunchOptions, PlayerBuilder},
        protocol::transcript::SharedBuffer,
        tournament_strategy::RoundRobinTournament,
    };

    fn player(name: &str, wins: u32, losses: u32, draws: u32) -> PlayerData {
        let census = Arc::new(Census::default());
        PlayerData {
            builder: ResignerBuilder::new(name, Duration::ZERO, &census),
            wins,
            losses,
            draws,
        }
    }

    #[test]
    fn elo_of_a_75_percent_score() {
        let elo = elo_difference(0.75);
        assert!((elo - 190.848).abs() < 0.01);
        let p = player("a", 25, 5, 10);
        assert_eq!(p.games(), 40);
        let ratio = f64::from(p.wins * 2 + p.draws) / f64::from(p.games() * 2);
        assert_eq!(ratio, 0.75);
        assert_eq!(elo_difference(0.5), 0.0);
    }

    #[test]
    fn two_players_print_only_the_difference() {
        let players = [player("new", 25, 5, 10), player("old", 5, 25, 10)];
        assert_eq!(ranking_lines(&players, None), vec!["ELO difference: 191"]);

        // the first player with games decides
        let players = [player("idle", 0, 0, 0), player("old", 5, 25, 10)];
        assert_eq!(ranking_lines(&players, None), vec!["ELO difference: -191"]);

        assert_eq!(
            score_line(&player("new", 25, 5, 10), &player("old", 5, 25, 10)),
            "Score of new vs old: 25 - 5 - 10  [0.750] 40"
        );
        // a first game without result
        assert_eq!(
            score_line(&player("new", 0, 0, 0), &player("old", 0, 0, 0)),
            "Score of new vs old: 0 - 0 - 0  [0.000] 0"
        );
    }

    #[test]
    fn debug_echo_shares_the_match_output() {
        let census = Arc::new(Census::default());
        let players: Vec<Arc<dyn PlayerBuilder>> = vec![
            ResignerBuilder::new("a", Duration::ZERO, &census),
            ResignerBuilder::new("b", Duration::ZERO, &census),
        ];
        let options = LaunchOptions {
            debug_since: Some(Instant::now()),
            ..LaunchOptions::default()
        };
        let tournament = Tournament::new(
            players,
            Box::new(RoundRobinTournament::new(2, 1)),
            GameManager::new(1, options),
        );
        let output = SharedBuffer::default();
        let engine_match = EngineMatch::new(tournament, Configuration::new().with_verbose(false))
            .unwrap()
            .with_output(Box::new(output.clone()));

        let echo = engine_match.tournament().output().clone();
        echo.write_line("12 >a: readyok").unwrap();
        assert_eq!(output.take_lines(), vec!["12 >a: readyok"]);
    }

    #[test]
    fn more_players_get_a_table() {
        let players = [
            player("a", 1, 3, 0),
            player("b", 3, 1, 0),
            player("a-very-long-engine-name-indeed", 2, 2, 0),
        ];
        let lines = ranking_lines(&players, None);
        assert_eq!(
            lines,
            vec![
                "Rank Name                          ELO   Games   Score   Draws",
                "   1 b                             191       4     75%      0%",
                "   2 a-very-long-engine-name-i       0       4     50%      0%",
                "   3 a                            -191       4     25%      0%",
            ]
        );
        assert!(!lines.iter().any(|l| l.starts_with("ELO difference")));
    }

    #[test]
    fn sprt_line() {
        let status = SprtStatus {
            llr: 0.1234,
            lower: -2.944,
            upper: 2.944,
            result: SprtResult::Continue,
        };
        let players = [player("a", 1, 0, 0), player("b", 0, 1, 0)];
        let lines = ranking_lines(&players, Some(status));
        assert_eq!(lines[1], "SPRT: llr 0.123, lbound -2.94, ubound 2.94");

        let status = SprtStatus {
            llr: 3.01,
            result: SprtResult::AcceptH1,
            ..status
        };
        let lines = ranking_lines(&players, Some(status));
        assert_eq!(lines[1], "SPRT: llr 3.01, lbound -2.94, ubound 2.94 - H1 was accepted");

        assert_eq!(format_general(1234.5, 3), "1.23e+03");
        assert_eq!(format_general(0.0001234, 3), "0.000123");
        assert_eq!(format_general(0.5, 3), "0.5");
    }

    #[test]
    fn match_output_and_summary() {
        let census = Arc::new(Census::default());
        let players: Vec<Arc<dyn PlayerBuilder>> = vec![
            ResignerBuilder::new("a", Duration::from_millis(5), &census),
            ResignerBuilder::new("b", Duration::from_millis(5), &census),
        ];
        let tournament = Tournament::new(
            players,
            Box::new(RoundRobinTournament::new(2, 2)),
            GameManager::new(2, LaunchOptions::default()),
        );
        let output = SharedBuffer::default();
        let handle = EngineMatch::new(tournament, Configuration::new().with_verbose(false))
            .unwrap()
            .with_rating_interval(3)
            .with_output(Box::new(output.clone()))
            .start()
            .unwrap();
        handle
            .finished()
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        let summary = handle.join().unwrap();

        assert_eq!(summary.finished_games, 4);
        assert_eq!(summary.players[0].wins + summary.players[0].losses, 4);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);

        let lines = output.take_lines();
        let count = |prefix: &str| lines.iter().filter(|l| l.starts_with(prefix)).count();
        assert_eq!(count("Started game"), 4);
        assert_eq!(count("Finished game"), 4);
        assert_eq!(count("Score of a vs b"), 4);
        // after game 3 and at the end
        assert_eq!(count("ELO difference"), 2);
        assert!(lines.contains(&"Started game 1 of 4 (a vs b)".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("Finished match"));
    }

    #[test]
    fn sprt_stops_the_match() {
        let census = Arc::new(Census::default());
        let players: Vec<Arc<dyn PlayerBuilder>> = vec![
            ResignerBuilder::new("a", Duration::ZERO, &census),
            ResignerBuilder::new("b", Duration::ZERO, &census),
        ];
        let tournament = Tournament::new(
            players,
            Box::new(RoundRobinTournament::new(2, 500)),
            GameManager::new(1, LaunchOptions::default()),
        );
        // a and b trade wins, far below a 200 Elo edge
        let sprt = Sprt::new(200.0, 400.0, 0.05, 0.05).unwrap();
        let summary = EngineMatch::new(tournament, Configuration::new().with_verbose(false))
            .unwrap()
            .with_sprt(sprt)
            .with_output(Box::new(std::io::sink()))
            .start()
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(summary.sprt.unwrap().result, SprtResult::AcceptH0);
        assert!(summary.finished_games < summary.final_game_count);
    }
}
