//! Match files: which engines play, and how.
//!
//! A match file is a small YAML-like text file:
//!
//! ```yaml
//! games: 2            # games per encounter
//! rounds: 50
//! tc: 40/60+0.5
//! timemargin: 50      # milliseconds an engine may overrun its clock
//! tournament: round-robin
//! book: books/performance.bin
//! book-depth: 8
//! sprt: 0 5 0.05 0.05
//! engines:
//!   - new: "uci ./engines/new --hash 64"
//!   - old: "xboard ./engines/old"
//! ```
//!
//! > ⚠️ This file is manually parsed and supports only the subset shown above. Comments
//! > are supported, but other YAML features (nesting, anchors, multi-line strings) are not.
//!
//! Relative engine commands are resolved against the directory of the match file, and each
//! engine runs in the directory of its executable.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tracing::{error, info, instrument};

use crate::{
    configuration::Configuration,
    game::{DrawAdjudication, GameSettings, ResignAdjudication},
    player::{EngineBuilder, PlayerBuilder, Protocol},
    protocol::xboard,
    sprt::Sprt,
    time_control::TimeControl,
    tournament_strategy::{GauntletTournament, RoundRobinTournament, TournamentStrategy},
};

mod config_file_utils;

pub use config_file_utils::parse_match_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TournamentKind {
    #[default]
    RoundRobin,
    Gauntlet,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtParameters {
    pub elo0: f64,
    pub elo1: f64,
    pub alpha: f64,
    pub beta: f64,
}

/// One `- name: "protocol command args"` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEntry {
    pub name: String,
    pub protocol: Protocol,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchFile {
    /// games per encounter
    pub games: u32,
    pub rounds: u32,
    pub concurrency: Option<usize>,
    pub time_control: TimeControl,
    pub time_margin: Duration,
    pub tournament: TournamentKind,
    pub book: Option<PathBuf>,
    pub book_depth: u32,
    pub fen: Option<String>,
    pub rating_interval: Option<usize>,
    pub sprt: Option<SprtParameters>,
    pub seed: Option<u64>,
    pub repeat: bool,
    pub reuse_engines: Option<bool>,
    pub max_moves: Option<u32>,
    pub max_protocol_errors: Option<u32>,
    pub draw_adjudication: Option<DrawAdjudication>,
    pub resign_adjudication: Option<ResignAdjudication>,
    pub debug: Option<bool>,
    pub engines: Vec<EngineEntry>,
}

impl Default for MatchFile {
    fn default() -> Self {
        MatchFile {
            games: 2,
            rounds: 1,
            concurrency: None,
            time_control: TimeControl::session(40, Duration::from_secs(60), Duration::ZERO),
            time_margin: Duration::ZERO,
            tournament: TournamentKind::RoundRobin,
            book: None,
            book_depth: 8,
            fen: None,
            rating_interval: None,
            sprt: None,
            seed: None,
            repeat: false,
            reuse_engines: None,
            max_moves: None,
            max_protocol_errors: None,
            draw_adjudication: None,
            resign_adjudication: None,
            debug: None,
            engines: vec![],
        }
    }
}

impl MatchFile {
    #[instrument]
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("could not read match file '{}'", path.display()))?;
        parse_match_file(&yaml).with_context(|| format!("invalid match file '{}'", path.display()))
    }

    /// `config` with the values this file overrides.
    pub fn apply(&self, mut config: Configuration) -> Configuration {
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(interval) = self.rating_interval {
            config = config.with_rating_interval(interval);
        }
        if let Some(reuse) = self.reuse_engines {
            config = config.with_reuse_engines(reuse);
        }
        if let Some(debug) = self.debug {
            config = config.with_debug(debug);
        }
        config
    }

    pub fn game_settings(&self, base: GameSettings) -> GameSettings {
        let settings = base
            .with_start_fen(self.fen.clone())
            .with_max_moves(self.max_moves)
            .with_draw_adjudication(self.draw_adjudication)
            .with_resign_adjudication(self.resign_adjudication);
        match self.max_protocol_errors {
            Some(count) => settings.with_max_protocol_errors(count),
            None => settings,
        }
    }

    /// The clock every engine plays with, `timemargin` included.
    pub fn time_control(&self) -> TimeControl {
        self.time_control.clone().with_margin(self.time_margin)
    }

    pub fn strategy(&self) -> Box<dyn TournamentStrategy> {
        let games = self.games.max(1);
        let rounds = self.rounds.max(1);
        match self.tournament {
            TournamentKind::RoundRobin => Box::new(RoundRobinTournament::new(games, rounds)),
            TournamentKind::Gauntlet => Box::new(GauntletTournament::new(games, rounds)),
        }
    }

    pub fn sprt(&self) -> anyhow::Result<Option<Sprt>> {
        self.sprt
            .map(|p| Sprt::new(p.elo0, p.elo1, p.alpha, p.beta))
            .transpose()
    }
}

/// Where `command` lives: relative paths are taken from `base`, bare names from `PATH`.
fn resolve_command(base: &Path, command: &str) -> anyhow::Result<(String, Option<PathBuf>)> {
    if !command.contains('/') {
        return Ok((command.to_string(), None));
    }
    let path = base.join(command);
    let metadata = path
        .metadata()
        .with_context(|| format!("not found: {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("not a file: {}", path.display());
    }
    let path = path.canonicalize().unwrap_or(path);
    let dir = path.parent().map(Path::to_path_buf);
    Ok((path.to_string_lossy().into_owned(), dir))
}

/// Builders for the engines of `file`. Engines whose executable is missing are reported
/// and skipped.
#[instrument(skip(file, config))]
pub fn collect_engines(
    file: &MatchFile,
    base_dir: &Path,
    config: Configuration,
) -> anyhow::Result<Vec<Arc<dyn PlayerBuilder>>> {
    let verbose = config.verbose;

    const RED: &str = "\x1b[31m";
    const GREEN: &str = "\x1b[32m";
    const RESET: &str = "\x1b[0m";

    let longest_name = file.engines.iter().map(|e| e.name.len()).max().unwrap_or(0) + 3; // at least 3 dots

    if verbose {
        println!("Collecting engines...");
    }

    let time_control = file.time_control();
    if file.engines.iter().any(|e| e.protocol == Protocol::Xboard) {
        xboard::check_time_control(&time_control)?;
    }

    let mut builders: Vec<Arc<dyn PlayerBuilder>> = vec![];
    for engine in &file.engines {
        let name = &engine.name;
        if verbose {
            print!("Collecting {name:·<longest_name$} ");
            let _ = std::io::stdout().flush(); // try to flush stdout
        }

        let (command, working_dir) = match resolve_command(base_dir, &engine.command) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("engine '{name}': {e:#}");
                if verbose {
                    println!("{RED}{e:#}{RESET}");
                }
                continue;
            }
        };

        let mut builder = EngineBuilder::new(name, &command, engine.protocol)
            .with_args(engine.args.clone())
            .with_time_control(time_control.clone());
        if let Some(dir) = working_dir {
            builder = builder.with_working_dir(dir);
        }
        info!(?builder);
        builders.push(Arc::new(builder));

        if verbose {
            println!("{GREEN}Ok{RESET}");
        }
    }

    Ok(builders)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn engines_are_resolved_against_the_match_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        File::create(dir.path().join("bin/present")).unwrap();

        let file = parse_match_file(
            "tc: st=1\nengines:\n - a: \"uci ./bin/present -v\"\n - b: \"uci ./bin/missing\"\n - c: \"xboard sh\"",
        )
        .unwrap();
        let config = Configuration::new().with_verbose(false);
        let builders = collect_engines(&file, dir.path(), config).unwrap();
        let names: Vec<_> = builders.iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn xboard_engines_reject_sub_second_moves() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::new().with_verbose(false);

        let file = parse_match_file("tc: st=0.5
engines:
 - a: \"uci sh\"").unwrap();
        assert_eq!(collect_engines(&file, dir.path(), config).unwrap().len(), 1);

        let file =
            parse_match_file("tc: st=0.5
engines:
 - a: \"uci sh\"
 - b: \"xboard sh\"")
                .unwrap();
        let err = collect_engines(&file, dir.path(), config).unwrap_err();
        assert!(err.to_string().contains("one second"), "{err}");
    }

    #[test]
    fn time_margin_reaches_the_engines() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            parse_match_file("tc: st=2
timemargin: 150
engines:
 - a: \"uci sh\"").unwrap();
        assert_eq!(
            file.time_control().available(),
            Some(Duration::from_millis(2150))
        );
        let config = Configuration::new().with_verbose(false);
        let builders = collect_engines(&file, dir.path(), config).unwrap();
        assert!(format!("{:?}", builders[0]).contains("margin: 150ms"));
    }

    #[test]
    fn file_overrides() {
        let mut file = parse_match_file(
            "concurrency: 3\nrating-interval: 0\ntournament: gauntlet\ngames: 1\nrounds: 2\nsprt: 0 5 0.05 0.05\nengines:\n - a: \"uci a\"",
        )
        .unwrap();
        let config = file.apply(Configuration::new());
        assert_eq!(config.concurrency(), 3);
        assert_eq!(config.rating_interval(), 0);
        let settings = format!("{:?}", file.game_settings(GameSettings::new()));
        assert!(settings.contains("max_protocol_errors: 3"), "{settings}");
        file.max_protocol_errors = Some(0);
        let settings = format!("{:?}", file.game_settings(GameSettings::new()));
        assert!(settings.contains("max_protocol_errors: 0"), "{settings}");

        let mut strategy = file.strategy();
        strategy.init(3);
        assert_eq!(strategy.name(), "gauntlet");
        assert_eq!(strategy.final_game_count(), 4);
        assert!(file.sprt().unwrap().is_some());

        file.sprt = Some(SprtParameters {
            elo0: 5.0,
            elo1: 0.0,
            alpha: 0.05,
            beta: 0.05,
        });
        assert!(file.sprt().is_err());
    }
}
