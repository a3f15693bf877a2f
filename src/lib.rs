//! # Engine Tournament
//!
//! Run matches and tournaments between chess engines speaking the UCI or xboard protocol.
//!
//! It provides:
//! - Engine processes driven over their standard streams (`EngineBuilder`, `Player`)
//! - Game rules, time controls, adjudication and opening books (`Game`, `TimeControl`)
//! - Concurrent game scheduling with optional engine reuse (`GameManager`)
//! - Pairing logic via the `TournamentStrategy` trait, with `RoundRobinTournament` and
//!   `GauntletTournament` built in
//! - Progress reporting, Elo rankings and early stopping through a sequential probability
//!   ratio test (`EngineMatch`, `Sprt`)
//!
//! Every game runs on its own thread and every engine is a separate OS process. Results are
//! gathered by a single orchestrator thread, which owns the tallies.
//!
//! # Documentation Overview
//!
//! - To run a whole match, see the [`engine_match`] module and its example.
//! - For match files and engine discovery, see [`engine_collector`].
//! - For runtime behavior (concurrency, logging, engine traffic echo), see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For pairing schemes, see the [`TournamentStrategy`](crate::tournament_strategy::TournamentStrategy)
//!   trait and its implementations.
//! - To plug in something other than an engine process, implement [`Player`](crate::player::Player)
//!   and [`PlayerBuilder`](crate::player::PlayerBuilder).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//! use engine_tournament::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_concurrency(4);
//!     let summary = EngineMatch::from_match_file(Path::new("matches/nightly.yaml"), config)?
//!         .start()?
//!         .join()?;
//!     for player in summary.players {
//!         println!("{}: +{} -{} ={}", player.name, player.wins, player.losses, player.draws);
//!     }
//!     Ok(())
//! }
//! ```

pub use anyhow;
pub mod board;
pub mod configuration;
pub mod engine_collector;
pub mod engine_match;
pub mod game;
pub mod game_manager;
mod logger;
pub mod opening_book;
pub mod outcome;
pub mod player;
pub mod process;
pub mod protocol;
pub mod sprt;
pub mod time_control;
pub mod tournament;
pub mod tournament_strategy;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use engine_tournament::prelude::*;
/// ```
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::engine_collector::MatchFile;
    pub use crate::engine_match::{EngineMatch, MatchHandle, MatchSummary};
    pub use crate::game::GameSettings;
    pub use crate::player::{EngineBuilder, Player, PlayerBuilder, Protocol};
    pub use crate::sprt::Sprt;
    pub use crate::time_control::TimeControl;
    pub use crate::tournament::Tournament;
    pub use crate::tournament_strategy::*;
}
