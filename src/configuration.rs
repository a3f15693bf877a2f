//! Config for the match runner behaviors
//!
//! This module provides configuration options for controlling how a match is run and
//! reported.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Flags are case-insensitive: set them to `"true"` to enable them.
//!
//! - `MATCH_VERBOSE`: Print match progress to stdout (default: `true`)
//! - `MATCH_LOG`: Enable logging to a file (default: `false`)
//! - `MATCH_DEBUG`: Echo all engine traffic to stdout (default: `false`)
//! - `MATCH_ENGINE_STDERR`: Let engines write to the terminal's stderr (default: `false`)
//! - `MATCH_REUSE_ENGINES`: Keep engines running between games (default: `false`)
//! - `MATCH_CONCURRENCY`: Number of games played at once (default: physical CPU count)
//! - `MATCH_RATING_INTERVAL`: Print the ranking every N games, `0` only at the end
//!   (default: `10`)
//! - `MATCH_STARTUP_TIMEOUT_MS`: Time an engine gets to become ready (default: `10000`)

use std::time::{Duration, Instant};

use crate::{game::GameSettings, game_manager::GameManager, player::LaunchOptions};

/// Configuration for match runner behaviors.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) debug: bool,
    pub(crate) engine_stderr: bool,
    pub(crate) reuse_engines: bool,
    pub(crate) concurrency: usize,
    pub(crate) rating_interval: usize,
    pub(crate) startup_timeout: Duration,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Engine traffic is not echoed.
    /// - Engine stderr output is discarded.
    /// - Engines are restarted for every game.
    /// - One game runs per physical CPU.
    /// - The ranking is printed every 10 games.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            debug: false,
            engine_stderr: false,
            reuse_engines: false,
            concurrency: num_cpus::get_physical(),
            rating_interval: 10,
            startup_timeout: Duration::from_secs(10),
        }
    }

    /// Create configuration from environment variables (see the [module](self) documentation).
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_number(var: &str, default: u64) -> u64 {
            std::env::var(var)
                .ok()
                .and_then(|val| val.trim().parse().ok())
                .unwrap_or(default)
        }

        let default = Self::new();
        Self {
            verbose: get_env_flag("MATCH_VERBOSE", true),
            log: get_env_flag("MATCH_LOG", false),
            debug: get_env_flag("MATCH_DEBUG", false),
            engine_stderr: get_env_flag("MATCH_ENGINE_STDERR", false),
            reuse_engines: get_env_flag("MATCH_REUSE_ENGINES", false),
            concurrency: get_env_number("MATCH_CONCURRENCY", default.concurrency as u64).max(1)
                as usize,
            rating_interval: get_env_number(
                "MATCH_RATING_INTERVAL",
                default.rating_interval as u64,
            ) as usize,
            startup_timeout: Duration::from_millis(get_env_number(
                "MATCH_STARTUP_TIMEOUT_MS",
                default.startup_timeout.as_millis() as u64,
            )),
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Echo every line exchanged with engines, prefixed with the milliseconds since start.
    pub fn with_debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }

    /// Enable or disable engine stderr output (debug purposes only).
    pub fn with_engine_stderr(mut self, value: bool) -> Self {
        self.engine_stderr = value;
        self
    }

    /// Keep engines alive between games.
    pub fn with_reuse_engines(mut self, value: bool) -> Self {
        self.reuse_engines = value;
        self
    }

    /// Number of games played at the same time, at least one.
    pub fn with_concurrency(mut self, value: usize) -> Self {
        self.concurrency = value.max(1);
        self
    }

    /// Print the ranking every `value` finished games. `0` prints it only at the end.
    pub fn with_rating_interval(mut self, value: usize) -> Self {
        self.rating_interval = value;
        self
    }

    pub fn with_startup_timeout(mut self, value: Duration) -> Self {
        self.startup_timeout = value;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn rating_interval(&self) -> usize {
        self.rating_interval
    }

    /// How engines are launched. Debug timestamps count from this call.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            debug_since: self.debug.then(Instant::now),
            engine_stderr: self.engine_stderr,
            ..LaunchOptions::default()
        }
    }

    /// A game manager with this concurrency and engine reuse policy.
    pub fn game_manager(&self) -> GameManager {
        GameManager::new(self.concurrency, self.launch_options())
            .with_reuse_engines(self.reuse_engines)
    }

    /// Game settings carrying the startup timeout.
    pub fn game_settings(&self) -> GameSettings {
        GameSettings::new().with_startup_timeout(self.startup_timeout)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
