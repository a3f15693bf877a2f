//! Engine protocols.
//!
//! Both protocol variants share the same shape: an [`EngineCore`] owning the process, the
//! readiness [`EngineState`] and the clock, plus a variant specific vocabulary implemented in
//! [`xboard`] and [`uci`]. Incoming lines are turned into [`PlayerEvent`]s; outgoing commands
//! are written and flushed one line at a time.

use std::{
    fmt::Display,
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::bail;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    board::{MoveNotation, Side},
    engine_match::SharedOutput,
    outcome::GameResult,
    process::{EngineProcess, ReadLine},
    time_control::TimeControl,
};

pub mod uci;
pub mod xboard;

/// Grace period given to an engine between `quit` and being killed.
pub(crate) const QUIT_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Xboard,
    Uci,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Xboard => write!(f, "xboard"),
            Protocol::Uci => write!(f, "uci"),
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xboard" | "winboard" | "cecp" => Ok(Protocol::Xboard),
            "uci" => Ok(Protocol::Uci),
            _ => bail!("unknown protocol '{s}' (expected 'xboard' or 'uci')"),
        }
    }
}

/// Readiness of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Initializing,
    Ready,
    Thinking,
    Terminated,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not ready (state: {0:?})")]
    NotReady(EngineState),
    #[error("could not write to engine: {0}")]
    Write(#[source] std::io::Error),
    #[error("engine is terminated")]
    Terminated,
    #[error("engine could not be started: {0}")]
    Spawn(String),
}

/// Evaluation reported by an engine, from its own point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    /// mate in N moves (negative: getting mated)
    Mate(i32),
}

impl Score {
    const MATE_CP: i32 = 30_000;
    const MAX_MATE: i32 = 1_000;

    /// Centipawn value, with mates mapped far outside any material score.
    pub fn centipawns(self) -> i32 {
        match self {
            Score::Centipawns(cp) => cp,
            Score::Mate(n) => match n.clamp(-Self::MAX_MATE, Self::MAX_MATE) {
                n if n >= 0 => Self::MATE_CP - n,
                n => -Self::MATE_CP - n,
            },
        }
    }
}

/// Something a player did or said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// initialization (or per-game reset) completed
    Ready,
    /// move text, in the player's notation
    Move(String),
    Score(Score),
    Resign,
    DrawOffer,
    /// the engine claims a result ("1-0 {White mates}")
    ClaimResult { result: GameResult, comment: String },
    /// the engine refused a move it was sent
    RejectedMove(String),
    /// soft protocol violation, counted against the engine
    ProtocolError(String),
    /// stdout closed or stdin broken
    Disconnected,
}

/// A move that was played on the board, in the notations players may need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayedMove {
    pub coordinate: String,
    pub san: String,
}

impl PlayedMove {
    pub fn in_notation(&self, notation: MoveNotation) -> &str {
        match notation {
            MoveNotation::Long => &self.coordinate,
            MoveNotation::Standard => &self.san,
        }
    }
}

/// Options applied to every engine process a builder launches.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// echo engine traffic to `output`, stamped with milliseconds since this instant
    pub debug_since: Option<Instant>,
    /// keep the engine's stderr attached
    pub engine_stderr: bool,
    pub output: SharedOutput,
}

impl LaunchOptions {
    pub fn debug_echo(&self) -> Option<DebugEcho> {
        self.debug_since.map(|since| DebugEcho {
            since,
            output: self.output.clone(),
        })
    }
}

/// Where an engine echoes its traffic in debug mode.
#[derive(Debug, Clone)]
pub struct DebugEcho {
    pub since: Instant,
    pub output: SharedOutput,
}

/// State shared by both protocol variants.
#[derive(Debug)]
pub(crate) struct EngineCore {
    pub(crate) process: EngineProcess,
    pub(crate) name: String,
    pub(crate) state: EngineState,
    pub(crate) notation: MoveNotation,
    pub(crate) side: Side,
    pub(crate) time_control: TimeControl,
    pub(crate) protocol_errors: u32,
    debug: Option<DebugEcho>,
}

impl EngineCore {
    pub(crate) fn new(
        process: EngineProcess,
        name: &str,
        time_control: TimeControl,
        debug: Option<DebugEcho>,
    ) -> Self {
        EngineCore {
            process,
            name: name.to_string(),
            state: EngineState::Created,
            notation: MoveNotation::Long,
            side: Side::White,
            time_control,
            protocol_errors: 0,
            debug,
        }
    }

    fn echo(&self, direction: char, line: &str) {
        if let Some(debug) = &self.debug {
            let echo = format!(
                "{} {direction}{}: {line}",
                debug.since.elapsed().as_millis(),
                self.name
            );
            if debug.output.write_line(&echo).is_err() {
                warn!("{}: could not echo engine traffic", self.name);
            }
        }
    }

    /// Write one command line. A failed write is fatal for the engine.
    pub(crate) fn write(&mut self, line: &str) -> Result<(), EngineError> {
        if self.state == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        self.echo('<', line);
        self.process.write_line(line).map_err(|e| {
            warn!("{}: write failed: {e}", self.name);
            self.state = EngineState::Terminated;
            EngineError::Write(e)
        })
    }

    pub(crate) fn require_ready(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Terminated => Err(EngineError::Terminated),
            state => Err(EngineError::NotReady(state)),
        }
    }

    /// Next line from the engine. A closed stream terminates the engine.
    pub(crate) fn read(&mut self, timeout: Duration) -> ReadLine {
        let line = self.process.read_line(timeout);
        match &line {
            ReadLine::Line(text) => self.echo('>', text),
            ReadLine::Timeout => {}
            ReadLine::Closed => {
                if self.state != EngineState::Terminated {
                    debug!("{}: output stream closed", self.name);
                }
                self.state = EngineState::Terminated;
            }
        }
        line
    }

    /// Throw away output that arrived before this call, such as a move from an earlier
    /// game that came in after its deadline.
    pub(crate) fn discard_pending(&mut self) {
        loop {
            match self.process.try_read_line() {
                ReadLine::Line(line) => {
                    self.echo('>', &line);
                    debug!("{}: discarding stale '{line}'", self.name);
                }
                ReadLine::Timeout => break,
                ReadLine::Closed => {
                    self.state = EngineState::Terminated;
                    break;
                }
            }
        }
    }

    pub(crate) fn protocol_error(&mut self, message: String) -> PlayerEvent {
        self.protocol_errors += 1;
        warn!("{}: protocol error: {message}", self.name);
        PlayerEvent::ProtocolError(message)
    }

    /// Send `quit`, then reclaim the process.
    pub(crate) fn quit(&mut self) {
        if self.state != EngineState::Terminated {
            let _ = self.write("quit");
        }
        self.state = EngineState::Terminated;
        if let Err(e) = self.process.try_kill(QUIT_GRACE) {
            warn!("{}: {e:#}", self.name);
        }
    }
}

/// Event loop shared by the protocol variants.
pub(crate) trait LineProtocol {
    fn core_mut(&mut self) -> &mut EngineCore;

    /// Turn one line of engine output into at most one event.
    fn parse_line(&mut self, line: &str) -> Option<PlayerEvent>;

    /// Deadline of a pending protocol timer.
    fn timer(&self) -> Option<Instant> {
        None
    }

    /// Called once the timer deadline has passed.
    fn on_timer(&mut self) -> Option<PlayerEvent> {
        None
    }

    /// Read lines until one produces an event or `timeout` elapses.
    ///
    /// Buffered lines are always drained, even with a zero timeout.
    fn read_event(&mut self, timeout: Duration) -> Option<PlayerEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.timer().is_some_and(|t| Instant::now() >= t) {
                if let Some(event) = self.on_timer() {
                    return Some(event);
                }
            }
            let now = Instant::now();
            let mut wait = deadline.saturating_duration_since(now);
            if let Some(timer) = self.timer() {
                wait = wait.min(timer.saturating_duration_since(now));
            }
            match self.core_mut().read(wait) {
                ReadLine::Line(line) => {
                    if let Some(event) = self.parse_line(&line) {
                        return Some(event);
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                ReadLine::Timeout => {
                    if Instant::now() >= deadline
                        && !self.timer().is_some_and(|t| Instant::now() >= t)
                    {
                        return None;
                    }
                }
                ReadLine::Closed => return Some(PlayerEvent::Disconnected),
            }
        }
    }
}

/// Split off the first whitespace-separated word.
pub(crate) fn first_word(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    }
}

/// Milliseconds, never below 1 so engines do not read it as "no time".
pub(crate) fn millis(d: Duration) -> u128 {
    d.as_millis().max(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names() {
        assert_eq!("UCI".parse::<Protocol>().unwrap(), Protocol::Uci);
        assert_eq!("xboard".parse::<Protocol>().unwrap(), Protocol::Xboard);
        assert!("usi".parse::<Protocol>().is_err());
    }

    #[test]
    fn mate_scores_dominate() {
        assert!(Score::Mate(3).centipawns() > Score::Centipawns(5000).centipawns());
        assert!(Score::Mate(-1).centipawns() < Score::Centipawns(-5000).centipawns());
        assert_eq!(Score::Mate(i32::MIN).centipawns(), -29_000);
        assert_eq!(Score::Mate(i32::MAX).centipawns(), 29_000);
        assert_eq!(Score::Centipawns(i32::MIN).centipawns(), i32::MIN);
    }

    #[test]
    fn traffic_is_echoed_to_the_shared_output() {
        let (process, _buffer, tx) = transcript::fake_process();
        let captured = transcript::SharedBuffer::default();
        let output = SharedOutput::new(Box::new(captured.clone()));
        let debug = DebugEcho {
            since: Instant::now(),
            output,
        };
        let mut core = EngineCore::new(process, "echo", TimeControl::infinite(), Some(debug));
        core.write("uci").unwrap();
        tx.send("uciok".into()).unwrap();
        assert!(matches!(core.read(Duration::from_secs(1)), ReadLine::Line(_)));

        let lines = captured.take_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" <echo: uci"), "{lines:?}");
        assert!(lines[1].ends_with(" >echo: uciok"), "{lines:?}");
    }

    #[test]
    fn words() {
        assert_eq!(first_word("  bestmove e2e4 ponder e7e5"), ("bestmove", "e2e4 ponder e7e5"));
        assert_eq!(first_word("uciok"), ("uciok", ""));
    }
}
