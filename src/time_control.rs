//! Per-player chess clocks.
//!
//! A [`TimeControl`] is both the configured limit (parsed from cutechess-style strings such
//! as `"40/60+0.5"`) and the running clock of one player during a game.

use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::{bail, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Infinite,
    /// fixed thinking time for every move
    MoveTime(Duration),
    /// `moves` moves in `base` (0 = whole game), `increment` added after every move
    Session {
        moves: u32,
        base: Duration,
        increment: Duration,
    },
}

/// Time control of one player, with its clock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeControl {
    limit: Limit,
    margin: Duration,
    time_left: Duration,
    moves_left: u32,
    last_move_time: Duration,
}

impl TimeControl {
    /// No limit at all. Engines are told to think forever, so only useful with
    /// [`ChannelPlayer`](crate::player::ChannelPlayer)s or adjudication.
    pub fn infinite() -> Self {
        Self::from_limit(Limit::Infinite)
    }

    /// Fixed time per move.
    pub fn per_move(move_time: Duration) -> Self {
        Self::from_limit(Limit::MoveTime(move_time))
    }

    /// `moves` moves in `base`, refilled every `moves` moves (`0` = sudden death),
    /// plus `increment` per move.
    pub fn session(moves: u32, base: Duration, increment: Duration) -> Self {
        Self::from_limit(Limit::Session {
            moves,
            base,
            increment,
        })
    }

    fn from_limit(limit: Limit) -> Self {
        let mut tc = TimeControl {
            limit,
            margin: Duration::ZERO,
            time_left: Duration::ZERO,
            moves_left: 0,
            last_move_time: Duration::ZERO,
        };
        tc.start_game();
        tc
    }

    /// Grace period before a flag falls, absorbing pipe and scheduling latency.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn is_infinite(&self) -> bool {
        self.limit == Limit::Infinite
    }

    pub fn move_time(&self) -> Option<Duration> {
        match self.limit {
            Limit::MoveTime(t) => Some(t),
            _ => None,
        }
    }

    pub fn moves_per_tc(&self) -> u32 {
        match self.limit {
            Limit::Session { moves, .. } => moves,
            _ => 0,
        }
    }

    pub fn base(&self) -> Duration {
        match self.limit {
            Limit::Session { base, .. } => base,
            _ => Duration::ZERO,
        }
    }

    pub fn increment(&self) -> Duration {
        match self.limit {
            Limit::Session { increment, .. } => increment,
            _ => Duration::ZERO,
        }
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Remaining clock time (session controls), or the per-move time.
    pub fn time_left(&self) -> Duration {
        match self.limit {
            Limit::MoveTime(t) => t,
            _ => self.time_left,
        }
    }

    /// Moves left until the next session refill (0 when not applicable).
    pub fn moves_left(&self) -> u32 {
        self.moves_left
    }

    pub fn last_move_time(&self) -> Duration {
        self.last_move_time
    }

    /// Reset the clock for a new game.
    pub fn start_game(&mut self) {
        if let Limit::Session { moves, base, .. } = self.limit {
            self.time_left = base;
            self.moves_left = moves;
        }
        self.last_move_time = Duration::ZERO;
    }

    /// Time the player may use for the current move before losing on time,
    /// margin included. `None` means no limit.
    pub fn available(&self) -> Option<Duration> {
        match self.limit {
            Limit::Infinite => None,
            Limit::MoveTime(t) => Some(t + self.margin),
            Limit::Session { .. } => Some(self.time_left + self.margin),
        }
    }

    /// Charge `elapsed` to the clock.
    ///
    /// Returns `false` when the flag fell.
    pub fn finish_move(&mut self, elapsed: Duration) -> bool {
        self.last_move_time = elapsed;
        match self.limit {
            Limit::Infinite => true,
            Limit::MoveTime(t) => elapsed <= t + self.margin,
            Limit::Session {
                moves,
                base,
                increment,
            } => {
                if elapsed > self.time_left + self.margin {
                    self.time_left = Duration::ZERO;
                    return false;
                }
                self.time_left = self.time_left.saturating_sub(elapsed) + increment;
                if moves > 0 {
                    self.moves_left = self.moves_left.saturating_sub(1);
                    if self.moves_left == 0 {
                        self.time_left += base;
                        self.moves_left = moves;
                    }
                }
                true
            }
        }
    }
}

impl Default for TimeControl {
    fn default() -> Self {
        Self::infinite()
    }
}

fn parse_seconds(s: &str) -> anyhow::Result<Duration> {
    let secs: f64 = s
        .trim()
        .parse()
        .with_context(|| format!("invalid number of seconds '{s}'"))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("invalid number of seconds '{s}'");
    }
    Ok(Duration::from_secs_f64(secs))
}

/// `"90"` or `"1:30"` (minutes:seconds)
fn parse_base(s: &str) -> anyhow::Result<Duration> {
    match s.split_once(':') {
        Some((min, sec)) => {
            let min: u64 = min
                .parse()
                .with_context(|| format!("invalid minutes '{min}'"))?;
            Ok(Duration::from_secs(min * 60) + parse_seconds(sec)?)
        }
        None => parse_seconds(s),
    }
}

impl FromStr for TimeControl {
    type Err = anyhow::Error;

    /// Accepted forms: `inf`, `st=<secs>`, `[moves/]base[+inc]` where `base` is
    /// seconds or `min:sec`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("inf") || s.eq_ignore_ascii_case("infinite") {
            return Ok(Self::infinite());
        }
        if let Some(secs) = s.strip_prefix("st=") {
            return Ok(Self::per_move(parse_seconds(secs)?));
        }

        let (moves, rest) = match s.split_once('/') {
            Some((moves, rest)) => {
                let moves: u32 = moves
                    .parse()
                    .with_context(|| format!("invalid move count in '{s}'"))?;
                (moves, rest)
            }
            None => (0, s),
        };
        let (base, increment) = match rest.split_once('+') {
            Some((base, inc)) => (parse_base(base)?, parse_seconds(inc)?),
            None => (parse_base(rest)?, Duration::ZERO),
        };
        if base.is_zero() && increment.is_zero() {
            bail!("time control '{s}' gives no time at all");
        }
        Ok(Self::session(moves, base, increment))
    }
}

pub(crate) fn format_seconds(d: Duration) -> String {
    let s = format!("{:.3}", d.as_secs_f64());
    match s.trim_end_matches('0').trim_end_matches('.') {
        "" => "0".to_string(),
        s => s.to_string(),
    }
}

impl Display for TimeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.limit {
            Limit::Infinite => write!(f, "inf"),
            Limit::MoveTime(t) => write!(f, "st={}", format_seconds(t)),
            Limit::Session {
                moves,
                base,
                increment,
            } => {
                if moves > 0 {
                    write!(f, "{moves}/")?;
                }
                write!(f, "{}", format_seconds(base))?;
                if !increment.is_zero() {
                    write!(f, "+{}", format_seconds(increment))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let tc: TimeControl = "40/60+0.5".parse().unwrap();
        assert_eq!(tc.moves_per_tc(), 40);
        assert_eq!(tc.base(), Duration::from_secs(60));
        assert_eq!(tc.increment(), Duration::from_millis(500));
        assert_eq!(tc.to_string(), "40/60+0.5");

        let tc: TimeControl = "1:30".parse().unwrap();
        assert_eq!(tc.base(), Duration::from_secs(90));
        assert_eq!(tc.moves_per_tc(), 0);

        let tc: TimeControl = "st=2".parse().unwrap();
        assert_eq!(tc.move_time(), Some(Duration::from_secs(2)));
        assert_eq!(tc.to_string(), "st=2");

        assert!("inf".parse::<TimeControl>().unwrap().is_infinite());
        assert!("abc".parse::<TimeControl>().is_err());
        assert!("0".parse::<TimeControl>().is_err());
        assert!("-3".parse::<TimeControl>().is_err());
    }

    #[test]
    fn increment_is_added_after_each_move() {
        let mut tc = TimeControl::session(0, Duration::from_secs(10), Duration::from_secs(1));
        assert!(tc.finish_move(Duration::from_secs(3)));
        assert_eq!(tc.time_left(), Duration::from_secs(8));
        assert_eq!(tc.available(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn session_is_refilled() {
        let mut tc = TimeControl::session(2, Duration::from_secs(10), Duration::ZERO);
        assert!(tc.finish_move(Duration::from_secs(4)));
        assert_eq!(tc.moves_left(), 1);
        assert!(tc.finish_move(Duration::from_secs(4)));
        assert_eq!(tc.moves_left(), 2);
        assert_eq!(tc.time_left(), Duration::from_secs(12));
    }

    #[test]
    fn flag_falls() {
        let mut tc = TimeControl::session(0, Duration::from_secs(1), Duration::ZERO)
            .with_margin(Duration::from_millis(100));
        assert!(!tc.finish_move(Duration::from_millis(1200)));
        assert_eq!(tc.time_left(), Duration::ZERO);

        let mut tc = TimeControl::per_move(Duration::from_millis(100));
        assert!(tc.finish_move(Duration::from_millis(90)));
        assert!(!tc.finish_move(Duration::from_millis(150)));

        tc.start_game();
        assert!(TimeControl::infinite().finish_move(Duration::from_secs(3600)));
    }
}
