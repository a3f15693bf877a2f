//! Xboard / Winboard (CECP version 2) engines.

use std::time::{Duration, Instant};

use anyhow::bail;
use tracing::{debug, info, warn};

use super::{
    first_word, DebugEcho, EngineCore, EngineError, EngineState, LineProtocol, PlayedMove,
    PlayerEvent, Protocol, Score,
};
use crate::{
    board::{MoveNotation, Side},
    outcome::{GameResult, Outcome},
    player::Player,
    process::EngineProcess,
    time_control::{format_seconds, TimeControl},
};

/// How long an engine may stay silent about `feature done` before it is assumed to be an
/// old protocol 1 engine.
const INIT_GRACE: Duration = Duration::from_secs(2);

/// Xboard thinking output reports mates as `100000 + N`.
const XBOARD_MATE: i32 = 100_000;

#[derive(Debug, Clone)]
struct Features {
    usermove: bool,
    ping: bool,
    setboard: bool,
    time: bool,
    reuse: bool,
    name: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            usermove: false,
            ping: false,
            setboard: false,
            time: true,
            reuse: true,
            name: false,
        }
    }
}

#[derive(Debug)]
pub struct XboardEngine {
    core: EngineCore,
    features: Features,
    init_deadline: Option<Instant>,
    init_lines: Vec<String>,
    force_mode: bool,
    ping_counter: u32,
    awaiting_pong: Option<u32>,
}

impl XboardEngine {
    /// Start the handshake (`xboard`, `protover 2`) on a freshly launched process.
    ///
    /// `init_lines` are sent verbatim once the engine finished announcing its features.
    pub fn start(
        process: EngineProcess,
        name: &str,
        time_control: TimeControl,
        init_lines: Vec<String>,
        debug: Option<DebugEcho>,
    ) -> Result<Self, EngineError> {
        let mut engine = XboardEngine {
            core: EngineCore::new(process, name, time_control, debug),
            features: Features::default(),
            init_deadline: None,
            init_lines,
            force_mode: false,
            ping_counter: 0,
            awaiting_pong: None,
        };
        engine.core.write("xboard")?;
        engine.core.write("protover 2")?;
        engine.core.state = EngineState::Initializing;
        engine.init_deadline = Some(Instant::now() + INIT_GRACE);
        Ok(engine)
    }

    fn finish_init(&mut self) -> Option<PlayerEvent> {
        self.init_deadline = None;
        if self.core.state != EngineState::Initializing {
            return None;
        }
        for line in std::mem::take(&mut self.init_lines) {
            if self.core.write(&line).is_err() {
                return Some(PlayerEvent::Disconnected);
            }
        }
        self.core.state = EngineState::Ready;
        debug!("{}: initialized", self.core.name);
        Some(PlayerEvent::Ready)
    }

    fn enter_force_mode(&mut self) -> Result<(), EngineError> {
        if !self.force_mode {
            self.core.write("force")?;
            self.force_mode = true;
        }
        Ok(())
    }

    fn parse_features(&mut self, args: &str) -> Option<PlayerEvent> {
        let mut done = false;
        for (name, value) in split_features(args) {
            let enabled = value == "1";
            let accepted = match name.as_str() {
                "done" => {
                    if enabled {
                        done = true;
                    } else {
                        // done=0: wait for done=1 however long it takes
                        self.init_deadline = None;
                    }
                    true
                }
                "san" => {
                    self.core.notation = if enabled {
                        MoveNotation::Standard
                    } else {
                        MoveNotation::Long
                    };
                    true
                }
                "usermove" => {
                    self.features.usermove = enabled;
                    true
                }
                "ping" => {
                    self.features.ping = enabled;
                    true
                }
                "setboard" => {
                    self.features.setboard = enabled;
                    true
                }
                "time" => {
                    self.features.time = enabled;
                    true
                }
                "reuse" => {
                    self.features.reuse = enabled;
                    true
                }
                "name" => {
                    self.features.name = enabled;
                    true
                }
                "myname" => {
                    info!("{}: engine calls itself '{value}'", self.core.name);
                    true
                }
                "sigint" | "sigterm" | "debug" | "draw" | "colors" | "analyze" | "variants" => {
                    true
                }
                _ => false,
            };
            let reply = if accepted { "accepted" } else { "rejected" };
            if self.core.write(&format!("{reply} {name}")).is_err() {
                return Some(PlayerEvent::Disconnected);
            }
        }
        if done {
            self.finish_init()
        } else {
            None
        }
    }

    fn on_move(&mut self, text: &str) -> Option<PlayerEvent> {
        if self.awaiting_pong.is_some() {
            debug!("{}: ignoring move '{text}' from previous game", self.core.name);
            return None;
        }
        if self.core.state != EngineState::Thinking {
            return Some(self.core.protocol_error(format!("unexpected move '{text}'")));
        }
        let Some(mv) = text.split_whitespace().next() else {
            return Some(self.core.protocol_error("empty move".to_string()));
        };
        self.core.state = EngineState::Ready;
        Some(PlayerEvent::Move(mv.to_string()))
    }

    fn on_pong(&mut self, arg: &str) -> Option<PlayerEvent> {
        let n: u32 = arg.trim().parse().ok()?;
        if self.awaiting_pong != Some(n) {
            return None;
        }
        self.awaiting_pong = None;
        if self.core.state == EngineState::Initializing {
            self.core.state = EngineState::Ready;
            return Some(PlayerEvent::Ready);
        }
        None
    }
}

/// `name=value` pairs; values may be double-quoted and contain spaces.
fn split_features(args: &str) -> Vec<(String, String)> {
    let mut features = vec![];
    let mut rest = args.trim();
    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(char::is_whitespace) {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        features.push((name, value.to_string()));
        rest = remaining.trim_start();
    }
    features
}

/// `Illegal move: e2e4` / `Illegal move (reason): e2e4`
fn parse_illegal_move(line: &str) -> Option<String> {
    let rest = line.strip_prefix("Illegal move")?.trim_start();
    let rest = match rest.strip_prefix('(') {
        Some(reason) => &reason[reason.find(')')? + 1..],
        None => rest,
    };
    let mv = rest.trim_start_matches(':').trim();
    Some(mv.to_string())
}

/// `<ply> <score> <time> <nodes> <pv>`
fn parse_thinking(line: &str) -> Option<Score> {
    let mut tokens = line.split_whitespace();
    let ply = tokens.next()?.trim_end_matches(['.', '&']);
    ply.parse::<u32>().ok()?;
    let score: i32 = tokens.next()?.parse().ok()?;
    // a thinking line has at least time and nodes
    tokens.next()?.parse::<u64>().ok()?;
    tokens.next()?.parse::<u64>().ok()?;
    let distance = score.unsigned_abs();
    Some(if distance >= XBOARD_MATE.unsigned_abs() {
        let moves = i32::try_from(distance - XBOARD_MATE.unsigned_abs()).unwrap_or(i32::MAX);
        Score::Mate(score.signum() * moves)
    } else {
        Score::Centipawns(score)
    })
}

/// Xboard's `st` takes whole seconds: a move time below one second cannot be expressed.
pub fn check_time_control(tc: &TimeControl) -> anyhow::Result<()> {
    if let Some(move_time) = tc.move_time() {
        if move_time < Duration::from_secs(1) {
            bail!(
                "xboard engines need at least one second per move, got st={}",
                format_seconds(move_time)
            );
        }
        if move_time.subsec_nanos() != 0 {
            warn!(
                "xboard engines are told st {} for st={}",
                move_time.as_secs(),
                format_seconds(move_time)
            );
        }
    }
    Ok(())
}

/// `level <mps> <base> <inc>` or `st <secs>`; base is in minutes (`min:sec` when needed).
///
/// `st` is rounded down so the engine never plans with more time than it has.
fn time_control_command(tc: &TimeControl) -> Option<String> {
    if tc.is_infinite() {
        return None;
    }
    if let Some(move_time) = tc.move_time() {
        return Some(format!("st {}", move_time.as_secs()));
    }
    let base = tc.base().as_secs();
    let base = if base % 60 == 0 {
        format!("{}", base / 60)
    } else {
        format!("{}:{:02}", base / 60, base % 60)
    };
    Some(format!(
        "level {} {} {}",
        tc.moves_per_tc(),
        base,
        format_seconds(tc.increment())
    ))
}

fn centiseconds(d: Duration) -> u128 {
    d.as_millis() / 10
}

impl LineProtocol for XboardEngine {
    fn core_mut(&mut self) -> &mut EngineCore {
        &mut self.core
    }

    fn parse_line(&mut self, line: &str) -> Option<PlayerEvent> {
        let (command, args) = first_word(line);
        match command {
            "" => None,
            "feature" => self.parse_features(args),
            "pong" => self.on_pong(args),
            "move" => self.on_move(args),
            "resign" => {
                if self.core.state == EngineState::Thinking {
                    self.core.state = EngineState::Ready;
                }
                Some(PlayerEvent::Resign)
            }
            "offer" if args == "draw" => Some(PlayerEvent::DrawOffer),
            "1-0" | "0-1" | "1/2-1/2" => {
                let result = match command {
                    "1-0" => GameResult::WhiteWin,
                    "0-1" => GameResult::BlackWin,
                    _ => GameResult::Draw,
                };
                let comment = args.trim_start_matches('{').trim_end_matches('}');
                Some(PlayerEvent::ClaimResult {
                    result,
                    comment: comment.trim().to_string(),
                })
            }
            "tellics" | "tellicsnoalias" | "telluser" | "tellusererror" | "tellopponent"
            | "tellothers" | "tellall" | "askuser" => {
                debug!("{}: {line}", self.core.name);
                None
            }
            _ if command.starts_with('#') => {
                debug!("{}: {line}", self.core.name);
                None
            }
            _ if line.starts_with("Illegal move") => {
                let mv = parse_illegal_move(line).unwrap_or_default();
                Some(PlayerEvent::RejectedMove(mv))
            }
            _ if line.starts_with("Error") => Some(self.core.protocol_error(line.to_string())),
            _ => match parse_thinking(line) {
                Some(score) => Some(PlayerEvent::Score(score)),
                None => {
                    debug!("{}: unrecognized line '{line}'", self.core.name);
                    None
                }
            },
        }
    }

    fn timer(&self) -> Option<Instant> {
        self.init_deadline
    }

    fn on_timer(&mut self) -> Option<PlayerEvent> {
        debug!("{}: no 'feature done=1', assuming defaults", self.core.name);
        self.finish_init()
    }
}

impl Player for XboardEngine {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn protocol(&self) -> Option<Protocol> {
        Some(Protocol::Xboard)
    }

    fn notation(&self) -> MoveNotation {
        self.core.notation
    }

    fn state(&self) -> EngineState {
        self.core.state
    }

    fn time_control(&self) -> &TimeControl {
        &self.core.time_control
    }

    fn time_control_mut(&mut self) -> &mut TimeControl {
        &mut self.core.time_control
    }

    fn new_game(
        &mut self,
        side: Side,
        opponent: &str,
        start_fen: Option<&str>,
    ) -> Result<(), EngineError> {
        self.core.require_ready()?;
        self.core.side = side;
        self.core.protocol_errors = 0;
        self.core.time_control.start_game();
        if !self.features.ping {
            self.core.discard_pending();
        }

        self.core.write("new")?;
        self.force_mode = false;
        self.enter_force_mode()?;
        if let Some(fen) = start_fen {
            if !self.features.setboard {
                warn!("{}: engine did not announce setboard", self.core.name);
            }
            self.core.write(&format!("setboard {fen}"))?;
        }
        if let Some(command) = time_control_command(&self.core.time_control) {
            self.core.write(&command)?;
        }
        if self.features.name {
            self.core.write(&format!("name {opponent}"))?;
        }
        self.core.write("post")?;

        if self.features.ping {
            self.ping_counter += 1;
            self.core.write(&format!("ping {}", self.ping_counter))?;
            self.awaiting_pong = Some(self.ping_counter);
            self.core.state = EngineState::Initializing;
        }
        Ok(())
    }

    fn go(&mut self, opponent_time: &TimeControl) -> Result<(), EngineError> {
        self.core.require_ready()?;
        if self.features.time && !self.core.time_control.is_infinite() {
            let own = centiseconds(self.core.time_control.time_left());
            let other = centiseconds(opponent_time.time_left());
            self.core.write(&format!("time {own}"))?;
            self.core.write(&format!("otim {other}"))?;
        }
        self.core.write("go")?;
        self.force_mode = false;
        self.core.state = EngineState::Thinking;
        Ok(())
    }

    fn send_move(&mut self, mv: &PlayedMove) -> Result<(), EngineError> {
        if self.core.state == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        self.enter_force_mode()?;
        let text = mv.in_notation(self.core.notation);
        if self.features.usermove {
            self.core.write(&format!("usermove {text}"))
        } else {
            self.core.write(text)
        }
    }

    fn next_event(&mut self, timeout: Duration) -> Option<PlayerEvent> {
        self.read_event(timeout)
    }

    fn end_game(&mut self, outcome: &Outcome) {
        if self.core.state == EngineState::Terminated {
            return;
        }
        let _ = self
            .core
            .write(&format!("result {} {{{}}}", outcome.result, outcome.description()));
        let _ = self.enter_force_mode();
        if self.core.state == EngineState::Thinking {
            self.core.state = EngineState::Ready;
        }
    }

    fn protocol_error_count(&self) -> u32 {
        self.core.protocol_errors
    }

    /// Without `ping` there is no telling whether a late move is still on its way.
    fn can_be_reused(&self) -> bool {
        self.features.reuse && self.features.ping
    }

    fn quit(&mut self) {
        self.core.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{outcome::Reason, protocol::transcript::fake_process};

    fn ready_engine() -> (
        XboardEngine,
        crate::protocol::transcript::SharedBuffer,
        std::sync::mpsc::Sender<String>,
    ) {
        let (process, buffer, tx) = fake_process();
        let tc: TimeControl = "40/60+1".parse().unwrap();
        let mut engine =
            XboardEngine::start(process, "xb", tc, vec!["memory 64".to_string()], None).unwrap();
        assert_eq!(buffer.take_lines(), vec!["xboard", "protover 2"]);
        tx.send("feature usermove=1 ping=1 setboard=1 myname=\"Mock Engine 1.0\" done=1".into())
            .unwrap();
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Ready)
        );
        assert!(engine.can_be_reused());
        assert_eq!(
            buffer.take_lines(),
            vec![
                "accepted usermove",
                "accepted ping",
                "accepted setboard",
                "accepted myname",
                "accepted done",
                "memory 64"
            ]
        );
        (engine, buffer, tx)
    }

    #[test]
    fn handshake_and_game() {
        let (mut engine, buffer, tx) = ready_engine();

        engine.new_game(Side::Black, "opponent", None).unwrap();
        assert_eq!(engine.state(), EngineState::Initializing);
        assert!(matches!(
            engine.go(&TimeControl::infinite()),
            Err(EngineError::NotReady(EngineState::Initializing))
        ));
        assert_eq!(
            buffer.take_lines(),
            vec!["new", "force", "level 40 1 1", "post", "ping 1"]
        );
        tx.send("pong 1".into()).unwrap();
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Ready)
        );

        let e4 = PlayedMove {
            coordinate: "e2e4".into(),
            san: "e4".into(),
        };
        engine.send_move(&e4).unwrap();
        let opponent: TimeControl = "40/60+1".parse().unwrap();
        engine.go(&opponent).unwrap();
        assert_eq!(
            buffer.take_lines(),
            vec!["usermove e2e4", "time 6000", "otim 6000", "go"]
        );

        tx.send("9 -25 100 12345 e7e5 g1f3".into()).unwrap();
        tx.send("move e7e5".into()).unwrap();
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Score(Score::Centipawns(-25)))
        );
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Move("e7e5".into()))
        );
        assert_eq!(engine.state(), EngineState::Ready);

        // the next opponent move puts the engine back into force mode
        let nf3 = PlayedMove {
            coordinate: "g1f3".into(),
            san: "Nf3".into(),
        };
        engine.send_move(&nf3).unwrap();
        assert_eq!(buffer.take_lines(), vec!["force", "usermove g1f3"]);

        engine.end_game(&Outcome::loss(Side::Black, Reason::Resignation, 2));
        assert_eq!(buffer.take_lines(), vec!["result 1-0 {Black resigns}"]);
    }

    #[test]
    fn replies_and_errors() {
        let (mut engine, _buffer, tx) = ready_engine();
        tx.send("move e2e4".into()).unwrap();
        assert!(matches!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::ProtocolError(_))
        ));
        tx.send("Error (unknown command): foo".into()).unwrap();
        assert!(matches!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::ProtocolError(_))
        ));
        assert_eq!(engine.protocol_error_count(), 2);

        tx.send("Illegal move (no such piece): e2e5".into()).unwrap();
        tx.send("Illegal move: d2d5".into()).unwrap();
        tx.send("# some debug output".into()).unwrap();
        tx.send("offer draw".into()).unwrap();
        tx.send("0-1 {White resigns}".into()).unwrap();
        tx.send("resign".into()).unwrap();
        let expected = [
            PlayerEvent::RejectedMove("e2e5".into()),
            PlayerEvent::RejectedMove("d2d5".into()),
            PlayerEvent::DrawOffer,
            PlayerEvent::ClaimResult {
                result: GameResult::BlackWin,
                comment: "White resigns".into(),
            },
            PlayerEvent::Resign,
        ];
        for event in expected {
            assert_eq!(engine.next_event(Duration::from_secs(1)), Some(event));
        }
        assert_eq!(engine.next_event(Duration::ZERO), None);

        drop(tx);
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Disconnected)
        );
        assert_eq!(engine.state(), EngineState::Terminated);
    }

    #[test]
    fn old_engines_are_ready_after_grace_period() {
        let (process, buffer, tx) = fake_process();
        let mut engine =
            XboardEngine::start(process, "old", TimeControl::infinite(), vec![], None).unwrap();
        buffer.take_lines();
        tx.send("feature san=1 wibble=1".into()).unwrap();
        assert_eq!(engine.next_event(Duration::from_millis(100)), None);
        assert_eq!(buffer.take_lines(), vec!["accepted san", "rejected wibble"]);
        assert_eq!(
            engine.next_event(Duration::from_secs(5)),
            Some(PlayerEvent::Ready)
        );
        assert_eq!(engine.notation(), MoveNotation::Standard);
    }

    #[test]
    fn level_command() {
        let tc: TimeControl = "90+0.5".parse().unwrap();
        assert_eq!(time_control_command(&tc).unwrap(), "level 0 1:30 0.5");
        let tc: TimeControl = "st=5".parse().unwrap();
        assert_eq!(time_control_command(&tc).unwrap(), "st 5");
        assert_eq!(time_control_command(&TimeControl::infinite()), None);
    }

    #[test]
    fn move_time_is_never_rounded_up() {
        let tc: TimeControl = "st=1.5".parse().unwrap();
        assert!(check_time_control(&tc).is_ok());
        assert_eq!(time_control_command(&tc).unwrap(), "st 1");
        assert!(Duration::from_secs(1) <= tc.available().unwrap());

        let tc: TimeControl = "st=0.5".parse().unwrap();
        let err = check_time_control(&tc).unwrap_err();
        assert!(err.to_string().contains("st=0.5"), "{err}");
        assert!(check_time_control(&"40/60".parse().unwrap()).is_ok());
    }

    #[test]
    fn extreme_thinking_scores() {
        assert_eq!(
            parse_thinking("5 -2147483648 10 100 e2e4"),
            Some(Score::Mate(-(i32::MAX - 99_999)))
        );
        assert_eq!(
            parse_thinking("5 100003 10 100 e2e4"),
            Some(Score::Mate(3))
        );
        assert_eq!(
            parse_thinking("5 -100002 10 100 e2e4"),
            Some(Score::Mate(-2))
        );
    }

    #[test]
    fn engines_without_ping_are_not_reused() {
        let (process, buffer, tx) = fake_process();
        let mut engine =
            XboardEngine::start(process, "noping", TimeControl::infinite(), vec![], None).unwrap();
        tx.send("feature usermove=1 done=1".into()).unwrap();
        assert_eq!(
            engine.next_event(Duration::from_secs(1)),
            Some(PlayerEvent::Ready)
        );
        assert!(!engine.can_be_reused());

        // a move that missed its game is not taken for one of the next
        tx.send("move e2e4".into()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        buffer.take_lines();
        engine.new_game(Side::Black, "opponent", None).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.next_event(Duration::from_millis(50)), None);
        assert_eq!(engine.protocol_error_count(), 0);
    }
}
