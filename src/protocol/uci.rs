//! UCI engines.

use std::time::Duration;

use tracing::{debug, info};

use super::{
    first_word, millis, DebugEcho, EngineCore, EngineError, EngineState, LineProtocol, PlayedMove,
    PlayerEvent, Protocol, Score,
};
use crate::{
    board::{MoveNotation, Side},
    outcome::Outcome,
    player::Player,
    process::EngineProcess,
    time_control::TimeControl,
};

#[derive(Debug)]
pub struct UciEngine {
    core: EngineCore,
    init_lines: Vec<String>,
    awaiting_readyok: bool,
    /// a `stop` was sent, the next `bestmove` answers it
    discard_bestmove: bool,
    start_fen: Option<String>,
    moves: Vec<String>,
}

impl UciEngine {
    /// Send `uci` to a freshly launched process.
    ///
    /// `init_lines` (typically `setoption ...`) are sent after `uciok`, followed by a
    /// synchronizing `isready`.
    pub fn start(
        process: EngineProcess,
        name: &str,
        time_control: TimeControl,
        init_lines: Vec<String>,
        debug: Option<DebugEcho>,
    ) -> Result<Self, EngineError> {
        let mut engine = UciEngine {
            core: EngineCore::new(process, name, time_control, debug),
            init_lines,
            awaiting_readyok: false,
            discard_bestmove: false,
            start_fen: None,
            moves: vec![],
        };
        engine.core.write("uci")?;
        engine.core.state = EngineState::Initializing;
        Ok(engine)
    }

    fn sync(&mut self) -> Result<(), EngineError> {
        self.core.write("isready")?;
        self.awaiting_readyok = true;
        self.core.state = EngineState::Initializing;
        Ok(())
    }

    fn on_uciok(&mut self) -> Option<PlayerEvent> {
        if self.core.state != EngineState::Initializing || self.awaiting_readyok {
            return None;
        }
        for line in std::mem::take(&mut self.init_lines) {
            if self.core.write(&line).is_err() {
                return Some(PlayerEvent::Disconnected);
            }
        }
        match self.sync() {
            Ok(()) => None,
            Err(_) => Some(PlayerEvent::Disconnected),
        }
    }

    fn on_bestmove(&mut self, args: &str) -> Option<PlayerEvent> {
        if self.awaiting_readyok || self.discard_bestmove {
            debug!("{}: discarding 'bestmove {args}'", self.core.name);
            self.discard_bestmove = false;
            return None;
        }
        if self.core.state != EngineState::Thinking {
            return Some(
                self.core
                    .protocol_error(format!("unexpected 'bestmove {args}'")),
            );
        }
        self.core.state = EngineState::Ready;
        let Some(mv) = args.split_whitespace().next() else {
            return Some(self.core.protocol_error("empty bestmove".to_string()));
        };
        self.moves.push(mv.to_string());
        Some(PlayerEvent::Move(mv.to_string()))
    }

    fn position_command(&self) -> String {
        let mut command = match &self.start_fen {
            Some(fen) => format!("position fen {fen}"),
            None => "position startpos".to_string(),
        };
        if !self.moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&self.moves.join(" "));
        }
        command
    }

    fn go_command(&self, opponent_time: &TimeControl) -> String {
        let own = &self.core.time_control;
        if own.is_infinite() {
            return "go infinite".to_string();
        }
        if let Some(move_time) = own.move_time() {
            return format!("go movetime {}", millis(move_time));
        }
        let (white, black) = match self.core.side {
            Side::White => (own, opponent_time),
            Side::Black => (opponent_time, own),
        };
        let mut command = format!(
            "go wtime {} btime {}",
            millis(white.time_left()),
            millis(black.time_left())
        );
        if !white.increment().is_zero() || !black.increment().is_zero() {
            command.push_str(&format!(
                " winc {} binc {}",
                white.increment().as_millis(),
                black.increment().as_millis()
            ));
        }
        if own.moves_per_tc() > 0 {
            command.push_str(&format!(" movestogo {}", own.moves_left()));
        }
        command
    }
}

/// Score out of an `info` line, if it has one. Everything after `string` is free text.
fn parse_info_score(args: &str) -> Option<Score> {
    let mut tokens = args.split_whitespace().take_while(|t| *t != "string");
    tokens.find(|t| *t == "score")?;
    let kind = tokens.next()?;
    let value: i32 = tokens.next()?.parse().ok()?;
    match kind {
        "cp" => Some(Score::Centipawns(value)),
        "mate" => Some(Score::Mate(value)),
        _ => None,
    }
}

impl LineProtocol for UciEngine {
    fn core_mut(&mut self) -> &mut EngineCore {
        &mut self.core
    }

    fn parse_line(&mut self, line: &str) -> Option<PlayerEvent> {
        let (command, args) = first_word(line);
        match command {
            "" => None,
            "id" => {
                if let Some(name) = args.strip_prefix("name ") {
                    info!("{}: engine calls itself '{}'", self.core.name, name.trim());
                }
                None
            }
            "uciok" => self.on_uciok(),
            "readyok" => {
                if !self.awaiting_readyok {
                    debug!("{}: unsolicited readyok", self.core.name);
                    return None;
                }
                self.awaiting_readyok = false;
                self.core.state = EngineState::Ready;
                Some(PlayerEvent::Ready)
            }
            "bestmove" => self.on_bestmove(args),
            "info" => parse_info_score(args).map(PlayerEvent::Score),
            "option" | "copyprotection" | "registration" => {
                debug!("{}: {line}", self.core.name);
                None
            }
            _ => {
                debug!("{}: unrecognized line '{line}'", self.core.name);
                None
            }
        }
    }
}

impl Player for UciEngine {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn protocol(&self) -> Option<Protocol> {
        Some(Protocol::Uci)
    }

    fn notation(&self) -> MoveNotation {
        MoveNotation::Long
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
        _opponent: &str,
        start_fen: Option<&str>,
    ) -> Result<(), EngineError> {
        self.core.require_ready()?;
        self.core.side = side;
        self.core.protocol_errors = 0;
        self.core.time_control.start_game();
        self.start_fen = start_fen.map(String::from);
        self.moves.clear();

        self.core.write("ucinewgame")?;
        self.sync()
    }

    fn go(&mut self, opponent_time: &TimeControl) -> Result<(), EngineError> {
        self.core.require_ready()?;
        let position = self.position_command();
        let go = self.go_command(opponent_time);
        self.core.write(&position)?;
        self.core.write(&go)?;
        self.core.state = EngineState::Thinking;
        Ok(())
    }

    fn send_move(&mut self, mv: &PlayedMove) -> Result<(), EngineError> {
        if self.core.state == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        self.moves.push(mv.coordinate.clone());
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<PlayerEvent> {
        self.read_event(timeout)
    }

    fn end_game(&mut self, _outcome: &Outcome) {
        if self.core.state == EngineState::Thinking {
            if self.core.write("stop").is_ok() {
                self.discard_bestmove = true;
            }
            self.core.state = EngineState::Ready;
        }
    }

    fn protocol_error_count(&self) -> u32 {
        self.core.protocol_errors
    }

    fn quit(&mut self) {
        self.core.quit();
    }
}
