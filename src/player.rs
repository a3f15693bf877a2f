//! Players: anything that can be asked for a move.
//!
//! Engines ([`XboardEngine`], [`UciEngine`]) are created by an [`EngineBuilder`], which
//! launches the process and starts the protocol handshake. A [`ChannelPlayer`] is driven by
//! an external controller (a GUI, a test) over channels.

use std::{
    fmt::Debug,
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tracing::{debug, instrument};

use crate::{
    board::{MoveNotation, Side},
    opening_book::OpeningBook,
    outcome::Outcome,
    process::EngineProcess,
    time_control::TimeControl,
};

pub use crate::protocol::{
    uci::UciEngine, xboard::XboardEngine, EngineError, EngineState, LaunchOptions, PlayedMove,
    PlayerEvent, Protocol,
};

/// Capability interface of a player, whatever drives it.
pub trait Player: Send + Debug {
    fn name(&self) -> &str;

    /// `None` for players that are not engine processes.
    fn protocol(&self) -> Option<Protocol>;

    fn notation(&self) -> MoveNotation;

    fn is_human(&self) -> bool {
        false
    }

    fn state(&self) -> EngineState;

    fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    fn time_control(&self) -> &TimeControl;

    fn time_control_mut(&mut self) -> &mut TimeControl;

    /// Prepare a new game playing `side`. Does not wait for the player: completion is
    /// signalled by [`PlayerEvent::Ready`] when the player needs a round-trip.
    fn new_game(
        &mut self,
        side: Side,
        opponent: &str,
        start_fen: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Start thinking on the current position. The move arrives as [`PlayerEvent::Move`].
    fn go(&mut self, opponent_time: &TimeControl) -> Result<(), EngineError>;

    /// Tell the player about a move it did not choose itself (opponent or book move).
    fn send_move(&mut self, mv: &PlayedMove) -> Result<(), EngineError>;

    /// Wait up to `timeout` for the next event; `None` when nothing happened in time.
    fn next_event(&mut self, timeout: Duration) -> Option<PlayerEvent>;

    fn end_game(&mut self, outcome: &Outcome);

    /// Soft protocol errors in the current game.
    fn protocol_error_count(&self) -> u32;

    /// Whether the player may be kept for another game.
    fn can_be_reused(&self) -> bool {
        true
    }

    fn quit(&mut self);
}

/// Creates players for a tournament participant.
pub trait PlayerBuilder: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn create(&self, options: &LaunchOptions) -> anyhow::Result<Box<dyn Player>>;

    /// Private opening book of this participant and its depth in plies.
    fn book(&self) -> Option<(Arc<dyn OpeningBook>, u32)> {
        None
    }
}

/// Builder of engine players: how to launch and talk to one engine.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    name: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    protocol: Protocol,
    time_control: TimeControl,
    book: Option<Arc<dyn OpeningBook>>,
    book_depth: u32,
    init_lines: Vec<String>,
}

impl EngineBuilder {
    pub fn new(name: &str, command: &str, protocol: Protocol) -> Self {
        EngineBuilder {
            name: name.to_string(),
            command: command.to_string(),
            args: vec![],
            working_dir: None,
            protocol,
            time_control: TimeControl::default(),
            book: None,
            book_depth: 0,
            init_lines: vec![],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_time_control(mut self, time_control: TimeControl) -> Self {
        self.time_control = time_control;
        self
    }

    /// Play from `book` for the first `depth` plies of every game.
    pub fn with_book(mut self, book: Arc<dyn OpeningBook>, depth: u32) -> Self {
        self.book = Some(book);
        self.book_depth = depth;
        self
    }

    /// Extra lines sent once the handshake is done (`setoption ...`, `memory 64`, ...).
    pub fn with_init_line(mut self, line: &str) -> Self {
        self.init_lines.push(line.to_string());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn time_control(&self) -> &TimeControl {
        &self.time_control
    }
}

impl PlayerBuilder for EngineBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(name = %self.name))]
    fn create(&self, options: &LaunchOptions) -> anyhow::Result<Box<dyn Player>> {
        if self.protocol == Protocol::Xboard {
            crate::protocol::xboard::check_time_control(&self.time_control)
                .with_context(|| format!("engine '{}'", self.name))?;
        }
        let process = EngineProcess::launch(
            &self.name,
            &self.command,
            &self.args,
            self.working_dir.as_deref(),
            options.engine_stderr,
        )
        .map_err(|e| EngineError::Spawn(format!("{e:#}")))?;
        debug!(pid = ?process.pid(), "engine launched");

        let tc = self.time_control.clone();
        let init = self.init_lines.clone();
        let player: Box<dyn Player> = match self.protocol {
            Protocol::Xboard => Box::new(
                XboardEngine::start(process, &self.name, tc, init, options.debug_echo())
                    .with_context(|| format!("could not start engine '{}'", self.name))?,
            ),
            Protocol::Uci => Box::new(
                UciEngine::start(process, &self.name, tc, init, options.debug_echo())
                    .with_context(|| format!("could not start engine '{}'", self.name))?,
            ),
        };
        Ok(player)
    }

    fn book(&self) -> Option<(Arc<dyn OpeningBook>, u32)> {
        self.book.clone().map(|book| (book, self.book_depth))
    }
}

/// What the game tells a [`ChannelPlayer`]'s controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    NewGame {
        side: Side,
        start_fen: Option<String>,
    },
    /// your turn
    Go,
    Move(PlayedMove),
    GameOver(Outcome),
}

/// The controller side of a [`ChannelPlayer`].
#[derive(Debug)]
pub struct ChannelHandle {
    pub events: Sender<PlayerEvent>,
    pub messages: Receiver<ControllerMessage>,
}

/// A player whose moves come from an external controller.
#[derive(Debug)]
pub struct ChannelPlayer {
    name: String,
    human: bool,
    state: EngineState,
    time_control: TimeControl,
    events: Receiver<PlayerEvent>,
    messages: Sender<ControllerMessage>,
}

impl ChannelPlayer {
    pub fn new(name: &str, time_control: TimeControl) -> (ChannelPlayer, ChannelHandle) {
        let (event_tx, event_rx) = mpsc::channel();
        let (message_tx, message_rx) = mpsc::channel();
        let player = ChannelPlayer {
            name: name.to_string(),
            human: true,
            state: EngineState::Ready,
            time_control,
            events: event_rx,
            messages: message_tx,
        };
        let handle = ChannelHandle {
            events: event_tx,
            messages: message_rx,
        };
        (player, handle)
    }

    /// Mark the controller as a program rather than a person.
    pub fn automated(mut self) -> Self {
        self.human = false;
        self
    }

    fn notify(&mut self, message: ControllerMessage) -> Result<(), EngineError> {
        self.messages.send(message).map_err(|_| {
            self.state = EngineState::Terminated;
            EngineError::Terminated
        })
    }
}

impl Player for ChannelPlayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Option<Protocol> {
        None
    }

    fn notation(&self) -> MoveNotation {
        MoveNotation::Long
    }

    fn is_human(&self) -> bool {
        self.human
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn time_control(&self) -> &TimeControl {
        &self.time_control
    }

    fn time_control_mut(&mut self) -> &mut TimeControl {
        &mut self.time_control
    }

    fn new_game(
        &mut self,
        side: Side,
        _opponent: &str,
        start_fen: Option<&str>,
    ) -> Result<(), EngineError> {
        if self.state == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        self.time_control.start_game();
        self.state = EngineState::Ready;
        self.notify(ControllerMessage::NewGame {
            side,
            start_fen: start_fen.map(String::from),
        })
    }

    fn go(&mut self, _opponent_time: &TimeControl) -> Result<(), EngineError> {
        match self.state {
            EngineState::Ready => {}
            EngineState::Terminated => return Err(EngineError::Terminated),
            state => return Err(EngineError::NotReady(state)),
        }
        self.notify(ControllerMessage::Go)?;
        self.state = EngineState::Thinking;
        Ok(())
    }

    fn send_move(&mut self, mv: &PlayedMove) -> Result<(), EngineError> {
        self.notify(ControllerMessage::Move(mv.clone()))
    }

    fn next_event(&mut self, timeout: Duration) -> Option<PlayerEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                if matches!(event, PlayerEvent::Move(_) | PlayerEvent::Resign) {
                    self.state = EngineState::Ready;
                }
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.state = EngineState::Terminated;
                Some(PlayerEvent::Disconnected)
            }
        }
    }

    fn end_game(&mut self, outcome: &Outcome) {
        if self.state == EngineState::Thinking {
            self.state = EngineState::Ready;
        }
        let _ = self.notify(ControllerMessage::GameOver(*outcome));
    }

    fn protocol_error_count(&self) -> u32 {
        0
    }

    fn quit(&mut self) {
        self.state = EngineState::Terminated;
    }
}
