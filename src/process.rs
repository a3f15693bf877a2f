//! Engine child processes.
//!
//! An [`EngineProcess`] owns one external program: its stdin (written line by line and
//! flushed immediately) and a reader thread forwarding every stdout line over a channel.
//! The process is always reclaimed: on [`EngineProcess::try_kill`] or, failing that, on drop.

use std::{
    io::{BufRead, BufReader, Write},
    path::Path,
    process::{Child, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{error, instrument, trace, warn};

/// Result of waiting for one line of engine output.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    Timeout,
    /// stdout was closed: the engine exited or crashed
    Closed,
}

pub struct EngineProcess {
    name: String,
    child: Option<Child>,
    stdin: Option<Box<dyn Write + Send>>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    cleaned_up: bool,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("name", &self.name)
            .field("pid", &self.child.as_ref().map(Child::id))
            .field("cleaned_up", &self.cleaned_up)
            .finish()
    }
}

impl EngineProcess {
    const CLEANUP_DURATION: Duration = Duration::from_secs(1);

    /// Spawn `command` with piped stdin/stdout.
    ///
    /// stderr is discarded unless `allow_stderr` is set (debugging engines).
    #[instrument(skip(args, working_dir))]
    pub fn launch(
        name: &str,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        allow_stderr: bool,
    ) -> anyhow::Result<EngineProcess> {
        let mut cmd = Command::new(command);
        cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped());
        if !allow_stderr {
            cmd.stderr(Stdio::null());
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("command '{command}' could not be started"))?;

        let stdin = child.stdin.take().context("engine has no stdin")?;
        let stdout = child.stdout.take().context("engine has no stdout")?;

        let (tx, rx) = mpsc::channel();
        let reader_name = name.to_string();
        let reader = thread::Builder::new()
            .name(format!("{name}-stdout"))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    let line = line.trim_end_matches('\r').to_string();
                    trace!("{reader_name} > {line}");
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("could not spawn engine reader thread")?;

        Ok(EngineProcess {
            name: name.to_string(),
            child: Some(child),
            stdin: Some(Box::new(stdin)),
            lines: rx,
            reader: Some(reader),
            cleaned_up: false,
        })
    }

    /// Build a process-less handle over any writer and line channel.
    ///
    /// Used to drive the protocol state machines from in-memory transcripts.
    pub fn from_parts(
        name: &str,
        writer: Box<dyn Write + Send>,
        lines: Receiver<String>,
    ) -> EngineProcess {
        EngineProcess {
            name: name.to_string(),
            child: None,
            stdin: Some(writer),
            lines,
            reader: None,
            cleaned_up: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Write one line (terminator added) and flush it.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "engine stdin is closed")
        })?;
        trace!("{} < {line}", self.name);
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    /// Wait up to `timeout` for the next line of output.
    pub fn read_line(&self, timeout: Duration) -> ReadLine {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => ReadLine::Line(line),
            Err(RecvTimeoutError::Timeout) => ReadLine::Timeout,
            Err(RecvTimeoutError::Disconnected) => ReadLine::Closed,
        }
    }

    /// Next line if one is already buffered.
    pub fn try_read_line(&self) -> ReadLine {
        match self.lines.try_recv() {
            Ok(line) => ReadLine::Line(line),
            Err(TryRecvError::Empty) => ReadLine::Timeout,
            Err(TryRecvError::Disconnected) => ReadLine::Closed,
        }
    }

    /// Close stdin, give the engine `max_duration` to exit on its own, then kill it.
    ///
    /// The child is always waited for, so no zombie is left behind.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        self.stdin = None;
        if let Some(child) = self.child.as_mut() {
            let deadline = Instant::now() + max_duration;
            loop {
                match child.try_wait() {
                    Ok(Some(_status)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(10).min(max_duration / 10));
                    }
                    _ => {
                        // already exited between the two calls is fine
                        let _ = child.kill();
                        child.wait().context("could not wait for engine process")?;
                        break;
                    }
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("{}: stdout reader thread panicked", self.name);
            }
        }
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(Self::CLEANUP_DURATION) {
                error!("could not reclaim engine process '{}': {e:#}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn echo_round_trip() {
        let mut process = EngineProcess::launch("cat", "cat", &[], None, false).unwrap();
        process.write_line("hello").unwrap();
        assert_eq!(
            process.read_line(Duration::from_secs(5)),
            ReadLine::Line("hello".to_string())
        );
        process.try_kill(Duration::from_secs(1)).unwrap();
        assert_eq!(process.read_line(Duration::from_millis(100)), ReadLine::Closed);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let res = EngineProcess::launch("nope", "/definitely/not/an/engine", &[], None, false);
        assert!(res.is_err());
    }

    #[test]
    fn closed_channel_reads_as_closed() {
        let (tx, rx) = mpsc::channel();
        let process = EngineProcess::from_parts("mem", Box::new(std::io::sink()), rx);
        tx.send("a".to_string()).unwrap();
        drop(tx);
        assert_eq!(process.try_read_line(), ReadLine::Line("a".to_string()));
        assert_eq!(process.read_line(Duration::from_millis(10)), ReadLine::Closed);
    }
}
