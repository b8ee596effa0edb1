//! Replication stream backed by an external reader process
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  spawn   ┌────────────────────┐
//!  │    Stream    │ ───────► │   reader process   │
//!  │  (caller)    │          │  (slot consumer)   │
//!  └──────┬───────┘          └─────────┬──────────┘
//!         │ stop(): cancel             │ stdout (framed records)
//!         ▼                            ▼
//!  ┌─────────────────────────────────────────────┐
//!  │        decode loop (one tokio task)         │
//!  │  read ─► FrameDecoder ─► bounded channel    │
//!  └──────────────┬───────────────────┬──────────┘
//!                 │ data()            │ finished() (oneshot, fires once)
//!                 ▼                   ▼
//!              consumer            consumer
//! ```
//!
//! The child process and its stdout pipe are owned by the decode loop. The
//! caller only talks to it through the cancellation token, the event
//! channel and the completion slot.

use crate::config::{validate_slot_name, ConnectionConfig, StreamOptions};
use crate::decoder::FrameDecoder;
use crate::error::{CdcError, Result};
use crate::lsn::LogPos;
use crate::types::ChangeEvent;
use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`Stream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    Finished,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Idle,
            1 => StreamState::Running,
            _ => StreamState::Finished,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Running => 1,
            StreamState::Finished => 2,
        }
    }
}

/// State shared between the caller and the decode loop
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    last_position: AtomicU64,
    has_position: AtomicBool,
    events_delivered: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Idle.as_u8()),
            last_position: AtomicU64::new(0),
            has_position: AtomicBool::new(false),
            events_delivered: AtomicU64::new(0),
        }
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn record_delivery(&self, position: LogPos) {
        self.last_position.store(position.value(), Ordering::Release);
        self.has_position.store(true, Ordering::Release);
        self.events_delivered.fetch_add(1, Ordering::AcqRel);
    }
}

/// One replication session against a single slot
///
/// A stream is single-use: once it reaches [`StreamState::Finished`] it
/// cannot be started again. Create a new one to resume, passing the last
/// consumed position as the start position.
///
/// The start position is handed to the server verbatim. Whether the event
/// at exactly that position is replayed depends on the output plugin;
/// consumers that need an exclusive bound should skip events with
/// `position <= start`.
pub struct Stream {
    config: ConnectionConfig,
    slot_name: String,
    start_position: LogPos,
    options: StreamOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    data_tx: Option<mpsc::Sender<ChangeEvent>>,
    data_rx: mpsc::Receiver<ChangeEvent>,
    finished_rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Stream {
    /// Create a stream with default options. No I/O happens here.
    pub fn new<S: Into<String>>(
        config: ConnectionConfig,
        slot_name: S,
        start_position: LogPos,
    ) -> Self {
        Self::with_options(config, slot_name, start_position, StreamOptions::default())
    }

    /// Create a stream with explicit options. Invalid options are reported
    /// by [`Stream::start`].
    pub fn with_options<S: Into<String>>(
        config: ConnectionConfig,
        slot_name: S,
        start_position: LogPos,
        options: StreamOptions,
    ) -> Self {
        // A zero capacity is rejected in start(); mpsc::channel would panic on it here.
        let (data_tx, data_rx) = mpsc::channel(options.channel_capacity.max(1));
        Self {
            config,
            slot_name: slot_name.into(),
            start_position,
            options,
            shared: Arc::new(Shared::new()),
            cancel: CancellationToken::new(),
            data_tx: Some(data_tx),
            data_rx,
            finished_rx: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn start_position(&self) -> LogPos {
        self.start_position
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Position of the newest event handed to the event channel
    pub fn last_position(&self) -> Option<LogPos> {
        if self.shared.has_position.load(Ordering::Acquire) {
            Some(LogPos(self.shared.last_position.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Number of events handed to the event channel so far
    pub fn events_delivered(&self) -> u64 {
        self.shared.events_delivered.load(Ordering::Acquire)
    }

    /// Arguments passed to the reader, after any wrapper prefix arguments
    ///
    /// The password is deliberately absent; it travels in `PGPASSWORD`.
    pub fn reader_args(&self) -> Vec<OsString> {
        let mut args = self.options.reader.prefix_args.clone();
        args.push(format!("--host={}", self.config.host).into());
        args.push(format!("--port={}", self.config.port).into());
        args.push(format!("--username={}", self.config.user).into());
        args.push(format!("--dbname={}", self.config.database).into());
        args.push(format!("--slot={}", self.slot_name).into());
        args.push(format!("--startpos={}", self.start_position.to_text()).into());
        args.push("--format=framed".into());
        args
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.options.reader.program);
        command
            .args(self.reader_args())
            .envs(&self.options.reader.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if !self.config.password.is_empty() {
            command.env("PGPASSWORD", &self.config.password);
        }
        command
    }

    /// Spawn the reader and start decoding its output
    ///
    /// Returns as soon as the process exists; it does not wait for data.
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != StreamState::Idle || self.data_tx.is_none() {
            return Err(CdcError::invalid_state(
                "stream has already been started; create a new stream to resume",
            ));
        }

        self.config.validate()?;
        validate_slot_name(&self.slot_name)?;
        self.options.validate()?;

        let program = self.options.reader.display_name();
        info!(
            "Starting reader '{}' for slot '{}' on {}:{}/{} at {}",
            program,
            self.slot_name,
            self.config.host,
            self.config.port,
            self.config.database,
            self.start_position
        );

        let mut child = self
            .build_command()
            .spawn()
            .map_err(|e| CdcError::spawn(program.clone(), e))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.start_kill();
                return Err(CdcError::spawn(
                    program,
                    std::io::Error::new(std::io::ErrorKind::Other, "stdout was not captured"),
                ));
            }
        };

        let data_tx = self
            .data_tx
            .take()
            .ok_or_else(|| CdcError::invalid_state("event sender not available"))?;

        debug!("Reader process started with pid {:?}", child.id());

        let (finished_tx, finished_rx) = oneshot::channel();
        self.finished_rx = Some(finished_rx);
        self.shared.set_state(StreamState::Running);

        let decode_loop = DecodeLoop {
            child,
            stdout,
            decoder: FrameDecoder::new(),
            data_tx,
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
            read_buffer_size: self.options.read_buffer_size,
            shutdown_grace: self.options.shutdown_grace,
            stop_deadline: None,
            exit_status: None,
            killed: false,
            dropped: 0,
        };

        let shared = Arc::clone(&self.shared);
        let slot_name = self.slot_name.clone();
        tokio::spawn(async move {
            let outcome = decode_loop.run().await;
            match &outcome {
                Ok(()) => info!("Stream for slot '{}' finished cleanly", slot_name),
                Err(e) => error!("Stream for slot '{}' failed: {}", slot_name, e),
            }
            shared.set_state(StreamState::Finished);
            // Receiver is gone when the Stream was dropped
            let _ = finished_tx.send(outcome);
        });

        Ok(())
    }

    /// Event channel in wire order
    ///
    /// `recv()` yields `None` once the decode loop has exited and every
    /// queued event was consumed.
    pub fn data(&mut self) -> &mut mpsc::Receiver<ChangeEvent> {
        &mut self.data_rx
    }

    /// Ask the reader to shut down
    ///
    /// Does not block; await [`Stream::finished`] for the outcome. Calling
    /// it more than once, or on a stream that is not running, has no
    /// further effect.
    pub fn stop(&self) {
        if self.state() != StreamState::Running || self.cancel.is_cancelled() {
            return;
        }
        info!("Stop requested for slot '{}'", self.slot_name);
        self.cancel.cancel();
    }

    /// Wait for the decode loop to exit
    ///
    /// Resolves to `Ok(())` after a requested stop with a clean reader
    /// exit, and to the failure otherwise. The outcome is delivered
    /// exactly once; later calls return [`CdcError::InvalidState`].
    /// Dropping the future before it resolves does not lose the outcome.
    pub async fn finished(&mut self) -> Result<()> {
        let rx = match self.finished_rx.as_mut() {
            Some(rx) => rx,
            None => return Err(self.no_outcome_error()),
        };
        let outcome = rx.await.unwrap_or_else(|_| {
            Err(CdcError::unexpected_termination(
                "decode loop exited without reporting an outcome",
            ))
        });
        self.finished_rx = None;
        outcome
    }

    /// Non-blocking variant of [`Stream::finished`]
    ///
    /// Returns `None` while the stream is still running.
    pub fn try_finished(&mut self) -> Option<Result<()>> {
        let rx = match self.finished_rx.as_mut() {
            Some(rx) => rx,
            None => return Some(Err(self.no_outcome_error())),
        };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(CdcError::unexpected_termination(
                "decode loop exited without reporting an outcome",
            )),
        };
        self.finished_rx = None;
        Some(outcome)
    }

    fn no_outcome_error(&self) -> CdcError {
        match self.state() {
            StreamState::Idle => CdcError::invalid_state("stream was never started"),
            _ => CdcError::invalid_state("completion outcome was already delivered"),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // The decode loop terminates the reader when it sees the cancellation
        if self.state() == StreamState::Running {
            self.cancel.cancel();
        }
    }
}

/// The decode loop; owns the child process exclusively
struct DecodeLoop {
    child: Child,
    stdout: ChildStdout,
    decoder: FrameDecoder,
    data_tx: mpsc::Sender<ChangeEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    read_buffer_size: usize,
    shutdown_grace: Duration,
    stop_deadline: Option<Instant>,
    exit_status: Option<ExitStatus>,
    killed: bool,
    dropped: u64,
}

/// Why the read loop ended
enum LoopEnd {
    /// The reader's output reached end of file
    Eof,
    /// Reading the output or waiting on the reader failed
    Failed(std::io::Error),
    /// The reader exited while no stop was requested
    Exited(ExitStatus),
    /// The shutdown deadline passed before the output closed
    GraceExpired,
}

impl DecodeLoop {
    async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.read_buffer_size];

        let end = loop {
            let stopping = self.stop_deadline.is_some();
            let exited = self.exit_status.is_some();
            let deadline = self.stop_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !stopping => {
                    self.begin_shutdown();
                }
                _ = tokio::time::sleep_until(deadline), if stopping => {
                    break LoopEnd::GraceExpired;
                }
                read = self.stdout.read(&mut buf) => match read {
                    Ok(0) => break LoopEnd::Eof,
                    Ok(n) => {
                        self.decoder.feed(&buf[..n]);
                        if let Err(e) = self.deliver_buffered().await {
                            self.kill();
                            let _ = self.child.wait().await;
                            return Err(e);
                        }
                    }
                    Err(e) => break LoopEnd::Failed(e),
                },
                status = self.child.wait(), if !exited => match status {
                    Ok(status) if self.stop_deadline.is_none() => break LoopEnd::Exited(status),
                    // Stopping: keep draining the output until it closes or the deadline passes
                    Ok(status) => {
                        debug!("Reader exited with {} during shutdown", status);
                        self.exit_status = Some(status);
                    }
                    Err(e) => break LoopEnd::Failed(e),
                },
            }
        };

        let outcome = self.finish(end).await;
        if self.dropped > 0 {
            if let Err(e) = &outcome {
                warn!("Shutdown also failed: {}", e);
            }
            return Err(CdcError::EventsDropped(self.dropped));
        }
        outcome
    }

    async fn finish(&mut self, end: LoopEnd) -> Result<()> {
        if self.decoder.has_partial_frame() {
            warn!(
                "Discarding {} bytes of an incomplete frame",
                self.decoder.buffered_len()
            );
        }

        let stopping = self.cancel.is_cancelled();

        match end {
            LoopEnd::Exited(status) => Err(CdcError::unexpected_termination(format!(
                "reader exited ({}) while the stream was running",
                status
            ))),
            LoopEnd::GraceExpired => {
                let status = match self.exit_status {
                    Some(status) => Some(status),
                    None => self.child.try_wait()?,
                };
                match status {
                    Some(status) => Err(CdcError::unexpected_termination(format!(
                        "reader exited ({}) but its output stayed open past the shutdown grace of {:?}",
                        status, self.shutdown_grace
                    ))),
                    None => {
                        warn!(
                            "Reader did not exit within {:?} of the stop request, killing it",
                            self.shutdown_grace
                        );
                        self.kill();
                        let status = self.child.wait().await?;
                        Err(CdcError::unexpected_termination(format!(
                            "reader had to be killed during shutdown ({})",
                            status
                        )))
                    }
                }
            }
            LoopEnd::Eof if !stopping => {
                self.unexpected_close("reader closed its output".to_string())
                    .await
            }
            LoopEnd::Failed(e) if !stopping => {
                self.unexpected_close(format!("I/O on the reader failed: {}", e))
                    .await
            }
            LoopEnd::Failed(e) => {
                warn!("I/O error during shutdown, treating as end of output: {}", e);
                self.finish_stopped().await
            }
            LoopEnd::Eof => self.finish_stopped().await,
        }
    }

    /// Output closed without a stop request; the reader may still be alive
    async fn unexpected_close(&mut self, detail: String) -> Result<()> {
        let status = self.reap_unexpected().await;
        Err(CdcError::unexpected_termination(format!(
            "{} while the stream was running ({})",
            detail, status
        )))
    }

    async fn finish_stopped(&mut self) -> Result<()> {
        let status = self.wait_for_exit().await?;
        if self.killed {
            return Err(CdcError::unexpected_termination(format!(
                "reader had to be killed during shutdown ({})",
                status
            )));
        }
        if !exited_cleanly(&status) {
            return Err(CdcError::unexpected_termination(format!(
                "reader exited during shutdown ({})",
                status
            )));
        }
        info!(
            "Reader exited cleanly after {} events",
            self.shared.events_delivered.load(Ordering::Acquire)
        );
        Ok(())
    }

    /// Push every fully buffered event to the channel, in order
    async fn deliver_buffered(&mut self) -> Result<()> {
        while let Some(event) = self.decoder.next_event()? {
            debug!(
                "Decoded {} {} at {}",
                event.operation,
                event.table_name(),
                event.position
            );
            self.push(event).await;
        }
        Ok(())
    }

    /// Wait for queue space; after a stop, only until the shutdown deadline
    async fn push(&mut self, event: ChangeEvent) {
        let position = event.position;

        loop {
            let stopping = self.stop_deadline.is_some();
            let deadline = self.stop_deadline.unwrap_or_else(Instant::now);
            let data_tx = self.data_tx.clone();

            tokio::select! {
                biased;
                permit = data_tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            permit.send(event);
                            self.shared.record_delivery(position);
                        }
                        Err(_) => {
                            debug!("Event receiver dropped, shutting down");
                            self.cancel.cancel();
                        }
                    }
                    return;
                }
                _ = self.cancel.cancelled(), if !stopping => {
                    self.begin_shutdown();
                }
                _ = tokio::time::sleep_until(deadline), if stopping => {
                    self.dropped += 1;
                    if self.dropped == 1 {
                        warn!(
                            "Event queue still full at the shutdown deadline, dropping {} at {} and any later events",
                            event.operation, event.position
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Signal the reader and arm the shutdown deadline
    fn begin_shutdown(&mut self) {
        self.stop_deadline = Some(Instant::now() + self.shutdown_grace);
        self.terminate();
    }

    /// Send the reader its termination signal
    fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            debug!("Sending SIGTERM to reader pid {}", pid);
            // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
            // to our un-reaped child so it cannot have been recycled.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(
                    "SIGTERM to reader pid {} failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
                self.kill();
            }
        }

        #[cfg(not(unix))]
        {
            debug!("Terminating reader pid {}", pid);
            self.kill();
        }
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if let Err(e) = self.child.start_kill() {
            // Already exited is fine
            debug!("Kill of reader failed: {}", e);
        }
    }

    /// Wait for the reader after a stop, bounded by the shutdown deadline
    async fn wait_for_exit(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        // Cancellation may have come from a dropped receiver rather than stop()
        if self.stop_deadline.is_none() {
            self.begin_shutdown();
        }
        let deadline = self.stop_deadline.unwrap_or_else(Instant::now);
        if !self.killed {
            match tokio::time::timeout_at(deadline, self.child.wait()).await {
                Ok(status) => return Ok(status?),
                Err(_) => {
                    warn!("Reader still running after closing its output, killing it");
                    self.kill();
                }
            }
        }
        Ok(self.child.wait().await?)
    }

    async fn reap_unexpected(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => return format!("exit status: {}", status),
            Ok(None) => self.kill(),
            Err(e) => return format!("exit status unavailable: {}", e),
        }
        match self.child.wait().await {
            Ok(_) => "reader was still running and has been killed".to_string(),
            Err(e) => format!("exit status unavailable: {}", e),
        }
    }
}

/// Exit code 0, or death by the SIGTERM we sent
fn exited_cleanly(status: &ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGTERM) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderCommand;

    fn stream() -> Stream {
        let config = ConnectionConfig::builder()
            .host("db.internal")
            .port(6543)
            .user("replicator")
            .password("s3cret")
            .database("app")
            .build()
            .unwrap();
        Stream::new(config, "llsr_test_slot", LogPos(692097666144))
    }

    #[test]
    fn test_new_is_idle() {
        let s = stream();
        assert_eq!(s.state(), StreamState::Idle);
        assert_eq!(s.last_position(), None);
        assert_eq!(s.events_delivered(), 0);
        // stop on an idle stream is a no-op
        s.stop();
        assert_eq!(s.state(), StreamState::Idle);
    }

    #[test]
    fn test_reader_args() {
        let args = stream().reader_args();
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--host=db.internal",
                "--port=6543",
                "--username=replicator",
                "--dbname=app",
                "--slot=llsr_test_slot",
                "--startpos=A1/243C4C60",
                "--format=framed",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("s3cret")));
    }

    #[test]
    fn test_reader_args_keep_prefix_first() {
        let options = StreamOptions::default()
            .reader(ReaderCommand::new("sudo").with_prefix_args(["-u", "postgres", "pg_logical_stream"]));
        let s = Stream::with_options(ConnectionConfig::new("app"), "slot", LogPos::ZERO, options);
        let args = s.reader_args();
        assert_eq!(args[0], "-u");
        assert_eq!(args[2], "pg_logical_stream");
        assert_eq!(args[args.len() - 2], "--startpos=0/00000000");
    }

    #[tokio::test]
    async fn test_start_rejects_bad_slot_name() {
        let mut s = Stream::new(ConnectionConfig::new("app"), "Bad-Slot", LogPos::ZERO);
        let err = s.start().unwrap_err();
        assert!(err.is_config());
        assert_eq!(s.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_capacity() {
        let options = StreamOptions::default().channel_capacity(0);
        let mut s = Stream::with_options(ConnectionConfig::new("app"), "slot", LogPos::ZERO, options);
        assert!(s.start().unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_finished_before_start_is_invalid() {
        let mut s = stream();
        assert!(matches!(
            s.finished().await,
            Err(CdcError::InvalidState(_))
        ));
        assert!(matches!(s.try_finished(), Some(Err(CdcError::InvalidState(_)))));
    }
}
