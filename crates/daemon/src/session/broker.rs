//! Session broker.
//!
//! Drives one [`Session`] over one WebSocket until either side goes away:
//!
//! ```text
//!            reader thread          output task
//!   pty ──▶ read(4 KiB) ──chan──▶ Utf8Stream ──▶ {"type":"output"} ──▶ ws sink
//!
//!            input task             writer thread
//!   ws stream ──▶ decode ──input──chan──▶ write_all ──▶ pty
//!                        └─resize──▶ ioctl on the pty master
//! ```
//!
//! The blocking pty handles live on dedicated threads, so a stalled client
//! only ever backs up its own shell. Whichever of "client gone" and "shell
//! exited" comes first tears down the other.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use portable_pty::{ChildKiller, MasterPty};
use protocol::{Envelope, Utf8Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use super::pty::{force_kill, hang_up, resize_pty, Session, SessionId, SessionParts, SessionStatus};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Output chunks buffered between the reader thread and the socket.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Input writes buffered between the socket and the writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Input held for a shell that is not reading, beyond the channel.
const MAX_PENDING_INPUT: usize = 1024 * 1024;

/// How long output may keep flowing after the shell exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Longest close reason a WebSocket control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// Default time a hung-up shell gets before SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// A full-duplex message channel to one client.
///
/// Implemented by any WebSocket stream from `tokio-tungstenite`.
pub trait Transport:
    Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<WsMessage, WsError>>
        + Sink<WsMessage, Error = WsError>
        + Unpin
        + Send
        + 'static
{
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client went away; the shell was terminated.
    TransportClosed(SessionStatus),
    /// The shell exited on its own; the connection was closed.
    ProcessExited(SessionStatus),
    /// The server is shutting down; both sides were closed.
    Shutdown(SessionStatus),
}

impl SessionOutcome {
    /// The shell's final status.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::TransportClosed(status)
            | SessionOutcome::ProcessExited(status)
            | SessionOutcome::Shutdown(status) => *status,
        }
    }
}

/// First terminal event observed by the broker.
enum Ended {
    ProcessExited(SessionStatus),
    TransportClosed,
    Shutdown,
}

/// Pumps bytes between sessions and their transports.
#[derive(Debug, Clone)]
pub struct SessionBroker {
    kill_grace: Duration,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl SessionBroker {
    /// Creates a broker that waits `kill_grace` after SIGHUP before SIGKILL.
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Drives `session` over `transport` until the session has fully ended.
    ///
    /// Cancelling `shutdown` ends the session from the server side.
    pub async fn run<T: Transport>(
        &self,
        session: Session,
        transport: T,
        shutdown: CancellationToken,
    ) -> SessionOutcome {
        let SessionParts {
            id,
            pid,
            master,
            reader,
            writer,
            mut child,
            killer,
        } = session.into_parts();

        let (sink, stream) = transport.split::<WsMessage>();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, mut exit_rx) = oneshot::channel();

        // Plain threads: a read stuck on a pty must never hold up runtime shutdown.
        let reader_id = id.clone();
        std::thread::spawn(move || read_pty(reader, output_tx, reader_id));
        let writer_id = id.clone();
        std::thread::spawn(move || write_pty(writer, input_rx, writer_id));
        std::thread::spawn(move || {
            let status = child
                .wait()
                .map(SessionStatus::from)
                .unwrap_or(SessionStatus::Terminated);
            let _ = exit_tx.send(status);
        });

        let stop_output = CancellationToken::new();
        let mut outbound = tokio::spawn(pump_output(
            sink,
            output_rx,
            stop_output.clone(),
            id.clone(),
        ));
        let mut inbound = tokio::spawn(pump_input(stream, input_tx, master, id.clone()));

        let ended = tokio::select! {
            status = &mut exit_rx => {
                Ended::ProcessExited(status.unwrap_or(SessionStatus::Terminated))
            }
            _ = &mut inbound => Ended::TransportClosed,
            _ = shutdown.cancelled() => Ended::Shutdown,
        };

        let outcome = match ended {
            Ended::ProcessExited(status) => {
                tracing::info!(session_id = %id, %status, "Shell exited");

                let sink = match tokio::time::timeout(DRAIN_TIMEOUT, &mut outbound).await {
                    Ok(joined) => joined.ok().flatten(),
                    Err(_) => {
                        stop_output.cancel();
                        outbound.await.ok().flatten()
                    }
                };
                inbound.abort();

                if let Some(sink) = sink {
                    close_transport(sink, CloseCode::Normal, format!("shell exited with {}", status))
                        .await;
                }
                SessionOutcome::ProcessExited(status)
            }
            Ended::TransportClosed => {
                tracing::info!(session_id = %id, "Client disconnected");

                stop_output.cancel();
                outbound.abort();
                let status = self.terminate(&id, pid, killer, exit_rx).await;
                SessionOutcome::TransportClosed(status)
            }
            Ended::Shutdown => {
                tracing::info!(session_id = %id, "Closing session for shutdown");

                inbound.abort();
                let status = self.terminate(&id, pid, killer, exit_rx).await;
                stop_output.cancel();
                if let Ok(Some(sink)) = outbound.await {
                    close_transport(sink, CloseCode::Away, "server shutting down".to_string())
                        .await;
                }
                SessionOutcome::Shutdown(status)
            }
        };

        tracing::debug!(session_id = %id, outcome = ?outcome, "Session finished");
        outcome
    }

    /// Hangs up the shell, escalating to SIGKILL after the grace period,
    /// and waits for it to be reaped.
    async fn terminate(
        &self,
        id: &SessionId,
        pid: Option<u32>,
        mut killer: Box<dyn ChildKiller + Send + Sync>,
        mut exit_rx: oneshot::Receiver<SessionStatus>,
    ) -> SessionStatus {
        if let Ok(status) = exit_rx.try_recv() {
            return status;
        }

        let hung_up = match pid {
            Some(pid) => match hang_up(pid) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "SIGHUP failed");
                    false
                }
            },
            None => false,
        };
        if !hung_up {
            if let Err(e) = killer.kill() {
                tracing::debug!(session_id = %id, error = %e, "Failed to signal shell");
            }
        }

        match tokio::time::timeout(self.kill_grace, &mut exit_rx).await {
            Ok(status) => status.unwrap_or(SessionStatus::Terminated),
            Err(_) => {
                tracing::warn!(
                    session_id = %id,
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Shell ignored hangup, killing"
                );
                if let Some(pid) = pid {
                    if let Err(e) = force_kill(pid) {
                        tracing::warn!(session_id = %id, error = %e, "SIGKILL failed");
                    }
                }
                exit_rx.await.unwrap_or(SessionStatus::Terminated)
            }
        }
    }
}

/// Reader thread: forwards raw pty output until EOF.
fn read_pty(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>, id: SessionId) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %id, "PTY EOF");
                break;
            }
            Ok(n) => {
                if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the last slave descriptor closes.
                tracing::debug!(session_id = %id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writer thread: applies client input to the pty in arrival order.
fn write_pty(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    id: SessionId,
) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(session_id = %id, error = %e, "PTY write failed");
            break;
        }
    }
}

/// Sends each output chunk as an `output` envelope.
///
/// Returns the sink for a final close frame, or `None` if the transport
/// failed.
async fn pump_output<S>(
    mut sink: S,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
    id: SessionId,
) -> Option<S>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut decoder = Utf8Stream::new();

    loop {
        let chunk = tokio::select! {
            biased;
            chunk = output_rx.recv() => chunk,
            _ = stop.cancelled() => break,
        };

        let Some(chunk) = chunk else { break };
        let text = decoder.decode(&chunk);
        if let Err(e) = send_output(&mut sink, text).await {
            tracing::debug!(session_id = %id, error = %e, "Output send failed");
            return None;
        }
    }

    if decoder.has_pending() {
        tracing::debug!(session_id = %id, "Output ended inside a UTF-8 sequence");
    }
    let tail = decoder.finish();
    if let Err(e) = send_output(&mut sink, tail).await {
        tracing::debug!(session_id = %id, error = %e, "Output send failed");
        return None;
    }

    Some(sink)
}

async fn send_output<S>(sink: &mut S, text: String) -> Result<(), WsError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    if text.is_empty() {
        return Ok(());
    }

    match protocol::encode_text(&Envelope::Output(text)) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode output");
            Ok(())
        }
    }
}

/// What a client message asks of the input pump.
enum Inbound {
    /// The transport is gone.
    Closed,
    /// Bytes to write to the pty.
    Input(Vec<u8>),
    /// Handled in place, or dropped.
    Handled,
}

/// Applies client envelopes until the transport closes.
///
/// Input waiting on a stalled shell is queued here rather than awaited, so
/// the stream keeps being read and a disconnect is always noticed. Malformed
/// or unexpected messages are dropped; they never end the session.
async fn pump_input<R>(
    mut stream: R,
    input_tx: mpsc::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    id: SessionId,
) where
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
    let mut pending_bytes = 0usize;
    let mut writer_open = true;

    loop {
        tokio::select! {
            permit = input_tx.reserve(), if writer_open && !pending.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(data) = pending.pop_front() {
                            pending_bytes -= data.len();
                            permit.send(data);
                        }
                    }
                    Err(_) => {
                        tracing::trace!(session_id = %id, "Dropping queued input, PTY writer gone");
                        writer_open = false;
                        pending.clear();
                        pending_bytes = 0;
                    }
                }
            }
            message = stream.next() => {
                let data = match apply_message(message, master.as_ref(), &id) {
                    Inbound::Closed => break,
                    Inbound::Handled => continue,
                    Inbound::Input(data) => data,
                };
                if !writer_open {
                    tracing::trace!(session_id = %id, "Dropping input, PTY writer gone");
                    continue;
                }

                // Keep order: only bypass the queue when it is empty
                let data = if pending.is_empty() {
                    match input_tx.try_send(data) {
                        Ok(()) => continue,
                        Err(mpsc::error::TrySendError::Full(data)) => data,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            tracing::trace!(session_id = %id, "Dropping input, PTY writer gone");
                            writer_open = false;
                            continue;
                        }
                    }
                } else {
                    data
                };

                if pending_bytes + data.len() > MAX_PENDING_INPUT {
                    tracing::warn!(
                        session_id = %id,
                        bytes = data.len(),
                        "Shell is not reading input, dropping"
                    );
                    continue;
                }
                pending_bytes += data.len();
                pending.push_back(data);
            }
        }
    }
}

/// Decodes one client message, applying resizes directly.
fn apply_message(
    message: Option<Result<WsMessage, WsError>>,
    master: &dyn MasterPty,
    id: &SessionId,
) -> Inbound {
    let payload = match message {
        Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
        Some(Ok(WsMessage::Binary(data))) => data,
        Some(Ok(WsMessage::Close(frame))) => {
            tracing::debug!(session_id = %id, frame = ?frame, "Client sent close");
            return Inbound::Closed;
        }
        Some(Ok(_)) => return Inbound::Handled,
        Some(Err(e)) => {
            tracing::debug!(session_id = %id, error = %e, "Transport error");
            return Inbound::Closed;
        }
        None => return Inbound::Closed,
    };

    match protocol::decode(&payload) {
        Ok(envelope) if !envelope.is_client_message() => {
            tracing::debug!(session_id = %id, kind = envelope.kind(), "Ignoring envelope from client");
            Inbound::Handled
        }
        Ok(Envelope::Input(data)) => Inbound::Input(data.into_bytes()),
        Ok(Envelope::Resize(size)) => {
            match resize_pty(master, size.cols, size.rows) {
                Ok(()) => tracing::debug!(
                    session_id = %id,
                    cols = size.cols,
                    rows = size.rows,
                    "Resized PTY"
                ),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Resize failed"),
            }
            Inbound::Handled
        }
        Ok(Envelope::Output(_)) => Inbound::Handled,
        Err(e) => {
            tracing::debug!(session_id = %id, error = %e, "Dropping malformed envelope");
            Inbound::Handled
        }
    }
}

/// Sends a close frame and shuts the sink.
async fn close_transport<S>(mut sink: S, code: CloseCode, reason: String)
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(close_reason(&reason).to_string()),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
    let _ = sink.close().await;
}

/// Truncates `reason` to fit a close frame, on a char boundary.
pub(crate) fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::ShellCommand;
    use protocol::ResizeData;
    use std::time::Instant;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    fn sh_session() -> Session {
        Session::spawn(
            ShellCommand {
                program: "/bin/sh".to_string(),
                args: Vec::new(),
                env: vec![
                    ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                    ("TERM".to_string(), "xterm".to_string()),
                    ("PS1".to_string(), "$ ".to_string()),
                ],
                cwd: std::env::temp_dir(),
            },
            80,
            24,
        )
        .unwrap()
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn send(client: &mut WebSocketStream<DuplexStream>, envelope: Envelope) {
        let json = protocol::encode_text(&envelope).unwrap();
        client.send(WsMessage::Text(json)).await.unwrap();
    }

    /// Collects output until `needle` appears or the deadline passes.
    async fn read_output_until(
        client: &mut WebSocketStream<DuplexStream>,
        needle: &str,
        deadline: Duration,
    ) -> String {
        let start = Instant::now();
        let mut output = String::new();
        while start.elapsed() < deadline && !output.contains(needle) {
            match tokio::time::timeout(Duration::from_millis(200), client.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Ok(Envelope::Output(data)) = protocol::decode(text.as_bytes()) {
                        output.push_str(&data);
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }
        output
    }

    fn process_alive(pid: u32) -> bool {
        // Signal 0 checks for existence; a reaped child is gone.
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_close_reason_truncation() {
        assert_eq!(close_reason("short"), "short");

        let long = "x".repeat(200);
        assert_eq!(close_reason(&long).len(), MAX_CLOSE_REASON);

        let multibyte = "é".repeat(100);
        let truncated = close_reason(&multibyte);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_outcome_status() {
        let status = SessionStatus::Exited(3);
        assert_eq!(SessionOutcome::ProcessExited(status).status(), status);
        assert_eq!(SessionOutcome::TransportClosed(status).status(), status);
        assert_eq!(SessionOutcome::Shutdown(status).status(), status);
    }

    #[tokio::test]
    async fn test_input_round_trip() {
        let (server, mut client) = ws_pair().await;
        let broker = SessionBroker::default();
        let handle = tokio::spawn(async move {
            broker.run(sh_session(), server, CancellationToken::new()).await
        });

        send(&mut client, Envelope::Input("echo hi_$((40+2))\n".to_string())).await;
        let output = read_output_until(&mut client, "hi_42", Duration::from_secs(5)).await;
        assert!(output.contains("hi_42"), "output: {:?}", output);

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::TransportClosed(_)));
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_session() {
        let (server, mut client) = ws_pair().await;
        let broker = SessionBroker::default();
        let handle = tokio::spawn(async move {
            broker.run(sh_session(), server, CancellationToken::new()).await
        });

        client
            .send(WsMessage::Text(r#"{"data":"missing type"}"#.to_string()))
            .await
            .unwrap();
        client.send(WsMessage::Text("garbage".to_string())).await.unwrap();
        client
            .send(WsMessage::Text(r#"{"type":"output","data":"spoof"}"#.to_string()))
            .await
            .unwrap();
        client
            .send(WsMessage::Text(r#"{"type":"resize","data":{"cols":0,"rows":0}}"#.to_string()))
            .await
            .unwrap();

        send(&mut client, Envelope::Input("echo still_$((1+1))_alive\n".to_string())).await;
        let output = read_output_until(&mut client, "still_2_alive", Duration::from_secs(5)).await;
        assert!(output.contains("still_2_alive"), "output: {:?}", output);
        assert!(!handle.is_finished());

        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let (server, mut client) = ws_pair().await;
        let broker = SessionBroker::default();
        let handle = tokio::spawn(async move {
            broker.run(sh_session(), server, CancellationToken::new()).await
        });

        let bytes = protocol::encode(&Envelope::Input("echo bin_$((3*3))\n".to_string())).unwrap();
        client.send(WsMessage::Binary(bytes)).await.unwrap();

        let output = read_output_until(&mut client, "bin_9", Duration::from_secs(5)).await;
        assert!(output.contains("bin_9"), "output: {:?}", output);

        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    #[tokio::test]
    async fn test_resize_applies_to_live_pty() {
        let (server, mut client) = ws_pair().await;
        let broker = SessionBroker::default();
        let handle = tokio::spawn(async move {
            broker.run(sh_session(), server, CancellationToken::new()).await
        });

        send(&mut client, Envelope::Resize(ResizeData::new(40, 10))).await;
        send(&mut client, Envelope::Input("echo \"size=$(stty size)\"\n".to_string())).await;

        let output = read_output_until(&mut client, "size=10 40", Duration::from_secs(5)).await;
        assert!(output.contains("size=10 40"), "output: {:?}", output);

        // Flat form from older clients
        client
            .send(WsMessage::Text(r#"{"type":"resize","cols":132,"rows":43}"#.to_string()))
            .await
            .unwrap();
        send(&mut client, Envelope::Input("echo \"size=$(stty size)\"\n".to_string())).await;

        let output = read_output_until(&mut client, "size=43 132", Duration::from_secs(5)).await;
        assert!(output.contains("size=43 132"), "output: {:?}", output);

        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    #[tokio::test]
    async fn test_shell_exit_closes_transport() {
        let (server, mut client) = ws_pair().await;
        let broker = SessionBroker::default();
        let handle = tokio::spawn(async move {
            broker.run(sh_session(), server, CancellationToken::new()).await
        });

        send(&mut client, Envelope::Input("exit 7\n".to_string())).await;

        let mut close_frame = None;
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), client.next()).await {
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    close_frame = frame;
                    break;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }

        let frame = close_frame.expect("server should send a close frame");
        assert_eq!(frame.code, CloseCode::Normal);
        assert!(frame.reason.contains("status 7"), "reason: {}", frame.reason);

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::ProcessExited(SessionStatus::Exited(7)));
    }

    #[tokio::test]
    async fn test_transport_close_terminates_shell() {
        let (server, client) = ws_pair().await;
        let session = sh_session();
        let pid = session.pid().unwrap();
        let broker = SessionBroker::new(Duration::from_millis(500));
        let handle = tokio::spawn(async move {
            broker.run(session, server, CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process_alive(pid));

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::TransportClosed(_)));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_shell_ignoring_hangup_is_killed() {
        let (server, mut client) = ws_pair().await;
        let session = sh_session();
        let pid = session.pid().unwrap();
        let broker = SessionBroker::new(Duration::from_millis(300));
        let handle = tokio::spawn(async move {
            broker.run(session, server, CancellationToken::new()).await
        });

        send(&mut client, Envelope::Input("trap '' HUP; echo trap_$((5+5))\n".to_string())).await;
        let output = read_output_until(&mut client, "trap_10", Duration::from_secs(5)).await;
        assert!(output.contains("trap_10"), "output: {:?}", output);

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::TransportClosed(_)));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_shutdown_closes_both_sides() {
        let (server, mut client) = ws_pair().await;
        let session = sh_session();
        let pid = session.pid().unwrap();
        let shutdown = CancellationToken::new();
        let broker = SessionBroker::default();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { broker.run(session, server, token).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Shutdown(_)));
        assert!(!process_alive(pid));

        let mut saw_away = false;
        while let Ok(Some(Ok(message))) =
            tokio::time::timeout(Duration::from_secs(2), client.next()).await
        {
            if let WsMessage::Close(Some(frame)) = message {
                saw_away = frame.code == CloseCode::Away;
                break;
            }
        }
        assert!(saw_away);
    }

    #[tokio::test]
    async fn test_disconnect_with_input_backlog_terminates_shell() {
        let (server, mut client) = ws_pair().await;
        let session = sh_session();
        let pid = session.pid().unwrap();
        let broker = SessionBroker::new(Duration::from_millis(500));
        let handle = tokio::spawn(async move {
            broker.run(session, server, CancellationToken::new()).await
        });

        // The shell stops reading stdin for a minute
        send(
            &mut client,
            Envelope::Input("stty raw -echo; echo ready_$((9+9)); sleep 60\n".to_string()),
        )
        .await;
        let output = read_output_until(&mut client, "ready_18", Duration::from_secs(5)).await;
        assert!(output.contains("ready_18"), "output: {:?}", output);

        // Far more than the pty and the input channel can hold
        let chunk = "a".repeat(4096);
        for _ in 0..200 {
            let json = protocol::encode_text(&Envelope::Input(chunk.clone())).unwrap();
            let sent =
                tokio::time::timeout(Duration::from_secs(1), client.send(WsMessage::Text(json)))
                    .await;
            assert!(sent.is_ok(), "input stopped being read while the shell was busy");
        }

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("disconnect went unnoticed behind queued input")
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::TransportClosed(_)));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_disconnect_with_unread_output_terminates_shell() {
        let (server, mut client) = ws_pair().await;
        let session = sh_session();
        let pid = session.pid().unwrap();
        let broker = SessionBroker::new(Duration::from_millis(500));
        let handle = tokio::spawn(async move {
            broker.run(session, server, CancellationToken::new()).await
        });

        // Endless output that the client never reads
        send(&mut client, Envelope::Input("yes flood_line\n".to_string())).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("disconnect went unnoticed behind unread output")
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::TransportClosed(_)));
        assert!(!process_alive(pid));
    }
}
