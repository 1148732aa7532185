use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::Local;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::core::commands::{CommandError, TransmitResult};
use crate::core::gateway::{PresenceChange, PresenceListener, Reader, TrafficEvent, TrafficListener};
use crate::core::session::{Session, SessionSnapshot};
use crate::core::utils::{describe_status_word, format_hex_spaced};

/// Requests handled by the session thread, in arrival order
#[derive(Debug)]
pub enum SessionMessage {
    Presence(PresenceChange),
    Submit {
        line: String,
        reply: Sender<Result<Option<TransmitResult>, CommandError>>,
    },
    Snapshot {
        reply: Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Forwards presence changes into the session queue
#[derive(Debug, Clone)]
pub struct QueuePresenceListener {
    sender: Sender<SessionMessage>,
}

impl PresenceListener for QueuePresenceListener {
    fn on_presence_change(&mut self, change: PresenceChange) {
        if self.sender.send(SessionMessage::Presence(change)).is_err() {
            log::warn!("Session has stopped, dropping presence change");
        }
    }
}

/// Queue feeding the session thread. Listeners can be handed out before
/// the session itself exists.
///
/// Presence changes from the card monitor and requests from the shell share
/// this one ordered queue, so the session is never touched from two threads.
/// Connection traffic does not go through it: it reaches a [`TraceWriter`]
/// directly.
#[derive(Debug)]
pub struct SessionQueue {
    sender: Sender<SessionMessage>,
    receiver: Receiver<SessionMessage>,
}

impl SessionQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn presence_listener(&self) -> QueuePresenceListener {
        QueuePresenceListener {
            sender: self.sender.clone(),
        }
    }

    /// Move `session` onto its own thread and start draining the queue
    pub fn spawn(self, session: Session) -> SessionHandle {
        let receiver = self.receiver;
        let worker = thread::Builder::new()
            .name("card-session".into())
            .spawn(move || run_session(session, receiver));

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::error!("Failed to start session thread: {e}");
                None
            }
        };

        SessionHandle {
            sender: self.sender,
            worker,
        }
    }
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn run_session(mut session: Session, receiver: Receiver<SessionMessage>) {
    log::debug!("Session thread started for reader {}", session.reader());

    for message in receiver {
        match message {
            SessionMessage::Presence(change) => session.handle_presence_change(&change),
            SessionMessage::Submit { line, reply } => {
                let _ = reply.send(session.submit(&line));
            }
            SessionMessage::Snapshot { reply } => {
                let _ = reply.send(session.snapshot());
            }
            SessionMessage::Shutdown => break,
        }
    }

    session.clear_connection();
    session.clear_context();
    log::debug!("Session thread stopped");
}

/// Shell-side handle to the session thread. Dropping it stops the session
/// and disconnects from the card.
#[derive(Debug)]
pub struct SessionHandle {
    sender: Sender<SessionMessage>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn presence_listener(&self) -> QueuePresenceListener {
        QueuePresenceListener {
            sender: self.sender.clone(),
        }
    }

    /// Submit one operator line and wait for the outcome
    pub fn submit(&self, line: &str) -> Result<Option<TransmitResult>, CommandError> {
        let (reply, outcome) = bounded(1);
        self.sender
            .send(SessionMessage::Submit {
                line: line.to_string(),
                reply,
            })
            .map_err(|_| CommandError::SessionClosed)?;

        outcome.recv().map_err(|_| CommandError::SessionClosed)?
    }

    /// Current session state, after every queued event has been applied
    pub fn snapshot(&self) -> Result<SessionSnapshot, CommandError> {
        let (reply, snapshot) = bounded(1);
        self.sender
            .send(SessionMessage::Snapshot { reply })
            .map_err(|_| CommandError::SessionClosed)?;

        snapshot.recv().map_err(|_| CommandError::SessionClosed)
    }

    /// Stop the session thread and wait for the card to be released
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.sender.send(SessionMessage::Shutdown);
        if worker.join().is_err() {
            log::error!("Session thread panicked");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rendering switches for the traffic trace
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    /// Prefix every line with the local time
    pub timestamps: bool,
    /// Append a status word description to responses
    pub explain_status: bool,
}

/// Render one traffic event as trace text (possibly several lines)
pub fn render_traffic_event(event: &TrafficEvent, options: &TraceOptions) -> String {
    match event {
        TrafficEvent::Connect => "Card connected".to_string(),
        TrafficEvent::Disconnect => "Card disconnected".to_string(),
        TrafficEvent::Command(apdu) => format!("> {}", format_hex_spaced(apdu)),
        TrafficEvent::Response { data, sw1, sw2 } => {
            let mut text = format!("< [{}]\n<  {sw1:02X} {sw2:02X}", format_hex_spaced(data));
            if options.explain_status {
                text.push_str(&format!(" ({})", describe_status_word(*sw1, *sw2)));
            }
            text
        }
        TrafficEvent::Other(kind) => format!("Unknown event type: {kind}"),
    }
}

/// Render the part of a presence change that concerns `reader`
pub fn render_presence_change(change: &PresenceChange, reader: &Reader) -> Vec<String> {
    let removed = change
        .removed
        .iter()
        .filter(|card| card.reader().name() == reader.name())
        .map(|card| format!("Card removed from [{}]", card.reader()));

    let added = change
        .added
        .iter()
        .filter(|card| card.reader().name() == reader.name())
        .map(|card| {
            format!(
                "Card inserted into [{}] (ATR: {})",
                card.reader(),
                format_hex_spaced(card.atr())
            )
        });

    removed.chain(added).collect()
}

/// Writes the traffic trace and presence notices to an output stream
#[derive(Debug)]
pub struct TraceWriter<W> {
    out: Mutex<W>,
    options: TraceOptions,
}

impl<W: Write + Send> TraceWriter<W> {
    pub fn new(out: W, options: TraceOptions) -> Self {
        Self {
            out: Mutex::new(out),
            options,
        }
    }

    /// Echo presence changes for `reader`
    pub fn presence(&self, change: &PresenceChange, reader: &Reader) {
        for line in render_presence_change(change, reader) {
            self.write_text(&line);
        }
    }

    fn write_text(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = self
            .options
            .timestamps
            .then(|| Local::now().format("[%H:%M:%S%.3f] ").to_string())
            .unwrap_or_default();

        for line in text.lines() {
            if let Err(e) = writeln!(out, "{stamp}{line}") {
                log::warn!("Failed to write trace: {e}");
                return;
            }
        }
        let _ = out.flush();
    }
}

impl<W: Write + Send> TrafficListener for TraceWriter<W> {
    fn on_traffic(&self, event: &TrafficEvent) {
        self.write_text(&render_traffic_event(event, &self.options));
    }
}
