//! Session runtime: one editor instance joined to one session.
//!
//! The run loop owns the document. It serves bus traffic through the sync
//! engine, finishes the startup bootstrap when its task completes, applies
//! and broadcasts local edits, and optionally pushes a full snapshot on a
//! fixed interval.
//!
//! Peer edits that arrive while the bootstrap is still running are held back
//! and replayed on top of the bootstrapped document. Calls are answered
//! right away, so two instances bootstrapping from each other both finish.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sharedpad_core::bootstrap::Result as BootstrapResult;
use sharedpad_core::{
    BootstrapOutcome, BusConnection, BusEvent, CharFormat, DocumentView, EditEvent, Emitter,
    EventBus, InboundEvents, InstanceId, RegistrationError, RichDocument, SessionAddress,
    SessionEvent, SharedDocumentBuffer, Signal, SyncEngine, apply_outcome, bootstrap, register,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, interval_at};
use tracing::{debug, error, info, warn};

use crate::commands::{Clipboard, LocalEdit};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to register on the bus: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Session has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// How an instance joins and behaves in its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub label: String,
    /// Run alone, invisible to every session.
    pub isolated: bool,
    /// Directory of the shared bootstrap segment.
    pub shm_dir: PathBuf,
    pub resync_interval: Option<Duration>,
}

/// What the local document looks like right now.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    pub markup: String,
    pub text: String,
    pub cursor: usize,
    /// Typing format at the cursor.
    pub format: CharFormat,
}

/// Requests accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Edit(LocalEdit),
    Inspect(oneshot::Sender<DocumentState>),
    Quit,
}

pub type SessionCommands = mpsc::UnboundedReceiver<SessionCommand>;

/// Cloneable front door to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Create a handle and the command receiver to pass to [`Session::run`].
    pub fn channel() -> (Self, SessionCommands) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn edit(&self, edit: LocalEdit) -> Result<()> {
        self.tx
            .send(SessionCommand::Edit(edit))
            .map_err(|_| SessionError::Closed)
    }

    /// Snapshot of the document, taken after every command sent before it.
    pub async fn inspect(&self) -> Result<DocumentState> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Inspect(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn quit(&self) {
        let _ = self.tx.send(SessionCommand::Quit);
    }
}

type BootstrapTask = JoinHandle<BootstrapResult<Option<BootstrapOutcome>>>;

/// A registered editor instance.
pub struct Session<C: BusConnection + 'static> {
    engine: SyncEngine<RichDocument>,
    emitter: Emitter<C>,
    inbound: InboundEvents,
    bootstrap: Option<BootstrapTask>,
    /// Signals received before the bootstrap finished, in arrival order.
    held: VecDeque<Signal>,
    resync_interval: Option<Duration>,
}

impl<C: BusConnection + 'static> Session<C> {
    /// Register on the bus and start the bootstrap in the background.
    ///
    /// Registration failures are fatal. The bootstrap runs as its own task
    /// so the run loop can keep answering calls meanwhile, including calls
    /// from an instance that is bootstrapping from us at the same time.
    pub async fn start(
        connection: Arc<C>,
        inbound: InboundEvents,
        settings: SessionSettings,
    ) -> Result<Self> {
        let identity = InstanceId::generate();
        let address = SessionAddress::derive(&settings.label, settings.isolated, &identity);
        let handle = register(connection, &address).await?;
        info!("Registered as {}", address.service_name);

        let emitter = Emitter::new(handle, identity.clone());
        let engine = SyncEngine::new(
            identity,
            RichDocument::new(),
            SharedDocumentBuffer::new(&settings.shm_dir),
            Arc::new(EventBus::new()),
        );

        let bootstrap_emitter = emitter.clone();
        let shm_dir = settings.shm_dir.clone();
        let bootstrap_task = tokio::spawn(async move {
            let mut reader = SharedDocumentBuffer::new(shm_dir);
            bootstrap(&bootstrap_emitter, &mut reader).await
        });

        Ok(Self {
            engine,
            emitter,
            inbound,
            bootstrap: Some(bootstrap_task),
            held: VecDeque::new(),
            resync_interval: settings.resync_interval,
        })
    }

    /// Session notifications. Subscribe before calling [`Session::run`] to
    /// see the bootstrap finish.
    pub fn events(&self) -> &Arc<EventBus> {
        self.engine.events()
    }

    pub fn address(&self) -> &SessionAddress {
        self.emitter.address()
    }

    pub fn document(&self) -> &RichDocument {
        self.engine.document()
    }

    /// Serve the session until a quit command, the end of `commands`, or the
    /// bus connection closing.
    pub async fn run(mut self, mut commands: SessionCommands) {
        let mut resync = self.resync_interval.map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                event = self.inbound.next() => match event {
                    Some(BusEvent::Signal(signal)) if self.bootstrap.is_some() => {
                        debug!("Holding {} until the bootstrap finishes", signal.member);
                        self.held.push_back(signal);
                    }
                    Some(event) => self.engine.handle_event(event),
                    None => {
                        warn!("Bus connection closed");
                        break;
                    }
                },
                joined = join_bootstrap(&mut self.bootstrap), if self.bootstrap.is_some() => {
                    self.bootstrap = None;
                    self.finish_bootstrap(joined);
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Edit(edit)) => self.perform(edit).await,
                    Some(SessionCommand::Inspect(reply)) => {
                        let _ = reply.send(self.state());
                    }
                    Some(SessionCommand::Quit) | None => {
                        info!("Leaving session {}", self.address().interface_name);
                        break;
                    }
                },
                _ = next_tick(&mut resync) => self.resync().await,
            }
        }

        if let Some(task) = self.bootstrap.take() {
            task.abort();
        }
    }

    fn state(&self) -> DocumentState {
        let doc = self.engine.document();
        DocumentState {
            markup: doc.markup(),
            text: doc.plain_text(),
            cursor: doc.cursor(),
            format: doc.format_at_cursor(),
        }
    }

    fn finish_bootstrap(
        &mut self,
        joined: std::result::Result<BootstrapResult<Option<BootstrapOutcome>>, JoinError>,
    ) {
        let peer = match joined {
            Ok(Ok(Some(outcome))) => {
                apply_outcome(self.engine.document_mut(), &outcome);
                info!("Joined with content from {}", outcome.peer);
                self.events()
                    .emit(SessionEvent::ToolbarPrimed(outcome.toolbar.clone()));
                Some(outcome.peer)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("Bootstrap failed, starting empty: {}", e);
                None
            }
            Err(e) => {
                error!("Bootstrap task failed: {}", e);
                None
            }
        };

        if !self.held.is_empty() {
            debug!("Replaying {} signals held during bootstrap", self.held.len());
        }
        while let Some(signal) = self.held.pop_front() {
            // Rejections are already logged and published
            let _ = self.engine.handle_signal(&signal);
        }
        self.events().emit(SessionEvent::BootstrapFinished { peer });
    }

    async fn perform(&mut self, edit: LocalEdit) {
        debug!("Local edit {:?}", edit);
        match edit {
            LocalEdit::Type(text) => {
                for character in text.chars() {
                    let format = self.engine.document().format_at_cursor();
                    self.commit(EditEvent::CharacterInserted {
                        character,
                        color_hex: format.color,
                        font_descriptor: format.font.to_string(),
                    })
                    .await;
                }
            }
            LocalEdit::MoveCursor(pos) => self.commit(EditEvent::CursorMoved { pos }).await,
            LocalEdit::Select { start, end } => {
                self.commit(EditEvent::SelectionChanged { start, end }).await
            }
            LocalEdit::SelectAll => self.commit(EditEvent::SelectAll).await,
            // Past the document length every further delete is a no-op
            LocalEdit::Backspace(count) => {
                for _ in 0..count.min(self.engine.document().len()) {
                    self.commit(EditEvent::DeleteBackward).await;
                }
            }
            LocalEdit::Delete(count) => {
                for _ in 0..count.min(self.engine.document().len()) {
                    self.commit(EditEvent::DeleteForward).await;
                }
            }
            LocalEdit::Toggle(kind, enabled) => {
                self.commit(EditEvent::FormatToggled { kind, enabled }).await
            }
            LocalEdit::Family(name) => self.commit(EditEvent::TextFamilyChanged { name }).await,
            LocalEdit::Size(points) => self.commit(EditEvent::TextSizeChanged { points }).await,
            LocalEdit::Color(color_hex) => {
                self.commit(EditEvent::TextColorChanged { color_hex }).await
            }
            LocalEdit::Paste(clipboard) => {
                if let Some(event) = paste_event(clipboard) {
                    self.commit(event).await;
                }
            }
            LocalEdit::Resync => self.resync().await,
        }
    }

    /// Apply locally, then tell the session.
    async fn commit(&mut self, event: EditEvent) {
        self.engine.apply(&event);
        broadcast(&self.emitter, event).await;
    }

    /// Broadcast the whole document without touching it.
    async fn resync(&mut self) {
        let doc = self.engine.document();
        let event = EditEvent::FullSnapshot {
            html: doc.markup(),
            cursor_pos: doc.cursor(),
        };
        broadcast(&self.emitter, event).await;
    }
}

async fn broadcast<C: BusConnection>(emitter: &Emitter<C>, event: EditEvent) {
    let member = event.member();
    if let Err(e) = emitter.broadcast(event).await {
        warn!("Failed to broadcast {}: {}", member, e);
    }
}

/// Rich clipboard content wins over plain text.
fn paste_event(clipboard: Clipboard) -> Option<EditEvent> {
    match clipboard {
        Clipboard {
            html: Some(payload),
            ..
        } => Some(EditEvent::RawInsert {
            is_html: true,
            payload,
        }),
        Clipboard {
            text: Some(payload),
            ..
        } => Some(EditEvent::RawInsert {
            is_html: false,
            payload,
        }),
        Clipboard { .. } => None,
    }
}

async fn join_bootstrap(
    task: &mut Option<BootstrapTask>,
) -> std::result::Result<BootstrapResult<Option<BootstrapOutcome>>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
