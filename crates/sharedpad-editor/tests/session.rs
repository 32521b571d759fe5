//! Session runtime tests over the in-process bus.
//!
//! Each test runs real `Session` loops as tokio tasks and drives them through
//! their `SessionHandle`, the same way the binary drives them from stdin.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sharedpad_core::{
    BusEvent, DocumentView, EditEvent, Emitter, EventBus, FormatKind, InstanceId, LocalBus,
    LocalConnection, Operation, RichDocument, SessionAddress, SessionEvent, SharedDocumentBuffer,
    Subscription, SyncEngine, register,
};
use sharedpad_editor::{
    Clipboard, DocumentState, LocalEdit, MAX_REPEAT, Session, SessionHandle, SessionSettings,
};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    handle: SessionHandle,
    service_name: String,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
    _subscription: Subscription,
}

fn settings(label: &str, isolated: bool, shm: &Path) -> SessionSettings {
    SessionSettings {
        label: label.to_string(),
        isolated,
        shm_dir: shm.to_path_buf(),
        resync_interval: None,
    }
}

async fn launch(bus: &LocalBus, settings: SessionSettings) -> Running {
    let (conn, inbound) = bus.connect();
    let session: Session<LocalConnection> = Session::start(Arc::new(conn), inbound, settings)
        .await
        .expect("Failed to start session");
    let service_name = session.address().service_name.clone();

    let (tx, events) = mpsc::unbounded_channel();
    let subscription = session.events().subscribe(move |event| {
        let _ = tx.send(event);
    });

    let (handle, commands) = SessionHandle::channel();
    let task = tokio::spawn(session.run(commands));
    Running {
        handle,
        service_name,
        events,
        task,
        _subscription: subscription,
    }
}

impl Running {
    /// Wait for the first event matching `pred`.
    async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("Session events ended"),
                }
            }
        })
        .await
        .expect("Timeout waiting for session event")
    }

    async fn bootstrapped(&mut self) -> Option<String> {
        match self
            .wait_for(|e| matches!(e, SessionEvent::BootstrapFinished { .. }))
            .await
        {
            SessionEvent::BootstrapFinished { peer } => peer,
            _ => unreachable!(),
        }
    }

    fn edit(&self, edit: LocalEdit) {
        self.handle.edit(edit).expect("Session closed");
    }

    async fn state(&self) -> DocumentState {
        self.handle.inspect().await.expect("Session closed")
    }

    /// Poll until the document text equals `text`.
    async fn wait_for_text(&self, text: &str) -> DocumentState {
        let result = timeout(WAIT, async {
            loop {
                let state = self.state().await;
                if state.text == text {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match result {
            Ok(state) => state,
            Err(_) => panic!(
                "Timeout waiting for {:?}, document is {:?}",
                text,
                self.state().await.text
            ),
        }
    }
}

#[tokio::test]
async fn test_first_instance_starts_empty() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;

    assert_eq!(a.bootstrapped().await, None);
    let state = a.state().await;
    assert_eq!(state.text, "");
    assert_eq!(state.cursor, 0);
}

#[tokio::test]
async fn test_joiner_copies_document_and_toolbar() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;

    a.edit(LocalEdit::Color("#ff0000".into()));
    a.edit(LocalEdit::Toggle(FormatKind::Bold, true));
    a.edit(LocalEdit::Type("hi".into()));
    let expected = a.state().await;

    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    let primed = b
        .wait_for(|e| matches!(e, SessionEvent::ToolbarPrimed(_)))
        .await;
    let SessionEvent::ToolbarPrimed(toolbar) = primed else {
        unreachable!()
    };
    assert!(toolbar.bold);
    assert_eq!(toolbar.color_hex, "#ff0000");
    assert_eq!(b.bootstrapped().await, Some(a.service_name.clone()));

    let joined = b.state().await;
    assert_eq!(joined.markup, expected.markup);
    assert_eq!(joined.cursor, expected.cursor);
    assert_eq!(joined.format.color, "#ff0000");
    assert!(!shm.path().join("SharedMemory").exists());
}

#[tokio::test]
async fn test_joiner_keeps_edits_made_during_bootstrap() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();

    // A bare peer that types '!' after handing out its snapshot but before
    // the joiner releases it
    let identity = InstanceId::generate();
    let address = SessionAddress::derive("notes", false, &identity);
    let (conn, mut inbound) = bus.connect();
    let handle = register(Arc::new(conn), &address)
        .await
        .expect("registration failed");
    let emitter = Emitter::new(handle, identity.clone());
    let mut document = RichDocument::new();
    document.insert_text("hello");
    let mut engine = SyncEngine::new(
        identity,
        document,
        SharedDocumentBuffer::new(shm.path()),
        Arc::new(EventBus::new()),
    );

    let peer = tokio::spawn(async move {
        while let Some(event) = inbound.next().await {
            let serialized = matches!(
                &event,
                BusEvent::MethodCall { call, .. }
                    if call.member == Operation::SerializeToSharedBuffer.member()
            );
            engine.handle_event(event);
            if serialized {
                let format = engine.document().format_at_cursor();
                let typed = EditEvent::CharacterInserted {
                    character: '!',
                    color_hex: format.color,
                    font_descriptor: format.font.to_string(),
                };
                engine.apply(&typed);
                emitter.broadcast(typed).await.expect("broadcast failed");
            }
        }
    });

    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    assert_eq!(b.bootstrapped().await, Some(address.service_name.clone()));

    let state = b.state().await;
    assert_eq!(state.text, "hello!");
    assert_eq!(state.cursor, 6);
    peer.abort();
}

#[tokio::test]
async fn test_large_backspace_count_stops_at_document_start() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    b.bootstrapped().await;

    a.edit(LocalEdit::Type("abc".into()));
    b.wait_for_text("abc").await;

    a.edit(LocalEdit::Backspace(MAX_REPEAT));
    b.wait_for_text("").await;
    a.edit(LocalEdit::Type("z".into()));
    b.wait_for_text("z").await;

    // Only three deletes went out for the whole count
    let mut deletes = 0;
    while let Ok(event) = b.events.try_recv() {
        if matches!(&event, SessionEvent::RemoteEditApplied { member } if member == "deleteBackward")
        {
            deletes += 1;
        }
    }
    assert_eq!(deletes, 3);
}

#[tokio::test]
async fn test_edits_converge_both_ways() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    a.edit(LocalEdit::Type("hello".into()));
    a.wait_for_text("hello").await;

    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    b.bootstrapped().await;

    b.edit(LocalEdit::Type(" world".into()));
    a.wait_for_text("hello world").await;

    a.edit(LocalEdit::Backspace(6));
    a.edit(LocalEdit::MoveCursor(0));
    a.edit(LocalEdit::Type(">".into()));
    let state_b = b.wait_for_text(">hello").await;
    let state_a = a.state().await;
    assert_eq!(state_a.markup, state_b.markup);
    assert_eq!(state_a.cursor, 1);
    assert_eq!(state_b.cursor, 1);
}

#[tokio::test]
async fn test_paste_and_selection_replicate() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    b.bootstrapped().await;

    a.edit(LocalEdit::Paste(Clipboard {
        html: Some("<b>bold</b> text".into()),
        text: Some("bold text".into()),
    }));
    b.wait_for_text("bold text").await;

    a.edit(LocalEdit::Select { start: 5, end: 9 });
    a.edit(LocalEdit::Toggle(FormatKind::Italic, true));
    a.edit(LocalEdit::SelectAll);
    a.edit(LocalEdit::Delete(1));
    b.wait_for_text("").await;
}

#[tokio::test]
async fn test_sessions_with_other_labels_stay_apart() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    a.edit(LocalEdit::Type("private".into()));
    a.wait_for_text("private").await;

    let mut other = launch(&bus, settings("todo", false, shm.path())).await;
    assert_eq!(other.bootstrapped().await, None);
    other.edit(LocalEdit::Type("x".into()));
    other.wait_for_text("x").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.state().await.text, "private");
}

#[tokio::test]
async fn test_isolated_instance_is_alone() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    a.edit(LocalEdit::Type("shared".into()));
    a.wait_for_text("shared").await;

    let mut solo = launch(&bus, settings("notes", true, shm.path())).await;
    assert_eq!(solo.bootstrapped().await, None);
    solo.edit(LocalEdit::Type("mine".into()));
    solo.wait_for_text("mine").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.state().await.text, "shared");
}

#[tokio::test]
async fn test_simultaneous_start_does_not_deadlock() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    let mut b = launch(&bus, settings("notes", false, shm.path())).await;

    a.bootstrapped().await;
    b.bootstrapped().await;

    a.edit(LocalEdit::Type("ok".into()));
    b.wait_for_text("ok").await;
}

#[tokio::test]
async fn test_resync_pushes_full_snapshot() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    b.bootstrapped().await;

    a.edit(LocalEdit::Type("abc".into()));
    b.wait_for_text("abc").await;

    a.edit(LocalEdit::Resync);
    b.wait_for(|e| {
        matches!(e, SessionEvent::RemoteEditApplied { member } if member == "fullSnapshot")
    })
    .await;
    assert_eq!(b.state().await.markup, a.state().await.markup);
}

#[tokio::test]
async fn test_periodic_resync() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut fast = settings("notes", false, shm.path());
    fast.resync_interval = Some(Duration::from_millis(20));
    let mut a = launch(&bus, fast).await;
    let mut b = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;
    b.bootstrapped().await;

    b.wait_for(|e| {
        matches!(e, SessionEvent::RemoteEditApplied { member } if member == "fullSnapshot")
    })
    .await;
}

#[tokio::test]
async fn test_quit_stops_the_loop() {
    let bus = LocalBus::default();
    let shm = tempdir().unwrap();
    let mut a = launch(&bus, settings("notes", false, shm.path())).await;
    a.bootstrapped().await;

    a.handle.quit();
    timeout(WAIT, a.task).await.expect("Session did not stop").unwrap();
    assert!(a.handle.inspect().await.is_err());
}
