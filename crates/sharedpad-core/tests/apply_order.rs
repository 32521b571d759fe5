//! Property: a receiver replaying one sender's events in order ends up with
//! the sender's content and cursor.

use std::sync::Arc;

use futures::executor::block_on;
use proptest::prelude::*;
use sharedpad_core::{
    DocumentView, EditEvent, Emitter, EventBus, InstanceId, LocalBus, RichDocument,
    SessionAddress, SharedDocumentBuffer, SyncEngine, register,
};

fn edit_event() -> impl Strategy<Value = EditEvent> {
    prop_oneof![
        4 => (proptest::char::range('a', 'z'), any::<bool>(), any::<bool>()).prop_map(
            |(character, bold, red)| EditEvent::CharacterInserted {
                character,
                color_hex: if red { "#ff0000" } else { "#000000" }.into(),
                font_descriptor: format!("Sans Serif,12,{},0,0", u8::from(bold)),
            }
        ),
        1 => Just(EditEvent::CharacterInserted {
            character: ' ',
            color_hex: "#000000".into(),
            font_descriptor: "Sans Serif,12,0,0,0".into(),
        }),
        2 => Just(EditEvent::DeleteBackward),
        2 => Just(EditEvent::DeleteForward),
        1 => (0usize..40).prop_map(|pos| EditEvent::CursorMoved { pos }),
        1 => "[a-z <>&]{0,12}".prop_map(|text| EditEvent::FullSnapshot {
            cursor_pos: text.len() / 2,
            html: text,
        }),
    ]
}

proptest! {
    #[test]
    fn replay_reproduces_sender(events in proptest::collection::vec(edit_event(), 0..60)) {
        let shm = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();

        let sender_id = InstanceId::generate();
        let address = SessionAddress::derive("prop", false, &sender_id);
        let (conn, _sender_inbound) = bus.connect();
        let handle = block_on(register(Arc::new(conn), &address)).unwrap();
        let emitter = Emitter::new(handle, sender_id.clone());
        let mut sender = SyncEngine::new(
            sender_id,
            RichDocument::new(),
            SharedDocumentBuffer::new(shm.path()),
            Arc::new(EventBus::new()),
        );

        let receiver_id = InstanceId::generate();
        let (conn, mut inbound) = bus.connect();
        // Keeps the receiver connected while the sender broadcasts
        let _receiver_handle = block_on(register(
            Arc::new(conn),
            &SessionAddress::derive("prop", false, &receiver_id),
        ))
        .unwrap();
        let mut receiver = SyncEngine::new(
            receiver_id,
            RichDocument::new(),
            SharedDocumentBuffer::new(shm.path()),
            Arc::new(EventBus::new()),
        );

        for event in events {
            sender.apply(&event);
            block_on(emitter.broadcast(event)).unwrap();
        }
        while let Ok(Some(event)) = inbound.try_next() {
            receiver.handle_event(event);
        }

        prop_assert_eq!(receiver.document().markup(), sender.document().markup());
        prop_assert_eq!(receiver.document().cursor(), sender.document().cursor());
    }
}
