//! Sync engine: applies inbound traffic to the local document.
//!
//! Signals carry `EditEnvelope`s. Each is decoded against the member it
//! arrived on, dropped if we sent it ourselves, and otherwise applied.
//! Method calls are the bootstrap responder operations plus one handler per
//! event member, for peers that deliver an event directly.
//!
//! The engine is not `Sync` and is driven from a single loop, so handlers
//! never overlap with each other or with local edits.

use crate::bus::{BusError, BusEvent, MethodCall, Signal};
use crate::document::DocumentView;
use crate::emitter::Operation;
use crate::envelope::{CodecError, EditEnvelope, EditEvent, encode_value};
use crate::events::{EventBus, SessionEvent};
use crate::format::{FontDescriptor, FormatAttr, ToolbarSnapshot, normalize_color};
use crate::identity::InstanceId;
use crate::shared_buffer::SharedDocumentBuffer;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Rejected {member}: {source}")]
    Rejected {
        member: String,
        #[source]
        source: CodecError,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied(&'static str),
    SelfEcho(&'static str),
}

pub struct SyncEngine<D: DocumentView> {
    identity: InstanceId,
    document: D,
    buffer: SharedDocumentBuffer,
    events: Arc<EventBus>,
}

impl<D: DocumentView> SyncEngine<D> {
    pub fn new(
        identity: InstanceId,
        document: D,
        buffer: SharedDocumentBuffer,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            identity,
            document,
            buffer,
            events,
        }
    }

    pub fn identity(&self) -> &InstanceId {
        &self.identity
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    /// Responder side of the shared segment.
    pub fn buffer(&self) -> &SharedDocumentBuffer {
        &self.buffer
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Handle one piece of inbound bus traffic, replying to calls.
    pub fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Signal(signal) => {
                // Rejections are already logged and published
                let _ = self.handle_signal(&signal);
            }
            BusEvent::MethodCall { call, reply } => {
                let result = self.handle_call(&call);
                if !reply.send(result) {
                    debug!("Caller {} went away before {} returned", call.sender, call.member);
                }
            }
        }
    }

    /// Decode and apply one broadcast.
    pub fn handle_signal(&mut self, signal: &Signal) -> Result<Dispatch> {
        let envelope = self.decode(&signal.member, &signal.body)?;
        Ok(self.dispatch(envelope))
    }

    /// Answer one direct call.
    pub fn handle_call(&mut self, call: &MethodCall) -> std::result::Result<Vec<u8>, BusError> {
        if let Some(operation) = Operation::from_member(&call.member) {
            return self.respond(operation);
        }

        if EditEvent::is_event_member(&call.member) {
            let envelope = self
                .decode(&call.member, &call.body)
                .map_err(|e| BusError::InvalidArgs { reason: e.to_string() })?;
            let applied = matches!(self.dispatch(envelope), Dispatch::Applied(_));
            return reply("applied flag", &applied);
        }

        Err(BusError::UnknownMethod {
            interface: call.interface.clone(),
            member: call.member.clone(),
        })
    }

    fn decode(&self, member: &str, body: &[u8]) -> Result<EditEnvelope> {
        EditEnvelope::decode_for(member, body).map_err(|source| {
            warn!("Rejected inbound {}: {}", member, source);
            self.events.emit(SessionEvent::EventRejected {
                member: member.to_string(),
                reason: source.to_string(),
            });
            EngineError::Rejected {
                member: member.to_string(),
                source,
            }
        })
    }

    fn dispatch(&mut self, envelope: EditEnvelope) -> Dispatch {
        let member = envelope.member();
        if envelope.sender == self.identity {
            self.events.emit(SessionEvent::SelfEchoDropped {
                member: member.to_string(),
            });
            return Dispatch::SelfEcho(member);
        }

        debug!("Applying {} from {}", member, envelope.sender);
        self.apply(&envelope.event);
        self.events.emit(SessionEvent::RemoteEditApplied {
            member: member.to_string(),
        });
        Dispatch::Applied(member)
    }

    /// Apply one event to the document. Used for remote and local edits alike.
    pub fn apply(&mut self, event: &EditEvent) {
        let doc = &mut self.document;
        match event {
            EditEvent::CharacterInserted {
                character,
                color_hex,
                font_descriptor,
            } => {
                let mut format = doc.format_at_cursor();
                match font_descriptor.parse::<FontDescriptor>() {
                    Ok(font) => format.font = font,
                    Err(e) => warn!("Keeping typing font, bad descriptor {:?}: {}", font_descriptor, e),
                }
                if !color_hex.trim().is_empty() {
                    format.color = normalize_color(color_hex);
                }
                doc.insert_styled(*character, format);
            }
            EditEvent::FullSnapshot { html, cursor_pos } => {
                doc.set_markup(html);
                doc.set_cursor(*cursor_pos);
            }
            EditEvent::CursorMoved { pos } => doc.set_cursor(*pos),
            EditEvent::SelectionChanged { start, end } => doc.select(*start, *end),
            EditEvent::DeleteBackward => doc.delete_backward(),
            EditEvent::DeleteForward => doc.delete_forward(),
            EditEvent::SelectAll => doc.select_all(),
            EditEvent::RawInsert { is_html, payload } => {
                if *is_html {
                    doc.insert_markup(payload);
                } else {
                    doc.insert_text(payload);
                }
            }
            EditEvent::FormatToggled { kind, enabled } => {
                doc.merge_format_on_word_or_selection(&FormatAttr::Toggle(*kind, *enabled));
            }
            EditEvent::TextFamilyChanged { name } => {
                doc.merge_format_on_word_or_selection(&FormatAttr::Family(name.clone()));
            }
            EditEvent::TextSizeChanged { points } => {
                if points.is_finite() && *points > 0.0 {
                    doc.merge_format_on_word_or_selection(&FormatAttr::Size(*points));
                } else {
                    warn!("Ignoring invalid text size {}", points);
                }
            }
            EditEvent::TextColorChanged { color_hex } => {
                doc.merge_format_on_word_or_selection(&FormatAttr::Color(color_hex.clone()));
            }
        }
    }

    fn respond(&mut self, operation: Operation) -> std::result::Result<Vec<u8>, BusError> {
        match operation {
            Operation::SerializeToSharedBuffer => {
                let markup = self.document.markup();
                let ok = match self.buffer.create_with(&markup) {
                    Ok(()) => {
                        debug!("Serialized {} bytes of markup into shared segment", markup.len());
                        true
                    }
                    Err(e) => {
                        warn!("Could not serialize to shared segment: {}", e);
                        false
                    }
                };
                reply(operation.member(), &ok)
            }
            Operation::ReleaseSharedBuffer => {
                let was_attached = self.buffer.detach();
                debug!("Released shared segment (attached: {})", was_attached);
                reply(operation.member(), &was_attached)
            }
            Operation::GetFormatSnapshot => {
                let snapshot = ToolbarSnapshot::from_format(
                    &self.document.format_at_cursor(),
                    self.document.cursor(),
                );
                reply(operation.member(), &snapshot)
            }
        }
    }
}

fn reply<T: Serialize>(what: &'static str, value: &T) -> std::result::Result<Vec<u8>, BusError> {
    encode_value(what, value).map_err(|e| BusError::InvalidArgs { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RichDocument;
    use crate::envelope::decode_value;
    use crate::format::FormatKind;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    fn engine() -> (SyncEngine<RichDocument>, TempDir) {
        let dir = tempdir().unwrap();
        let engine = SyncEngine::new(
            InstanceId::generate(),
            RichDocument::new(),
            SharedDocumentBuffer::new(dir.path()),
            Arc::new(EventBus::new()),
        );
        (engine, dir)
    }

    fn signal(sender: &InstanceId, event: EditEvent) -> Signal {
        let envelope = EditEnvelope::new(sender.clone(), event);
        Signal::new("/p", "i", envelope.member(), envelope.encode().unwrap())
    }

    fn call(member: &str, body: Vec<u8>) -> MethodCall {
        MethodCall::new("dest", "/p", "i", member, body)
    }

    fn typed(c: char) -> EditEvent {
        EditEvent::CharacterInserted {
            character: c,
            color_hex: "#000000".into(),
            font_descriptor: "Sans Serif,12,0,0,0".into(),
        }
    }

    #[test]
    fn test_self_echo_dropped() {
        let (mut engine, _dir) = engine();
        let own = engine.identity().clone();
        let before = engine.document().clone();

        let result = engine.handle_signal(&signal(&own, typed('x'))).unwrap();
        assert_eq!(result, Dispatch::SelfEcho("characterInserted"));
        assert_eq!(engine.document(), &before);
    }

    #[test]
    fn test_peer_event_applied() {
        let (mut engine, _dir) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = engine
            .events()
            .subscribe(move |e| seen_clone.lock().unwrap().push(e));

        let peer = InstanceId::generate();
        engine.handle_signal(&signal(&peer, typed('h'))).unwrap();
        engine.handle_signal(&signal(&peer, typed('i'))).unwrap();

        assert_eq!(engine.document().plain_text(), "hi");
        assert_eq!(engine.document().cursor(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_character_carries_format() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::CharacterInserted {
            character: 'B',
            color_hex: "#FF0000".into(),
            font_descriptor: "Mono,20,1,0,1".into(),
        });
        let format = &engine.document().chars()[0].format;
        assert_eq!(format.color, "#ff0000");
        assert_eq!(format.font.family, "Mono");
        assert!(format.font.bold);
        assert!(format.font.underline);
    }

    #[test]
    fn test_bad_font_descriptor_keeps_typing_font() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::CharacterInserted {
            character: 'x',
            color_hex: "#00ff00".into(),
            font_descriptor: "garbage".into(),
        });
        let format = &engine.document().chars()[0].format;
        assert_eq!(format.font, FontDescriptor::default());
        assert_eq!(format.color, "#00ff00");
    }

    #[test]
    fn test_invalid_size_ignored() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::FullSnapshot {
            html: "word".into(),
            cursor_pos: 2,
        });
        let before = engine.document().clone();
        engine.apply(&EditEvent::TextSizeChanged { points: 0.0 });
        engine.apply(&EditEvent::TextSizeChanged { points: f32::NAN });
        assert_eq!(engine.document(), &before);
    }

    #[test]
    fn test_undecodable_signal_rejected() {
        let (mut engine, _dir) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = engine
            .events()
            .subscribe(move |e| seen_clone.lock().unwrap().push(e));

        let bad = Signal::new("/p", "i", "characterInserted", vec![1, 2, 3]);
        assert!(engine.handle_signal(&bad).is_err());

        let mismatched = signal(&InstanceId::generate(), EditEvent::SelectAll);
        let mismatched = Signal {
            member: "deleteBackward".into(),
            ..mismatched
        };
        assert!(engine.handle_signal(&mismatched).is_err());

        assert!(engine.document().is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], SessionEvent::EventRejected { member, .. } if member == "characterInserted"));
    }

    #[test]
    fn test_release_twice() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::RawInsert {
            is_html: true,
            payload: "<b>hi</b>".into(),
        });

        let created = engine.handle_call(&call("serializeToSharedBuffer", vec![])).unwrap();
        assert!(decode_value::<bool>("t", &created).unwrap());

        let first = engine.handle_call(&call("releaseSharedBuffer", vec![])).unwrap();
        let second = engine.handle_call(&call("releaseSharedBuffer", vec![])).unwrap();
        assert!(decode_value::<bool>("t", &first).unwrap());
        assert!(!decode_value::<bool>("t", &second).unwrap());
    }

    #[test]
    fn test_format_snapshot_reply() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::FullSnapshot {
            html: "<i>ab</i>".into(),
            cursor_pos: 1,
        });
        let bytes = engine.handle_call(&call("getFormatSnapshot", vec![])).unwrap();
        let snapshot: ToolbarSnapshot = decode_value("t", &bytes).unwrap();
        assert!(snapshot.italic);
        assert_eq!(snapshot.cursor_pos, 1);
    }

    #[test]
    fn test_direct_event_call() {
        let (mut engine, _dir) = engine();
        let envelope = EditEnvelope::new(InstanceId::generate(), typed('z'));
        let bytes = engine
            .handle_call(&call("characterInserted", envelope.encode().unwrap()))
            .unwrap();
        assert!(decode_value::<bool>("t", &bytes).unwrap());
        assert_eq!(engine.document().plain_text(), "z");

        let own = EditEnvelope::new(engine.identity().clone(), typed('z'));
        let bytes = engine
            .handle_call(&call("characterInserted", own.encode().unwrap()))
            .unwrap();
        assert!(!decode_value::<bool>("t", &bytes).unwrap());

        assert!(matches!(
            engine.handle_call(&call("characterInserted", vec![9])),
            Err(BusError::InvalidArgs { .. })
        ));
        assert!(matches!(
            engine.handle_call(&call("explode", vec![])),
            Err(BusError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_format_toggle_on_word() {
        let (mut engine, _dir) = engine();
        engine.apply(&EditEvent::FullSnapshot {
            html: "one two".into(),
            cursor_pos: 5,
        });
        engine.apply(&EditEvent::FormatToggled {
            kind: FormatKind::Bold,
            enabled: true,
        });
        let bold: String = engine
            .document()
            .chars()
            .iter()
            .filter(|c| c.format.font.bold)
            .map(|c| c.ch)
            .collect();
        assert_eq!(bold, "two");
    }
}
