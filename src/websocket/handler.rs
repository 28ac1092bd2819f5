use super::frame::{
    pack_into, unpack_with_limit, Frame, FrameError, FrameResult, Opcode, MAX_PAYLOAD_SIZE,
};
use super::handshake;
use crate::handler::{Outbox, ProtocolHandler};
use crate::http::{HttpHandler, Request};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Kind of a complete data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// The payload as a string, for text messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }

    fn into_frame(self) -> Frame {
        let opcode = match self.kind {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        };
        Frame::new(opcode, self.payload)
    }
}

/// Application side of a websocket connection.
///
/// Messages pushed onto `replies` are sent to the peer in order.
pub trait MessageHandler: Send {
    /// The handshake completed.
    fn on_open(&mut self, _replies: &mut Vec<Message>) {}

    fn on_message(&mut self, message: Message, replies: &mut Vec<Message>);

    fn on_close(&mut self) {}
}

/// Sends every message straight back.
#[derive(Debug, Default)]
pub struct EchoMessages;

impl MessageHandler for EchoMessages {
    fn on_message(&mut self, message: Message, replies: &mut Vec<Message>) {
        replies.push(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Plain HTTP until an upgrade request arrives
    Http,
    /// Exchanging frames
    Open,
    /// A close frame is queued; the connection ends once it is flushed
    Closing,
}

/// A fragmented message being reassembled.
struct Partial {
    kind: MessageKind,
    payload: BytesMut,
}

/// HTTP handler that can switch a connection to websocket framing.
///
/// Requests that are not upgrades are served by the wrapped [`HttpHandler`].
pub struct WebsocketHandler {
    http: HttpHandler,
    messages: Box<dyn MessageHandler>,
    phase: Phase,
    /// Received bytes not yet decoded into frames
    frames: BytesMut,
    partial: Option<Partial>,
    max_payload: usize,
}

impl WebsocketHandler {
    pub fn new(http: HttpHandler, messages: Box<dyn MessageHandler>) -> Self {
        Self {
            http,
            messages,
            phase: Phase::Http,
            frames: BytesMut::new(),
            partial: None,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Limits the size of single frames and of reassembled messages.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// True once the handshake has completed.
    pub fn is_upgraded(&self) -> bool {
        self.phase != Phase::Http
    }

    fn pump_http(&mut self, out: &mut Outbox<'_>) {
        match self.http.next_request() {
            Ok(Some(request)) if handshake::is_upgrade_request(&request) => {
                self.upgrade(request, out)
            }
            Ok(Some(request)) => self.http.dispatch(request, out),
            Ok(None) => {}
            Err(e) => self.http.reject(&e, out),
        }
    }

    fn upgrade(&mut self, request: Request, out: &mut Outbox<'_>) {
        let response = match handshake::accept(&request) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, path = request.path(), "Websocket handshake refused");
                self.http
                    .respond(e.to_response(request.version), request.keep_alive(), out);
                return;
            }
        };

        debug!(path = request.path(), "Websocket connection upgraded");
        out.append(&response.to_bytes());
        self.phase = Phase::Open;
        self.frames = self.http.take_remaining();

        let mut replies = Vec::new();
        self.messages.on_open(&mut replies);
        self.send_messages(replies, out);
        self.pump_frames(out);
    }

    fn pump_frames(&mut self, out: &mut Outbox<'_>) {
        while self.phase == Phase::Open {
            match unpack_with_limit(&mut self.frames, self.max_payload) {
                Ok(Some(frame)) => {
                    if let Err(e) = self.on_frame(frame, out) {
                        self.fail(e, out);
                    }
                }
                Ok(None) => break,
                Err(e) => self.fail(e, out),
            }
        }
        if self.phase == Phase::Closing {
            self.frames.clear();
        }
    }

    fn on_frame(&mut self, frame: Frame, out: &mut Outbox<'_>) -> FrameResult<()> {
        match frame.opcode {
            Opcode::Ping => send(&Frame::pong(frame.payload), out),
            Opcode::Pong => {}
            Opcode::Close => {
                debug!(code = ?frame.close_code(), "Websocket close received");
                send(&Frame::close(frame.close_code(), ""), out);
                self.phase = Phase::Closing;
            }
            Opcode::Continuation => {
                let mut partial = self.partial.take().ok_or(FrameError::UnexpectedContinuation)?;
                if partial.payload.len() + frame.payload.len() > self.max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        size: (partial.payload.len() + frame.payload.len()) as u64,
                        max: self.max_payload,
                    });
                }
                partial.payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(partial.kind, partial.payload.freeze(), out)?;
                } else {
                    self.partial = Some(partial);
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(FrameError::MessageInterrupted);
                }
                let kind = if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                if frame.fin {
                    self.deliver(kind, frame.payload, out)?;
                } else {
                    self.partial = Some(Partial {
                        kind,
                        payload: BytesMut::from(&frame.payload[..]),
                    });
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, kind: MessageKind, payload: Bytes, out: &mut Outbox<'_>) -> FrameResult<()> {
        if kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(FrameError::InvalidUtf8);
        }
        let mut replies = Vec::new();
        self.messages.on_message(Message { kind, payload }, &mut replies);
        self.send_messages(replies, out);
        Ok(())
    }

    fn send_messages(&mut self, replies: Vec<Message>, out: &mut Outbox<'_>) {
        for message in replies {
            send(&message.into_frame(), out);
        }
    }

    /// Sends a close frame for `err` and stops reading frames.
    fn fail(&mut self, err: FrameError, out: &mut Outbox<'_>) {
        warn!(error = %err, "Websocket protocol error");
        send(&Frame::close(Some(err.close_code()), ""), out);
        self.partial = None;
        self.phase = Phase::Closing;
    }
}

fn send(frame: &Frame, out: &mut Outbox<'_>) {
    let mut buf = BytesMut::new();
    pack_into(frame, &mut buf);
    out.append(&buf);
}

impl ProtocolHandler for WebsocketHandler {
    fn read(&mut self, data: &[u8], out: &mut Outbox<'_>) -> bool {
        match self.phase {
            Phase::Http => {
                self.http.feed(data);
                self.pump_http(out);
            }
            Phase::Open => {
                self.frames.extend_from_slice(data);
                self.pump_frames(out);
            }
            // Nothing more is read once a close frame is queued.
            Phase::Closing => {}
        }
        true
    }

    fn write(&mut self, out: &mut Outbox<'_>) -> bool {
        match self.phase {
            Phase::Http => match self.http.complete_response() {
                Some(false) => false,
                Some(true) => {
                    self.pump_http(out);
                    true
                }
                None => true,
            },
            Phase::Open => true,
            Phase::Closing => false,
        }
    }

    fn close(&mut self) {
        if self.phase != Phase::Http {
            self.messages.on_close();
        }
        self.partial = None;
        self.frames.clear();
    }

    fn buffered(&self) -> usize {
        match self.phase {
            Phase::Http => self.http.buffered(),
            _ => self.frames.len() + self.partial.as_ref().map_or(0, |p| p.payload.len()),
        }
    }
}
