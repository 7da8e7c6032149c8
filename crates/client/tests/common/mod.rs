//! Shared fixtures: a scripted engine, a recording handler and a fake peer.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use seqwire_client::{
    DecodeError, Event, EventHandler, FrameCodec, FramingError, Notification, OutboundRequest,
    ProtocolEngine, RequestBuilder,
};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

/// Encode a packet as `seq (i32 BE) | name length (u8) | name | body`.
pub fn encode_payload(sequence_id: i32, command_name: &str, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + command_name.len() + body.len());
    buf.put_i32(sequence_id);
    buf.put_u8(u8::try_from(command_name.len()).unwrap());
    buf.put_slice(command_name.as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// Inverse of [`encode_payload`].
pub fn decode_payload(frame: &[u8]) -> Result<(i32, String, Bytes), DecodeError> {
    let (id, rest) = frame
        .split_first_chunk::<4>()
        .ok_or_else(|| DecodeError::Malformed("missing sequence id".into()))?;
    let (&name_len, rest) = rest
        .split_first()
        .ok_or_else(|| DecodeError::Malformed("missing command name".into()))?;
    let name_len = usize::from(name_len);
    if rest.len() < name_len {
        return Err(DecodeError::Malformed("truncated command name".into()));
    }
    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok((
        i32::from_be_bytes(*id),
        name.to_string(),
        Bytes::copy_from_slice(&rest[name_len..]),
    ))
}

/// Engine speaking the packet shape above, numbering requests from 1.
#[derive(Debug)]
pub struct ScriptedEngine {
    next_sequence: AtomicI32,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_sequence: AtomicI32::new(1),
        })
    }

    fn build(&self, command_name: &str, body: &[u8]) -> OutboundRequest {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        OutboundRequest::new(
            sequence_id,
            command_name,
            encode_payload(sequence_id, command_name, body),
        )
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn decode(&self, frame: &[u8]) -> Result<Event, DecodeError> {
        let (sequence_id, name, body) = decode_payload(frame)?;
        Ok(Event::new(sequence_id, name, body))
    }
}

impl RequestBuilder for ScriptedEngine {
    fn build_qrcode_fetch(&self) -> OutboundRequest {
        self.build("wtlogin.trans_emp", b"fetch")
    }

    fn build_qrcode_query(&self, sig: &[u8]) -> OutboundRequest {
        self.build("wtlogin.trans_emp", sig)
    }

    fn build_password_login(&self) -> OutboundRequest {
        self.build("wtlogin.login", b"password")
    }

    fn build_qrcode_login(&self, t106: &[u8], t16a: &[u8], t318: &[u8]) -> OutboundRequest {
        self.build("wtlogin.login", &[t106, t16a, t318].concat())
    }

    fn build_device_lock_login(&self) -> OutboundRequest {
        self.build("wtlogin.login", b"device-lock")
    }

    fn build_sms_request(&self) -> OutboundRequest {
        self.build("wtlogin.login", b"sms")
    }

    fn build_sms_code_submit(&self, code: &str) -> OutboundRequest {
        self.build("wtlogin.login", code.as_bytes())
    }

    fn build_ticket_submit(&self, ticket: &str) -> OutboundRequest {
        self.build("wtlogin.login", ticket.as_bytes())
    }

    fn build_client_register(&self) -> OutboundRequest {
        self.build("StatSvc.register", b"")
    }

    fn build_heartbeat(&self) -> OutboundRequest {
        self.build("Heartbeat.Alive", b"")
    }

    fn build_update_signature(&self, signature: &str) -> OutboundRequest {
        self.build("OidbSvc.0x4ff_9_IMCore", signature.as_bytes())
    }

    fn build_uni_packet(&self, command_name: &str, body: &[u8]) -> OutboundRequest {
        self.build(command_name, body)
    }
}

/// Handler forwarding every notification to a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Notification>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn on_unsolicited(&self, event: Event) {
        let _ = self.tx.send(Notification::Unsolicited(event));
    }

    async fn on_decode_error(&self, error: DecodeError) {
        let _ = self.tx.send(Notification::DecodeFailed(error));
    }

    async fn on_protocol_error(&self, error: FramingError) {
        let _ = self.tx.send(Notification::ProtocolError(error));
    }
}

/// The server side of an in-memory connection.
pub struct Peer {
    frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    /// Create a connected `(client stream, peer)` pair.
    pub fn pair() -> (DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        (
            client,
            Self {
                frames: FramedRead::new(reader, FrameCodec::new()),
                writer,
            },
        )
    }

    /// Next request written by the client, decoded.
    pub async fn next_request(&mut self) -> (i32, String, Bytes) {
        let frame = self.frames.next().await.unwrap().unwrap();
        decode_payload(&frame).unwrap()
    }

    /// Next raw frame payload written by the client.
    pub async fn next_frame(&mut self) -> Bytes {
        self.frames.next().await.unwrap().unwrap()
    }

    /// Send a framed packet.
    pub async fn reply(&mut self, sequence_id: i32, command_name: &str, body: &[u8]) {
        let frame = FrameCodec::new()
            .encode(&encode_payload(sequence_id, command_name, body))
            .unwrap();
        self.send_bytes(&frame).await;
    }

    /// Send bytes exactly as given.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}
