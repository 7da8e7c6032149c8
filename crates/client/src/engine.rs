//! Interface to the protocol engine that owns packet bodies.
//!
//! The connection core never looks inside a payload. It asks an engine to
//! build outbound requests (already encoded, with their sequence id) and to
//! decode each inbound frame into an [`Event`].

use bytes::Bytes;
use phf::phf_map;
use thiserror::Error;

/// Protocol-assigned integer correlating a request with its reply.
pub type SequenceId = i32;

/// Commands the core can name. Anything else decodes as [`Command::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// QR code fetch and poll (`wtlogin.trans_emp`).
    TransEmp,
    /// Password, QR, device-lock, SMS and ticket login (`wtlogin.login`).
    Login,
    /// Token exchange (`wtlogin.exchange_emp`).
    ExchangeEmp,
    /// Client registration (`StatSvc.register`).
    ClientRegister,
    /// Keep-alive (`Heartbeat.Alive`).
    Heartbeat,
    /// Signature update (`OidbSvc.0x4ff_9_IMCore`).
    UpdateSignature,
    /// Server push announcing new messages (`MessageSvc.PushNotify`).
    PushNotify,
    /// Server push carrying a group message (`OnlinePush.PbPushGroupMsg`).
    GroupMessagePush,
    /// Server push carrying configuration (`ConfigPushSvc.PushReq`).
    ConfigPush,
    /// Server telling the client it was logged out (`StatSvc.ReqMSFOffline`).
    ForceOffline,
    /// A command name not in the registry.
    Unknown,
}

static COMMANDS: phf::Map<&'static str, Command> = phf_map! {
    "wtlogin.trans_emp" => Command::TransEmp,
    "wtlogin.login" => Command::Login,
    "wtlogin.exchange_emp" => Command::ExchangeEmp,
    "StatSvc.register" => Command::ClientRegister,
    "Heartbeat.Alive" => Command::Heartbeat,
    "OidbSvc.0x4ff_9_IMCore" => Command::UpdateSignature,
    "MessageSvc.PushNotify" => Command::PushNotify,
    "OnlinePush.PbPushGroupMsg" => Command::GroupMessagePush,
    "ConfigPushSvc.PushReq" => Command::ConfigPush,
    "StatSvc.ReqMSFOffline" => Command::ForceOffline,
};

impl Command {
    /// Look up a command by its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        COMMANDS.get(name).copied().unwrap_or(Self::Unknown)
    }

    /// Wire name of a known command.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        COMMANDS
            .entries()
            .find_map(|(name, command)| (*command == self).then_some(*name))
    }

    /// Every registered command with its wire name.
    pub fn registry() -> impl Iterator<Item = (&'static str, Self)> {
        COMMANDS.entries().map(|(name, command)| (*name, *command))
    }

    /// Whether the server sends this command unprompted.
    #[must_use]
    pub const fn is_server_push(self) -> bool {
        matches!(
            self,
            Self::PushNotify | Self::GroupMessagePush | Self::ConfigPush | Self::ForceOffline
        )
    }
}

/// Packet-level fields the engine extracts alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    /// Packet type as reported by the engine.
    pub packet_type: u32,
    /// Encryption scheme the body was wrapped in.
    pub encrypt_type: u32,
    /// Account the packet belongs to.
    pub uin: i64,
    /// Server-supplied status message, often empty.
    pub message: String,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Sequence id used for correlation.
    pub sequence_id: SequenceId,
    /// Registry lookup of `command_name`.
    pub command: Command,
    /// Command name exactly as it arrived.
    pub command_name: String,
    /// Packet-level fields.
    pub metadata: EventMetadata,
    /// Decrypted body, still in the command's own format.
    pub body: Bytes,
}

impl Event {
    /// Create an event, resolving the command through the registry.
    pub fn new(sequence_id: SequenceId, command_name: impl Into<String>, body: Bytes) -> Self {
        let command_name = command_name.into();
        Self {
            sequence_id,
            command: Command::from_name(&command_name),
            command_name,
            metadata: EventMetadata::default(),
            body,
        }
    }

    /// Attach packet-level fields.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An encoded request ready for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Sequence id the reply will carry.
    pub sequence_id: SequenceId,
    /// Command name, for logging.
    pub command_name: String,
    /// Encoded packet, without the length prefix.
    pub payload: Bytes,
}

impl OutboundRequest {
    /// Create a new outbound request.
    pub fn new(sequence_id: SequenceId, command_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            sequence_id,
            command_name: command_name.into(),
            payload,
        }
    }
}

/// Errors reported by an engine while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The packet structure is invalid.
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// The body could not be decrypted.
    #[error("Decryption failed: {0}")]
    Crypto(String),
}

/// Decodes inbound frames.
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Decode one frame payload (length prefix already stripped).
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the frame cannot be decoded. The
    /// connection keeps processing later frames.
    fn decode(&self, frame: &[u8]) -> Result<Event, DecodeError>;
}

/// Builds outbound requests, one method per command kind.
///
/// Every builder allocates the sequence id the reply will carry.
pub trait RequestBuilder: ProtocolEngine {
    /// Request a login QR code.
    fn build_qrcode_fetch(&self) -> OutboundRequest;

    /// Poll the state of a QR code previously fetched.
    fn build_qrcode_query(&self, sig: &[u8]) -> OutboundRequest;

    /// Password login.
    fn build_password_login(&self) -> OutboundRequest;

    /// Login with the tickets returned once a QR code is confirmed.
    fn build_qrcode_login(&self, t106: &[u8], t16a: &[u8], t318: &[u8]) -> OutboundRequest;

    /// Login after a device-lock challenge.
    fn build_device_lock_login(&self) -> OutboundRequest;

    /// Ask the server to send an SMS code.
    fn build_sms_request(&self) -> OutboundRequest;

    /// Submit a received SMS code.
    fn build_sms_code_submit(&self, code: &str) -> OutboundRequest;

    /// Submit a captcha ticket.
    fn build_ticket_submit(&self, ticket: &str) -> OutboundRequest;

    /// Register the client as online.
    fn build_client_register(&self) -> OutboundRequest;

    /// Keep-alive.
    fn build_heartbeat(&self) -> OutboundRequest;

    /// Update the account signature.
    fn build_update_signature(&self, signature: &str) -> OutboundRequest;

    /// Any command with a pre-encoded body.
    fn build_uni_packet(&self, command_name: &str, body: &[u8]) -> OutboundRequest;
}
