//! Typed command surface over a [`Connection`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::engine::{Event, OutboundRequest, RequestBuilder};
use crate::error::Result;
use crate::handler::{EventHandler, NoopHandler};

/// Builder for creating clients.
pub struct ClientBuilder {
    config: ClientConfig,
    handler: Arc<dyn EventHandler>,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration and a handler
    /// that ignores notifications.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            handler: Arc::new(NoopHandler),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame payload size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the size of the region offered to each socket read.
    #[must_use]
    pub fn read_size_hint(mut self, size: usize) -> Self {
        self.config.read_size_hint = size;
        self
    }

    /// Set the extra bytes allocated when the read buffer grows.
    #[must_use]
    pub fn arena_slack(mut self, slack: usize) -> Self {
        self.config.arena_slack = slack;
        self
    }

    /// Set how many frames may queue for the writer.
    #[must_use]
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity;
        self
    }

    /// Receive unsolicited events and errors through `handler`.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Build a client driving `stream`.
    pub fn spawn<E, S>(self, stream: S, engine: Arc<E>) -> Client<E>
    where
        E: RequestBuilder,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::spawn(stream, Arc::clone(&engine), self.config, self.handler);
        Client::new(connection, engine)
    }

    /// Build a client over a new TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established in time.
    pub async fn connect<E, A>(self, addr: A, engine: Arc<E>) -> Result<Client<E>>
    where
        E: RequestBuilder,
        A: ToSocketAddrs,
    {
        let connection =
            Connection::connect(addr, Arc::clone(&engine), self.config, self.handler).await?;
        Ok(Client::new(connection, engine))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client issuing one request per command kind.
///
/// The engine builds each request (and picks its sequence id); the
/// connection correlates the reply.
pub struct Client<E> {
    connection: Connection,
    engine: Arc<E>,
}

impl<E> Client<E>
where
    E: RequestBuilder,
{
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Wrap an existing connection.
    #[must_use]
    pub const fn new(connection: Connection, engine: Arc<E>) -> Self {
        Self { connection, engine }
    }

    /// Request a login QR code.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn fetch_qrcode(&self) -> Result<Event> {
        self.send(self.engine.build_qrcode_fetch()).await
    }

    /// Poll whether the QR code identified by `sig` has been scanned.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn query_qrcode_result(&self, sig: &[u8]) -> Result<Event> {
        self.send(self.engine.build_qrcode_query(sig)).await
    }

    /// Log in with the configured password.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn password_login(&self) -> Result<Event> {
        self.send(self.engine.build_password_login()).await
    }

    /// Log in with the tickets from a confirmed QR code.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn qrcode_login(&self, t106: &[u8], t16a: &[u8], t318: &[u8]) -> Result<Event> {
        self.send(self.engine.build_qrcode_login(t106, t16a, t318))
            .await
    }

    /// Continue a login that hit a device lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn device_lock_login(&self) -> Result<Event> {
        self.send(self.engine.build_device_lock_login()).await
    }

    /// Ask for an SMS verification code.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn sms_request(&self) -> Result<Event> {
        self.send(self.engine.build_sms_request()).await
    }

    /// Submit an SMS verification code.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn sms_code_submit(&self, code: &str) -> Result<Event> {
        self.send(self.engine.build_sms_code_submit(code)).await
    }

    /// Submit a captcha ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn ticket_submit(&self, ticket: &str) -> Result<Event> {
        self.send(self.engine.build_ticket_submit(ticket)).await
    }

    /// Register the client as online.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn client_register(&self) -> Result<Event> {
        self.send(self.engine.build_client_register()).await
    }

    /// Send a keep-alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn heartbeat(&self) -> Result<Event> {
        self.send(self.engine.build_heartbeat()).await
    }

    /// Update the account signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn update_signature(&self, signature: &str) -> Result<Event> {
        self.send(self.engine.build_update_signature(signature))
            .await
    }

    /// Send any command with a pre-encoded body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn uni_packet(&self, command_name: &str, body: &[u8]) -> Result<Event> {
        self.send(self.engine.build_uni_packet(command_name, body))
            .await
    }

    /// Write an already-encoded packet without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open or the write fails.
    pub async fn send_raw(&self, payload: Bytes) -> Result<()> {
        self.connection.fire_and_forget(payload).await
    }

    /// Close the connection.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Wait until the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the connection failed.
    pub async fn wait_closed(&self) -> Result<()> {
        self.connection.wait_closed().await
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The protocol engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    async fn send(&self, request: OutboundRequest) -> Result<Event> {
        debug!(
            sequence_id = request.sequence_id,
            command = %request.command_name,
            "sending command"
        );
        self.connection.request(request).await
    }
}

impl<E> std::fmt::Debug for Client<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
