/// The top-level lifecycle state machine: reads bytes off a duplex stream,
/// feeds the message buffer, routes each complete message through the
/// `on_message` hook and then the state machine in §4.4, and writes the
/// resulting frames back. One `Connection` serves exactly one client
/// session.
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::auth::{AuthFlow, AuthStep};
use crate::config::{AuthConfig, ConnectionConfig, OnMessageOutcome, ServerVersion};
use crate::error::{Error, HookError, Result};
use crate::error_response::{BackendError, Severity};
use crate::framing::{MessageBuffer, RawMessage};
use crate::messages;
use crate::query;
use crate::state::{ClientParams, ConnectionState, DetachHandle, Step};
use crate::tls::{BoxDuplex, TlsAcceptor};

const READ_CHUNK: usize = 8192;

/// Drives a single client through TLS upgrade, startup, authentication, and
/// the steady-state query loop. Generic transport is erased behind
/// [`BoxDuplex`] so the stream can be swapped out in place after a TLS
/// upgrade without the engine becoming generic over every possible
/// upgraded stream type.
pub struct Connection {
    stream: Option<BoxDuplex>,
    config: ConnectionConfig,
    tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    request_client_cert: bool,
    state: ConnectionState,
    auth_flow: Option<AuthFlow>,
    message_buffer: MessageBuffer,
    detach_handle: DetachHandle,
}

impl Connection {
    pub fn new(
        stream: BoxDuplex,
        config: ConnectionConfig,
        tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    ) -> Self {
        let request_client_cert = matches!(config.auth, AuthConfig::Cert { .. });

        Connection {
            stream: Some(stream),
            config,
            tls_acceptor,
            request_client_cert,
            state: ConnectionState::new(),
            auth_flow: None,
            message_buffer: MessageBuffer::new(),
            detach_handle: DetachHandle::new(),
        }
    }

    /// A read-only snapshot of the state handed to hooks.
    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    /// `true` once a hook has called [`DetachHandle::request`] on the handle
    /// it was given. `run` stops processing as soon as this is observed;
    /// the caller should then call [`Connection::detach`] to take the
    /// stream back.
    pub fn detach_requested(&self) -> bool {
        self.detach_handle.is_requested()
    }

    /// Surrenders the live (possibly TLS-upgraded) stream and halts all
    /// further processing. Any bytes already pulled off the stream but not
    /// yet forming a complete message are returned alongside it rather than
    /// silently dropped, though the engine itself never replays them. See
    /// the detach design note.
    pub fn detach(mut self) -> (BoxDuplex, Bytes) {
        self.detach_handle.request();
        let stream = self.stream.take().expect("stream present before detach");
        let residual = Bytes::copy_from_slice(self.message_buffer.residual());
        (stream, residual)
    }

    /// Drives the connection to completion: until the client disconnects,
    /// `Terminate` is received, a fatal protocol error closes the session,
    /// or a hook requests detach via its [`DetachHandle`]. In the last
    /// case `run` returns normally without closing the stream, leaving it
    /// for the caller to retrieve with [`Connection::detach`].
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if self.detach_requested() {
                return Ok(());
            }

            let n = match self.read_chunk(&mut buf).await {
                Ok(n) => n,
                Err(Error::Io(e)) if is_expected_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Ok(());
            }

            self.message_buffer.push(&buf[..n]);

            loop {
                if self.detach_requested() {
                    return Ok(());
                }

                let raw = match self.message_buffer.poll(self.state.has_started) {
                    Some(raw) => raw,
                    None => break,
                };

                match self.dispatch(raw).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(Error::Io(e)) if is_expected_disconnect(&e) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().expect("stream present while attached");
        Ok(stream.read(buf).await?)
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        let stream = self.stream.as_mut().expect("stream present while attached");
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Runs the `on_message` hook (invoked for every message, including the
    /// initial frame) and, unless it short-circuits, the built-in state
    /// machine. Returns `Ok(true)` once the session should end.
    async fn dispatch(&mut self, raw: RawMessage) -> Result<bool> {
        let is_startup_frame = raw.code.is_none() && !messages::is_ssl_request(&raw.payload);

        if let Some(hook) = self.config.hooks.on_message.clone() {
            match hook(raw.payload.clone(), self.state(), self.detach_handle.clone()).await {
                Ok(Some(OnMessageOutcome::Bytes(bytes))) => {
                    if is_startup_frame {
                        self.state.has_started = true;
                    }
                    self.write(bytes).await?;
                    return Ok(false);
                }
                Ok(Some(OnMessageOutcome::Stream(mut stream))) => {
                    if is_startup_frame {
                        self.state.has_started = true;
                    }
                    while let Some(bytes) = stream.next().await {
                        self.write(bytes).await?;
                    }
                    return Ok(false);
                }
                Ok(None) => {}
                Err(e) => return self.handle_hook_error(e).await,
            }
        }

        self.handle_builtin(raw).await
    }

    async fn handle_builtin(&mut self, raw: RawMessage) -> Result<bool> {
        match self.state.step {
            Step::AwaitingInitialMessage => match raw.code {
                None => self.handle_initial_frame(raw.payload).await,
                Some(_) => {
                    self.fatal_close(BackendError::fatal("08000", "Unexpected initial message"))
                        .await
                }
            },
            Step::PerformingAuthentication => match raw.code {
                Some(b'p') => self.handle_auth_message(&raw.payload).await,
                _ => {
                    self.fatal_close(BackendError::fatal(
                        "08000",
                        "Unexpected message during authentication",
                    ))
                    .await
                }
            },
            Step::ReadyForQuery => match raw.code {
                Some(b'X') => {
                    self.close().await?;
                    Ok(true)
                }
                Some(b'Q') => self.handle_query(&raw.payload).await,
                _ => {
                    let err = BackendError::new(
                        Severity::Error,
                        "123",
                        "Message code not yet implemented",
                    );
                    self.write(err.encode()).await?;
                    self.write(messages::encode_ready_for_query(b'I')).await?;
                    Ok(false)
                }
            },
        }
    }

    /// §4.4.1: the session's first codeless frame is either SSLRequest or
    /// StartupMessage.
    async fn handle_initial_frame(&mut self, payload: Bytes) -> Result<bool> {
        if messages::is_ssl_request(&payload) {
            self.handle_ssl_request().await
        } else {
            self.handle_startup(payload).await
        }
    }

    async fn handle_ssl_request(&mut self) -> Result<bool> {
        let acceptor = match self.tls_acceptor.clone() {
            None => {
                self.write(messages::encode_ssl_response(false)).await?;
                return Ok(false);
            }
            Some(acceptor) => acceptor,
        };

        self.write(messages::encode_ssl_response(true)).await?;

        let stream = self.stream.take().expect("stream present before upgrade");
        let (new_stream, tls_info) = acceptor
            .accept(stream, self.request_client_cert)
            .await?;

        self.stream = Some(new_stream);
        self.state.tls_info = Some(tls_info);
        self.message_buffer.clear();
        self.state.has_started = false;
        self.state.step = Step::AwaitingInitialMessage;

        if let Some(hook) = self.config.hooks.on_tls_upgrade.clone() {
            if let Err(e) = hook(self.state(), self.detach_handle.clone()).await {
                return self.handle_hook_error(e).await;
            }
        }

        Ok(self.detach_requested())
    }

    /// §4.4.2: parses StartupMessage, validates the protocol version,
    /// stores `client_params`, runs `on_startup`, then selects the
    /// configured authentication method.
    async fn handle_startup(&mut self, payload: Bytes) -> Result<bool> {
        if self.tls_acceptor.is_some() && self.state.tls_info.is_none() {
            return self
                .fatal_close(BackendError::fatal("08P01", "SSL connection is required"))
                .await;
        }

        let startup = match messages::parse_startup(&payload) {
            Ok(s) => s,
            Err(e) => return self.fatal_close(BackendError::fatal("08000", e.to_string())).await,
        };

        if startup.major != messages::PROTOCOL_MAJOR || startup.minor != messages::PROTOCOL_MINOR {
            return self
                .fatal_close(BackendError::fatal("08000", "unsupported protocol version"))
                .await;
        }

        let user = startup
            .user()
            .expect("parse_startup requires `user`")
            .to_string();
        let mut other = startup.params.clone();
        other.remove("user");

        self.state.client_params = Some(ClientParams {
            user: user.clone(),
            other,
        });
        self.state.has_started = true;

        if let Some(hook) = self.config.hooks.on_startup.clone() {
            if let Err(e) = hook(self.state(), self.detach_handle.clone()).await {
                return self.handle_hook_error(e).await;
            }
        }
        if self.detach_requested() {
            return Ok(true);
        }

        match &self.config.auth {
            AuthConfig::Trust => self.complete_authentication().await,
            AuthConfig::Cert { .. } => self.evaluate_cert_auth(&user).await,
            _ => {
                let flow = AuthFlow::new(&self.config.auth, &user)
                    .expect("non-trust auth config always builds a flow");
                if let Some(msg) = flow.create_initial_auth_message() {
                    self.write(msg).await?;
                }
                self.auth_flow = Some(flow);
                self.state.step = Step::PerformingAuthentication;
                Ok(false)
            }
        }
    }

    /// §4.5.5: certificate auth is evaluated immediately after Startup.
    /// There is no further client frame to wait for.
    async fn evaluate_cert_auth(&mut self, user: &str) -> Result<bool> {
        let mut flow = AuthFlow::new(&self.config.auth, user).expect("Cert auth always builds a flow");

        let step = match &mut flow {
            AuthFlow::Cert(cert_flow) => cert_flow.evaluate(self.state.tls_info.as_ref()).await,
            _ => unreachable!("AuthConfig::Cert always builds AuthFlow::Cert"),
        };

        match step {
            AuthStep::Success(_) => self.complete_authentication().await,
            AuthStep::Failed(err) => {
                self.write(err.encode()).await?;
                self.close().await?;
                Ok(true)
            }
            AuthStep::Continue(_) => unreachable!("certificate auth never continues"),
        }
    }

    async fn handle_auth_message(&mut self, payload: &[u8]) -> Result<bool> {
        let mut flow = self
            .auth_flow
            .take()
            .expect("auth flow present while PerformingAuthentication");

        let step = flow.handle_client_message(payload).await?;

        match step {
            AuthStep::Continue(frames) => {
                for frame in frames {
                    self.write(frame).await?;
                }
                self.auth_flow = Some(flow);
                Ok(false)
            }
            AuthStep::Failed(err) => {
                self.write(err.encode()).await?;
                self.close().await?;
                Ok(true)
            }
            AuthStep::Success(frames) => {
                for frame in frames {
                    self.write(frame).await?;
                }
                self.complete_authentication().await
            }
        }
    }

    /// §4.4.3: AuthenticationOk, `on_authenticated`, optional
    /// ParameterStatus, then ReadyForQuery. Returns `true` if a hook error
    /// ended the session before it could reach ReadyForQuery.
    async fn complete_authentication(&mut self) -> Result<bool> {
        self.state.is_authenticated = true;
        self.write(messages::encode_auth_ok()).await?;

        if let Some(hook) = self.config.hooks.on_authenticated.clone() {
            if let Err(e) = hook(self.state(), self.detach_handle.clone()).await {
                // Authentication already succeeded; a hook failure here
                // still ends the session the same way any other hook error
                // does (framed + close, or log + abort).
                return self.handle_hook_error(e).await;
            }
        }

        if let Some(server_version) = self.config.server_version.clone() {
            let value = match server_version {
                ServerVersion::Static(v) => v,
                ServerVersion::Dynamic(f) => f(self.state()).await,
            };
            self.write(messages::encode_parameter_status("server_version", &value))
                .await?;
        }

        self.state.step = Step::ReadyForQuery;
        self.write(messages::encode_ready_for_query(b'I')).await?;

        Ok(false)
    }

    /// §4.4.4: Query parsing and the command-response sequence.
    async fn handle_query(&mut self, payload: &[u8]) -> Result<bool> {
        let mut reader = crate::codec::BufferReader::new(payload);
        let text = reader
            .cstring()
            .map_err(|_| Error::Protocol("malformed Query message".into()))?;

        let hook = match self.config.hooks.on_query.clone() {
            Some(hook) => hook,
            None => return Ok(false),
        };

        let outcome = match hook(text, self.state(), self.detach_handle.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => return self.handle_hook_error(e).await,
        };

        match outcome {
            None => {
                self.write(query::encode_empty_query_response()).await?;
            }
            Some(responses) => {
                for response in responses {
                    match response {
                        query::CommandResponse::Exec {
                            command,
                            affected_rows,
                        } => {
                            self.write(query::encode_command_complete(&command, affected_rows))
                                .await?;
                        }
                        query::CommandResponse::Query {
                            command,
                            fields,
                            rows,
                            affected_rows,
                        } => {
                            self.write(query::encode_row_description(&fields)).await?;

                            let mut emitted = 0u64;
                            for row in &rows {
                                let frame = query::encode_data_row(&fields, row)?;
                                self.write(frame).await?;
                                emitted += 1;
                            }

                            let count = affected_rows.unwrap_or(emitted);
                            self.write(query::encode_command_complete(&command, count))
                                .await?;
                        }
                    }
                }
            }
        }

        self.write(messages::encode_ready_for_query(b'I')).await?;
        Ok(false)
    }

    async fn handle_hook_error(&mut self, err: HookError) -> Result<bool> {
        match err {
            HookError::Backend(backend_err) => {
                self.write(backend_err.encode()).await?;
                self.close().await?;
                Ok(true)
            }
            HookError::Other(message) => {
                log::error!("hook raised an error, aborting connection: {}", message);
                self.abort().await;
                Ok(true)
            }
        }
    }

    async fn fatal_close(&mut self, err: BackendError) -> Result<bool> {
        self.write(err.encode()).await?;
        self.close().await?;
        Ok(true)
    }

    /// CloseSignal contract: flush, close the writable half, end the
    /// session.
    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().await?;
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    /// Hook-raised non-`BackendError` errors are logged and the writable
    /// half is aborted without attempting to frame anything (§7).
    async fn abort(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }
}

fn is_expected_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}
