//! Connection lifecycle.
//!
//! `Disconnected` is both the initial and the terminal state: a
//! [`Connection`] value only exists once the handshake succeeded, and after
//! [`Connection::disconnect`] (or a fatal transport error) it stays
//! disconnected for good. Containers opened on it then fail with
//! [`ClientError::NotConnected`].

use std::fmt;
use std::sync::{Arc, Once};
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::container::Container;
use crate::error::{ClientError, Result};
use crate::protocol::{field, EventCode, Message};
use crate::session::{Session, Timeouts};
use crate::utils::retry::connection_backoff;
use crate::variant::Variant;

static INIT: Once = Once::new();

/// One-time process-wide initialization.
///
/// Returns true only for the call that performed it; later calls are no-ops.
/// [`Connection::connect`] calls it implicitly.
pub fn init() -> bool {
    let mut performed = false;
    INIT.call_once(|| {
        performed = true;
        debug!("tio client initialized");
    });
    performed
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// A session with one tio server.
///
/// Dropping the connection closes the transport.
pub struct Connection {
    session: Arc<Session>,
    host: String,
    port: u16,
}

impl Connection {
    /// Connect with default timeouts and no retry.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(&ConnectionConfig::new(host, port)).await
    }

    /// Connect using explicit configuration. Transport failures are retried
    /// `connect_retries` times; handshake rejections are not.
    pub async fn connect_with(config: &ConnectionConfig) -> Result<Self> {
        init();

        let timeouts = Timeouts {
            connect: config.connect_timeout(),
            request: config.request_timeout(),
        };
        let endpoint = config.endpoint();

        let session = (|| Session::connect(&config.host, config.port, timeouts))
            .retry(connection_backoff(config.connect_retries))
            .when(ClientError::is_retryable)
            .notify(|err: &ClientError, dur: Duration| {
                warn!(endpoint = %endpoint, error = %err, delay = ?dur, "Connection failed, retrying");
            })
            .await?;

        Ok(Self {
            session: Arc::new(session),
            host: config.host.clone(),
            port: config.port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`.
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Liveness probe. The server must echo `payload` back.
    pub async fn ping(&self, payload: &str) -> Result<()> {
        let request = Message::request(EventCode::Ping.code()).with(field::VALUE, payload);
        let answer = self.session.request(request).await?;
        match answer.get(field::VALUE) {
            Some(echo) if echo.as_bytes() == Some(payload.as_bytes()) => Ok(()),
            other => Err(ClientError::Connect {
                endpoint: self.endpoint().to_string(),
                reason: format!("ping answered with {:?}", other),
            }),
        }
    }

    /// Open a container. An empty `kind` opens an existing container only;
    /// a non-empty `kind` creates it when absent.
    pub async fn open(&self, name: &str, kind: &str) -> Result<Container> {
        let request = if kind.is_empty() {
            Message::request(EventCode::Open.code()).with(field::NAME, name)
        } else {
            Message::request(EventCode::Create.code())
                .with(field::NAME, name)
                .with(field::TYPE, kind)
        };

        let answer = self.session.call(request).await?;
        let code = answer.status();
        if code < 0 {
            return Err(ClientError::Open {
                name: name.to_string(),
                code,
                description: answer.error_description(),
            });
        }

        let handle = answer
            .int(field::HANDLE)
            .and_then(|h| u32::try_from(h).ok())
            .ok_or_else(|| ClientError::protocol("open answer without a valid handle"))?;
        let reported = match answer.variant(field::TYPE) {
            Variant::None => kind.to_string(),
            other => other.to_string(),
        };

        info!(container = %name, handle, kind = %reported, "container opened");
        Ok(Container::new(
            Arc::clone(&self.session),
            handle,
            name.to_string(),
            reported,
        ))
    }

    /// Create-if-absent shorthand for [`Connection::open`].
    pub async fn create(&self, name: &str, kind: &str) -> Result<Container> {
        if kind.is_empty() {
            return Err(ClientError::Open {
                name: name.to_string(),
                code: crate::protocol::status::MISSING_PARAMETER,
                description: "create needs a container type".to_string(),
            });
        }
        self.open(name, kind).await
    }

    /// Graceful disconnect. Idempotent.
    pub async fn disconnect(&self) {
        self.session.shutdown().await;
    }

    /// Release the transport without the graceful shutdown. Errors are not
    /// surfaced.
    pub fn close(&self) {
        self.session.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}
