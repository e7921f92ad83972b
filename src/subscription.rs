//! Push subscriptions on a container.
//!
//! Events for one subscription are delivered in server order on a single
//! dedicated thread. A callback that blocks stalls only its own subscription.

use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::container::Container;
use crate::error::{ClientError, Result};
use crate::protocol::{field, EventCode, Message};
use crate::variant::Variant;

/// One server-side mutation reported to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub code: EventCode,
    pub key: Variant,
    pub value: Variant,
    pub metadata: Variant,
}

impl Event {
    pub fn new(code: EventCode) -> Self {
        Self {
            code,
            key: Variant::None,
            value: Variant::None,
            metadata: Variant::None,
        }
    }

    /// Parse an EVENT frame.
    pub fn from_message(message: &Message) -> Result<Self> {
        let code = message
            .int(field::EVENT)
            .ok_or_else(|| ClientError::protocol("event frame without event code"))?;
        Ok(Self {
            code: EventCode::try_from(code)?,
            key: message.variant(field::KEY),
            value: message.variant(field::VALUE),
            metadata: message.variant(field::METADATA),
        })
    }
}

/// A live subscription. Dropping it without [`Subscription::unsubscribe`]
/// leaves the server feed open until the connection or container closes.
pub struct Subscription {
    container: Container,
    delivery: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn start<F>(
        container: Container,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut on_event: F,
    ) -> Result<Self>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let name = container.name().to_string();
        let delivery = std::thread::Builder::new()
            .name(format!("tio-sub-{}", name))
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    on_event(event);
                }
                debug!(container = %name, "subscription feed closed");
            })?;

        Ok(Self {
            container,
            delivery: Some(delivery),
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// True while events can still be delivered.
    pub fn is_active(&self) -> bool {
        self.delivery
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Stop the server feed and wait for in-flight callbacks to return.
    ///
    /// Must not be called from inside the subscription's own callback.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.container.session().remove_subscriber(self.container.handle());
        let result = self
            .container
            .command(self.container.message(EventCode::Unsubscribe))
            .await;

        if let Some(thread) = self.delivery.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(container = %self.container.name(), "subscription callback panicked");
            }
        }

        match result {
            Err(ClientError::NotConnected) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("container", &self.container.name())
            .field("active", &self.is_active())
            .finish()
    }
}
