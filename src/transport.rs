//! Chat transport abstraction — pure I/O, no scheduling logic.
//!
//! Transports (WhatsApp, Telegram, …) deliver inbound messages into the
//! store and carry outbound replies. The core only needs the small surface
//! below; concrete adapters live outside this crate.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::TransportError;
use crate::registry::GroupJid;

/// A connected chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport name (e.g. "whatsapp", "telegram").
    fn name(&self) -> &str;

    /// Whether this transport is responsible for the given jid.
    fn owns_jid(&self, jid: &GroupJid) -> bool;

    fn is_connected(&self) -> bool;

    /// Send a message, optionally quoting an earlier message id.
    async fn send_message(
        &self,
        jid: &GroupJid,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Toggle the typing indicator. Best-effort; failures are ignored.
    async fn set_typing(&self, jid: &GroupJid, on: bool);
}

/// Routes outbound traffic to whichever registered transport owns a jid.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn ChatTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transport: Arc<dyn ChatTransport>) {
        self.transports.push(transport);
    }

    /// Find the transport owning the given jid.
    pub fn for_jid(&self, jid: &GroupJid) -> Option<Arc<dyn ChatTransport>> {
        self.transports.iter().find(|t| t.owns_jid(jid)).cloned()
    }

    /// Send through the owning transport.
    pub async fn send_message(
        &self,
        jid: &GroupJid,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError> {
        let transport = self
            .for_jid(jid)
            .ok_or_else(|| TransportError::NoTransportForJid(jid.to_string()))?;
        if !transport.is_connected() {
            return Err(TransportError::NotConnected(transport.name().to_string()));
        }
        transport.send_message(jid, text, reply_to).await
    }

    /// Toggle typing through the owning transport; unknown jids are ignored.
    pub async fn set_typing(&self, jid: &GroupJid, on: bool) {
        match self.for_jid(jid) {
            Some(transport) => transport.set_typing(jid, on).await,
            None => warn!(jid = %jid, "No transport for typing indicator"),
        }
    }
}
