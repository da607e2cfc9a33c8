//! Real-time side of parley: session handshake, presence, message
//! ingestion and the fan-out bus that delivers both to connected sessions.

pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod ingest;
pub mod presence;
pub mod upgrade;

use dispatcher::Dispatcher;
use handshake::SessionAuthenticator;
use ingest::MessageIngestor;
use presence::PresenceRegistry;

/// Everything a gateway session needs, cloned into each connection.
#[derive(Clone)]
pub struct GatewayState {
    pub authenticator: SessionAuthenticator,
    pub dispatcher: Dispatcher,
    pub presence: PresenceRegistry,
    pub ingestor: MessageIngestor,
}
