use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by the card services layer
#[derive(Debug, Error)]
pub enum CardError {
    #[error("{0}")]
    Pcsc(#[from] pcsc::Error),

    /// Transmission failure; the message may be empty if the transport gave none
    #[error("{0}")]
    Transmission(String),

    #[error("Card connection is not open")]
    NotConnected,

    #[error("Invalid reader name: {0}")]
    InvalidReaderName(String),

    #[error("Failed to start card monitor: {0}")]
    Monitor(#[from] std::io::Error),
}

/// A card reader slot, identified by its name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reader(String);

impl Reader {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A card inserted in a reader. Two handles are the same card when both
/// the reader and the ATR match.
///
/// Presence is sampled, so pulling a card and putting it (or another card
/// with the same ATR) back between two polls is not reported: the old
/// handle stays current until the reader is seen empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Card {
    reader: Reader,
    atr: Vec<u8>,
}

impl Card {
    pub fn new(reader: Reader, atr: Vec<u8>) -> Self {
        Self { reader, atr }
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    /// ATR as reported when the card was detected
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }
}

/// Cards inserted and removed since the previous notification, in the
/// order the monitor observed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<Card>,
    pub removed: Vec<Card>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Response to a transmitted APDU, with the status word split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

/// Connection-level occurrences observed by traffic listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficEvent {
    Connect,
    Disconnect,
    /// Outgoing command frame
    Command(Vec<u8>),
    /// Incoming response data and status word
    Response { data: Vec<u8>, sw1: u8, sw2: u8 },
    /// Gateway-specific occurrence with no dedicated variant
    Other(String),
}

/// Receives card insertion/removal notifications
pub trait PresenceListener: Send {
    fn on_presence_change(&mut self, change: PresenceChange);
}

impl<F> PresenceListener for F
where
    F: FnMut(PresenceChange) + Send,
{
    fn on_presence_change(&mut self, change: PresenceChange) {
        self(change)
    }
}

/// Receives traffic on a card connection. Listeners are shared between
/// the session and the connection, so they take `&self`.
pub trait TrafficListener: Send + Sync {
    fn on_traffic(&self, event: &TrafficEvent);
}

impl<F> TrafficListener for F
where
    F: Fn(&TrafficEvent) + Send + Sync,
{
    fn on_traffic(&self, event: &TrafficEvent) {
        self(event)
    }
}

/// Reader discovery, presence monitoring and connection factory.
///
/// The session only reaches readers, cards and connections through this
/// trait and [`Connection`]. Presence changes and connection traffic arrive
/// through two separate listener traits, registered independently.
#[cfg_attr(test, mockall::automock)]
pub trait CardServices: Send {
    /// List attached readers; empty when none are attached
    fn list_readers(&self) -> Result<Vec<Reader>, CardError>;

    /// Start delivering presence changes for all readers to `listener`
    fn subscribe_presence(&self, listener: Box<dyn PresenceListener>) -> Result<(), CardError>;

    /// Create a (not yet connected) logical connection to `card`
    fn open_connection(&self, card: &Card) -> Result<Box<dyn Connection>, CardError>;
}

/// A logical connection to one card
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send {
    fn subscribe_traffic(&mut self, listener: Arc<dyn TrafficListener>);

    /// Remove a listener previously passed to `subscribe_traffic`, matched by identity
    fn unsubscribe_traffic(&mut self, listener: &Arc<dyn TrafficListener>);

    fn connect(&mut self) -> Result<(), CardError>;

    fn disconnect(&mut self) -> Result<(), CardError>;

    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, CardError>;

    fn atr(&self) -> Result<Vec<u8>, CardError>;
}
