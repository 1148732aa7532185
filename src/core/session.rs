use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::core::commands::{self, CommandError, TransmitResult};
use crate::core::gateway::{Card, CardError, CardServices, Connection, PresenceChange, Reader, TrafficListener};
use crate::core::utils::format_hex;

/// Errors that prevent a session from starting
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Unable to connect to card reader")]
    NoReader,

    #[error("Failed to list readers: {0}")]
    Readers(#[from] CardError),
}

/// Pick the reader the session will use: the first one attached
pub fn select_reader(services: &dyn CardServices) -> Result<Reader, StartupError> {
    let readers = services.list_readers()?;
    debug!("Found {} reader(s)", readers.len());

    readers.into_iter().next().ok_or(StartupError::NoReader)
}

/// Whether a card is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoCard,
    CardConnected,
}

/// Read-only view of a session, used to render the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub reader: Reader,
    pub state: SessionState,
    pub selected: Option<String>,
    pub atr: Option<Vec<u8>>,
}

impl SessionSnapshot {
    pub fn prompt(&self) -> String {
        match self.state {
            SessionState::NoCard => {
                format!("Please insert card into reader [{}]> ", self.reader)
            }
            SessionState::CardConnected => format!(
                "Using reader [{}]\n[{}] selected> ",
                self.reader,
                self.selected.as_deref().unwrap_or("None")
            ),
        }
    }
}

/// Session state for the single selected reader: at most one card on it and
/// the connection to that card. Card and connection are set and cleared
/// together; the selected object and the ATR never outlive the connection.
pub struct Session {
    services: Box<dyn CardServices>,
    tracer: Arc<dyn TrafficListener>,
    reader: Reader,
    card: Option<Card>,
    connection: Option<Box<dyn Connection>>,
    selected: Option<String>,
    atr: Option<Vec<u8>>,
}

impl Session {
    /// Create a session on `reader`. `tracer` is subscribed to every
    /// connection the session opens.
    pub fn new(services: Box<dyn CardServices>, reader: Reader, tracer: Arc<dyn TrafficListener>) -> Self {
        Self {
            services,
            tracer,
            reader,
            card: None,
            connection: None,
            selected: None,
            atr: None,
        }
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    pub fn card(&self) -> Option<&Card> {
        self.card.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn selected_object(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    pub fn state(&self) -> SessionState {
        if self.card.is_some() {
            SessionState::CardConnected
        } else {
            SessionState::NoCard
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            reader: self.reader.clone(),
            state: self.state(),
            selected: self.selected.clone(),
            atr: self.atr.clone(),
        }
    }

    /// Forget the card, the selected object and the ATR.
    /// The connection is torn down separately by `clear_connection`.
    pub fn clear_context(&mut self) {
        self.card = None;
        self.selected = None;
        self.atr = None;
    }

    /// Unsubscribe the tracer, disconnect and drop the connection.
    /// Does nothing when no connection is open.
    pub fn clear_connection(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        connection.unsubscribe_traffic(&self.tracer);
        if let Err(e) = connection.disconnect() {
            warn!("Failed to disconnect cleanly from card: {e}");
        }
        self.connection = None;
        info!("Disconnected from card in reader {}", self.reader);
    }

    /// Open a connection to `card`, subscribe the tracer and read the ATR.
    ///
    /// Must only be called while no connection is open. The card, the
    /// connection and the ATR are stored only if every step succeeds.
    pub fn establish_connection(&mut self, card: &Card) -> Result<(), CardError> {
        debug_assert!(self.connection.is_none(), "connection already open");

        let mut connection = self.services.open_connection(card)?;
        connection.subscribe_traffic(Arc::clone(&self.tracer));

        let atr = match connection.connect().and_then(|()| connection.atr()) {
            Ok(atr) => atr,
            Err(e) => {
                connection.unsubscribe_traffic(&self.tracer);
                let _ = connection
                    .disconnect()
                    .map_err(|e| debug!("Disconnect after failed setup: {e}"));
                return Err(e);
            }
        };

        info!("Connected to card in reader {}, ATR: {}", self.reader, format_hex(&atr));

        self.card = Some(card.clone());
        self.connection = Some(connection);
        self.atr = Some(atr);
        Ok(())
    }

    /// Apply a presence change: drop the current card if it was removed,
    /// then adopt the first added card on this session's reader.
    pub fn handle_presence_change(&mut self, change: &PresenceChange) {
        let removed = self
            .card
            .as_ref()
            .is_some_and(|card| change.removed.contains(card));
        if removed {
            info!("Card removed from reader {}", self.reader);
            self.clear_connection();
            self.clear_context();
        }

        let Some(card) = change
            .added
            .iter()
            .find(|card| card.reader().name() == self.reader.name())
        else {
            return;
        };

        if self.connection.is_some() {
            warn!(
                "Ignoring card inserted into reader {} while another card is connected",
                self.reader
            );
            return;
        }

        if let Err(e) = self.establish_connection(card) {
            error!("Failed to connect to card in reader {}: {e}", self.reader);
            self.clear_context();
        }
    }

    /// Submit one operator line as a raw APDU.
    ///
    /// Blank lines and lines submitted without a card are ignored and
    /// return `Ok(None)`. A SELECT accepted by the card updates the
    /// selected object.
    pub fn submit(&mut self, line: &str) -> Result<Option<TransmitResult>, CommandError> {
        if line.trim().is_empty() {
            return Ok(None);
        }

        let Some(connection) = self.connection.as_mut() else {
            debug!("No card connected, ignoring command");
            return Ok(None);
        };

        let apdu = commands::decode_apdu(line)?;
        let result = commands::transmit(connection.as_mut(), apdu)?;

        if let Some(selected) = commands::selected_object(&result.apdu, result.sw1) {
            debug!("Selected object: {selected}");
            self.selected = Some(selected).filter(|s| !s.is_empty());
        }

        Ok(Some(result))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::{ApduResponse, MockCardServices, MockConnection, TrafficEvent};
    use mockall::Sequence;

    const ATR: [u8; 4] = [0x3B, 0x8F, 0x80, 0x01];

    fn reader() -> Reader {
        Reader::new("Mock Reader 0")
    }

    fn card() -> Card {
        Card::new(reader(), ATR.to_vec())
    }

    fn tracer() -> Arc<dyn TrafficListener> {
        Arc::new(|_event: &TrafficEvent| {})
    }

    /// A connection that accepts setup and answers every APDU with `sw1 sw2`
    fn connection(sw1: u8, sw2: u8) -> MockConnection {
        let mut connection = MockConnection::new();
        connection.expect_subscribe_traffic().times(1).return_const(());
        connection.expect_connect().times(1).returning(|| Ok(()));
        connection.expect_atr().returning(|| Ok(ATR.to_vec()));
        connection.expect_transmit().returning(move |_| {
            Ok(ApduResponse {
                data: vec![],
                sw1,
                sw2,
            })
        });
        connection.expect_unsubscribe_traffic().return_const(());
        connection.expect_disconnect().returning(|| Ok(()));
        connection
    }

    fn services_with(connection: MockConnection) -> MockCardServices {
        let connection: Box<dyn Connection> = Box::new(connection);
        let mut services = MockCardServices::new();
        services
            .expect_open_connection()
            .times(1)
            .return_once(move |_| Ok(connection));
        services
    }

    fn connected_session(sw1: u8, sw2: u8) -> Session {
        let services = services_with(connection(sw1, sw2));
        let mut session = Session::new(Box::new(services), reader(), tracer());
        session.handle_presence_change(&PresenceChange {
            added: vec![card()],
            removed: vec![],
        });
        session
    }

    #[test]
    fn test_select_reader_picks_first() {
        let mut services = MockCardServices::new();
        services
            .expect_list_readers()
            .returning(|| Ok(vec![Reader::new("First"), Reader::new("Second")]));

        assert_eq!(select_reader(&services).unwrap(), Reader::new("First"));
    }

    #[test]
    fn test_select_reader_without_readers() {
        let mut services = MockCardServices::new();
        services.expect_list_readers().returning(|| Ok(vec![]));

        assert!(matches!(select_reader(&services), Err(StartupError::NoReader)));
    }

    #[test]
    fn test_insertion_connects() {
        let session = connected_session(0x90, 0x00);

        assert_eq!(session.state(), SessionState::CardConnected);
        assert_eq!(session.card(), Some(&card()));
        assert!(session.is_connected());
        assert_eq!(session.atr(), Some(&ATR[..]));
        assert_eq!(session.selected_object(), None);
    }

    #[test]
    fn test_insertion_into_other_reader_is_ignored() {
        let mut services = MockCardServices::new();
        services.expect_open_connection().never();
        let mut session = Session::new(Box::new(services), reader(), tracer());

        session.handle_presence_change(&PresenceChange {
            added: vec![Card::new(Reader::new("Other Reader"), ATR.to_vec())],
            removed: vec![],
        });

        assert_eq!(session.state(), SessionState::NoCard);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_removal_clears_everything() {
        let mut session = connected_session(0x90, 0x00);
        session.submit("00A4040007A0000002471001").unwrap();
        assert_eq!(session.selected_object(), Some("A0000002471001"));

        session.handle_presence_change(&PresenceChange {
            added: vec![],
            removed: vec![card()],
        });

        assert_eq!(session.state(), SessionState::NoCard);
        assert!(session.card().is_none());
        assert!(!session.is_connected());
        assert!(session.selected_object().is_none());
        assert!(session.atr().is_none());
    }

    #[test]
    fn test_teardown_order() {
        let mut seq = Sequence::new();
        let mut connection = MockConnection::new();
        connection.expect_subscribe_traffic().return_const(());
        connection.expect_connect().returning(|| Ok(()));
        connection.expect_atr().returning(|| Ok(ATR.to_vec()));
        connection
            .expect_unsubscribe_traffic()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        connection
            .expect_disconnect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut session = Session::new(Box::new(services_with(connection)), reader(), tracer());
        session.establish_connection(&card()).unwrap();

        session.clear_connection();
        // Second teardown is a no-op; the mock would fail on a second disconnect
        session.clear_connection();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_failed_disconnect_still_clears() {
        let mut connection = MockConnection::new();
        connection.expect_subscribe_traffic().return_const(());
        connection.expect_connect().returning(|| Ok(()));
        connection.expect_atr().returning(|| Ok(ATR.to_vec()));
        connection.expect_unsubscribe_traffic().return_const(());
        connection
            .expect_disconnect()
            .times(1)
            .returning(|| Err(CardError::Pcsc(pcsc::Error::RemovedCard)));

        let mut session = Session::new(Box::new(services_with(connection)), reader(), tracer());
        session.establish_connection(&card()).unwrap();
        session.clear_connection();

        assert!(!session.is_connected());
    }

    #[test]
    fn test_failed_connect_leaves_no_card() {
        let mut connection = MockConnection::new();
        connection.expect_subscribe_traffic().return_const(());
        connection
            .expect_connect()
            .returning(|| Err(CardError::Pcsc(pcsc::Error::UnresponsiveCard)));
        connection.expect_unsubscribe_traffic().times(1).return_const(());
        connection.expect_disconnect().returning(|| Err(CardError::NotConnected));

        let mut session = Session::new(Box::new(services_with(connection)), reader(), tracer());
        session.handle_presence_change(&PresenceChange {
            added: vec![card()],
            removed: vec![],
        });

        assert_eq!(session.state(), SessionState::NoCard);
        assert!(session.card().is_none());
        assert!(session.atr().is_none());
    }

    #[test]
    fn test_submit_without_card_is_noop() {
        let mut services = MockCardServices::new();
        services.expect_open_connection().never();
        let mut session = Session::new(Box::new(services), reader(), tracer());

        assert!(session.submit("00A4040007A0000002471001").unwrap().is_none());
        assert!(session.submit("ZZ").unwrap().is_none());
        assert!(session.selected_object().is_none());
    }

    #[test]
    fn test_blank_line_is_noop() {
        let mut session = connected_session(0x90, 0x00);
        assert!(session.submit("").unwrap().is_none());
        assert!(session.submit("   \t").unwrap().is_none());
    }

    #[test]
    fn test_non_select_leaves_selection() {
        let mut session = connected_session(0x90, 0x00);
        session.submit("00A4000C023F00").unwrap();
        assert_eq!(session.selected_object(), Some("3F00"));

        let result = session.submit("00B0000010").unwrap().unwrap();
        assert_eq!(result.sw1, 0x90);
        assert_eq!(session.selected_object(), Some("3F00"));
    }

    #[test]
    fn test_failed_select_leaves_selection() {
        let mut session = connected_session(0x6A, 0x82);
        session.submit("00A4040007A0000002471001").unwrap();
        assert_eq!(session.selected_object(), None);
    }

    #[test]
    fn test_malformed_hex_reports_error() {
        let mut session = connected_session(0x90, 0x00);
        let err = session.submit("ZZ").unwrap_err();

        assert!(matches!(err, CommandError::Decode(_)));
        assert_eq!(session.state(), SessionState::CardConnected);
        assert!(session.submit("00A4000C023F00").is_ok());
    }

    #[test]
    fn test_transmission_failure_reports_error() {
        let mut connection = MockConnection::new();
        connection.expect_subscribe_traffic().return_const(());
        connection.expect_connect().returning(|| Ok(()));
        connection.expect_atr().returning(|| Ok(ATR.to_vec()));
        connection
            .expect_transmit()
            .returning(|_| Err(CardError::Transmission(String::new())));
        connection.expect_unsubscribe_traffic().return_const(());
        connection.expect_disconnect().returning(|| Ok(()));

        let mut session = Session::new(Box::new(services_with(connection)), reader(), tracer());
        session.establish_connection(&card()).unwrap();

        let err = session.submit("00A4000C023F00").unwrap_err();
        assert_eq!(err.user_message(), "TransmissionError (no message given)");
        assert!(session.is_connected());
        assert_eq!(session.selected_object(), None);
    }

    #[test]
    fn test_prompt() {
        let mut snapshot = SessionSnapshot {
            reader: reader(),
            state: SessionState::NoCard,
            selected: None,
            atr: None,
        };
        assert_eq!(snapshot.prompt(), "Please insert card into reader [Mock Reader 0]> ");

        snapshot.state = SessionState::CardConnected;
        assert_eq!(snapshot.prompt(), "Using reader [Mock Reader 0]\n[None] selected> ");

        snapshot.selected = Some("3F00".to_string());
        assert_eq!(snapshot.prompt(), "Using reader [Mock Reader 0]\n[3F00] selected> ");
    }
}
