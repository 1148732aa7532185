use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pcsc::{Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE, PNP_NOTIFICATION};

use crate::core::gateway::{
    ApduResponse, Card, CardError, CardServices, Connection, PresenceChange, PresenceListener, Reader, TrafficEvent,
    TrafficListener,
};
use crate::core::utils::format_hex;

/// Default wait between card presence checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Card services backed by the system PCSC daemon
pub struct PcscServices {
    context: Context,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl PcscServices {
    /// Establish a PCSC context
    pub fn new() -> Result<Self, CardError> {
        let context = Context::establish(Scope::User)?;

        Ok(Self {
            context,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Set how long the presence monitor waits for a change per round
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl CardServices for PcscServices {
    fn list_readers(&self) -> Result<Vec<Reader>, CardError> {
        let mut readers_buf = vec![0; 2048];
        let readers = match self.context.list_readers(&mut readers_buf) {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(readers
            .map(|name| Reader::new(name.to_string_lossy()))
            .collect())
    }

    fn subscribe_presence(&self, mut listener: Box<dyn PresenceListener>) -> Result<(), CardError> {
        let mut monitor = PresenceMonitor::new(self.context.clone(), Vec::new());

        // First scan inline, so cards already inserted are reported before we return
        if let Some(change) = monitor.poll(Duration::ZERO)? {
            listener.on_presence_change(change);
        }

        let context = self.context.clone();
        let known_cards = monitor.cards;
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;

        thread::Builder::new()
            .name("card-monitor".into())
            .spawn(move || {
                let mut monitor = PresenceMonitor::new(context, known_cards);
                while running.load(Ordering::Relaxed) {
                    match monitor.poll(poll_interval) {
                        Ok(Some(change)) => listener.on_presence_change(change),
                        Ok(None) => {}
                        Err(pcsc::Error::Cancelled) => {}
                        Err(e) => {
                            log::warn!("Card presence monitoring error: {e}");
                            thread::sleep(poll_interval);
                        }
                    }
                }
                log::debug!("Card monitor stopped");
            })?;

        Ok(())
    }

    fn open_connection(&self, card: &Card) -> Result<Box<dyn Connection>, CardError> {
        let reader = CString::new(card.reader().name())
            .map_err(|_| CardError::InvalidReaderName(card.reader().to_string()))?;

        Ok(Box::new(PcscConnection::new(self.context.clone(), reader)))
    }
}

impl Drop for PcscServices {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        // Wake a monitor blocked in get_status_change
        let _ = self.context.cancel();
    }
}

/// Tracks which cards are present and reports the differences
struct PresenceMonitor {
    context: Context,
    states: Vec<ReaderState>,
    cards: Vec<Card>,
}

impl PresenceMonitor {
    /// Start watching, treating `cards` as already reported
    fn new(context: Context, cards: Vec<Card>) -> Self {
        Self {
            context,
            states: vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)],
            cards,
        }
    }

    fn is_pnp(name: &CStr) -> bool {
        name == PNP_NOTIFICATION()
    }

    /// Keep one state entry per attached reader, plus the PnP entry
    fn refresh_readers(&mut self) -> Result<(), pcsc::Error> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => return Err(e),
        };

        self.states
            .retain(|rs| Self::is_pnp(rs.name()) || names.iter().any(|name| name.as_c_str() == rs.name()));

        for name in names {
            if !self.states.iter().any(|rs| rs.name() == name.as_c_str()) {
                log::debug!("Watching reader {}", name.to_string_lossy());
                self.states.push(ReaderState::new(name, State::UNAWARE));
            }
        }

        Ok(())
    }

    /// Wait up to `timeout` for a state change and diff the present cards
    fn poll(&mut self, timeout: Duration) -> Result<Option<PresenceChange>, pcsc::Error> {
        self.refresh_readers()?;

        match self.context.get_status_change(timeout, &mut self.states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => return Err(e),
        }

        let mut present = Vec::new();
        for rs in &mut self.states {
            let state = rs.event_state();
            if !Self::is_pnp(rs.name()) && state.contains(State::PRESENT) && !state.contains(State::EMPTY) {
                let reader = Reader::new(rs.name().to_string_lossy());
                present.push(Card::new(reader, rs.atr().to_vec()));
            }
            rs.sync_current_state();
        }

        let change = diff_cards(&self.cards, &present);
        self.cards = present;

        if change.is_empty() {
            return Ok(None);
        }

        log::debug!(
            "Presence change: {} added, {} removed",
            change.added.len(),
            change.removed.len()
        );
        Ok(Some(change))
    }
}

/// Cards in `present` but not in `previous` are added, the reverse are removed.
/// Both lists keep the order of the snapshot they come from.
fn diff_cards(previous: &[Card], present: &[Card]) -> PresenceChange {
    PresenceChange {
        added: present.iter().filter(|card| !previous.contains(card)).cloned().collect(),
        removed: previous.iter().filter(|card| !present.contains(card)).cloned().collect(),
    }
}

/// Connection to a card through PCSC, reporting its traffic to listeners
pub struct PcscConnection {
    context: Context,
    reader: CString,
    card: Option<pcsc::Card>,
    listeners: Vec<Arc<dyn TrafficListener>>,
}

impl PcscConnection {
    fn new(context: Context, reader: CString) -> Self {
        Self {
            context,
            reader,
            card: None,
            listeners: Vec::new(),
        }
    }

    fn notify(&self, event: TrafficEvent) {
        for listener in &self.listeners {
            listener.on_traffic(&event);
        }
    }

    fn card(&self) -> Result<&pcsc::Card, CardError> {
        self.card.as_ref().ok_or(CardError::NotConnected)
    }
}

impl Connection for PcscConnection {
    fn subscribe_traffic(&mut self, listener: Arc<dyn TrafficListener>) {
        self.listeners.push(listener);
    }

    fn unsubscribe_traffic(&mut self, listener: &Arc<dyn TrafficListener>) {
        self.listeners
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    fn connect(&mut self) -> Result<(), CardError> {
        log::info!("Connecting to card in reader: {}", self.reader.to_string_lossy());

        let card = self
            .context
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)?;
        self.card = Some(card);

        self.notify(TrafficEvent::Connect);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), CardError> {
        let Some(card) = self.card.take() else {
            return Ok(());
        };

        self.notify(TrafficEvent::Disconnect);
        card.disconnect(Disposition::LeaveCard)
            .map_err(|(_card, e)| CardError::from(e))
    }

    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, CardError> {
        self.notify(TrafficEvent::Command(apdu.to_vec()));

        let mut response_buf = [0; MAX_BUFFER_SIZE];
        let response = self.card()?.transmit(apdu, &mut response_buf)?;

        let Some((data, status)) = response.split_last_chunk::<2>() else {
            return Err(CardError::Transmission(format!(
                "Response too short for a status word: {}",
                format_hex(response)
            )));
        };
        let response = ApduResponse {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        };

        self.notify(TrafficEvent::Response {
            data: response.data.clone(),
            sw1: response.sw1,
            sw2: response.sw2,
        });
        Ok(response)
    }

    fn atr(&self) -> Result<Vec<u8>, CardError> {
        let status = self.card()?.status2_owned()?;
        Ok(status.atr().to_vec())
    }
}

impl Drop for PcscConnection {
    fn drop(&mut self) {
        if let Some(card) = self.card.take() {
            let _ = card
                .disconnect(Disposition::LeaveCard)
                .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));
        }
    }
}
