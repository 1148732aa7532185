use std::time::Instant;

use thiserror::Error;

use crate::core::gateway::{CardError, Connection};
use crate::core::utils::{format_hex, parse_hex};

/// Instruction byte of SELECT
pub const SELECT_INSTRUCTION: u8 = 0xA4;

/// SW1 values that mean a SELECT went through
pub const SELECT_SUCCESS_SW1: [u8; 4] = [0x90, 0x9E, 0x9F, 0x61];

/// Length of the CLA INS P1 P2 Lc header preceding the SELECT data field
const COMMAND_HEADER_LEN: usize = 5;

/// Failures of a single operator command. None of these end the session.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0:#}")]
    Decode(anyhow::Error),

    #[error("APDU cannot be empty")]
    Empty,

    #[error(transparent)]
    Transmit(#[from] CardError),

    #[error("Card session is no longer running")]
    SessionClosed,
}

impl CommandError {
    fn kind(&self) -> &'static str {
        match self {
            CommandError::Decode(_) | CommandError::Empty => "DecodeError",
            CommandError::Transmit(_) => "TransmissionError",
            CommandError::SessionClosed => "SessionError",
        }
    }

    /// Single-line message shown to the operator
    pub fn user_message(&self) -> String {
        let message = self.to_string();
        if message.trim().is_empty() {
            format!("{} (no message given)", self.kind())
        } else {
            message
        }
    }
}

/// Result of a transmitted APDU
#[derive(Debug, Clone)]
pub struct TransmitResult {
    pub apdu: Vec<u8>,
    pub response: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
    pub duration_ms: u64,
}

/// Decode one operator line into a command frame
pub fn decode_apdu(line: &str) -> Result<Vec<u8>, CommandError> {
    let apdu = parse_hex(line).map_err(CommandError::Decode)?;

    if apdu.is_empty() {
        return Err(CommandError::Empty);
    }

    Ok(apdu)
}

/// Send `apdu` over `connection` and time the exchange
pub fn transmit(connection: &mut dyn Connection, apdu: Vec<u8>) -> Result<TransmitResult, CommandError> {
    let start_time = Instant::now();

    log::info!("Transmitting APDU: {}", format_hex(&apdu));

    let response = connection.transmit(&apdu).map_err(|e| {
        log::error!("Transmit failed: {e}");
        CommandError::Transmit(e)
    })?;
    let duration = start_time.elapsed();

    log::info!(
        "Received response: {} {:02X}{:02X} ({}ms)",
        format_hex(&response.data),
        response.sw1,
        response.sw2,
        duration.as_millis()
    );

    Ok(TransmitResult {
        apdu,
        response: response.data,
        sw1: response.sw1,
        sw2: response.sw2,
        duration_ms: duration.as_millis() as u64,
    })
}

/// Identifier selected by `apdu`, if it was a SELECT that the card accepted.
///
/// The identifier is the packed hex of everything after the 5-byte header.
/// A SELECT without a data field yields an empty string.
pub fn selected_object(apdu: &[u8], sw1: u8) -> Option<String> {
    let is_select = apdu.get(1) == Some(&SELECT_INSTRUCTION);
    if !is_select || !SELECT_SUCCESS_SW1.contains(&sw1) {
        return None;
    }

    let data = apdu.get(COMMAND_HEADER_LEN..).unwrap_or_default();
    Some(format_hex(data))
}
