/// APDU Shell - interactive smart card command shell
///
/// Tracks one PCSC reader, connects to cards as they are inserted and sends
/// raw APDUs typed by the operator, tracing all card traffic.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    commands::{CommandError, TransmitResult},
    dispatch::{SessionHandle, SessionQueue, TraceOptions, TraceWriter},
    gateway::{ApduResponse, Card, CardError, CardServices, Connection, PresenceChange, Reader, TrafficEvent},
    reader::PcscServices,
    session::{Session, SessionSnapshot, SessionState},
    utils::{format_hex, parse_hex},
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
