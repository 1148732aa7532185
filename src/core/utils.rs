use anyhow::{bail, Context, Result};

/// Decode an APDU typed by the operator.
/// Accepts pairs of hex digits, optionally separated:
/// - "00A40400" (packed)
/// - "00 A4 04 00" (space-separated)
/// - "0x00,0xA4,0x04,0x00" (0x prefix with commas)
/// - "00:A4:04:00" or "00-A4-04-00"
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.len() % 2 != 0 {
        bail!("Hex string must have even number of characters: '{}'", hex_str.trim());
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{}'", hex_str.trim()))
}

/// Strip separators and `0x` prefixes, leaving only the digits
fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | '-'))
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect::<String>()
        .to_uppercase()
}

/// Format bytes as a packed uppercase hex string
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as uppercase hex pairs separated by spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human-readable meaning of a status word (ISO 7816-4, plus the GSM 11.11
/// `9E`/`9F` response-available codes)
pub fn describe_status_word(sw1: u8, sw2: u8) -> String {
    let text = match (sw1, sw2) {
        (0x90, 0x00) => "Success",
        (0x61, n) => return format!("Success, {n} bytes available"),
        (0x9F, n) => return format!("Success, {n} bytes of response data"),
        (0x9E, n) => return format!("Success with warning, {n} bytes of response data"),
        (0x62, 0x81) => "Warning: Part of returned data may be corrupted",
        (0x62, 0x82) => "Warning: End of file reached",
        (0x62, 0x83) => "Warning: Selected file invalidated",
        (0x62, 0x84) => "Warning: FCI not formatted",
        (0x62, _) | (0x63, 0x00) => "Warning: No information given",
        (0x63, n) if n & 0xF0 == 0xC0 => return format!("Warning: Counter = {}", n & 0x0F),
        (0x64, _) => "Error: Execution error",
        (0x65, 0x81) => "Error: Memory failure",
        (0x67, 0x00) => "Error: Wrong length",
        (0x68, 0x81) => "Error: Logical channel not supported",
        (0x68, 0x82) => "Error: Secure messaging not supported",
        (0x68, _) => "Error: Functions in CLA not supported",
        (0x69, 0x81) => "Error: Command incompatible with file structure",
        (0x69, 0x82) => "Error: Security status not satisfied",
        (0x69, 0x83) => "Error: Authentication method blocked",
        (0x69, 0x84) => "Error: Referenced data invalidated",
        (0x69, 0x85) => "Error: Conditions of use not satisfied",
        (0x69, 0x86) => "Error: Command not allowed (no current EF)",
        (0x69, _) => "Error: Command not allowed",
        (0x6A, 0x80) => "Error: Incorrect parameters in data field",
        (0x6A, 0x81) => "Error: Function not supported",
        (0x6A, 0x82) => "Error: File not found",
        (0x6A, 0x83) => "Error: Record not found",
        (0x6A, 0x84) => "Error: Not enough memory space in file",
        (0x6A, 0x86) => "Error: Incorrect parameters P1-P2",
        (0x6A, 0x88) => "Error: Referenced data not found",
        (0x6A, _) | (0x6B, 0x00) => "Error: Wrong parameter(s) P1-P2",
        (0x6C, n) => return format!("Error: Wrong Le field, exact length: {n}"),
        (0x6D, 0x00) => "Error: Instruction code not supported or invalid",
        (0x6E, 0x00) => "Error: Class not supported",
        (0x65, _) | (0x6F, 0x00) => "Error: No precise diagnosis",
        _ => return format!("Unknown status: {sw1:02X} {sw2:02X}"),
    };
    text.to_string()
}
