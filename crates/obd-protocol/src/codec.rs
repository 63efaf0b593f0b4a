//! ELM327 Wire Codec
//!
//! Requests are ASCII `MMPP\r`. Responses are hex digit streams terminated
//! by a carriage return or the `>` prompt. With echo, spaces and headers
//! disabled a positive reply to `010C` reads `410C1AF8`.

use crate::error::ProtocolError;
use crate::pid::{FrameKind, ParameterDefinition, PidValue};

/// Prompt the adapter prints when it is ready for the next command
pub const PROMPT: char = '>';

/// Banner printed while the adapter auto-detects the bus protocol
const SEARCHING: &str = "SEARCHING...";

/// Encode a parameter request
pub fn encode_request(def: &ParameterDefinition) -> Vec<u8> {
    encode_command(&def.request())
}

/// Encode an AT command or raw request line
pub fn encode_command(command: &str) -> Vec<u8> {
    format!("{}\r", command).into_bytes()
}

/// Check whether the accumulated reply text holds a complete response.
///
/// The prompt always ends a response. Single-frame replies also end at the
/// first carriage return following some content; multi-frame replies span
/// several lines and only end at the prompt.
pub fn is_complete(buffer: &str, frames: FrameKind) -> bool {
    if buffer.contains(PROMPT) {
        return true;
    }
    match frames {
        FrameKind::Single => {
            let text = buffer.trim_start();
            let text = text.strip_prefix(SEARCHING).unwrap_or(text).trim_start();
            text.contains('\r')
        }
        FrameKind::Multi => false,
    }
}

/// Parse a raw reply for the given parameter.
///
/// A reply without the expected prefix yields [`ProtocolError::NoMatch`];
/// it may belong to a request that was already abandoned.
pub fn parse(raw: &str, def: &ParameterDefinition) -> Result<PidValue, ProtocolError> {
    let prefix = def.response_prefix();
    let payload = match def.frames {
        FrameKind::Single => clean(raw).strip_prefix(prefix.as_str()).map(str::to_string),
        FrameKind::Multi => multi_frame_payload(raw, &prefix),
    }
    .ok_or_else(|| ProtocolError::NoMatch {
        expected: prefix.clone(),
    })?;

    let bytes = hex_to_bytes(&payload)?;
    def.decode(&bytes)
}

/// Strip whitespace, control characters, the prompt and the search banner
fn clean(raw: &str) -> String {
    let text = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control() && *c != PROMPT)
        .collect::<String>()
        .to_ascii_uppercase();

    match text.strip_prefix(SEARCHING) {
        Some(rest) => rest.to_string(),
        None => text,
    }
}

/// Join the data of a multi-line reply.
///
/// CAN adapters print a byte-count line followed by `0:`, `1:`... indexed
/// lines with the prefix only on the first; older buses repeat the prefix
/// on every line. Both reduce to the payload after the prefix.
fn multi_frame_payload(raw: &str, prefix: &str) -> Option<String> {
    let mut payload = String::new();
    let mut matched = false;

    for line in raw.split(|c: char| c == '\r' || c == '\n') {
        let line = clean(line);
        let line = strip_frame_index(&line);
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(prefix) {
            matched = true;
            payload.push_str(rest);
        } else if matched {
            payload.push_str(line);
        }
    }

    matched.then_some(payload)
}

fn strip_frame_index(line: &str) -> &str {
    match line.split_once(':') {
        Some((index, rest)) if !index.is_empty() && index.chars().all(|c| c.is_ascii_hexdigit()) => {
            rest
        }
        _ => line,
    }
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, ProtocolError> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(ProtocolError::InvalidHex(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| ProtocolError::InvalidHex(hex.to_string()))
        })
        .collect()
}
