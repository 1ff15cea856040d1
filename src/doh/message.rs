//! Raw DNS message helpers used around the DoH exchange.

use crate::doh::error::PaddingError;
use hickory_resolver::proto::op::{Message, MessageType, ResponseCode};

/// Reads the 16-bit ID at the start of a DNS message.
pub fn query_id(msg: &[u8]) -> Option<u16> {
    match msg {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Overwrites the ID of a DNS message. Messages shorter than two bytes are
/// left alone.
pub fn set_query_id(msg: &mut [u8], id: u16) {
    if msg.len() >= 2 {
        msg[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Builds a SERVFAIL response to `query`.
///
/// The question section is kept, additional records (and with them EDNS) are
/// dropped.
pub fn servfail(query: &[u8]) -> Result<Vec<u8>, PaddingError> {
    let mut msg =
        Message::from_vec(query).map_err(|e| PaddingError::MalformedMessage(e.to_string()))?;
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::ServFail);
    msg.take_additionals();
    *msg.extensions_mut() = None;
    msg.to_vec().map_err(|e| PaddingError::Encode(e.to_string()))
}

/// Like [`servfail`], but logs and returns `None` when `query` cannot be
/// parsed.
pub fn try_servfail(query: &[u8]) -> Option<Vec<u8>> {
    match servfail(query) {
        Ok(response) => Some(response),
        Err(e) => {
            tracing::warn!(error = %e, "Error constructing servfail");
            None
        }
    }
}
