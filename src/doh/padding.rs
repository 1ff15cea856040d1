//! EDNS(0) padding (RFC 7830) for outgoing queries.
//!
//! Padded queries are rounded up to a multiple of [`PADDING_BLOCK_SIZE`] bytes
//! so their length says less about the name being looked up.

use crate::doh::error::PaddingError;
use hickory_resolver::proto::op::{Edns, Message};
use hickory_resolver::proto::rr::rdata::opt::{EdnsCode, EdnsOption};

/// Option code of the padding option.
pub const OPT_PADDING_CODE: u16 = 12;

/// Block size recommended by RFC 8467 for queries.
pub const PADDING_BLOCK_SIZE: usize = 128;

/// OPTION-CODE + OPTION-LENGTH.
const OPT_PADDING_HEADER_LEN: usize = 2 + 2;

/// Number of zero bytes needed to pad a `msg_len`-byte message, which already
/// carries an OPT record without a padding option, to a multiple of
/// `block_size`.
pub fn compute_padding_size(msg_len: usize, block_size: usize) -> usize {
    let pad = block_size - (msg_len + OPT_PADDING_HEADER_LEN) % block_size;
    pad % block_size
}

/// Adds EDNS padding to a raw DNS message.
///
/// Messages that already carry a padding option are returned unchanged, so
/// the stub resolver's own padding is respected and padding is never applied
/// twice.
pub fn add_edns_padding(raw: &[u8]) -> Result<Vec<u8>, PaddingError> {
    let mut msg = Message::from_vec(raw).map_err(|e| PaddingError::MalformedMessage(e.to_string()))?;

    match msg.extensions_mut() {
        Some(edns) => {
            if edns.options().get(EdnsCode::Padding).is_some() {
                return Ok(raw.to_vec());
            }
        }
        None => {
            let mut edns = Edns::new();
            edns.set_max_payload(u16::MAX);
            edns.set_version(0);
            *msg.extensions_mut() = Some(edns);
        }
    }

    // Compressed size before padding.
    let pre_size = msg.to_vec().map_err(|e| PaddingError::Encode(e.to_string()))?.len();
    let padding = vec![0u8; compute_padding_size(pre_size, PADDING_BLOCK_SIZE)];

    if let Some(edns) = msg.extensions_mut() {
        edns.options_mut()
            .insert(EdnsOption::Unknown(OPT_PADDING_CODE, padding));
    }
    msg.to_vec().map_err(|e| PaddingError::Encode(e.to_string()))
}
