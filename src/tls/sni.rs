//! Server Name Indication extraction from a buffered TLS ClientHello.
//!
//! Only the first record is examined. The parser never panics on truncated or
//! hostile input; anything it does not understand yields `None`.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Cursor over a byte slice with big-endian length-prefixed reads.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some((bytes[0] as usize) << 16 | (bytes[1] as usize) << 8 | bytes[2] as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Returns the host name carried by the ClientHello at the start of `data`.
///
/// `data` is everything written on the connection so far, so a ClientHello
/// that is still incomplete returns `None` and can be retried later.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let mut record = Reader::new(data);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let version = record.u16()?;
    if !(0x0300..=0x0304).contains(&version) {
        return None;
    }
    let record_len = record.u16()? as usize;
    let mut handshake = Reader::new(record.take(record_len)?);

    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hello_len = handshake.u24()?;
    let mut hello = Reader::new(handshake.take(hello_len)?);

    // legacy_version + random
    hello.skip(2 + 32)?;
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    if hello.is_empty() {
        // No extensions at all.
        return None;
    }
    let extensions_len = hello.u16()? as usize;
    let mut extensions = Reader::new(hello.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }
    None
}

fn parse_server_name(body: &[u8]) -> Option<String> {
    let mut ext = Reader::new(body);
    let list_len = ext.u16()? as usize;
    let mut list = Reader::new(ext.take(list_len)?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST_NAME {
            let name = std::str::from_utf8(name).ok()?;
            if name.is_empty() {
                return None;
            }
            return Some(name.to_ascii_lowercase());
        }
    }
    None
}

/// Builds a minimal ClientHello carrying `host` in its SNI extension.
///
/// Exposed for tests and benchmarks.
#[doc(hidden)]
pub fn client_hello_for(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(NAME_TYPE_HOST_NAME);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    // A leading non-SNI extension (supported_versions) so the walk is exercised.
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
