//! Wire protocol: request parsing and response framing (spec §6, C5).
//!
//! All multi-byte integers on the wire are little-endian `u32`. Newlines are
//! the single byte `0x0A`. `GET XRAY` is the only request whose body carries
//! binary data rather than a bare keyword line.

pub const LINE_FEED: u8 = b'\n';

const STREAM_LINE: &[u8] = b"STREAM\n";
const XRAY_TOTAL_LINE: &[u8] = b"GET XRAY TOTALNUM\n";
const XRAY_KEYWORD: &[u8] = b"GET XRAY\n";
/// `len("GET XRAY\n") + size_of::<u32>() + len("\n")`
const XRAY_REQUEST_LEN: usize = XRAY_KEYWORD.len() + 4 + 1;

const OK_TAG: &[u8] = b"OK\n";
const ERROR_TAG: &[u8] = b"ERROR\n";
const NOT_FOUND_MESSAGE: &[u8] = b"The required index is not available.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Stream,
    GetXrayTotal,
    GetXray { index: u32 },
    Invalid,
}

/// Result of one parse attempt against the accumulated read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes yet to decide; keep reading.
    Need,
    /// A verdict has been reached (may be `Request::Invalid`).
    Ready(Request),
}

/// Attempt to parse a complete request out of `buf`.
///
/// `max_bytes` is `ServerConfig::request_max_bytes`; exceeding it before a
/// request resolves classifies the connection `Invalid` rather than waiting
/// forever for a terminator that will never come.
pub fn try_parse(buf: &[u8], max_bytes: usize) -> ParseOutcome {
    if buf.len() > max_bytes {
        return ParseOutcome::Ready(Request::Invalid);
    }

    if buf == STREAM_LINE {
        return ParseOutcome::Ready(Request::Stream);
    }
    if buf == XRAY_TOTAL_LINE {
        return ParseOutcome::Ready(Request::GetXrayTotal);
    }

    if buf.starts_with(XRAY_KEYWORD) {
        if buf.len() < XRAY_REQUEST_LEN {
            return ParseOutcome::Need;
        }
        if buf.len() > XRAY_REQUEST_LEN || buf[XRAY_REQUEST_LEN - 1] != LINE_FEED {
            return ParseOutcome::Ready(Request::Invalid);
        }
        let mut index_bytes = [0u8; 4];
        index_bytes.copy_from_slice(&buf[XRAY_KEYWORD.len()..XRAY_KEYWORD.len() + 4]);
        return ParseOutcome::Ready(Request::GetXray {
            index: u32::from_le_bytes(index_bytes),
        });
    }

    // Still a viable prefix of one of the three known request lines?
    if is_prefix(buf, STREAM_LINE) || is_prefix(buf, XRAY_TOTAL_LINE) || is_prefix(buf, XRAY_KEYWORD) {
        return ParseOutcome::Need;
    }

    ParseOutcome::Ready(Request::Invalid)
}

fn is_prefix(buf: &[u8], full: &[u8]) -> bool {
    buf.len() <= full.len() && full.starts_with(buf)
}

/// `OK\n` ‖ `<u32-LE total>` ‖ `\n`
pub fn encode_catalog_count(total: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(OK_TAG.len() + 4 + 1);
    out.extend_from_slice(OK_TAG);
    out.extend_from_slice(&total.to_le_bytes());
    out.push(LINE_FEED);
    out
}

/// `OK\n` ‖ `<u32-LE size>` ‖ `<size bytes of image>`
pub fn encode_catalog_item(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OK_TAG.len() + 4 + data.len());
    out.extend_from_slice(OK_TAG);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// `ERROR\n` ‖ `"The required index is not available.\n"`
pub fn encode_not_found() -> Vec<u8> {
    let mut out = Vec::with_capacity(ERROR_TAG.len() + NOT_FOUND_MESSAGE.len());
    out.extend_from_slice(ERROR_TAG);
    out.extend_from_slice(NOT_FOUND_MESSAGE);
    out
}

/// `ERROR\n`, with no reason body — matches the source's wire behavior for
/// unrecognized requests (spec §9).
pub fn encode_invalid() -> Vec<u8> {
    ERROR_TAG.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream() {
        assert_eq!(try_parse(b"STREAM\n", 1024), ParseOutcome::Ready(Request::Stream));
    }

    #[test]
    fn waits_for_more_bytes_on_partial_keyword() {
        assert_eq!(try_parse(b"STREA", 1024), ParseOutcome::Need);
        assert_eq!(try_parse(b"GET XRAY", 1024), ParseOutcome::Need);
        assert_eq!(try_parse(b"GET XRAY\n\x01\x00", 1024), ParseOutcome::Need);
    }

    #[test]
    fn parses_catalog_total() {
        assert_eq!(
            try_parse(b"GET XRAY TOTALNUM\n", 1024),
            ParseOutcome::Ready(Request::GetXrayTotal)
        );
    }

    #[test]
    fn parses_xray_fetch_little_endian_index() {
        let mut req = b"GET XRAY\n".to_vec();
        req.extend_from_slice(&1u32.to_le_bytes());
        req.push(LINE_FEED);
        assert_eq!(
            try_parse(&req, 1024),
            ParseOutcome::Ready(Request::GetXray { index: 1 })
        );
    }

    #[test]
    fn rejects_xray_fetch_missing_terminator() {
        let mut req = b"GET XRAY\n".to_vec();
        req.extend_from_slice(&1u32.to_le_bytes());
        req.push(b'x'); // not a newline
        assert_eq!(try_parse(&req, 1024), ParseOutcome::Ready(Request::Invalid));
    }

    #[test]
    fn garbage_is_invalid_immediately() {
        assert_eq!(try_parse(b"HELLO\n", 1024), ParseOutcome::Ready(Request::Invalid));
    }

    #[test]
    fn oversized_request_is_invalid() {
        let buf = vec![b'x'; 2048];
        assert_eq!(try_parse(&buf, 1024), ParseOutcome::Ready(Request::Invalid));
    }

    #[test]
    fn encodes_s1_s2_s3_s4_literal_bytes() {
        assert_eq!(encode_catalog_count(0), vec![0x4F, 0x4B, 0x0A, 0, 0, 0, 0, 0x0A]);
        assert_eq!(
            encode_catalog_count(7),
            vec![0x4F, 0x4B, 0x0A, 0x07, 0, 0, 0, 0x0A]
        );
        assert_eq!(
            encode_catalog_item(&[0xFF, 0xEE, 0xDD]),
            vec![0x4F, 0x4B, 0x0A, 0x03, 0, 0, 0, 0xFF, 0xEE, 0xDD]
        );
        let mut expected = vec![0x45, 0x52, 0x52, 0x4F, 0x52, 0x0A];
        expected.extend_from_slice(NOT_FOUND_MESSAGE);
        assert_eq!(encode_not_found(), expected);
        assert_eq!(encode_invalid(), vec![0x45, 0x52, 0x52, 0x4F, 0x52, 0x0A]);
    }
}
