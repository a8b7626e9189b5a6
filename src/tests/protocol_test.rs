use bytes::BufMut;

use crate::iriswire::pg::protocol::{
    error_codes, ErrorSeverity, Header, MessageErrorBuilder, MessageParser, Tag,
};

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(tag);
    out.put_i32(4 + body.len() as i32);
    out.extend_from_slice(body);
    out
}

#[test]
fn test_header_needs_five_bytes() {
    assert!(Header::parse(&[b'Q', 0, 0, 0]).unwrap().is_none());
    let hdr = Header::parse(&frame(b'Q', b"SELECT 1\0")).unwrap().unwrap();
    assert_eq!(hdr.tag, Tag::QUERY);
    assert_eq!(hdr.length, 13);
    assert_eq!(hdr.total_len(), 14);
}

#[test]
fn test_header_rejects_length_below_four() {
    let mut bytes = vec![b'Q'];
    bytes.put_i32(3);
    assert!(Header::parse(&bytes).is_err());
}

#[test]
fn test_header_rejects_unknown_tag() {
    let bytes = frame(b'!', b"junk\0");
    assert!(Header::parse(&bytes).is_err());
}

#[test]
fn test_parser_reassembles_split_messages() {
    let mut parser = MessageParser::new(64);
    let bytes = frame(b'Q', b"SELECT 1\0");
    let (left, right) = bytes.split_at(7);

    parser.bytes_mut().extend_from_slice(left);
    assert!(parser.next().unwrap().is_none());

    parser.bytes_mut().extend_from_slice(right);
    let msg = parser.next().unwrap().unwrap();
    assert_eq!(msg.tag(), Tag::QUERY);
    assert_eq!(msg.body(), b"SELECT 1\0");
    assert!(parser.next().unwrap().is_none());
}

#[test]
fn test_parser_splits_pipelined_messages() {
    let mut parser = MessageParser::new(64);
    let mut bytes = frame(b'P', b"s1\0SELECT $1\0\0\0");
    bytes.extend_from_slice(&frame(b'S', b""));
    parser.bytes_mut().extend_from_slice(&bytes);

    let first = parser.next().unwrap().unwrap();
    assert_eq!(first.tag(), Tag::PARSE);
    let second = parser.next().unwrap().unwrap();
    assert_eq!(second.tag(), Tag::SYNC);
    assert_eq!(second.body(), b"");
    assert!(parser.next().unwrap().is_none());
}

#[test]
fn test_error_response_wire_format() {
    let msg = MessageErrorBuilder::new(
        ErrorSeverity::Error,
        error_codes::QUERY_CANCELED,
        "canceled",
    )
    .finish();
    assert_eq!(msg[0], b'E');
    let len = i32::from_be_bytes(msg[1..5].try_into().unwrap());
    assert_eq!(len as usize, msg.len() - 1);
    // severity, non-localized severity, code, message, terminator
    let body = &msg[5..];
    assert_eq!(body[0], b'S');
    assert!(body.windows(7).any(|w| w == b"C57014\0"));
    assert!(body.windows(9).any(|w| w == b"Mcanceled"));
    assert_eq!(body[body.len() - 1], 0);
}

#[test]
fn test_notice_uses_notice_tag() {
    let msg =
        MessageErrorBuilder::new(ErrorSeverity::Notice, error_codes::WARNING, "heads up").finish();
    assert_eq!(msg[0], b'N');
}
