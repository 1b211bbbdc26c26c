//! Incremental event stream parsing
//!
//! [`parse`] is restartable: feed it the unparsed remainder of the previous
//! call followed by the newly received bytes and it yields exactly the
//! messages a single pass over the whole stream would.

use super::Message;

/// UTF-8 byte order mark, stripped once at the start of a connection
pub const BOM: &[u8] = b"\xEF\xBB\xBF";

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Split `buffer` into complete messages and the unterminated remainder
///
/// Blocks are closed by two consecutive line terminators, each of which may be
/// `\r\n`, `\r` or `\n`. Blocks that carry no recognised field produce no
/// message. Invalid UTF-8 inside a block is replaced, never rejected.
pub fn parse(buffer: &[u8]) -> (Vec<Message>, &[u8]) {
    let mut messages = Vec::new();
    let mut start = skip_terminators(buffer, 0);
    let mut pos = start;

    while pos < buffer.len() {
        let first = terminator_len(buffer, pos);
        if first == 0 {
            pos += 1;
            continue;
        }

        let second = terminator_len(buffer, pos + first);
        if second == 0 {
            pos += first;
            continue;
        }

        let block = String::from_utf8_lossy(&buffer[start..pos]);
        if let Some(message) = Message::parse_block(&block) {
            messages.push(message);
        }

        start = skip_terminators(buffer, pos + first + second);
        pos = start;
    }

    (messages, &buffer[start..])
}

/// Strip a leading byte order mark
pub fn strip_bom(buffer: &[u8]) -> &[u8] {
    buffer.strip_prefix(BOM).unwrap_or(buffer)
}

fn terminator_len(buffer: &[u8], pos: usize) -> usize {
    match buffer.get(pos) {
        Some(&CR) if buffer.get(pos + 1) == Some(&LF) => 2,
        Some(&CR) | Some(&LF) => 1,
        _ => 0,
    }
}

fn skip_terminators(buffer: &[u8], mut pos: usize) -> usize {
    while matches!(buffer.get(pos), Some(&CR) | Some(&LF)) {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const STREAM: &str = ":ok\n\nevent: builderror\nid: 46\ndata: {\"foo\": \"bar\"}\n\nevent: reload\nid: 47\ndata: {}\n\nevent: reload\nid: 48\ndata: {}\n\ndata: test\ndata:test\nid: 49\nevent: testEvent\n\n\nid: 50\ndata: <tag>\ndata\ndata:   <foo />\ndata\ndata: </tag>\n\nid: 60\ndata";

    fn expected() -> Vec<Message> {
        vec![
            Message::new("{\"foo\": \"bar\"}").with_id("46").with_event("builderror"),
            Message::new("{}").with_id("47").with_event("reload"),
            Message::new("{}").with_id("48").with_event("reload"),
            Message::new("test\ntest").with_id("49").with_event("testEvent"),
            Message::new("<tag>\n\n  <foo />\n\n</tag>").with_id("50"),
        ]
    }

    fn parse_in_pieces(input: &[u8], cuts: &[usize]) -> (Vec<Message>, Vec<u8>) {
        let mut messages = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut last = 0;

        for &cut in cuts.iter().chain(std::iter::once(&input.len())) {
            pending.extend_from_slice(&input[last..cut]);
            last = cut;
            let (parsed, rest) = parse(&pending);
            messages.extend(parsed);
            pending = rest.to_vec();
        }

        (messages, pending)
    }

    #[test]
    fn test_parse_whole_stream() {
        let (messages, rest) = parse(STREAM.as_bytes());
        assert_eq!(messages, expected());
        assert_eq!(rest, b"id: 60\ndata");
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let input = STREAM.as_bytes();
        for cut in 0..=input.len() {
            let (messages, rest) = parse_in_pieces(input, &[cut]);
            assert_eq!(messages, expected(), "split at {cut}");
            assert_eq!(rest, b"id: 60\ndata", "split at {cut}");
        }
    }

    #[test]
    fn test_byte_by_byte_mixed_terminators() {
        let input = b"data: a\r\n\r\nid: 2\rdata: b\r\rdata: c\n\r\n";
        let cuts: Vec<usize> = (1..input.len()).collect();
        let (messages, rest) = parse_in_pieces(input, &cuts);

        assert_eq!(
            messages,
            vec![
                Message::new("a"),
                Message::new("b").with_id("2"),
                Message::new("c"),
            ]
        );
        assert!(rest.is_empty());
        assert_eq!(parse(input).0, messages);
    }

    #[test]
    fn test_cr_split_from_lf_keeps_block_open() {
        let (messages, rest) = parse(b"data: a\r");
        assert!(messages.is_empty());
        assert_eq!(rest, b"data: a\r");

        let mut next = rest.to_vec();
        next.extend_from_slice(b"\ndata: b\n\n");
        let (messages, rest) = parse(&next);
        assert_eq!(messages, vec![Message::new("a\nb")]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_comment_block_yields_nothing() {
        let (messages, rest) = parse(b":ok\n\n");
        assert!(messages.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_retry_field() {
        let (messages, _) = parse(b"retry: 12\n\nretry: 12x\n\n");
        assert_eq!(messages[0].retry(), Some(Duration::from_millis(12)));
        assert_eq!(messages[1].retry(), None);
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom(b"\xEF\xBB\xBFdata: x"), b"data: x");
        assert_eq!(strip_bom(b"data: x"), b"data: x");
        assert_eq!(strip_bom(b"\xEF\xBB"), b"\xEF\xBB");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let input = "data: héllo wörld\n\n".as_bytes();
        let cut = input.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let (messages, _) = parse_in_pieces(input, &[cut]);
        assert_eq!(messages, vec![Message::new("héllo wörld")]);
    }
}
