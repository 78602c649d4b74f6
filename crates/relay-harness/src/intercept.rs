//! Parsing of the relay's intercepted-traffic log.
//!
//! The relay prints, for every chunk it forwards:
//!
//! ```text
//! A -> B sent 4 bytes
//! 00000000  41 41 41 0a                                       |AAA.            |
//! B is in sync
//! ```
//!
//! Rows continuing a partially printed row leave the already printed columns
//! blank. Lines may be wrapped in ANSI color escapes. [`parse`] rebuilds, per
//! direction, the bytes the relay claims to have forwarded so they can be
//! verified like any endpoint ledger.

use crate::ledger::ByteLedger;

/// What the relay reported for one direction of traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionLog {
    pub from: String,
    pub to: String,
    /// Sum of the `sent N bytes` announcements.
    pub announced: usize,
    /// Bytes recovered from the dump rows.
    pub bytes: Vec<u8>,
    /// Last reported backlog towards `to`; `Some(0)` means in sync.
    pub behind: Option<usize>,
    /// The relay reported this flow as shut down.
    pub shutdown: bool,
    /// Rows whose offset did not continue the previous row.
    pub offset_gaps: usize,
}

impl DirectionLog {
    fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            ..Self::default()
        }
    }

    /// The recovered bytes as a single-chunk ledger.
    pub fn ledger(&self) -> ByteLedger {
        std::iter::once(self.bytes.clone()).collect()
    }

    pub fn is_in_sync(&self) -> bool {
        self.behind == Some(0)
    }
}

/// Everything recovered from a relay's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptLog {
    pub directions: Vec<DirectionLog>,
    /// `(a_to_b, b_to_a)` from the `Allocating buffers` line.
    pub buf_sizes: Option<(usize, usize)>,
}

impl InterceptLog {
    pub fn direction(&self, from: &str, to: &str) -> Option<&DirectionLog> {
        self.directions
            .iter()
            .find(|d| d.from == from && d.to == to)
    }

    fn direction_mut(&mut self, from: &str, to: &str) -> usize {
        match self
            .directions
            .iter()
            .position(|d| d.from == from && d.to == to)
        {
            Some(i) => i,
            None => {
                self.directions.push(DirectionLog::new(from, to));
                self.directions.len() - 1
            }
        }
    }

    fn towards(&mut self, to: &str) -> Option<&mut DirectionLog> {
        self.directions.iter_mut().find(|d| d.to == to)
    }
}

/// Remove ANSI CSI escape sequences (`ESC [ ... final`).
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Parse the complete lines of `script`; a trailing partial line is ignored
/// until the rest of it was drained.
pub fn parse(script: &str) -> InterceptLog {
    let clean = strip_ansi(script);
    let complete = match clean.rfind('\n') {
        Some(end) => &clean[..end],
        None => "",
    };

    let mut log = InterceptLog::default();
    let mut current: Option<usize> = None;

    for line in complete.lines() {
        if let Some(offset) = row_offset(line) {
            match current {
                Some(i) => parse_row(&mut log.directions[i], offset, line),
                None => tracing::warn!(line, "dump row without a preceding header"),
            }
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [from, "->", to, "sent", n, "bytes"] => {
                let i = log.direction_mut(from, to);
                log.directions[i].announced += n.parse::<usize>().unwrap_or(0);
                current = Some(i);
            }
            [from, "->", to, "flow", "shutdown"] => {
                let i = log.direction_mut(from, to);
                log.directions[i].shutdown = true;
                current = None;
            }
            [to, "is", "in", "sync"] => {
                if let Some(d) = log.towards(to) {
                    d.behind = Some(0);
                }
            }
            [to, "is", n, "bytes", "behind"] => {
                let n = n.parse::<usize>().ok();
                if let Some(d) = log.towards(to) {
                    d.behind = n;
                }
            }
            ["Allocating", "buffers:", a, "and", b, "bytes..."] => {
                if let (Ok(a), Ok(b)) = (a.parse::<usize>(), b.parse::<usize>()) {
                    log.buf_sizes = Some((a, b));
                }
            }
            _ => {}
        }
    }

    log
}

fn row_offset(line: &str) -> Option<usize> {
    let head = line.get(..10)?;
    if !head.ends_with("  ") {
        return None;
    }
    let digits = &head[..8];
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(digits, 16).ok()
}

fn parse_row(direction: &mut DirectionLog, offset: usize, line: &str) {
    if offset != direction.bytes.len() {
        direction.offset_gaps += 1;
        tracing::warn!(
            offset,
            expected = direction.bytes.len(),
            "dump row offset does not continue the stream"
        );
    }
    let hex = match line[10..].find('|') {
        Some(end) => &line[10..10 + end],
        None => &line[10..],
    };
    for token in hex.split_whitespace() {
        match u8::from_str_radix(token, 16) {
            Ok(byte) => direction.bytes.push(byte),
            Err(_) => tracing::warn!(token, "unparseable byte in dump row"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "Connecting to B localhost:9001...\n\
Waiting for a connection from A localhost:9000...\n\
Allocating buffers: 1 and 2048 bytes...\n\
\x1b[91mA -> B sent 2 bytes\n\
\x1b[1m00000000  41 41                                             |AA              |\n\
\x1b[0m\x1b[91mB is 2 bytes behind\n\
\x1b[0m\x1b[91mA -> B sent 2 bytes\n\
\x1b[1m00000002        41 0a                                       |  A.            |\n\
\x1b[0m\x1b[91mB is in sync\n\
\x1b[0m\x1b[94mB -> A sent 4 bytes\n\
\x1b[1m00000000  42 42 42 0a                                       |BBB.            |\n\
\x1b[0m\x1b[94mA is in sync\n\
\x1b[0m\x1b[91mA -> B flow shutdown\n\
\x1b[0m00000000  ff";

    #[test]
    fn rebuilds_both_directions() {
        let log = parse(SCRIPT);

        let a_to_b = log.direction("A", "B").expect("A -> B");
        assert_eq!(a_to_b.bytes, b"AAA\n".to_vec());
        assert_eq!(a_to_b.announced, 4);
        assert!(a_to_b.is_in_sync());
        assert!(a_to_b.shutdown);
        assert_eq!(a_to_b.offset_gaps, 0);

        let b_to_a = log.direction("B", "A").expect("B -> A");
        assert_eq!(b_to_a.bytes, b"BBB\n".to_vec());
        assert!(!b_to_a.shutdown);

        assert_eq!(log.buf_sizes, Some((1, 2048)));
    }

    #[test]
    fn trailing_partial_line_is_ignored() {
        let log = parse("A -> B sent 1 bytes\n00000000  7a    ");
        let a_to_b = log.direction("A", "B").unwrap();
        assert_eq!(a_to_b.announced, 1);
        assert!(a_to_b.bytes.is_empty());
    }

    #[test]
    fn backlog_is_tracked_per_receiver() {
        let log = parse("A -> B sent 1024 bytes\nB is 3072 bytes behind\n");
        assert_eq!(log.direction("A", "B").unwrap().behind, Some(3072));
    }

    #[test]
    fn strip_ansi_keeps_plain_text() {
        assert_eq!(strip_ansi("\x1b[91mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn rows_split_across_chunks_rebuild_the_stream() {
        let payload: Vec<u8> = (0u8..=255).cycle().skip(30).take(100).collect();
        let mut script = String::new();
        let mut offset = 0;
        for chunk in payload.chunks(7) {
            script.push_str(&format!("A -> B sent {} bytes\n", chunk.len()));
            script.push_str(&crate::hexdump::rows(offset, chunk));
            offset += chunk.len();
        }

        let log = parse(&script);
        let a_to_b = log.direction("A", "B").unwrap();
        assert_eq!(a_to_b.bytes, payload);
        assert_eq!(a_to_b.announced, payload.len());
        assert_eq!(a_to_b.offset_gaps, 0);
    }

    #[test]
    fn offset_gaps_are_counted() {
        let log = parse("A -> B sent 1 bytes\n00000010  41 |A|\n");
        assert_eq!(log.direction("A", "B").unwrap().offset_gaps, 1);
    }
}
