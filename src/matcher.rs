//! Byte-at-a-time, case-insensitive pattern matchers used by the response
//! parser. Both matchers keep their entire progress in a small `Copy` value
//! so a match can straddle any number of input chunks.

/// Header fields the parser knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Server,
    ContentLength,
    ContentType,
    Via,
    Location,
    /// Any other `name:`.
    Unknown,
    /// End of line reached before a colon.
    Newline,
}

/// Field names anchored at the start of a header line. Every entry ends in
/// `:` so a hit on one of these always wins over the bare `:` fallback.
const FIELD_NAMES: [(&[u8], Field); 5] = [
    (b"server:", Field::Server),
    (b"content-length:", Field::ContentLength),
    (b"content-type:", Field::ContentType),
    (b"via:", Field::Via),
    (b"location:", Field::Location),
];

/// Progress through a header field name.
///
/// `Anchored` walks the anchored name table the way a trie would: `pattern`
/// is the first table entry consistent with every byte seen so far and
/// `matched` is how many of its bytes have been seen. Once no named entry
/// can match, the scan drops to `Unanchored` and only waits for `:` or a
/// newline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldScan {
    Anchored { pattern: u8, matched: u8 },
    Unanchored,
}

impl Default for FieldScan {
    fn default() -> Self {
        FieldScan::Anchored {
            pattern: 0,
            matched: 0,
        }
    }
}

impl FieldScan {
    /// Feeds one byte of a field name. Returns the field once its name has
    /// been terminated by `:` (or the line ended).
    pub fn step(self, byte: u8) -> (FieldScan, Option<Field>) {
        if byte == b'\n' {
            return (FieldScan::default(), Some(Field::Newline));
        }
        let byte = byte.to_ascii_lowercase();
        if let FieldScan::Anchored { pattern, matched } = self {
            if let Some(next) = advance_anchored(pattern as usize, matched as usize, byte) {
                let (name, field) = FIELD_NAMES[next];
                let matched = matched as usize + 1;
                if matched == name.len() {
                    return (FieldScan::default(), Some(field));
                }
                return (
                    FieldScan::Anchored {
                        pattern: next as u8,
                        matched: matched as u8,
                    },
                    None,
                );
            }
        }
        if byte == b':' {
            (FieldScan::default(), Some(Field::Unknown))
        } else {
            (FieldScan::Unanchored, None)
        }
    }
}

fn advance_anchored(pattern: usize, matched: usize, byte: u8) -> Option<usize> {
    let prefix = &FIELD_NAMES[pattern].0[..matched];
    FIELD_NAMES
        .iter()
        .enumerate()
        .skip(pattern)
        .find(|(_, (name, _))| {
            name.len() > matched && name.starts_with(prefix) && name[matched] == byte
        })
        .map(|(index, _)| index)
}

/// Opening of the HTML title element. `<` only occurs at the start, so on a
/// mismatch the scan can restart without a failure table.
const TITLE_TAG: &[u8] = b"<title";

/// Number of bytes of `<title` matched so far, anywhere in the body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagScan(u8);

impl TagScan {
    /// Feeds one body byte; returns true when the tag opener completes.
    pub fn step(&mut self, byte: u8) -> bool {
        let byte = byte.to_ascii_lowercase();
        let matched = self.0 as usize;
        if TITLE_TAG[matched] == byte {
            if matched + 1 == TITLE_TAG.len() {
                self.0 = 0;
                return true;
            }
            self.0 += 1;
        } else if byte == TITLE_TAG[0] {
            self.0 = 1;
        } else {
            self.0 = 0;
        }
        false
    }
}
