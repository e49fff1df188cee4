use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::LedgerError;

pub const SERIAL_MIN_LEN: usize = 9;
pub const SERIAL_MAX_LEN: usize = 11;

const PRINTED_SERIAL_LEN: usize = 11;
const PRINTED_SERIAL_DIGITS: usize = 8;

/// Serials drawn in the competition. Lookup is exact on the normalized form.
pub const WINNING_SERIALS: [&str; 100] = [
    "AH28519618B", "AH28519616B", "AH28519613B", "AH28519611B", "AH28519609B",
    "AH28519607B", "AH28519605B", "AH28519603B", "AH27519700B", "AH27519697B",
    "AH27519695B", "AH27519693B", "AH27519691B", "AH27519689B", "AH27519687B",
    "AH27519682B", "AH27519679B", "AH27519675B", "AH27519673B", "AH27519670B",
    "AH27519668B", "AH27519666B", "AH27519663B", "AH27519661B", "AH27519658B",
    "AH27519655B", "AH27519653B", "AH27519650B", "AH27519646B", "AH27519643B",
    "AH27519640B", "AH27519632B", "AH27519628B", "AH27519625B", "AH27519622B",
    "AH27519618B", "AH27519615B", "AH27519609B", "AH27519605B", "AH27519602B",
    "AH26519700B", "AH26519698B", "AH26519695B", "AH26519693B", "AH26519691B",
    "AH26519689B", "AH26519687B", "AH26519685B", "AH26519683B", "AH26519681B",
    "AH28519617B", "AH28519615B", "AH28519612B", "AH28519610B", "AH28519608B",
    "AH28519606B", "AH28519604B", "AH28519602B", "AH27519699B", "AH27519696B",
    "AH27519694B", "AH27519692B", "AH27519690B", "AH27519688B", "AH27519686B",
    "AH27519681B", "AH27519676B", "AH27519674B", "AH27519671B", "AH27519669B",
    "AH27519667B", "AH27519664B", "AH27519662B", "AH27519659B", "AH27519656B",
    "AH27519654B", "AH27519652B", "AH27519647B", "AH27519644B", "AH27519641B",
    "AH27519638B", "AH27519631B", "AH27519626B", "AH27519623B", "AH27519620B",
    "AH27519617B", "AH27519612B", "AH27519606B", "AH27519604B", "AH27519601B",
    "AH26519699B", "AH26519696B", "AH26519694B", "AH26519692B", "AH26519690B",
    "AH26519688B", "AH26519686B", "AH26519684B", "AH26519682B", "AH27519634B",
];

/// Accepts exactly `^[A-Z]{2}[0-9]{6,8}[A-Z]$`.
///
/// The check is strict: no trimming, no case folding, no partial matches.
#[must_use]
pub fn validate_serial_number(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if !(SERIAL_MIN_LEN..=SERIAL_MAX_LEN).contains(&bytes.len()) {
        return false;
    }

    let last = bytes.len() - 1;
    bytes[0].is_ascii_uppercase()
        && bytes[1].is_ascii_uppercase()
        && bytes[2..last].iter().all(u8::is_ascii_digit)
        && bytes[last].is_ascii_uppercase()
}

/// Trims surrounding whitespace and uppercases, as the handler does before
/// validating a submitted serial.
#[must_use]
pub fn normalize_serial(candidate: &str) -> String {
    candidate.trim().to_uppercase()
}

/// Interactive input cleanup: uppercase, drop anything outside `[A-Z0-9]`,
/// cap at the longest serial length.
#[must_use]
pub fn sanitize_serial_input(raw: &str) -> String {
    raw.to_uppercase()
        .chars()
        .filter(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
        .take(SERIAL_MAX_LEN)
        .collect()
}

/// A serial number that passed [`validate_serial_number`] after
/// normalization. Every stored query event carries one of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Normalizes and validates a candidate.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the normalized candidate does
    /// not match the serial format.
    pub fn parse(candidate: &str) -> Result<Self, LedgerError> {
        let normalized = normalize_serial(candidate);
        if validate_serial_number(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(LedgerError::Validation(
                "Invalid serial number format".to_string(),
            ))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_winner(&self) -> bool {
        is_winning_serial(self)
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SerialNumber> for String {
    fn from(value: SerialNumber) -> Self {
        value.0
    }
}

#[must_use]
pub fn is_winning_serial(serial: &SerialNumber) -> bool {
    WINNING_SERIALS
        .iter()
        .any(|winner| *winner == serial.as_str())
}

/// Picks the most plausible serial out of free-form recognized text.
///
/// A full printed serial (two letters, eight digits, one letter) wins
/// outright. Otherwise looser runs are considered and the one whose length is
/// closest to a printed serial is kept, truncated to eleven characters. The
/// result is only a candidate and still has to pass validation.
#[must_use]
pub fn extract_serial_candidate(text: &str) -> Option<String> {
    // Matching is case-insensitive: recognizers often emit lowercase letters
    // for printed capitals, and the candidate comes back uppercased.
    let upper = text.to_uppercase();
    let bytes = upper.as_bytes();

    if let Some(start) = find_printed_serial(bytes) {
        return Some(ascii_string(&bytes[start..start + PRINTED_SERIAL_LEN]));
    }

    let mut best: Option<&[u8]> = None;
    for candidate in LooseRuns::new(bytes) {
        let best_distance = best.map_or(PRINTED_SERIAL_LEN, |item| {
            item.len().abs_diff(PRINTED_SERIAL_LEN)
        });
        if candidate.len().abs_diff(PRINTED_SERIAL_LEN) < best_distance {
            best = Some(candidate);
        }
    }

    let best = best?;
    if (SERIAL_MIN_LEN..=13).contains(&best.len()) {
        Some(ascii_string(&best[..best.len().min(PRINTED_SERIAL_LEN)]))
    } else {
        None
    }
}

fn find_printed_serial(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < PRINTED_SERIAL_LEN {
        return None;
    }

    (0..=bytes.len() - PRINTED_SERIAL_LEN).find(|&start| {
        let window = &bytes[start..start + PRINTED_SERIAL_LEN];
        window[0].is_ascii_uppercase()
            && window[1].is_ascii_uppercase()
            && window[2..2 + PRINTED_SERIAL_DIGITS]
                .iter()
                .all(u8::is_ascii_digit)
            && window[PRINTED_SERIAL_LEN - 1].is_ascii_uppercase()
    })
}

fn ascii_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

fn run_length(bytes: &[u8], from: usize, max: usize, pred: fn(&u8) -> bool) -> usize {
    bytes
        .get(from..)
        .unwrap_or_default()
        .iter()
        .take_while(|byte| pred(*byte))
        .take(max)
        .count()
}

/// Non-overlapping leftmost matches of `[A-Z]{1,3}[0-9]{6,10}[A-Z]{0,2}`.
struct LooseRuns<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LooseRuns<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn match_at(&self, start: usize) -> Option<usize> {
        // Letter runs longer than three cannot be followed by a digit here.
        let letters = run_length(self.bytes, start, 4, u8::is_ascii_uppercase);
        if !(1..=3).contains(&letters) {
            return None;
        }

        let digits = run_length(self.bytes, start + letters, 10, u8::is_ascii_digit);
        if digits < 6 {
            return None;
        }

        let trailing = run_length(
            self.bytes,
            start + letters + digits,
            2,
            u8::is_ascii_uppercase,
        );
        Some(start + letters + digits + trailing)
    }
}

impl<'a> Iterator for LooseRuns<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.bytes.len() {
            let start = self.pos;
            if let Some(end) = self.match_at(start) {
                self.pos = end;
                return Some(&self.bytes[start..end]);
            }
            self.pos += 1;
        }
        None
    }
}
