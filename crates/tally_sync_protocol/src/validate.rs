//! Local payload validation.
//!
//! These are the same rules the server enforces on create and update.
//! Running them before an optimistic write keeps obviously bad payloads
//! out of the ledger, where they would only come back as rejections.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{Challenge, Entry, Follow, Timeframe, TimeframeUnit};

/// Longest allowed challenge name, in characters.
pub const MAX_NAME_LEN: usize = 100;

/// Longest allowed entry note, in characters.
pub const MAX_NOTE_LEN: usize = 500;

/// Returns true for `YYYY-MM-DD`.
pub fn is_valid_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Returns true for `#RGB` or `#RRGGBB`.
pub fn is_valid_color(value: &str) -> bool {
    match value.strip_prefix('#') {
        Some(hex) => {
            (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

pub(crate) fn challenge(c: &Challenge) -> ProtocolResult<()> {
    let name_len = c.name.chars().count();
    if name_len == 0 {
        return Err(ProtocolError::invalid("name", "name is required"));
    }
    if name_len > MAX_NAME_LEN {
        return Err(ProtocolError::invalid("name", "name too long"));
    }
    if c.target == 0 {
        return Err(ProtocolError::invalid("target", "target must be positive"));
    }
    if !is_valid_color(&c.color) {
        return Err(ProtocolError::invalid("color", "invalid hex color"));
    }
    if c.icon.is_empty() {
        return Err(ProtocolError::invalid("icon", "icon is required"));
    }
    timeframe(&c.timeframe)
}

fn timeframe(t: &Timeframe) -> ProtocolResult<()> {
    for date in [&t.start_date, &t.end_date].into_iter().flatten() {
        if !is_valid_date(date) {
            return Err(ProtocolError::invalid(
                "timeframe",
                "date must be YYYY-MM-DD format",
            ));
        }
    }

    if t.unit == TimeframeUnit::Custom {
        match (&t.start_date, &t.end_date) {
            // Fixed-width ISO dates order lexicographically.
            (Some(start), Some(end)) if start <= end => {}
            (Some(_), Some(_)) => {
                return Err(ProtocolError::invalid(
                    "timeframe",
                    "start date must not be after end date",
                ))
            }
            _ => {
                return Err(ProtocolError::invalid(
                    "timeframe",
                    "custom timeframe needs start and end dates",
                ))
            }
        }
    }
    Ok(())
}

pub(crate) fn entry(e: &Entry) -> ProtocolResult<()> {
    if e.challenge_id.is_empty() {
        return Err(ProtocolError::invalid("challenge_id", "ID is required"));
    }
    if !is_valid_date(&e.date) {
        return Err(ProtocolError::invalid(
            "date",
            "date must be YYYY-MM-DD format",
        ));
    }
    if let Some(note) = &e.note {
        if note.chars().count() > MAX_NOTE_LEN {
            return Err(ProtocolError::invalid("note", "note too long"));
        }
    }
    Ok(())
}

pub(crate) fn follow(f: &Follow) -> ProtocolResult<()> {
    if f.challenge_id.is_empty() {
        return Err(ProtocolError::invalid("challenge_id", "ID is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, Visibility};
    use proptest::prelude::*;

    fn challenge_fixture() -> Challenge {
        Challenge {
            id: "c-1".into(),
            name: "Push-ups".into(),
            target: 10_000,
            timeframe: Timeframe::year(),
            color: "#ff8800".into(),
            icon: "dumbbell".into(),
            visibility: Visibility::Private,
            archived: false,
            created_at: 0,
        }
    }

    fn entry_fixture() -> Entry {
        Entry {
            id: "e-1".into(),
            challenge_id: "c-1".into(),
            date: "2026-03-14".into(),
            count: 25,
            note: None,
            sets: vec![],
            feeling: None,
            created_at: 0,
        }
    }

    fn field_of(err: ProtocolError) -> &'static str {
        match err {
            ProtocolError::Invalid { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn valid_fixtures_pass() {
        assert!(challenge_fixture().validate().is_ok());
        assert!(entry_fixture().validate().is_ok());
    }

    #[test]
    fn colors() {
        assert!(is_valid_color("#abc"));
        assert!(is_valid_color("#A1B2C3"));
        assert!(!is_valid_color("abc"));
        assert!(!is_valid_color("#abcd"));
        assert!(!is_valid_color("#ggg"));
    }

    #[test]
    fn dates() {
        assert!(is_valid_date("2026-01-31"));
        assert!(!is_valid_date("2026-1-31"));
        assert!(!is_valid_date("2026/01/31"));
        assert!(!is_valid_date("2026-01-31T00"));
    }

    #[test]
    fn challenge_rules() {
        let mut c = challenge_fixture();
        c.name = String::new();
        assert_eq!(field_of(c.validate().unwrap_err()), "name");

        let mut c = challenge_fixture();
        c.name = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(field_of(c.validate().unwrap_err()), "name");

        let mut c = challenge_fixture();
        c.target = 0;
        assert_eq!(field_of(c.validate().unwrap_err()), "target");

        let mut c = challenge_fixture();
        c.icon = String::new();
        assert_eq!(field_of(c.validate().unwrap_err()), "icon");
    }

    #[test]
    fn name_length_counts_characters() {
        let mut c = challenge_fixture();
        c.name = "é".repeat(MAX_NAME_LEN);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn custom_timeframe_needs_ordered_dates() {
        let mut c = challenge_fixture();
        c.timeframe = Timeframe::custom("2026-01-01", "2026-06-30");
        assert!(c.validate().is_ok());

        c.timeframe = Timeframe::custom("2026-07-01", "2026-06-30");
        assert_eq!(field_of(c.validate().unwrap_err()), "timeframe");

        c.timeframe.end_date = None;
        assert_eq!(field_of(c.validate().unwrap_err()), "timeframe");
    }

    #[test]
    fn entry_rules() {
        let mut e = entry_fixture();
        e.challenge_id = String::new();
        assert_eq!(field_of(e.validate().unwrap_err()), "challenge_id");

        let mut e = entry_fixture();
        e.note = Some("n".repeat(MAX_NOTE_LEN));
        assert!(e.validate().is_ok());
        e.note = Some("n".repeat(MAX_NOTE_LEN + 1));
        assert_eq!(field_of(e.validate().unwrap_err()), "note");
    }

    #[test]
    fn follow_needs_challenge() {
        let f = Follow {
            id: "f-1".into(),
            challenge_id: String::new(),
            followed_at: 0,
            created_at: 0,
        };
        assert_eq!(field_of(f.validate().unwrap_err()), "challenge_id");
    }

    proptest! {
        #[test]
        fn generated_dates_validate(y in 1000u32..9999, m in 1u32..=12, d in 1u32..=28) {
            let date = format!("{y:04}-{m:02}-{d:02}");
            prop_assert!(is_valid_date(&date));
        }
    }
}
