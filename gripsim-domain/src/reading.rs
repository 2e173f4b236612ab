//! Grip-force readings and their textual wire format.
//!
//! The grip-data characteristic carries ASCII text of the form
//! `L1:<n> L2:<n> L3:<n> R1:<n> R2:<n> R3:<n> Score:<n>`; third-party client apps parse
//! exactly this layout, so [`fmt::Display`] and [`FromStr`] are kept strict.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub const MAX_VALUE: u16 = 999;

const FIELDS: [&str; 7] = ["L1", "L2", "L3", "R1", "R2", "R3", "Score"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadingError {
    #[error("{field} value {value} is outside 0..=999")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("expected field {expected}, found '{found}'")]
    UnexpectedField {
        expected: &'static str,
        found: String,
    },
    #[error("malformed token '{0}'")]
    Malformed(String),
}

/// One immutable sample of all six grip sensors plus the derived score.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GripReading {
    left: [u16; 3],
    right: [u16; 3],
    score: u16,
    generated_at: DateTime<Utc>,
}

impl GripReading {
    pub fn new(
        left: [u16; 3],
        right: [u16; 3],
        score: u16,
        generated_at: DateTime<Utc>,
    ) -> Result<GripReading, ReadingError> {
        let values = left.iter().chain(right.iter()).chain(std::iter::once(&score));
        for (field, value) in FIELDS.into_iter().zip(values) {
            checked(field, u32::from(*value))?;
        }
        Ok(GripReading {
            left,
            right,
            score,
            generated_at,
        })
    }

    /// Builds a reading from values already known to be in range, clamping anything above MAX_VALUE.
    pub(crate) fn clamped(
        left: [u16; 3],
        right: [u16; 3],
        score: u16,
        generated_at: DateTime<Utc>,
    ) -> GripReading {
        GripReading {
            left: left.map(|v| v.min(MAX_VALUE)),
            right: right.map(|v| v.min(MAX_VALUE)),
            score: score.min(MAX_VALUE),
            generated_at,
        }
    }

    /// The value exposed before the first generation tick.
    #[must_use]
    pub fn initial(generated_at: DateTime<Utc>) -> GripReading {
        GripReading {
            left: [100, 100, 100],
            right: [100, 100, 100],
            score: 80,
            generated_at,
        }
    }

    pub fn left(&self) -> [u16; 3] {
        self.left
    }

    pub fn right(&self) -> [u16; 3] {
        self.right
    }

    pub fn score(&self) -> u16 {
        self.score
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// L1, L2, L3, R1, R2, R3 in wire order.
    pub fn sensors(&self) -> [u16; 6] {
        let [l1, l2, l3] = self.left;
        let [r1, r2, r3] = self.right;
        [l1, l2, l3, r1, r2, r3]
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn parse_at(text: &str, generated_at: DateTime<Utc>) -> Result<GripReading, ReadingError> {
        let mut values = [0u16; 7];
        let mut tokens = text.trim().split(' ');
        for (slot, field) in values.iter_mut().zip(FIELDS) {
            let token = tokens.next().ok_or(ReadingError::MissingField(field))?;
            let (label, value) = token
                .split_once(':')
                .ok_or_else(|| ReadingError::Malformed(token.to_string()))?;
            if label != field {
                return Err(ReadingError::UnexpectedField {
                    expected: field,
                    found: label.to_string(),
                });
            }
            let value: u32 = value
                .parse()
                .map_err(|_| ReadingError::Malformed(token.to_string()))?;
            *slot = checked(field, value)?;
        }
        if let Some(extra) = tokens.next() {
            return Err(ReadingError::Malformed(extra.to_string()));
        }

        let [l1, l2, l3, r1, r2, r3, score] = values;
        Ok(GripReading {
            left: [l1, l2, l3],
            right: [r1, r2, r3],
            score,
            generated_at,
        })
    }

    pub fn from_payload(
        payload: &[u8],
        generated_at: DateTime<Utc>,
    ) -> Result<GripReading, ReadingError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ReadingError::Malformed(String::from_utf8_lossy(payload).into_owned()))?;
        GripReading::parse_at(text, generated_at)
    }
}

fn checked(field: &'static str, value: u32) -> Result<u16, ReadingError> {
    if value > u32::from(MAX_VALUE) {
        Err(ReadingError::OutOfRange { field, value })
    } else {
        // bounded by MAX_VALUE above
        Ok(value as u16)
    }
}

impl fmt::Display for GripReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [l1, l2, l3] = self.left;
        let [r1, r2, r3] = self.right;
        write!(
            f,
            "L1:{l1} L2:{l2} L3:{l3} R1:{r1} R2:{r2} R3:{r3} Score:{}",
            self.score
        )
    }
}

impl FromStr for GripReading {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GripReading::parse_at(s, Utc::now())
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};

    use super::{GripReading, ReadingError};

    #[test]
    fn wire_format() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let reading = GripReading::new([120, 5, 999], [0, 42, 300], 77, at).unwrap();
        assert_eq!(
            reading.to_string(),
            "L1:120 L2:5 L3:999 R1:0 R2:42 R3:300 Score:77"
        );
        assert_eq!(
            reading.to_payload(),
            b"L1:120 L2:5 L3:999 R1:0 R2:42 R3:300 Score:77".to_vec()
        );
    }

    #[test]
    fn initial_reading() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(
            GripReading::initial(at).to_string(),
            "L1:100 L2:100 L3:100 R1:100 R2:100 R3:100 Score:80"
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(
            GripReading::new([1, 2, 3], [4, 1000, 6], 7, at),
            Err(ReadingError::OutOfRange {
                field: "R2",
                value: 1000
            })
        );
        assert_eq!(
            GripReading::new([1, 2, 3], [4, 5, 6], 1200, at),
            Err(ReadingError::OutOfRange {
                field: "Score",
                value: 1200
            })
        );
    }

    #[test]
    fn parse_wire_text() {
        let at = Utc.timestamp_opt(1, 0).unwrap();
        let reading =
            GripReading::parse_at("L1:1 L2:2 L3:3 R1:4 R2:5 R3:6 Score:7\n", at).unwrap();
        assert_eq!(reading.sensors(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(reading.score(), 7);
        assert_eq!(reading.generated_at(), at);
    }

    #[test]
    fn parse_rejects_bad_text() {
        let at = Utc.timestamp_opt(1, 0).unwrap();
        assert_eq!(
            GripReading::parse_at("L1:1 L2:2 L3:3 R1:4 R2:5 R3:6", at),
            Err(ReadingError::MissingField("Score"))
        );
        assert_eq!(
            GripReading::parse_at("L1:1 L2:2 L3:3 R2:4 R1:5 R3:6 Score:7", at),
            Err(ReadingError::UnexpectedField {
                expected: "R1",
                found: "R2".to_string()
            })
        );
        assert_eq!(
            GripReading::parse_at("L1:1 L2:x L3:3 R1:4 R2:5 R3:6 Score:7", at),
            Err(ReadingError::Malformed("L2:x".to_string()))
        );
        assert_eq!(
            GripReading::parse_at("L1:1  L2:2 L3:3 R1:4 R2:5 R3:6 Score:7", at),
            Err(ReadingError::Malformed("".to_string()))
        );
        assert_eq!(
            GripReading::parse_at("L1:1 L2:2 L3:3 R1:4 R2:5 R3:6 Score:7 X:1", at),
            Err(ReadingError::Malformed("X:1".to_string()))
        );
        assert_eq!(
            GripReading::parse_at("L1:1 L2:2 L3:3 R1:4 R2:5 R3:6 Score:1000", at),
            Err(ReadingError::OutOfRange {
                field: "Score",
                value: 1000
            })
        );
    }

    #[test]
    fn from_payload_requires_utf8() {
        let at = Utc.timestamp_opt(1, 0).unwrap();
        assert!(matches!(
            GripReading::from_payload(&[0xff, 0xfe], at),
            Err(ReadingError::Malformed(_))
        ));
    }
}
