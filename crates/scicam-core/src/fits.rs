//! Minimal FITS writer for single-image 16-bit unsigned frames.
//!
//! Produces a primary HDU with `BITPIX = 16` and `BZERO = 32768`, the
//! standard encoding of unsigned 16-bit data. Headers are written as
//! fixed-format 80 character cards and both the header and data units are
//! padded to 2880 byte blocks.

use thiserror::Error;

pub const CARD_LENGTH: usize = 80;
pub const BLOCK_LENGTH: usize = 2880;

const KEYWORD_LENGTH: usize = 8;
const VALUE_FIELD_LENGTH: usize = 20;
const BZERO_U16: i32 = 32768;
/// `BSCALE` and `BZERO`.
const SCALING_CARDS: usize = 2;

#[derive(Error, Debug)]
pub enum FitsError {
    #[error("image must have non-zero dimensions, got {width}x{height}")]
    EmptyImage { width: usize, height: usize },
    #[error("pixel buffer has {actual} pixels, expected {expected}")]
    DataLength { expected: usize, actual: usize },
    #[error("invalid keyword `{0}`")]
    InvalidKeyword(String),
}

/// Value of a keyword card.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        // Counters never approach i64::MAX in practice
        Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            Value::Float(value)
        } else {
            Value::Str(value.to_string())
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// A single header card.
#[derive(Debug, Clone, PartialEq)]
pub enum Card {
    Keyword {
        keyword: String,
        value: Value,
        comment: String,
    },
    Comment(String),
    Blank,
}

impl Card {
    pub fn new(keyword: &str, value: impl Into<Value>, comment: &str) -> Self {
        Card::Keyword {
            keyword: keyword.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        }
    }

    pub fn comment(text: &str) -> Self {
        Card::Comment(text.to_string())
    }

    /// Render the card as exactly 80 ASCII characters.
    pub fn encode(&self) -> Result<String, FitsError> {
        let mut card = match self {
            Card::Blank => String::new(),
            Card::Comment(text) => format!("{:<KEYWORD_LENGTH$}{}", "COMMENT", ascii(text)),
            Card::Keyword {
                keyword,
                value,
                comment,
            } => {
                validate_keyword(keyword)?;
                let mut card = format!("{keyword:<KEYWORD_LENGTH$}= {}", format_value(value));
                if !comment.is_empty() {
                    card.push_str(" / ");
                    card.push_str(&ascii(comment));
                }
                card
            }
        };

        if card.len() > CARD_LENGTH {
            tracing::debug!(card = %card, "truncating header card");
            card.truncate(CARD_LENGTH);
        }
        Ok(format!("{card:<CARD_LENGTH$}"))
    }
}

fn validate_keyword(keyword: &str) -> Result<(), FitsError> {
    let valid = !keyword.is_empty()
        && keyword.len() <= KEYWORD_LENGTH
        && keyword
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(FitsError::InvalidKeyword(keyword.to_string()))
    }
}

/// Replace anything outside printable ASCII, which FITS headers forbid.
fn ascii(text: &str) -> String {
    text.chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '?' })
        .collect()
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Str(s) => {
            let quoted = format!("'{:<KEYWORD_LENGTH$}'", ascii(s).replace('\'', "''"));
            format!("{quoted:<VALUE_FIELD_LENGTH$}")
        }
        Value::Int(i) => format!("{i:>VALUE_FIELD_LENGTH$}"),
        Value::Bool(b) => format!("{:>VALUE_FIELD_LENGTH$}", if *b { "T" } else { "F" }),
        Value::Float(f) => format!("{:>VALUE_FIELD_LENGTH$}", format_float(*f)),
    }
}

/// Shortest round-trip representation, always with a decimal point and an
/// upper-case exponent marker.
fn format_float(value: f64) -> String {
    let repr = format!("{value:?}");
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let mantissa = if mantissa.contains('.') {
                mantissa.to_string()
            } else {
                format!("{mantissa}.0")
            };
            format!("{mantissa}E{exponent}")
        }
        None if repr.contains('.') => repr,
        None => format!("{repr}.0"),
    }
}

/// Encode a primary HDU holding a `width` x `height` image.
///
/// `cards` follow the mandatory structural keywords. When
/// `card_capacity` exceeds the resulting card count, blank cards are
/// appended so the header keeps room for that many cards plus `END`.
/// `BSCALE` and `BZERO` are not counted against the capacity, so files
/// keep the same layout as those written by astropy.
pub fn encode_image(
    width: usize,
    height: usize,
    pixels: &[u16],
    cards: &[Card],
    card_capacity: usize,
) -> Result<Vec<u8>, FitsError> {
    if width == 0 || height == 0 {
        return Err(FitsError::EmptyImage { width, height });
    }
    let expected = width * height;
    if pixels.len() != expected {
        return Err(FitsError::DataLength {
            expected,
            actual: pixels.len(),
        });
    }

    let mut header: Vec<Card> = vec![
        Card::new("SIMPLE", true, "conforms to FITS standard"),
        Card::new("BITPIX", 16i64, "array data type"),
        Card::new("NAXIS", 2i64, "number of array dimensions"),
        Card::new("NAXIS1", width as i64, ""),
        Card::new("NAXIS2", height as i64, ""),
        Card::new("EXTEND", true, ""),
        Card::new("BSCALE", 1i64, ""),
        Card::new("BZERO", i64::from(BZERO_U16), ""),
    ];
    header.extend_from_slice(cards);

    let padding = card_capacity.saturating_sub(header.len() - SCALING_CARDS + 1);
    header.extend(std::iter::repeat(Card::Blank).take(padding));

    let header_cards = header.len() + 1;
    let header_bytes = padded_len(header_cards * CARD_LENGTH);
    let data_bytes = padded_len(expected * 2);
    let mut out = Vec::with_capacity(header_bytes + data_bytes);

    for card in &header {
        out.extend_from_slice(card.encode()?.as_bytes());
    }
    out.extend_from_slice(format!("{:<CARD_LENGTH$}", "END").as_bytes());
    out.resize(header_bytes, b' ');

    for &pixel in pixels {
        let stored = (i32::from(pixel) - BZERO_U16) as i16;
        out.extend_from_slice(&stored.to_be_bytes());
    }
    out.resize(header_bytes + data_bytes, 0);

    Ok(out)
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_LENGTH) * BLOCK_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_cards(bytes: &[u8]) -> Vec<String> {
        let mut cards = Vec::new();
        for chunk in bytes.chunks(CARD_LENGTH) {
            let card = String::from_utf8(chunk.to_vec()).unwrap();
            let end = card.starts_with("END ");
            cards.push(card);
            if end {
                break;
            }
        }
        cards
    }

    #[test]
    fn test_string_card_layout() {
        let card = Card::new("CAMID", "CAM1", "camera identifier").encode().unwrap();
        assert_eq!(card.len(), 80);
        assert_eq!(&card[..10], "CAMID   = ");
        // Strings are padded to at least 8 characters inside the quotes
        assert_eq!(&card[10..20], "'CAM1    '");
        assert_eq!(&card[30..52], " / camera identifier  ");
    }

    #[test]
    fn test_string_quotes_escaped() {
        let card = Card::new("CAMERA", "it's", "").encode().unwrap();
        assert!(card.starts_with("CAMERA  = 'it''s    '"));
    }

    #[test]
    fn test_numeric_cards_right_aligned() {
        let card = Card::new("EXPCNT", 42u64, "").encode().unwrap();
        assert_eq!(&card[10..30], format!("{:>20}", 42));

        let card = Card::new("TEC-LOCK", true, "").encode().unwrap();
        assert_eq!(card.as_bytes()[29], b'T');

        let card = Card::new("CAM-TEMP", -40.0, "").encode().unwrap();
        assert_eq!(card[10..30].trim(), "-40.0");
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.125), "0.125");
        assert_eq!(format_float(1e-7), "1.0E-7");
        assert_eq!(format_float(2.5e20), "2.5E20");
    }

    #[test]
    fn test_non_finite_float_becomes_string() {
        assert_eq!(Value::from(f64::NAN), Value::Str("NaN".into()));
    }

    #[test]
    fn test_comment_and_blank_cards() {
        let card = Card::comment(" TEMP-SET not available").encode().unwrap();
        assert_eq!(card.trim_end(), "COMMENT  TEMP-SET not available");
        assert_eq!(Card::Blank.encode().unwrap(), " ".repeat(80));
    }

    #[test]
    fn test_long_card_truncated() {
        let long = "x".repeat(100);
        let card = Card::new("CAMERA", "model", &long).encode().unwrap();
        assert_eq!(card.len(), 80);
    }

    #[test]
    fn test_invalid_keyword() {
        assert!(Card::new("lower", 1i64, "").encode().is_err());
        assert!(Card::new("TOOLONGKEY", 1i64, "").encode().is_err());
    }

    #[test]
    fn test_image_layout() {
        let pixels: Vec<u16> = vec![0, 1, 32768, 65535];
        let bytes = encode_image(2, 2, &pixels, &[], 0).unwrap();
        assert_eq!(bytes.len(), 2 * BLOCK_LENGTH);

        let cards = header_cards(&bytes);
        assert!(cards[0].starts_with("SIMPLE  =                    T"));
        assert!(cards[3].starts_with("NAXIS1  =                    2"));
        assert!(cards.last().unwrap().starts_with("END"));

        let data = &bytes[BLOCK_LENGTH..];
        assert_eq!(&data[0..2], &(-32768i16).to_be_bytes());
        assert_eq!(&data[2..4], &(-32767i16).to_be_bytes());
        assert_eq!(&data[4..6], &0i16.to_be_bytes());
        assert_eq!(&data[6..8], &32767i16.to_be_bytes());
        assert!(data[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_padding_to_capacity() {
        let cards = vec![Card::new("CAMID", "CAM1", "")];
        let bytes = encode_image(1, 1, &[0], &cards, 100).unwrap();
        let header = header_cards(&bytes);
        // 99 cards plus END, plus the uncounted BSCALE and BZERO
        assert_eq!(header.len(), 102);
        assert!(header[6].starts_with("BSCALE"));
        assert!(header[7].starts_with("BZERO"));
        assert!(header[8].starts_with("CAMID"));
        assert_eq!(header[9], " ".repeat(80));
        assert_eq!(header[100], " ".repeat(80));
        assert!(header[101].starts_with("END"));

        // Capacity smaller than the header adds nothing
        let bytes = encode_image(1, 1, &[0], &cards, 3).unwrap();
        assert_eq!(header_cards(&bytes).len(), 10);
    }

    #[test]
    fn test_large_header_spans_blocks() {
        let bytes = encode_image(1, 1, &[0], &[], 40).unwrap();
        // 42 cards = 3360 bytes -> two header blocks, one data block
        assert_eq!(bytes.len(), 3 * BLOCK_LENGTH);
    }

    #[test]
    fn test_data_length_mismatch() {
        assert!(matches!(
            encode_image(2, 2, &[0; 3], &[], 0),
            Err(FitsError::DataLength { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            encode_image(0, 2, &[], &[], 0),
            Err(FitsError::EmptyImage { .. })
        ));
    }
}
