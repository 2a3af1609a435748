//! Frame timestamps embedded by the camera (`DATA:STAMP ON`).
//!
//! The first row of every frame carries the camera clock at exposure start:
//! whole unix seconds packed into pixels 3-5 and a fraction in units of
//! 62.5 us in pixel 2.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Duration of one fractional tick in nanoseconds (62.5 us).
const TICK_NANOS: i64 = 62_500;
const STAMP_PIXELS: usize = 6;

/// Time format used for FITS date cards.
pub const FITS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimestampError {
    #[error("frame row has {0} pixels, timestamp needs {STAMP_PIXELS}")]
    RowTooShort(usize),
    #[error("timestamp {0} is out of range")]
    OutOfRange(i64),
}

/// Decode the exposure start time from the first row of a frame.
pub fn decode_frame_timestamp(row: &[u16]) -> Result<DateTime<Utc>, TimestampError> {
    if row.len() < STAMP_PIXELS {
        return Err(TimestampError::RowTooShort(row.len()));
    }

    let seconds =
        (i64::from(row[5]) << 22) | (i64::from(row[4]) << 10) | (i64::from(row[3]) >> 2);
    let fraction = Duration::nanoseconds(i64::from(row[2]) * TICK_NANOS);

    DateTime::from_timestamp(seconds, 0)
        .map(|t| t + fraction)
        .ok_or(TimestampError::OutOfRange(seconds))
}

/// Write `time` into the first row of a frame the way the camera does.
pub fn encode_frame_timestamp(time: DateTime<Utc>, row: &mut [u16]) -> Result<(), TimestampError> {
    if row.len() < STAMP_PIXELS {
        return Err(TimestampError::RowTooShort(row.len()));
    }
    let seconds = time.timestamp();
    if !(0..(1i64 << 38)).contains(&seconds) {
        return Err(TimestampError::OutOfRange(seconds));
    }

    row[5] = ((seconds >> 22) & 0xffff) as u16;
    row[4] = ((seconds >> 10) & 0xfff) as u16;
    row[3] = ((seconds & 0x3ff) << 2) as u16;
    row[2] = (i64::from(time.timestamp_subsec_nanos()) / TICK_NANOS) as u16;
    Ok(())
}

/// Format a timestamp for a FITS date card.
pub fn format_fits_time(time: &DateTime<Utc>) -> String {
    time.format(FITS_TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_known_stamp() {
        // 2024-01-01T00:00:00Z = 1704067200
        let seconds: i64 = 1_704_067_200;
        let mut row = [0u16; 8];
        row[5] = (seconds >> 22) as u16;
        row[4] = ((seconds >> 10) & 0xfff) as u16;
        row[3] = ((seconds & 0x3ff) << 2) as u16;
        row[2] = 8000; // 8000 * 62.5us = 0.5s

        let t = decode_frame_timestamp(&row).unwrap();
        assert_eq!(format_fits_time(&t), "2024-01-01T00:00:00.500000");
    }

    #[test]
    fn test_low_bits_of_pixel_three_ignored() {
        let mut row = [0u16; 6];
        row[3] = 0b111; // one second, plus two ignored bits
        let t = decode_frame_timestamp(&row).unwrap();
        assert_eq!(t.timestamp(), 1);
    }

    #[test]
    fn test_encode_matches_decode() {
        let time = Utc.with_ymd_and_hms(2025, 6, 30, 22, 15, 7).unwrap()
            + Duration::microseconds(250_125);
        let mut row = vec![0u16; 1280];
        encode_frame_timestamp(time, &mut row).unwrap();
        let decoded = decode_frame_timestamp(&row).unwrap();
        // Fractional part is quantised to 62.5us ticks
        let error = (decoded - time).num_microseconds().unwrap().abs();
        assert!(error < 63, "error {error}us");
        assert_eq!(decoded.timestamp(), time.timestamp());
    }

    #[test]
    fn test_short_row() {
        assert_eq!(
            decode_frame_timestamp(&[0u16; 5]),
            Err(TimestampError::RowTooShort(5))
        );
    }

    #[test]
    fn test_fits_time_format() {
        let t = Utc.with_ymd_and_hms(2023, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_fits_time(&t), "2023-03-04T05:06:07.000000");
    }
}
