//! Date and time encodings.
//!
//! PostgreSQL counts from 2000-01-01 at microsecond resolution. Encoding
//! floors any sub-microsecond part; decoding is exact.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::{fixed, Encoding};
use crate::error::{Error, Result};
use crate::value::OffsetTime;

/// Days from 0001-01-01 (CE day 1) to 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;
/// Microseconds from the Unix epoch to 2000-01-01.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

fn infinite(type_name: &str) -> Error {
    Error::InvalidValue(format!("{} infinity is not representable", type_name))
}

fn out_of_range(type_name: &str) -> Error {
    Error::InvalidValue(format!("{} out of range", type_name))
}

fn time_to_micros(time: &NaiveTime) -> i64 {
    // Leap-second nanos (>= 1e9) stay within the same second.
    let nanos = time.nanosecond().min(999_999_999) as i64;
    time.num_seconds_from_midnight() as i64 * MICROS_PER_SECOND + nanos / 1_000
}

fn micros_to_time(micros: i64) -> Result<NaiveTime> {
    if !(0..MICROS_PER_DAY).contains(&micros) {
        return Err(out_of_range("TIME"));
    }
    let secs = (micros / MICROS_PER_SECOND) as u32;
    let nanos = (micros % MICROS_PER_SECOND) as u32 * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or_else(|| out_of_range("TIME"))
}

fn datetime_to_micros(dt: &NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

fn micros_to_datetime(micros: i64, type_name: &str) -> Result<NaiveDateTime> {
    if micros == i64::MAX || micros == i64::MIN {
        return Err(infinite(type_name));
    }
    micros
        .checked_add(PG_EPOCH_UNIX_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| out_of_range(type_name))
}

pub struct DateEncoding;

impl Encoding for DateEncoding {
    type Item = NaiveDate;

    fn encode(&self, item: &NaiveDate, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(item.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<NaiveDate> {
        let days = i32::from_be_bytes(fixed(data, "DATE")?);
        if days == i32::MAX || days == i32::MIN {
            return Err(infinite("DATE"));
        }
        days.checked_add(PG_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or_else(|| out_of_range("DATE"))
    }
}

/// Microseconds since midnight.
pub struct TimeEncoding;

impl Encoding for TimeEncoding {
    type Item = NaiveTime;

    fn encode(&self, item: &NaiveTime, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(time_to_micros(item));
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<NaiveTime> {
        micros_to_time(i64::from_be_bytes(fixed(data, "TIME")?))
    }
}

/// Microseconds since midnight followed by the zone in seconds west of UTC.
pub struct TimeTzEncoding;

impl Encoding for TimeTzEncoding {
    type Item = OffsetTime;

    fn encode(&self, item: &OffsetTime, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(time_to_micros(&item.time));
        buf.put_i32(-item.offset.local_minus_utc());
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<OffsetTime> {
        let raw: [u8; 12] = fixed(data, "TIMETZ")?;
        let micros = i64::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]);
        let zone = i32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        let time = micros_to_time(micros)?;
        let offset = FixedOffset::east_opt(-zone)
            .ok_or_else(|| Error::InvalidValue(format!("invalid TIMETZ zone {}", zone)))?;
        Ok(OffsetTime::new(time, offset))
    }
}

pub struct TimestampEncoding;

impl Encoding for TimestampEncoding {
    type Item = NaiveDateTime;

    fn encode(&self, item: &NaiveDateTime, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(datetime_to_micros(item));
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<NaiveDateTime> {
        micros_to_datetime(i64::from_be_bytes(fixed(data, "TIMESTAMP")?), "TIMESTAMP")
    }
}

/// The wire carries only the instant; decoded values are at `+00:00`.
pub struct TimestampTzEncoding;

impl Encoding for TimestampTzEncoding {
    type Item = DateTime<FixedOffset>;

    fn encode(&self, item: &DateTime<FixedOffset>, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(datetime_to_micros(&item.naive_utc()));
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<DateTime<FixedOffset>> {
        let micros = i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?);
        let naive = micros_to_datetime(micros, "TIMESTAMPTZ")?;
        Ok(naive.and_utc().fixed_offset())
    }
}
