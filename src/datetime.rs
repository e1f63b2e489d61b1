//! Civil date-time and duration scalars.
//!
//! Both types are thin wrappers over the wire representation: a signed
//! microsecond count. `LocalDateTime` counts from 2000-01-01T00:00:00;
//! conversion to a civil timestamp goes through the proleptic epoch shift
//! between 0001-01-01 and 2000-01-01.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::errors::{Error, Result};

/// Microseconds between 0001-01-01T00:00 and 2000-01-01T00:00.
pub const EPOCH_SHIFT_US: i64 = 62_135_596_800_000_000;

fn year_one() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .expect("valid calendar date")
        .and_hms_opt(0, 0, 0)
        .expect("valid time of day")
}

/// A date and time without a timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDateTime {
    usec: i64,
}

impl LocalDateTime {
    /// Build from civil components.
    pub fn new(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        microsecond: u32,
    ) -> Result<Self> {
        let dt = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_micro_opt(hour, minute, second, microsecond))
            .ok_or_else(|| {
                Error::invalid_type(format!(
                    "invalid civil timestamp {:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, minute, second, microsecond
                ))
            })?;
        let since_year_one = dt
            .signed_duration_since(year_one())
            .num_microseconds()
            .ok_or_else(|| Error::invalid_type("timestamp out of range"))?;
        Ok(Self {
            usec: since_year_one - EPOCH_SHIFT_US,
        })
    }

    /// Microseconds relative to 2000-01-01T00:00:00 (the wire value).
    pub fn from_micros(usec: i64) -> Self {
        Self { usec }
    }

    pub fn micros(self) -> i64 {
        self.usec
    }

    fn to_naive(self) -> Option<NaiveDateTime> {
        year_one().checked_add_signed(chrono::Duration::microseconds(
            self.usec.checked_add(EPOCH_SHIFT_US)?,
        ))
    }
}

impl fmt::Display for LocalDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_naive() {
            Some(dt) => {
                write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S"))?;
                let micro = dt.time().nanosecond() / 1_000;
                if micro != 0 {
                    let frac = format!("{:06}", micro);
                    write!(f, ".{}", frac.trim_end_matches('0'))?;
                }
                Ok(())
            }
            None => write!(f, "<local_datetime out of range>"),
        }
    }
}

/// Elapsed time as a signed microsecond count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_micros(usec: i64) -> Self {
        Self(usec)
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0s");
        }

        let mut x = self.0;
        if x < 0 {
            write!(f, "-")?;
            x = -x;
        }

        if x < 1_000 {
            return write!(f, "{}us", x);
        }
        if x < 1_000_000 {
            return write!(f, "{}ms", fmt_with_frac(x / 1_000, (x % 1_000) * 1_000));
        }

        let hours = x / 3_600_000_000;
        let minutes = (x % 3_600_000_000) / 60_000_000;
        let sec_us = x % 60_000_000;

        if hours > 0 {
            write!(f, "{}h", hours)?;
        }
        if minutes > 0 {
            write!(f, "{}m", minutes)?;
        }
        if sec_us > 0 {
            write!(f, "{}s", fmt_with_frac(sec_us / 1_000_000, sec_us % 1_000_000))?;
        }
        Ok(())
    }
}

/// `whole[.frac]` with the six-digit fraction right-trimmed.
fn fmt_with_frac(whole: i64, frac_millionths: i64) -> String {
    if frac_millionths == 0 {
        return whole.to_string();
    }
    let frac = format!("{:06}", frac_millionths);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

impl FromStr for Duration {
    type Err = Error;

    /// Inverse of the formatter. Accepts a sign, then any run of
    /// `<number><unit>` components with units `h`, `m`, `s`, `ms`, `us`;
    /// fractional values are honoured to microsecond precision.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid_type(format!("invalid duration literal {:?}", s));

        let (negative, mut rest) = match s.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, s),
        };
        if rest.is_empty() {
            return Err(bad());
        }

        let mut total: i128 = 0;
        while !rest.is_empty() {
            let num_len = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(bad)?;
            if num_len == 0 {
                return Err(bad());
            }
            let (number, tail) = rest.split_at(num_len);

            let (unit_us, tail) = if let Some(t) = tail.strip_prefix("ms") {
                (1_000i128, t)
            } else if let Some(t) = tail.strip_prefix("us") {
                (1i128, t)
            } else if let Some(t) = tail.strip_prefix('h') {
                (3_600_000_000i128, t)
            } else if let Some(t) = tail.strip_prefix('m') {
                (60_000_000i128, t)
            } else if let Some(t) = tail.strip_prefix('s') {
                (1_000_000i128, t)
            } else {
                return Err(bad());
            };

            let (whole, frac) = match number.split_once('.') {
                Some((w, fr)) => (w, fr),
                None => (number, ""),
            };
            if whole.is_empty() && frac.is_empty() {
                return Err(bad());
            }
            let whole: i128 = if whole.is_empty() {
                0
            } else {
                whole.parse().map_err(|_| bad())?
            };
            total += whole * unit_us;

            if !frac.is_empty() {
                if frac.contains('.') {
                    return Err(bad());
                }
                let scaled: i128 = frac.parse().map_err(|_| bad())?;
                let denom = 10i128.pow(frac.len() as u32);
                let frac_us = scaled * unit_us / denom;
                if frac_us * denom != scaled * unit_us {
                    return Err(bad());
                }
                total += frac_us;
            }
            rest = tail;
        }

        if negative {
            total = -total;
        }
        i64::try_from(total)
            .map(Duration)
            .map_err(|_| Error::invalid_type("duration out of range"))
    }
}
