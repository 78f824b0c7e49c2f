//! Git dates and identities.
//!
//! Commits, tags, and reflog entries carry an identity of the form
//! `"Name <email> 1234567890 +0000"`. The timestamp is seconds since the
//! Unix epoch; the timezone is the writer's offset, preserved verbatim.

use bstr::{BStr, BString, ByteSlice};
use chrono::Local;

use crate::error::UtilError;
use crate::Result;

/// Timestamps must fit in a signed 63-bit value.
const MAX_TIMESTAMP: i64 = (1 << 62) - 1;

/// A git date: Unix timestamp plus the originating timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitDate {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Timezone offset in minutes east of UTC (e.g. -300 for EST).
    pub tz_offset: i32,
}

impl GitDate {
    pub fn new(timestamp: i64, tz_offset_minutes: i32) -> Self {
        Self {
            timestamp,
            tz_offset: tz_offset_minutes,
        }
    }

    /// The current time in the local timezone.
    pub fn now() -> Self {
        let now = Local::now();
        let offset_secs = now.offset().local_minus_utc();
        Self {
            timestamp: now.timestamp(),
            tz_offset: offset_secs / 60,
        }
    }

    /// Parse the raw git form: `"1234567890 +0130"` (timezone optional).
    pub fn parse_raw(input: &str) -> Result<Self> {
        let input = input.trim();
        let mut parts = input.splitn(2, ' ');

        let ts_str = parts.next().unwrap_or("");
        let timestamp: i64 = ts_str
            .parse()
            .map_err(|_| UtilError::DateParse(format!("invalid timestamp: {ts_str:?}")))?;
        if timestamp.unsigned_abs() > MAX_TIMESTAMP as u64 {
            return Err(UtilError::DateParse(format!(
                "timestamp out of range: {timestamp}"
            )));
        }

        let tz_offset = match parts.next() {
            Some(tz_str) => parse_tz(tz_str.trim())?,
            None => 0,
        };

        Ok(Self {
            timestamp,
            tz_offset,
        })
    }

    /// Serialize to the raw git form: `"1234567890 +0130"`.
    pub fn format_raw(&self) -> String {
        format!("{} {}", self.timestamp, format_tz(self.tz_offset))
    }
}

/// Parse a `+hhmm` / `-hhmm` timezone into minutes east of UTC.
fn parse_tz(tz: &str) -> Result<i32> {
    let bytes = tz.as_bytes();
    if bytes.len() != 5 || (bytes[0] != b'+' && bytes[0] != b'-') {
        return Err(UtilError::DateParse(format!("invalid timezone: {tz:?}")));
    }
    let digits: i32 = tz[1..]
        .parse()
        .map_err(|_| UtilError::DateParse(format!("invalid timezone: {tz:?}")))?;
    let minutes = (digits / 100) * 60 + digits % 100;
    Ok(if bytes[0] == b'-' { -minutes } else { minutes })
}

/// Format minutes east of UTC as `+hhmm` / `-hhmm`.
fn format_tz(minutes: i32) -> String {
    let sign = if minutes < 0 { '-' } else { '+' };
    let abs = minutes.unsigned_abs();
    format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
}

/// An identity with a timestamp, as stored in commit/tag headers and reflogs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: BString,
    pub email: BString,
    pub date: GitDate,
}

impl Signature {
    pub fn new(name: impl Into<BString>, email: impl Into<BString>, date: GitDate) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            date,
        }
    }

    /// Parse `"Name <email> 1234567890 +0000"`.
    pub fn parse(data: &BStr) -> Result<Self> {
        let open = data
            .find(b" <")
            .ok_or_else(|| UtilError::IdentityParse(data.to_string()))?;
        let close = data[open..]
            .find(b"> ")
            .map(|p| p + open)
            .ok_or_else(|| UtilError::IdentityParse(data.to_string()))?;

        let name = BString::from(&data[..open]);
        let email = BString::from(&data[open + 2..close]);

        let date_str = std::str::from_utf8(&data[close + 2..])
            .map_err(|_| UtilError::IdentityParse(data.to_string()))?;
        let date = GitDate::parse_raw(date_str)?;

        Ok(Self { name, email, date })
    }

    /// Serialize to `"Name <email> 1234567890 +0000"`.
    pub fn to_bytes(&self) -> BString {
        let mut out = BString::from(self.name.clone());
        out.extend_from_slice(b" <");
        out.extend_from_slice(&self.email);
        out.extend_from_slice(b"> ");
        out.extend_from_slice(self.date.format_raw().as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw_with_tz() {
        let date = GitDate::parse_raw("1234567890 +0130").unwrap();
        assert_eq!(date.timestamp, 1234567890);
        assert_eq!(date.tz_offset, 90);
    }

    #[test]
    fn parse_raw_negative_tz() {
        let date = GitDate::parse_raw("1234567890 -0500").unwrap();
        assert_eq!(date.tz_offset, -300);
    }

    #[test]
    fn parse_raw_without_tz() {
        let date = GitDate::parse_raw("0").unwrap();
        assert_eq!(date.timestamp, 0);
        assert_eq!(date.tz_offset, 0);
    }

    #[test]
    fn format_roundtrip() {
        for raw in ["0 +0000", "1234567890 +0130", "1234567890 -0500"] {
            let date = GitDate::parse_raw(raw).unwrap();
            assert_eq!(date.format_raw(), raw);
        }
    }

    #[test]
    fn timestamp_out_of_range() {
        let too_big = format!("{} +0000", i64::MAX);
        assert!(GitDate::parse_raw(&too_big).is_err());
    }

    #[test]
    fn signature_roundtrip() {
        let raw = BStr::new(b"A U Thor <author@example.com> 1234567890 +0000");
        let sig = Signature::parse(raw).unwrap();
        assert_eq!(sig.name, "A U Thor");
        assert_eq!(sig.email, "author@example.com");
        assert_eq!(sig.date.timestamp, 1234567890);
        assert_eq!(sig.to_bytes().as_slice(), raw.as_bytes());
    }

    #[test]
    fn signature_empty_name() {
        let sig = Signature::parse(BStr::new(b" <a@b> 0 +0000")).unwrap();
        assert!(sig.name.is_empty());
        assert_eq!(sig.email, "a@b");
    }

    #[test]
    fn signature_missing_email_fails() {
        assert!(Signature::parse(BStr::new(b"nobody 0 +0000")).is_err());
    }
}
