//! Bundle identifiers and the per-store timestamp format.

use std::path::Path;
use std::str::FromStr;

use bundle_fs::{BundlePath, io};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::DeviceId;
use crate::{Error, Result};

/// Immutable identifier of one bundle version.
///
/// Rendered as the filename-safe token `YYYYMMDD-HHMMSSmmm-<device>-<name>`.
/// Ordering is by timestamp, then device, then name, so tokens from one
/// store sort chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleId {
    timestamp: NaiveDateTime,
    device_id: String,
    name: String,
}

impl BundleId {
    pub fn new(timestamp: NaiveDateTime, device_id: &DeviceId, name: &str) -> Result<Self> {
        validate_bundle_name(name)?;
        let millis = timestamp.nanosecond() / 1_000_000 * 1_000_000;
        Ok(Self {
            timestamp: timestamp.with_nanosecond(millis).unwrap_or(timestamp),
            device_id: device_id.as_str().to_string(),
            name: name.to_string(),
        })
    }

    /// Parse a token produced by [`BundleId::token`].
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = || Error::InvalidBundleId {
            token: token.to_string(),
        };
        let mut parts = token.splitn(4, '-');
        let (Some(date), Some(time), Some(device), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if time.len() != 9 || !time.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
        let field = |range: std::ops::Range<usize>| time[range].parse::<u32>().map_err(|_| invalid());
        let time = NaiveTime::from_hms_milli_opt(field(0..2)?, field(2..4)?, field(4..6)?, field(6..9)?)
            .ok_or_else(invalid)?;
        let device = DeviceId::new(device).map_err(|_| invalid())?;
        validate_bundle_name(name).map_err(|_| invalid())?;

        Ok(Self {
            timestamp: date.and_time(time),
            device_id: device.as_str().to_string(),
            name: name.to_string(),
        })
    }

    pub fn token(&self) -> String {
        format!(
            "{}{:03}-{}-{}",
            self.timestamp.format("%Y%m%d-%H%M%S"),
            self.timestamp.nanosecond() / 1_000_000,
            self.device_id,
            self.name
        )
    }

    /// Timestamp in the store's time zone.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The bundle (ref) name this version belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token())
    }
}

impl FromStr for BundleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BundleId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BundleId> for String {
    fn from(id: BundleId) -> Self {
        id.token()
    }
}

/// Bundle and ref names: non-empty, no path separators, no whitespace,
/// nothing a properties file would misread.
pub fn validate_bundle_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '=' | ':' | '#'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRefName {
            name: name.to_string(),
        })
    }
}

/// Formats bundle timestamps in the time zone recorded for a bundle
/// directory, so every device writing there produces comparable tokens.
#[derive(Debug, Clone, Copy)]
pub struct BundleTimeFormat {
    offset: FixedOffset,
}

impl BundleTimeFormat {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Read `timezone.txt` from `bundle_dir`, creating it from the local
    /// offset on first use.
    pub fn load_or_create(bundle_dir: &Path) -> Result<Self> {
        let path = bundle_dir.join(BundlePath::TimezoneFile);
        match io::read_text(&path) {
            Ok(content) => match FixedOffset::from_str(content.trim()) {
                Ok(offset) => Ok(Self::new(offset)),
                Err(_) => {
                    warn!(path = %path.display(), "Unrecognized time zone, using UTC");
                    Ok(Self::new(Utc.fix()))
                }
            },
            Err(e) if e.is_not_found() => {
                let offset = chrono::Local::now().offset().fix();
                io::write_text(&path, &offset.to_string())?;
                info!(path = %path.display(), %offset, "Initialized bundle directory time zone");
                Ok(Self::new(offset))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Render epoch milliseconds as a local timestamp for a bundle token.
    pub fn to_local(&self, millis: i64) -> NaiveDateTime {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .naive_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn token_round_trips() {
        let format = BundleTimeFormat::new(FixedOffset::east_opt(2 * 3600).unwrap());
        let id = BundleId::new(format.to_local(1_700_000_000_123), &device("dev1"), "jd-data,pdash")
            .unwrap();

        assert_eq!(id.token(), "20231115-001320123-dev1-jd-data,pdash");
        assert_eq!(BundleId::parse(&id.token()).unwrap(), id);
    }

    #[test]
    fn ordering_is_chronological_then_device() {
        let format = BundleTimeFormat::new(Utc.fix());
        let early = BundleId::new(format.to_local(1000), &device("b"), "core").unwrap();
        let late = BundleId::new(format.to_local(2000), &device("a"), "core").unwrap();
        let tie = BundleId::new(format.to_local(2000), &device("b"), "core").unwrap();

        assert!(early < late);
        assert!(late < tie);
        assert!(early.token() < late.token());
    }

    #[test]
    fn rejects_malformed_tokens() {
        for token in ["", "20240101", "20240101-12-dev-core", "2024x101-120000000-dev-core"] {
            assert!(BundleId::parse(token).is_err(), "{token}");
        }
    }

    #[test]
    fn serializes_as_token_string() {
        let format = BundleTimeFormat::new(Utc.fix());
        let id = BundleId::new(format.to_local(0), &device("d"), "core").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"19700101-000000000-d-core\"");
        assert_eq!(serde_json::from_str::<BundleId>(&json).unwrap(), id);
    }

    #[test]
    fn time_zone_file_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = BundleTimeFormat::load_or_create(dir.path()).unwrap();
        std::fs::write(dir.path().join("timezone.txt"), "+05:30").unwrap();
        let second = BundleTimeFormat::load_or_create(dir.path()).unwrap();

        assert_eq!(second.offset(), FixedOffset::east_opt(5 * 3600 + 1800).unwrap());
        let _ = first;
    }
}
