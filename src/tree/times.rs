//! Times block shared by groups and entries

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use xmltree::Element;

use super::element::{parse_bool, set_text_at, text_at};

pub const CREATION_TIME: &str = "Times/CreationTime";
pub const LAST_MODIFICATION_TIME: &str = "Times/LastModificationTime";
pub const LAST_ACCESS_TIME: &str = "Times/LastAccessTime";
pub const EXPIRY_TIME: &str = "Times/ExpiryTime";
pub const EXPIRES: &str = "Times/Expires";
pub const USAGE_COUNT: &str = "Times/UsageCount";
pub const LOCATION_CHANGED: &str = "Times/LocationChanged";

/// Seconds between 0001-01-01 and the Unix epoch (KDBX 4 binary times)
const DOTNET_EPOCH_OFFSET: i64 = 62_135_596_800;

/// Written form
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Accepts ISO 8601 (KDBX 3) and base64 seconds-since-0001 (KDBX 4)
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(time.with_timezone(&Utc));
    }

    let bytes = STANDARD.decode(text).ok()?;
    let raw: [u8; 8] = bytes.try_into().ok()?;
    let seconds = i64::from_le_bytes(raw).checked_sub(DOTNET_EPOCH_OFFSET)?;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Typed view of a `<Times>` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: Option<DateTime<Utc>>,
}

impl Times {
    pub(crate) fn read(owner: &Element) -> Self {
        let time = |path| text_at(owner, path).as_deref().and_then(parse_time);
        Self {
            created: time(CREATION_TIME),
            modified: time(LAST_MODIFICATION_TIME),
            accessed: time(LAST_ACCESS_TIME),
            expiry: time(EXPIRY_TIME),
            expires: text_at(owner, EXPIRES).map(|t| parse_bool(&t)).unwrap_or(false),
            usage_count: text_at(owner, USAGE_COUNT)
                .and_then(|t| t.trim().parse().ok())
                .unwrap_or(0),
            location_changed: time(LOCATION_CHANGED),
        }
    }

    /// Has the expiry passed (only when `Expires` is set)
    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}

pub(crate) fn touch(owner: &mut Element, path: &str) {
    set_text_at(owner, path, &format_time(Utc::now()));
}

/// Record an access: bump `UsageCount` and `LastAccessTime`
pub(crate) fn record_access(owner: &mut Element) {
    let count: u64 = text_at(owner, USAGE_COUNT)
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0);
    set_text_at(owner, USAGE_COUNT, &(count + 1).to_string());
    touch(owner, LAST_ACCESS_TIME);
}
