//! Mandatory default elements for freshly created groups and entries

use chrono::{DateTime, Utc};
use uuid::Uuid;
use xmltree::Element;

use super::element::{encode_uuid, has_path, set_text_at};
use super::times::{
    format_time, CREATION_TIME, EXPIRES, EXPIRY_TIME, LAST_ACCESS_TIME, LAST_MODIFICATION_TIME,
    LOCATION_CHANGED, USAGE_COUNT,
};

/// How a default value is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    FreshUuid,
    Now,
    Fixed(&'static str),
}

impl DefaultValue {
    pub fn generate(&self, now: DateTime<Utc>) -> String {
        match self {
            DefaultValue::FreshUuid => encode_uuid(&Uuid::new_v4()),
            DefaultValue::Now => format_time(now),
            DefaultValue::Fixed(value) => (*value).to_string(),
        }
    }
}

fn times_defaults() -> [(&'static str, DefaultValue); 7] {
    [
        (CREATION_TIME, DefaultValue::Now),
        (LAST_MODIFICATION_TIME, DefaultValue::Now),
        (LAST_ACCESS_TIME, DefaultValue::Now),
        (EXPIRY_TIME, DefaultValue::Now),
        (EXPIRES, DefaultValue::Fixed("False")),
        (USAGE_COUNT, DefaultValue::Fixed("0")),
        (LOCATION_CHANGED, DefaultValue::Now),
    ]
}

/// Ordered `(path, generator)` pairs every group element must carry
pub fn mandatory_group_defaults() -> Vec<(&'static str, DefaultValue)> {
    let mut defaults = vec![
        ("UUID", DefaultValue::FreshUuid),
        ("Notes", DefaultValue::Fixed("")),
        ("IconID", DefaultValue::Fixed("0")),
    ];
    defaults.extend(times_defaults());
    defaults
}

/// Ordered `(path, generator)` pairs every entry element must carry
pub fn mandatory_entry_defaults() -> Vec<(&'static str, DefaultValue)> {
    let mut defaults = vec![
        ("UUID", DefaultValue::FreshUuid),
        ("IconID", DefaultValue::Fixed("0")),
    ];
    defaults.extend(times_defaults());
    defaults
}

/// Fill in every missing path; existing values are left alone
pub(crate) fn apply_defaults(
    el: &mut Element,
    defaults: &[(&'static str, DefaultValue)],
    now: DateTime<Utc>,
) {
    for (path, value) in defaults {
        if !has_path(el, path) {
            set_text_at(el, path, &value.generate(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::element::{decode_uuid, text_at};

    #[test]
    fn test_group_defaults_order() {
        let paths: Vec<_> = mandatory_group_defaults().iter().map(|(p, _)| *p).collect();
        assert_eq!(
            paths,
            vec![
                "UUID",
                "Notes",
                "IconID",
                "Times/CreationTime",
                "Times/LastModificationTime",
                "Times/LastAccessTime",
                "Times/ExpiryTime",
                "Times/Expires",
                "Times/UsageCount",
                "Times/LocationChanged",
            ]
        );
    }

    #[test]
    fn test_apply_keeps_existing() {
        let mut el = Element::new("Group");
        set_text_at(&mut el, "IconID", "48");

        apply_defaults(&mut el, &mandatory_group_defaults(), Utc::now());

        assert_eq!(text_at(&el, "IconID").as_deref(), Some("48"));
        assert_eq!(text_at(&el, "Notes").as_deref(), Some(""));
        assert_eq!(text_at(&el, "Times/UsageCount").as_deref(), Some("0"));
        assert!(decode_uuid(&text_at(&el, "UUID").unwrap()).is_some());
    }

    #[test]
    fn test_fresh_uuids_differ() {
        let now = Utc::now();
        assert_ne!(
            DefaultValue::FreshUuid.generate(now),
            DefaultValue::FreshUuid.generate(now)
        );
    }
}
