use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generalized time without fraction, always UTC.
pub const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";

pub const ENTRY_UUID: &str = "entryUUID";
pub const CREATE_TIMESTAMP: &str = "createTimestamp";
pub const MODIFY_TIMESTAMP: &str = "modifyTimestamp";
pub const CREATORS_NAME: &str = "creatorsName";
pub const MODIFIERS_NAME: &str = "modifiersName";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(GENERALIZED_TIME_FORMAT).to_string()
}

/// Lower-cases a DN and strips whitespace around separators so that
/// `CN=Admin, DC=Example` and `cn=admin,dc=example` compare equal.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(|part| part.trim().to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join("=")
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// A row of the `entries` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: i64,
    pub dn: String,
    pub entry_uuid: String,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub creators_name: Option<String>,
    pub create_timestamp: String,
    pub modifiers_name: Option<String>,
    /// Unset until the entry is modified for the first time.
    pub modify_timestamp: Option<String>,
}

impl StoredEntry {
    /// Values of a user or operational attribute, looked up case-insensitively.
    pub fn values(&self, name: &str) -> Option<Vec<String>> {
        if let Some(values) = self.operational_value(name) {
            return values.map(|value| vec![value]);
        }
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.clone())
    }

    pub fn operational_attributes(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for name in [
            ENTRY_UUID,
            CREATE_TIMESTAMP,
            MODIFY_TIMESTAMP,
            CREATORS_NAME,
            MODIFIERS_NAME,
        ] {
            if let Some(Some(value)) = self.operational_value(name) {
                out.insert(name.to_string(), vec![value]);
            }
        }
        out
    }

    /// Projects the entry onto the requested attribute list.
    ///
    /// An empty list or `*` returns every user attribute, `+` returns every
    /// operational attribute; any other name is matched case-insensitively.
    pub fn select(&self, requested: &[String]) -> SearchEntry {
        let mut attributes = BTreeMap::new();
        let all_user = requested.is_empty() || requested.iter().any(|name| name == "*");
        if all_user {
            attributes.extend(self.attributes.clone());
        }
        if requested.iter().any(|name| name == "+") {
            attributes.extend(self.operational_attributes());
        }
        for name in requested {
            if name == "*" || name == "+" {
                continue;
            }
            if let Some(Some(value)) = self.operational_value(name) {
                attributes.insert(canonical_operational(name).to_string(), vec![value]);
            } else if !all_user {
                if let Some((key, values)) = self
                    .attributes
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                {
                    attributes.insert(key.clone(), values.clone());
                }
            }
        }
        SearchEntry {
            dn: self.dn.clone(),
            attributes,
        }
    }

    // Outer None: not an operational attribute. Inner None: operational but unset.
    fn operational_value(&self, name: &str) -> Option<Option<String>> {
        let value = match canonical_operational(name) {
            ENTRY_UUID => Some(self.entry_uuid.clone()),
            CREATE_TIMESTAMP => Some(self.create_timestamp.clone()),
            MODIFY_TIMESTAMP => self.modify_timestamp.clone(),
            CREATORS_NAME => self.creators_name.clone(),
            MODIFIERS_NAME => self.modifiers_name.clone(),
            _ => return None,
        };
        Some(value)
    }
}

fn canonical_operational(name: &str) -> &'static str {
    [
        ENTRY_UUID,
        CREATE_TIMESTAMP,
        MODIFY_TIMESTAMP,
        CREATORS_NAME,
        MODIFIERS_NAME,
    ]
    .into_iter()
    .find(|known| known.eq_ignore_ascii_case(name))
    .unwrap_or("")
}

/// An entry as returned by a search: DN plus the selected attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}
