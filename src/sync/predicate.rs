// ABOUTME: Acceptance predicate deciding which found entries become change events
// ABOUTME: Default policy drops foreign object classes and changes made by excluded identities

use crate::directory::{Entry, CREATORS_NAME, MODIFIERS_NAME, OBJECT_CLASS};
use crate::schema::ObjectClassInfo;

pub trait AcceptancePredicate {
    fn accept(&self, entry: &Entry, info: Option<&ObjectClassInfo>, excluded: &[String]) -> bool;
}

impl<F> AcceptancePredicate for F
where
    F: Fn(&Entry, Option<&ObjectClassInfo>, &[String]) -> bool,
{
    fn accept(&self, entry: &Entry, info: Option<&ObjectClassInfo>, excluded: &[String]) -> bool {
        self(entry, info, excluded)
    }
}

/// Rejects entries of another object class and entries whose last changer is
/// one of the excluded identities (typically the connector's own bind DN, so
/// its writes do not echo back as inbound changes).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangerExclusion;

impl AcceptancePredicate for ChangerExclusion {
    fn accept(&self, entry: &Entry, info: Option<&ObjectClassInfo>, excluded: &[String]) -> bool {
        if let Some(info) = info {
            if !entry.has_value(OBJECT_CLASS, &info.ldap_object_class) {
                return false;
            }
        }
        match last_changer(entry) {
            Some(changer) => {
                let changer = normalize_dn(changer);
                !excluded
                    .iter()
                    .any(|identity| normalize_dn(identity) == changer)
            }
            None => true,
        }
    }
}

/// `modifiersName`, or `creatorsName` for entries never modified.
pub fn last_changer(entry: &Entry) -> Option<&str> {
    entry
        .first_value(MODIFIERS_NAME)
        .or_else(|| entry.first_value(CREATORS_NAME))
}

/// Case-insensitive DN form with whitespace around `,` and `=` removed.
// Mirrors `sqlite_directory::normalize_dn`; the store crate is optional here.
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
