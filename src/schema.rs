// ABOUTME: Object-class model and translation of directory entries into connector objects
// ABOUTME: ConfiguredSchema is the translator driven by the [[object_classes]] config table

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::{
    Entry, CREATE_TIMESTAMP, CREATORS_NAME, MODIFIERS_NAME, MODIFY_TIMESTAMP, OBJECT_CLASS,
};

/// Selector meaning "every object class"; descriptors are resolved per entry.
pub const ALL_OBJECT_CLASSES: &str = "__ALL__";

/// Pseudo-attribute naming the entry DN itself.
pub const DN_ATTRIBUTE: &str = "dn";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    All,
    Named(String),
}

impl ObjectClass {
    pub fn named(name: impl Into<String>) -> Self {
        ObjectClass::Named(name.into())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ObjectClass::All)
    }

    pub fn name(&self) -> &str {
        match self {
            ObjectClass::All => ALL_OBJECT_CLASSES,
            ObjectClass::Named(name) => name,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ObjectClass {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case(ALL_OBJECT_CLASSES) {
            Ok(ObjectClass::All)
        } else {
            Ok(ObjectClass::Named(value.to_string()))
        }
    }
}

fn default_uid_attribute() -> String {
    "entryUUID".to_string()
}

/// Descriptor of one logical object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectClassInfo {
    /// Logical name used by callers (e.g. "account").
    pub name: String,
    /// Native structural object class (e.g. "inetOrgPerson").
    pub ldap_object_class: String,
    #[serde(default = "default_uid_attribute")]
    pub uid_attribute: String,
    /// Attributes copied into connector objects; empty means all user attributes.
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Canonical representation handed to change handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorObject {
    pub object_class: String,
    pub uid: String,
    pub name: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("entry {dn} does not match any configured object class")]
    UnknownObjectClass { dn: String },
    #[error("entry {dn} has no value for uid attribute {attribute}")]
    MissingUid { dn: String, attribute: String },
}

pub trait SchemaTranslator {
    /// Descriptor for a logical object class. `None` for [`ObjectClass::All`]
    /// and for names that are not defined.
    fn find_object_class_info(&self, object_class: &ObjectClass) -> Option<ObjectClassInfo>;

    /// Translates a native entry. `info` is `None` when syncing all object
    /// classes, in which case the entry must identify its own class.
    fn to_connector_object(
        &self,
        info: Option<&ObjectClassInfo>,
        entry: &Entry,
    ) -> Result<ConnectorObject, TranslationError>;

    /// Extra attributes the translator needs on every searched entry.
    fn required_attributes(&self, _info: Option<&ObjectClassInfo>) -> Vec<String> {
        Vec::new()
    }

    /// Whether an entry found by an all-classes scan belongs to a class this
    /// translator handles. Entries it does not know are skipped, not failed.
    fn knows_entry(&self, _entry: &Entry) -> bool {
        true
    }
}

impl<T: SchemaTranslator + ?Sized> SchemaTranslator for &T {
    fn find_object_class_info(&self, object_class: &ObjectClass) -> Option<ObjectClassInfo> {
        (**self).find_object_class_info(object_class)
    }

    fn to_connector_object(
        &self,
        info: Option<&ObjectClassInfo>,
        entry: &Entry,
    ) -> Result<ConnectorObject, TranslationError> {
        (**self).to_connector_object(info, entry)
    }

    fn required_attributes(&self, info: Option<&ObjectClassInfo>) -> Vec<String> {
        (**self).required_attributes(info)
    }

    fn knows_entry(&self, entry: &Entry) -> bool {
        (**self).knows_entry(entry)
    }
}

impl<T: SchemaTranslator + ?Sized> SchemaTranslator for Arc<T> {
    fn find_object_class_info(&self, object_class: &ObjectClass) -> Option<ObjectClassInfo> {
        (**self).find_object_class_info(object_class)
    }

    fn to_connector_object(
        &self,
        info: Option<&ObjectClassInfo>,
        entry: &Entry,
    ) -> Result<ConnectorObject, TranslationError> {
        (**self).to_connector_object(info, entry)
    }

    fn required_attributes(&self, info: Option<&ObjectClassInfo>) -> Vec<String> {
        (**self).required_attributes(info)
    }

    fn knows_entry(&self, entry: &Entry) -> bool {
        (**self).knows_entry(entry)
    }
}

/// Translator backed by a static list of object class descriptors.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredSchema {
    classes: Vec<ObjectClassInfo>,
}

impl ConfiguredSchema {
    pub fn new(classes: Vec<ObjectClassInfo>) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &[ObjectClassInfo] {
        &self.classes
    }

    /// First configured class whose native object class the entry carries.
    pub fn info_for_entry(&self, entry: &Entry) -> Option<&ObjectClassInfo> {
        self.classes
            .iter()
            .find(|info| entry.has_value(OBJECT_CLASS, &info.ldap_object_class))
    }
}

impl SchemaTranslator for ConfiguredSchema {
    fn find_object_class_info(&self, object_class: &ObjectClass) -> Option<ObjectClassInfo> {
        match object_class {
            ObjectClass::All => None,
            ObjectClass::Named(name) => self
                .classes
                .iter()
                .find(|info| info.name.eq_ignore_ascii_case(name))
                .cloned(),
        }
    }

    fn knows_entry(&self, entry: &Entry) -> bool {
        self.info_for_entry(entry).is_some()
    }

    fn to_connector_object(
        &self,
        info: Option<&ObjectClassInfo>,
        entry: &Entry,
    ) -> Result<ConnectorObject, TranslationError> {
        let info = info
            .or_else(|| self.info_for_entry(entry))
            .ok_or_else(|| TranslationError::UnknownObjectClass {
                dn: entry.dn.clone(),
            })?;

        let uid = if info.uid_attribute.eq_ignore_ascii_case(DN_ATTRIBUTE) {
            entry.dn.clone()
        } else {
            entry
                .first_value(&info.uid_attribute)
                .map(str::to_string)
                .ok_or_else(|| TranslationError::MissingUid {
                    dn: entry.dn.clone(),
                    attribute: info.uid_attribute.clone(),
                })?
        };

        let attributes = entry
            .attributes
            .iter()
            .filter(|(name, _)| {
                if info.attributes.is_empty() {
                    !is_bookkeeping(name) && !name.eq_ignore_ascii_case(&info.uid_attribute)
                } else {
                    info.attributes
                        .iter()
                        .any(|wanted| wanted.eq_ignore_ascii_case(name))
                }
            })
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();

        Ok(ConnectorObject {
            object_class: info.name.clone(),
            uid,
            name: entry.dn.clone(),
            attributes,
        })
    }

    fn required_attributes(&self, info: Option<&ObjectClassInfo>) -> Vec<String> {
        let uid_attributes: Vec<&ObjectClassInfo> = match info {
            Some(info) => vec![info],
            None => self.classes.iter().collect(),
        };
        uid_attributes
            .into_iter()
            .map(|info| info.uid_attribute.clone())
            .filter(|attr| !attr.eq_ignore_ascii_case(DN_ATTRIBUTE))
            .collect()
    }
}

/// Attributes fetched for change tracking rather than for the payload.
fn is_bookkeeping(name: &str) -> bool {
    [
        MODIFY_TIMESTAMP,
        CREATE_TIMESTAMP,
        MODIFIERS_NAME,
        CREATORS_NAME,
        OBJECT_CLASS,
    ]
    .iter()
    .any(|known| known.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ConfiguredSchema {
        ConfiguredSchema::new(vec![
            ObjectClassInfo {
                name: "account".to_string(),
                ldap_object_class: "inetOrgPerson".to_string(),
                uid_attribute: "entryUUID".to_string(),
                attributes: vec![],
            },
            ObjectClassInfo {
                name: "group".to_string(),
                ldap_object_class: "groupOfNames".to_string(),
                uid_attribute: "dn".to_string(),
                attributes: vec!["cn".to_string(), "member".to_string()],
            },
        ])
    }

    fn person() -> Entry {
        Entry::new("uid=alice,ou=people,dc=example")
            .with_attribute("objectClass", ["top", "inetOrgPerson"])
            .with_attribute("entryUUID", ["5f1d"])
            .with_attribute("cn", ["Alice"])
            .with_attribute("modifyTimestamp", ["20240101000000Z"])
            .with_attribute("modifiersName", ["cn=admin"])
    }

    #[test]
    fn parses_all_selector() {
        assert_eq!("__all__".parse::<ObjectClass>().unwrap(), ObjectClass::All);
        assert_eq!(
            "account".parse::<ObjectClass>().unwrap(),
            ObjectClass::named("account")
        );
        assert_eq!(ObjectClass::All.to_string(), ALL_OBJECT_CLASSES);
    }

    #[test]
    fn resolves_named_classes_only() {
        let schema = schema();
        let info = schema
            .find_object_class_info(&ObjectClass::named("Account"))
            .unwrap();
        assert_eq!(info.ldap_object_class, "inetOrgPerson");
        assert!(schema.find_object_class_info(&ObjectClass::All).is_none());
        assert!(schema
            .find_object_class_info(&ObjectClass::named("printer"))
            .is_none());
    }

    #[test]
    fn translation_strips_bookkeeping_attributes() {
        let schema = schema();
        let info = schema.find_object_class_info(&ObjectClass::named("account"));
        let object = schema.to_connector_object(info.as_ref(), &person()).unwrap();
        assert_eq!(object.object_class, "account");
        assert_eq!(object.uid, "5f1d");
        assert_eq!(object.name, "uid=alice,ou=people,dc=example");
        assert_eq!(object.attributes.keys().collect::<Vec<_>>(), vec!["cn"]);
    }

    #[test]
    fn deferred_translation_detects_class_from_entry() {
        let schema = schema();
        let group = Entry::new("cn=ops,ou=groups,dc=example")
            .with_attribute("objectClass", ["groupOfNames"])
            .with_attribute("cn", ["ops"])
            .with_attribute("description", ["not configured"]);
        let object = schema.to_connector_object(None, &group).unwrap();
        assert_eq!(object.object_class, "group");
        assert_eq!(object.uid, "cn=ops,ou=groups,dc=example");
        assert!(!object.attributes.contains_key("description"));

        let printer = Entry::new("cn=p1,dc=example").with_attribute("objectClass", ["device"]);
        assert_eq!(
            schema.to_connector_object(None, &printer),
            Err(TranslationError::UnknownObjectClass {
                dn: "cn=p1,dc=example".to_string()
            })
        );
    }

    #[test]
    fn test_knows_entry_only_for_configured_classes() {
        let schema = schema();
        assert!(schema.knows_entry(&person()));

        let unit = Entry::new("ou=people,dc=example")
            .with_attribute("objectClass", ["top", "organizationalUnit"]);
        assert!(!schema.knows_entry(&unit));
        assert!(!(&schema).knows_entry(&unit));
        assert!(!Arc::new(schema).knows_entry(&unit));
    }

    #[test]
    fn missing_uid_is_a_translation_error() {
        let schema = schema();
        let mut entry = person();
        entry.attributes.remove("entryUUID");
        assert!(matches!(
            schema.to_connector_object(None, &entry),
            Err(TranslationError::MissingUid { .. })
        ));
    }

    #[test]
    fn required_attributes_cover_uid_attributes() {
        let schema = schema();
        assert_eq!(schema.required_attributes(None), vec!["entryUUID".to_string()]);
        let group = schema.find_object_class_info(&ObjectClass::named("group"));
        assert!(schema.required_attributes(group.as_ref()).is_empty());
    }
}
