use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A person known to the linked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Phone number when known, otherwise the service UUID
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_blocked: bool,
    /// Last activity seen from this contact, unix millis
    #[serde(default)]
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub is_blocked: bool,
}

fn text(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

impl Contact {
    /// Build from one `listContacts` entry. Entries with neither number nor
    /// UUID are unusable and yield `None`.
    pub fn from_signal_cli(item: &Value) -> Option<Self> {
        let number = text(item, "number");
        let uuid = text(item, "uuid");
        let id = number.clone().or_else(|| uuid.clone())?;

        let profile = item.get("profile").unwrap_or(&Value::Null);
        let profile_name = {
            let given = text(profile, "givenName").or_else(|| text(item, "givenName"));
            let family = text(profile, "familyName").or_else(|| text(item, "familyName"));
            match (given, family) {
                (Some(g), Some(f)) => Some(format!("{} {}", g, f)),
                (Some(g), None) => Some(g),
                (None, Some(f)) => Some(f),
                (None, None) => None,
            }
        };

        let display_name = text(item, "name")
            .or_else(|| text(item, "nickName"))
            .or_else(|| profile_name.clone())
            .unwrap_or_else(|| id.clone());

        Some(Self {
            id,
            display_name,
            number,
            uuid,
            profile_name,
            avatar: text(item, "avatar").or_else(|| text(profile, "avatar")),
            is_blocked: item
                .get("isBlocked")
                .or_else(|| item.get("blocked"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            last_seen: None,
        })
    }
}

impl Group {
    pub fn from_signal_cli(item: &Value) -> Option<Self> {
        let id = text(item, "id").or_else(|| text(item, "groupId"))?;
        let members = item
            .get("members")
            .and_then(Value::as_array)
            .map(|ms| {
                ms.iter()
                    .filter_map(|m| match m {
                        Value::String(s) => Some(s.clone()),
                        other => text(other, "number").or_else(|| text(other, "uuid")),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            id,
            name: text(item, "name").unwrap_or_else(|| "Unknown Group".to_string()),
            members,
            is_blocked: item
                .get("isBlocked")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Point-in-time view of contacts and groups. Readers hold an `Arc` of it and
/// never observe a half-applied refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub contacts: BTreeMap<String, Contact>,
    pub groups: BTreeMap<String, Group>,
    /// Unix seconds of the last successful refresh
    pub refreshed_at: Option<u64>,
    /// Last refresh failed; contents may be outdated
    pub stale: bool,
}

impl Snapshot {
    pub fn from_listing(contacts: &Value, groups: &Value) -> Self {
        let mut snap = Self::default();
        for c in contacts.as_array().into_iter().flatten().filter_map(Contact::from_signal_cli) {
            snap.contacts.insert(c.id.clone(), c);
        }
        for g in groups.as_array().into_iter().flatten().filter_map(Group::from_signal_cli) {
            snap.groups.insert(g.id.clone(), g);
        }
        snap
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id).or_else(|| {
            self.contacts
                .values()
                .find(|c| c.uuid.as_deref() == Some(id) || c.number.as_deref() == Some(id))
        })
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Human readable name for a contact or group id, falling back to the id.
    pub fn display_name(&self, id: &str) -> String {
        if let Some(c) = self.contact(id) {
            return c.display_name.clone();
        }
        if let Some(g) = self.group(id) {
            return g.name.clone();
        }
        id.to_string()
    }

    /// Contacts ordered by display name, case-insensitive.
    pub fn sorted_contacts(&self) -> Vec<&Contact> {
        let mut list: Vec<&Contact> = self.contacts.values().collect();
        list.sort_by_key(|c| c.display_name.to_lowercase());
        list
    }

    pub fn len(&self) -> usize {
        self.contacts.len() + self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty() && self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_name_precedence() {
        let named = Contact::from_signal_cli(&json!({
            "number": "+1", "name": "Alice", "profile": {"givenName": "Al"}
        }))
        .unwrap();
        assert_eq!(named.display_name, "Alice");

        let profile_only = Contact::from_signal_cli(&json!({
            "number": "+2", "name": "", "profile": {"givenName": "Bo", "familyName": "Li"}
        }))
        .unwrap();
        assert_eq!(profile_only.display_name, "Bo Li");

        let bare = Contact::from_signal_cli(&json!({"uuid": "u-3"})).unwrap();
        assert_eq!(bare.id, "u-3");
        assert_eq!(bare.display_name, "u-3");

        assert!(Contact::from_signal_cli(&json!({"name": "ghost"})).is_none());
    }

    #[test]
    fn group_members_in_both_shapes() {
        let g = Group::from_signal_cli(&json!({
            "id": "g1",
            "members": ["+1", {"number": "+2"}, {"uuid": "u-3"}, {"number": "+2"}]
        }))
        .unwrap();
        assert_eq!(g.name, "Unknown Group");
        assert_eq!(g.members.len(), 3);
    }

    #[test]
    fn snapshot_ids_are_unique() {
        let snap = Snapshot::from_listing(
            &json!([{"number": "+1", "name": "A"}, {"number": "+1", "name": "A again"}, {"uuid": "u2"}]),
            &json!([{"id": "g", "name": "Team"}]),
        );
        assert_eq!(snap.contacts.len(), 2);
        assert_eq!(snap.display_name("+1"), "A again");
        assert_eq!(snap.display_name("g"), "Team");
        assert_eq!(snap.display_name("+999"), "+999");
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn lookup_by_uuid() {
        let snap = Snapshot::from_listing(
            &json!([{"number": "+1", "uuid": "u-1", "name": "Zed"}, {"number": "+2", "name": "amy"}]),
            &Value::Null,
        );
        assert_eq!(snap.display_name("u-1"), "Zed");
        let names: Vec<&str> = snap.sorted_contacts().iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["amy", "Zed"]);
    }
}
