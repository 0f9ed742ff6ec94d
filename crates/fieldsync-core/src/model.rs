use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

pub type RecordId = String;
pub type LayerId = String;
pub type UserId = String;

/// Reserved owner id of the admin-authored baseline partition.
pub const TEMPLATE_OWNER: &str = "template";

/// Who a record or partition belongs to.
///
/// On the wire this is `null` for unclaimed data, the literal `"template"` for
/// the read-only baseline, and the user id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Owner {
    #[default]
    Unclaimed,
    Template,
    User(UserId),
}

impl Owner {
    pub fn user(id: impl Into<UserId>) -> Self {
        Owner::User(id.into())
    }

    pub fn is_template(&self) -> bool {
        matches!(self, Owner::Template)
    }

    pub fn is_user(&self, user_id: &str) -> bool {
        matches!(self, Owner::User(id) if id == user_id)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Owner::Unclaimed => None,
            Owner::Template => Some(TEMPLATE_OWNER),
            Owner::User(id) => Some(id),
        }
    }
}

impl From<Option<String>> for Owner {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Owner::Unclaimed,
            Some(id) if id == TEMPLATE_OWNER => Owner::Template,
            Some(id) => Owner::User(id),
        }
    }
}

impl From<Owner> for Option<String> {
    fn from(owner: Owner) -> Self {
        owner.as_str().map(str::to_string)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("<unclaimed>"))
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.into())
    }
}

/// One geographic record. `fields` and `geometry` are carried opaquely;
/// field-level merge belongs to the record layer, not the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub owner_id: Owner,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub geometry: Option<serde_json::Value>,
}

fn default_visible() -> bool {
    true
}

impl Record {
    pub fn new(id: impl Into<RecordId>, owner_id: Owner) -> Self {
        Self {
            id: id.into(),
            owner_id,
            display_name: String::new(),
            visible: true,
            updated_at: None,
            deleted: None,
            fields: serde_json::Map::new(),
            geometry: None,
        }
    }

    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn is_template(&self) -> bool {
        self.owner_id.is_template()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }
}

/// One `(layer_id, owner_id)` bucket of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub layer_id: LayerId,
    #[serde(default)]
    pub owner_id: Owner,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl Partition {
    pub fn new(layer_id: impl Into<LayerId>, owner_id: Owner, records: Vec<Record>) -> Self {
        Self {
            layer_id: layer_id.into(),
            owner_id,
            records,
        }
    }

    /// An empty partition; writing it clears the stored `(layer, owner)` bucket.
    pub fn cleared(layer_id: impl Into<LayerId>, owner_id: Owner) -> Self {
        Self::new(layer_id, owner_id, Vec::new())
    }

    pub fn is_template(&self) -> bool {
        self.owner_id.is_template()
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.is_user(user_id)
    }

    pub fn key(&self) -> (&str, &Owner) {
        (&self.layer_id, &self.owner_id)
    }

    /// First record id that appears more than once, if any.
    pub fn duplicate_record_id(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .find(|r| !seen.insert(r.id.as_str()))
            .map(|r| r.id.as_str())
    }
}

/// Which store slice a partition lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Private,
    Public,
    Template,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 3] = [
        PartitionKind::Private,
        PartitionKind::Public,
        PartitionKind::Template,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            PartitionKind::Private => "private",
            PartitionKind::Public => "public",
            PartitionKind::Template => "template",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Automatic tie-break rule applied when no interactive answer is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Latest,
    #[serde(rename = "self")]
    SelfOwned,
    #[default]
    Manual,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Latest => "latest",
            Strategy::SelfOwned => "self",
            Strategy::Manual => "manual",
        })
    }
}

/// Auto-resolve override chosen by the operator for all remaining conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkMode {
    #[serde(rename = "self")]
    SelfOwned,
    Latest,
}

impl fmt::Display for BulkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BulkMode::SelfOwned => "self",
            BulkMode::Latest => "latest",
        })
    }
}
