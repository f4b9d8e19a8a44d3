use serde::{Deserialize, Serialize};

/// What the engine needs to know about an item to apply merge policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: u64,
    pub entity_type: String,
    /// Prefix of the item table the row was found in.
    pub table_prefix: String,
    /// Found in the archive table rather than the live one.
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: u64,
    pub source: u64,
    pub destination: u64,
    pub link_type: i64,
    pub ordering: i64,
}

impl LinkInfo {
    pub fn key(&self) -> LinkKey {
        LinkKey {
            source: self.source,
            destination: self.destination,
            link_type: self.link_type,
        }
    }
}

/// Links are identified by their endpoints and type when replaying,
/// because the change log does not carry a link id for add/remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub source: u64,
    pub destination: u64,
    pub link_type: i64,
}

/// Which row a file is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOwner {
    Item(u64),
    Link(u64),
}

impl FileOwner {
    /// Build from the `item_id` / `itemlink_id` discriminator stored in the change log.
    pub fn from_discriminator(column: &str, id: u64) -> Option<Self> {
        match column.trim().to_ascii_lowercase().as_str() {
            "item_id" => Some(FileOwner::Item(id)),
            "itemlink_id" => Some(FileOwner::Link(id)),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            FileOwner::Item(_) => "item_id",
            FileOwner::Link(_) => "itemlink_id",
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            FileOwner::Item(id) | FileOwner::Link(id) => *id,
        }
    }
}

/// Values longer than this are stored in `long_value` instead of `value`.
pub const DETAIL_VALUE_MAX_LENGTH: usize = 1000;

/// A key/value detail row of an item or a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailValue {
    /// `item_id` for item details, `itemlink_id` for link details.
    pub owner_column: &'static str,
    pub owner_id: u64,
    pub key: String,
    pub language_code: String,
    pub group_name: String,
    pub value: String,
}

impl DetailValue {
    /// `(value, long_value)` as they should be written.
    pub fn storage_columns(&self) -> (String, String) {
        if self.value.chars().count() > DETAIL_VALUE_MAX_LENGTH {
            (String::new(), self.value.clone())
        } else {
            (self.value.clone(), String::new())
        }
    }
}

/// Link type configuration as exposed by the item service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkTypeSettings {
    pub id: u64,
    pub link_type: i64,
    pub name: String,
    pub destination_entity_type: String,
    pub source_entity_type: String,
    pub use_dedicated_table: bool,
}
