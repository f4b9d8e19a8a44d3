use crate::model::BranchError;

/// The change log written by triggers in every branch.
pub const HISTORY_TABLE: &str = "wiser_history";
/// Persistent branch id -> production id mappings, stored in the branch.
pub const ID_MAPPINGS_TABLE: &str = "wiser_id_mappings";
pub const BRANCH_QUEUE_TABLE: &str = "wiser_branch_queue";
pub const COMMUNICATION_TABLE: &str = "wiser_communication_generated";

pub const ENTITY_TABLE: &str = "wiser_entity";

pub const ITEM_TABLE: &str = "wiser_item";
pub const ITEM_DETAIL_TABLE: &str = "wiser_itemdetail";
pub const ITEM_LINK_TABLE: &str = "wiser_itemlink";
pub const ITEM_LINK_DETAIL_TABLE: &str = "wiser_itemlinkdetail";
pub const ITEM_FILE_TABLE: &str = "wiser_itemfile";

pub const ARCHIVE_SUFFIX: &str = "_archive";

/// The item table families that exist once per table prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemTableKind {
    Item,
    ItemDetail,
    ItemLink,
    ItemLinkDetail,
    ItemFile,
}

impl ItemTableKind {
    pub const ALL: [ItemTableKind; 5] = [
        ItemTableKind::Item,
        ItemTableKind::ItemDetail,
        ItemTableKind::ItemLink,
        ItemTableKind::ItemLinkDetail,
        ItemTableKind::ItemFile,
    ];

    pub fn base_name(&self) -> &'static str {
        match self {
            ItemTableKind::Item => ITEM_TABLE,
            ItemTableKind::ItemDetail => ITEM_DETAIL_TABLE,
            ItemTableKind::ItemLink => ITEM_LINK_TABLE,
            ItemTableKind::ItemLinkDetail => ITEM_LINK_DETAIL_TABLE,
            ItemTableKind::ItemFile => ITEM_FILE_TABLE,
        }
    }

    /// Name of this family's table for `prefix`.
    pub fn table(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.base_name())
    }
}

/// A parsed `{prefix}wiser_item…[_archive]` table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemTable {
    pub prefix: String,
    pub kind: ItemTableKind,
    pub archive: bool,
}

impl ItemTable {
    pub fn parse(table: &str) -> Option<Self> {
        let lower = table.to_ascii_lowercase();
        let (base, archive) = match lower.strip_suffix(ARCHIVE_SUFFIX) {
            Some(stripped) => (stripped.to_string(), true),
            None => (lower, false),
        };

        ItemTableKind::ALL.iter().find_map(|kind| {
            base.strip_suffix(kind.base_name()).map(|prefix| ItemTable {
                prefix: prefix.to_string(),
                kind: *kind,
                archive,
            })
        })
    }

    /// The live (non-archive) table name.
    pub fn name(&self) -> String {
        self.kind.table(&self.prefix)
    }

    pub fn archive_name(&self) -> String {
        format!("{}{}", self.name(), ARCHIVE_SUFFIX)
    }

    /// The item table that owns rows of this family for the same prefix.
    pub fn item_table(&self) -> String {
        ItemTableKind::Item.table(&self.prefix)
    }
}

pub fn is_archive_table(table: &str) -> bool {
    table.to_ascii_lowercase().ends_with(ARCHIVE_SUFFIX)
}

/// Lowercased table name without the archive suffix. Ids are shared between
/// a table and its archive, so mappings and caches are keyed by this.
pub fn normalize_table_name(table: &str) -> String {
    let lower = table.to_ascii_lowercase();
    match lower.strip_suffix(ARCHIVE_SUFFIX) {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

/// `product` and `product_` both name the `product_wiser_item…` tables.
pub fn normalize_table_prefix(prefix: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{}_", prefix)
    }
}

pub fn archive_table_name(table: &str) -> String {
    format!("{}{}", normalize_table_name(table), ARCHIVE_SUFFIX)
}

/// Quote a table or column name with backticks.
///
/// Names come from change-log rows and settings documents, so anything that
/// could break out of the quotes is rejected instead of escaped.
pub fn quote_identifier(name: &str) -> Result<String, BranchError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$');
    if !valid {
        return Err(BranchError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("`{}`", name))
}

/// Quote a `database`.`table` pair.
pub fn qualified_name(database: &str, table: &str) -> Result<String, BranchError> {
    Ok(format!(
        "{}.{}",
        quote_identifier(database)?,
        quote_identifier(table)?
    ))
}
