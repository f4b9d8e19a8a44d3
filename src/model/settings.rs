use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::model::{BranchError, Effect, SettingKind};

pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Where a database lives. Missing host, port and credentials are inherited
/// from the production connection, which makes "same server" the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(default)]
    pub database_name: String,
    #[serde(rename = "databaseHost", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "databasePort", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "databaseUsername", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "databasePassword", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectionSettings {
    /// Identifies the MySQL server, used to choose between cross-schema
    /// `INSERT … SELECT` and batched copies.
    pub fn server_key(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("localhost").to_ascii_lowercase(),
            self.port.unwrap_or(DEFAULT_MYSQL_PORT)
        )
    }

    /// Fill in whatever is missing from `fallback`.
    pub fn inherit_from(&self, fallback: &ConnectionSettings) -> ConnectionSettings {
        ConnectionSettings {
            database_name: self.database_name.clone(),
            host: self.host.clone().or_else(|| fallback.host.clone()),
            port: self.port.or(fallback.port),
            username: self.username.clone().or_else(|| fallback.username.clone()),
            password: self.password.clone().or_else(|| fallback.password.clone()),
        }
    }

    pub fn with_database(&self, database_name: &str) -> ConnectionSettings {
        ConnectionSettings {
            database_name: database_name.to_string(),
            ..self.clone()
        }
    }

    pub fn require_database_name(&self) -> Result<&str, BranchError> {
        let name = self.database_name.trim();
        if name.is_empty() {
            return Err(BranchError::Configuration(
                "No database name given for the branch".to_string(),
            ));
        }
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMode {
    Everything,
    Random,
    Recent,
    CreatedBefore,
    CreatedAfter,
    CreatedBetween,
    DataSelector,
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCopyRule {
    pub entity_type: String,
    pub mode: CopyMode,
    #[serde(default)]
    pub amount_of_items: Option<u64>,
    #[serde(default)]
    pub start: Option<NaiveDateTime>,
    #[serde(default)]
    pub end: Option<NaiveDateTime>,
    #[serde(default)]
    pub data_selector: Option<u64>,
}

impl EntityCopyRule {
    /// Rules that cannot run at all abort the whole creation.
    pub fn validate(&self) -> Result<(), BranchError> {
        if self.entity_type.trim().is_empty() {
            return Err(BranchError::Configuration(
                "Entity copy rule without an entity type".to_string(),
            ));
        }
        if matches!(self.mode, CopyMode::Random | CopyMode::Recent)
            && self.amount_of_items.unwrap_or(0) == 0
        {
            return Err(BranchError::Configuration(format!(
                "Copy mode {:?} for entity type '{}' needs an amount of items",
                self.mode, self.entity_type
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableCopyType {
    /// Neither structure nor data.
    Nothing,
    StructureOnly,
    #[default]
    Everything,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCopyRule {
    /// Table name, optionally with a leading and/or trailing `%` or `*` wildcard.
    pub table_name: String,
    #[serde(default)]
    pub copy_type: TableCopyType,
}

impl TableCopyRule {
    pub fn matches(&self, table: &str) -> bool {
        let pattern = self.table_name.trim().to_ascii_lowercase();
        let table = table.to_ascii_lowercase();
        let is_wildcard = |c: char| c == '%' || c == '*';

        let leading = pattern.starts_with(is_wildcard);
        let trailing = pattern.len() > 1 && pattern.ends_with(is_wildcard);
        let core = pattern.trim_matches(is_wildcard);

        match (leading, trailing) {
            (true, true) => table.contains(core),
            (true, false) => table.ends_with(core),
            (false, true) => table.starts_with(core),
            (false, false) => table == core,
        }
    }
}

/// First matching rule wins; unmatched tables are copied completely.
pub fn table_copy_type(rules: &[TableCopyRule], table: &str) -> TableCopyType {
    rules
        .iter()
        .find(|rule| rule.matches(table))
        .map(|rule| rule.copy_type)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchSettings {
    #[serde(flatten)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub entities: Vec<EntityCopyRule>,
    #[serde(default)]
    pub tables: Vec<TableCopyRule>,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Entity type name that applies to every entity type without its own policy.
pub const ALL_ENTITY_TYPES: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMergePolicy {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingMergePolicy {
    #[serde(rename = "type")]
    pub kind: SettingKind,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
}

fn allows(create: bool, update: bool, delete: bool, effect: Effect) -> bool {
    match effect {
        Effect::Create => create,
        Effect::Update => update,
        Effect::Delete => delete,
    }
}

/// An operator's decision on a single change-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSetting {
    pub id: u64,
    #[serde(default)]
    pub accept_change: Option<bool>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeBranchSettings {
    #[serde(flatten)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub entities: Vec<EntityMergePolicy>,
    #[serde(default)]
    pub settings: Vec<SettingMergePolicy>,
    #[serde(default)]
    pub conflict_changes: Vec<ConflictSetting>,
    #[serde(default)]
    pub delete_branch_after_successful_merge: bool,
    #[serde(default = "default_true")]
    pub use_transaction: bool,
}

impl MergeBranchSettings {
    pub fn new(database_name: &str) -> Self {
        Self {
            connection: ConnectionSettings {
                database_name: database_name.to_string(),
                ..ConnectionSettings::default()
            },
            entities: Vec::new(),
            settings: Vec::new(),
            conflict_changes: Vec::new(),
            delete_branch_after_successful_merge: false,
            use_transaction: true,
        }
    }

    /// Entity types without a policy (and no `all` fallback) are not merged.
    pub fn entity_allows(&self, entity_type: &str, effect: Effect) -> bool {
        let policy = self
            .entities
            .iter()
            .find(|p| p.entity_type.eq_ignore_ascii_case(entity_type))
            .or_else(|| {
                self.entities
                    .iter()
                    .find(|p| p.entity_type.eq_ignore_ascii_case(ALL_ENTITY_TYPES))
            });
        policy.is_some_and(|p| allows(p.create, p.update, p.delete, effect))
    }

    pub fn setting_allows(&self, kind: SettingKind, effect: Effect) -> bool {
        self.settings
            .iter()
            .find(|p| p.kind == kind)
            .is_some_and(|p| allows(p.create, p.update, p.delete, effect))
    }

    /// `Some(false)` when the operator rejected this record.
    pub fn conflict_decision(&self, record_id: u64) -> Option<bool> {
        self.conflict_changes
            .iter()
            .find(|c| c.id == record_id)
            .and_then(|c| c.accept_change)
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBranchSettings {
    #[serde(default)]
    pub database_name: String,
}
