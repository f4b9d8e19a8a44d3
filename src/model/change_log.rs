use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::BranchError;

/// Which part of a merge policy governs a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Create,
    Update,
    Delete,
}

/// Non-item configuration objects that are tracked in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettingKind {
    Entity,
    EntityProperty,
    Link,
    Module,
    Permission,
    Query,
    Role,
    FieldTemplate,
    ApiConnection,
    DataSelector,
    StyledOutput,
}

impl SettingKind {
    pub const ALL: [SettingKind; 11] = [
        SettingKind::Entity,
        SettingKind::EntityProperty,
        SettingKind::Link,
        SettingKind::Module,
        SettingKind::Permission,
        SettingKind::Query,
        SettingKind::Role,
        SettingKind::FieldTemplate,
        SettingKind::ApiConnection,
        SettingKind::DataSelector,
        SettingKind::StyledOutput,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            SettingKind::Entity => "wiser_entity",
            SettingKind::EntityProperty => "wiser_entityproperty",
            SettingKind::Link => "wiser_link",
            SettingKind::Module => "wiser_module",
            SettingKind::Permission => "wiser_permission",
            SettingKind::Query => "wiser_query",
            SettingKind::Role => "wiser_roles",
            SettingKind::FieldTemplate => "wiser_field_templates",
            SettingKind::ApiConnection => "wiser_api_connection",
            SettingKind::DataSelector => "wiser_data_selector",
            SettingKind::StyledOutput => "wiser_styled_output",
        }
    }

    /// Suffix used in change-log verbs, e.g. `ENTITYPROPERTY` in `INSERT_ENTITYPROPERTY`.
    fn verb_suffix(&self) -> &'static str {
        match self {
            SettingKind::Entity => "ENTITY",
            SettingKind::EntityProperty => "ENTITYPROPERTY",
            SettingKind::Link => "LINK_SETTING",
            SettingKind::Module => "MODULE",
            SettingKind::Permission => "PERMISSION",
            SettingKind::Query => "QUERY",
            SettingKind::Role => "ROLE",
            SettingKind::FieldTemplate => "FIELD_TEMPLATE",
            SettingKind::ApiConnection => "API_CONNECTION",
            SettingKind::DataSelector => "DATA_SELECTOR",
            SettingKind::StyledOutput => "STYLED_OUTPUT",
        }
    }
}

/// Every mutation verb the branch triggers can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    CreateItem,
    UpdateItem,
    DeleteItem,
    UndeleteItem,
    AddLink,
    ChangeLink,
    RemoveLink,
    UpdateLinkDetail,
    AddFile,
    UpdateFile,
    DeleteFile,
    Setting { kind: SettingKind, effect: Effect },
}

impl ChangeAction {
    /// The policy flag that decides whether this action may be replayed.
    ///
    /// Links and files belong to an item, so changing them counts as an
    /// update of that item. Undelete reverses a delete and follows the same flag.
    pub fn effect(&self) -> Effect {
        match self {
            ChangeAction::CreateItem => Effect::Create,
            ChangeAction::DeleteItem | ChangeAction::UndeleteItem => Effect::Delete,
            ChangeAction::UpdateItem
            | ChangeAction::AddLink
            | ChangeAction::ChangeLink
            | ChangeAction::RemoveLink
            | ChangeAction::UpdateLinkDetail
            | ChangeAction::AddFile
            | ChangeAction::UpdateFile
            | ChangeAction::DeleteFile => Effect::Update,
            ChangeAction::Setting { effect, .. } => *effect,
        }
    }
}

impl FromStr for ChangeAction {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = s.trim().to_ascii_uppercase();
        let action = match verb.as_str() {
            "CREATE_ITEM" | "INSERT_ITEM" => ChangeAction::CreateItem,
            "UPDATE_ITEM" => ChangeAction::UpdateItem,
            "DELETE_ITEM" => ChangeAction::DeleteItem,
            "UNDELETE_ITEM" => ChangeAction::UndeleteItem,
            "ADD_LINK" => ChangeAction::AddLink,
            "CHANGE_LINK" => ChangeAction::ChangeLink,
            "REMOVE_LINK" => ChangeAction::RemoveLink,
            "UPDATE_ITEMLINKDETAIL" => ChangeAction::UpdateLinkDetail,
            "ADD_FILE" => ChangeAction::AddFile,
            "UPDATE_FILE" => ChangeAction::UpdateFile,
            "DELETE_FILE" => ChangeAction::DeleteFile,
            _ => {
                let (effect, suffix) = if let Some(rest) = verb.strip_prefix("INSERT_") {
                    (Effect::Create, rest)
                } else if let Some(rest) = verb.strip_prefix("UPDATE_") {
                    (Effect::Update, rest)
                } else if let Some(rest) = verb.strip_prefix("DELETE_") {
                    (Effect::Delete, rest)
                } else {
                    return Err(BranchError::UnknownAction(s.to_string()));
                };

                let kind = SettingKind::ALL
                    .iter()
                    .copied()
                    .find(|kind| kind.verb_suffix() == suffix)
                    .ok_or_else(|| BranchError::UnknownAction(s.to_string()))?;

                ChangeAction::Setting { kind, effect }
            }
        };
        Ok(action)
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            ChangeAction::CreateItem => "CREATE_ITEM",
            ChangeAction::UpdateItem => "UPDATE_ITEM",
            ChangeAction::DeleteItem => "DELETE_ITEM",
            ChangeAction::UndeleteItem => "UNDELETE_ITEM",
            ChangeAction::AddLink => "ADD_LINK",
            ChangeAction::ChangeLink => "CHANGE_LINK",
            ChangeAction::RemoveLink => "REMOVE_LINK",
            ChangeAction::UpdateLinkDetail => "UPDATE_ITEMLINKDETAIL",
            ChangeAction::AddFile => "ADD_FILE",
            ChangeAction::UpdateFile => "UPDATE_FILE",
            ChangeAction::DeleteFile => "DELETE_FILE",
            ChangeAction::Setting { kind, effect } => {
                let prefix = match effect {
                    Effect::Create => "INSERT",
                    Effect::Update => "UPDATE",
                    Effect::Delete => "DELETE",
                };
                return write!(f, "{}_{}", prefix, kind.verb_suffix());
            }
        };
        f.write_str(verb)
    }
}

/// One row of the branch's `wiser_history` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogRecord {
    pub id: u64,
    pub action: ChangeAction,
    pub table_name: String,
    pub item_id: u64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub language_code: String,
    pub group_name: String,
    pub changed_by: String,
}

impl ChangeLogRecord {
    pub fn new(id: u64, action: ChangeAction, table_name: &str, item_id: u64) -> Self {
        Self {
            id,
            action,
            table_name: table_name.to_string(),
            item_id,
            field: String::new(),
            old_value: None,
            new_value: None,
            language_code: String::new(),
            group_name: String::new(),
            changed_by: String::new(),
        }
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }

    pub fn with_values(mut self, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        self.old_value = old_value.map(str::to_string);
        self.new_value = new_value.map(str::to_string);
        self
    }

    pub fn with_language(mut self, language_code: &str, group_name: &str) -> Self {
        self.language_code = language_code.to_string();
        self.group_name = group_name.to_string();
        self
    }

    /// Parse an id out of the old value.
    pub fn old_value_id(&self) -> Result<u64, BranchError> {
        self.parse_id(self.old_value.as_deref(), "old value")
    }

    /// Parse an id out of the new value.
    pub fn new_value_id(&self) -> Result<u64, BranchError> {
        self.parse_id(self.new_value.as_deref(), "new value")
    }

    /// `ADD_LINK` and `REMOVE_LINK` store `"{type},{ordering}"` (or only the type) in `field`.
    pub fn link_type_and_ordering(&self) -> Result<(i64, i64), BranchError> {
        let mut parts = self.field.split(',').map(str::trim);
        let link_type = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| self.malformed(format!("invalid link type in field '{}'", self.field)))?;
        let ordering = parts.next().and_then(|p| p.parse::<i64>().ok()).unwrap_or(1);
        Ok((link_type, ordering))
    }

    fn parse_id(&self, value: Option<&str>, what: &str) -> Result<u64, BranchError> {
        value
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| self.malformed(format!("{} '{}' is not an id", what, value.unwrap_or(""))))
    }

    fn malformed(&self, reason: String) -> BranchError {
        BranchError::MalformedRecord {
            id: self.id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item_and_link_verbs() {
        assert_eq!("CREATE_ITEM".parse::<ChangeAction>().unwrap(), ChangeAction::CreateItem);
        assert_eq!("insert_item".parse::<ChangeAction>().unwrap(), ChangeAction::CreateItem);
        assert_eq!("REMOVE_LINK".parse::<ChangeAction>().unwrap(), ChangeAction::RemoveLink);
        assert_eq!(
            "UPDATE_ITEMLINKDETAIL".parse::<ChangeAction>().unwrap(),
            ChangeAction::UpdateLinkDetail
        );
    }

    #[test]
    fn test_parse_setting_verbs_and_display_round_trip() {
        for kind in SettingKind::ALL {
            for effect in [Effect::Create, Effect::Update, Effect::Delete] {
                let action = ChangeAction::Setting { kind, effect };
                let parsed: ChangeAction = action.to_string().parse().unwrap();
                assert_eq!(parsed, action);
            }
        }
        assert_eq!(
            "INSERT_ENTITYPROPERTY".parse::<ChangeAction>().unwrap(),
            ChangeAction::Setting {
                kind: SettingKind::EntityProperty,
                effect: Effect::Create
            }
        );
    }

    #[test]
    fn test_unknown_verb_is_an_error() {
        let err = "MERGE_EVERYTHING".parse::<ChangeAction>().unwrap_err();
        assert!(matches!(err, BranchError::UnknownAction(v) if v == "MERGE_EVERYTHING"));
        assert!("INSERT_SOMETHING".parse::<ChangeAction>().is_err());
    }

    #[test]
    fn test_link_field_parsing() {
        let record = ChangeLogRecord::new(1, ChangeAction::AddLink, "wiser_itemlink", 10)
            .with_field("3,7");
        assert_eq!(record.link_type_and_ordering().unwrap(), (3, 7));

        let only_type = record.clone().with_field("5");
        assert_eq!(only_type.link_type_and_ordering().unwrap(), (5, 1));

        let broken = record.with_field("abc");
        assert!(broken.link_type_and_ordering().is_err());
    }

    #[test]
    fn test_effects() {
        assert_eq!(ChangeAction::UndeleteItem.effect(), Effect::Delete);
        assert_eq!(ChangeAction::AddFile.effect(), Effect::Update);
    }
}
