use std::collections::{HashMap, HashSet};

use crate::model::tables::ItemTable;
use crate::model::{BranchError, ChangeAction, ChangeLogRecord, Effect, SettingKind};

/// The logical object a change-log record touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Item { prefix: String, id: u64 },
    /// Links added and removed by endpoints carry no link id in the log.
    Link {
        prefix: String,
        destination: u64,
        source: u64,
        link_type: i64,
    },
    LinkId { prefix: String, id: u64 },
    File { prefix: String, id: u64 },
    Setting { kind: SettingKind, id: u64 },
}

fn table_prefix(table: &str) -> String {
    ItemTable::parse(table)
        .map(|t| t.prefix)
        .unwrap_or_default()
}

impl ObjectKey {
    pub fn for_record(record: &ChangeLogRecord) -> Result<ObjectKey, BranchError> {
        let prefix = table_prefix(&record.table_name);
        let key = match record.action {
            ChangeAction::CreateItem
            | ChangeAction::UpdateItem
            | ChangeAction::DeleteItem
            | ChangeAction::UndeleteItem => ObjectKey::Item {
                prefix,
                id: record.item_id,
            },
            ChangeAction::AddLink => ObjectKey::Link {
                prefix,
                destination: record.item_id,
                source: record.new_value_id()?,
                link_type: record.link_type_and_ordering()?.0,
            },
            ChangeAction::RemoveLink => ObjectKey::Link {
                prefix,
                destination: record.item_id,
                source: record.old_value_id()?,
                link_type: record.link_type_and_ordering()?.0,
            },
            ChangeAction::ChangeLink | ChangeAction::UpdateLinkDetail => ObjectKey::LinkId {
                prefix,
                id: record.item_id,
            },
            ChangeAction::AddFile | ChangeAction::UpdateFile | ChangeAction::DeleteFile => {
                ObjectKey::File {
                    prefix,
                    id: record.item_id,
                }
            }
            ChangeAction::Setting { kind, .. } => ObjectKey::Setting {
                kind,
                id: record.item_id,
            },
        };
        Ok(key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Lifecycle {
    created: bool,
    deleted: bool,
}

/// Which records touch objects that were created and deleted again within
/// the merged window.
///
/// Such objects never existed in production, so every record touching them
/// is skipped (and pruned from the log). Links carry no id in ADD_LINK and
/// REMOVE_LINK records, so those are paired per record instead: a REMOVE_LINK
/// cancels the latest unmatched ADD_LINK with the same endpoints.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    objects: HashMap<ObjectKey, Lifecycle>,
    open_links: HashMap<ObjectKey, Vec<u64>>,
    cancelled: HashSet<u64>,
}

impl LifecycleTracker {
    pub fn from_records(records: &[ChangeLogRecord]) -> Self {
        let mut tracker = Self::default();
        for record in records {
            // Malformed records fail on their own when replayed.
            let Ok(key) = ObjectKey::for_record(record) else {
                continue;
            };
            tracker.observe(record.id, key, record.action);
        }
        tracker
    }

    fn observe(&mut self, record_id: u64, key: ObjectKey, action: ChangeAction) {
        match action {
            ChangeAction::AddLink => {
                self.open_links.entry(key).or_default().push(record_id);
                return;
            }
            ChangeAction::RemoveLink => {
                if let Some(added) = self.open_links.get_mut(&key).and_then(Vec::pop) {
                    self.cancelled.insert(added);
                    self.cancelled.insert(record_id);
                }
                return;
            }
            _ => {}
        }

        let state = self.objects.entry(key).or_default();
        match action {
            ChangeAction::CreateItem | ChangeAction::AddFile => {
                state.created = true;
                state.deleted = false;
            }
            ChangeAction::DeleteItem | ChangeAction::DeleteFile => state.deleted = true,
            ChangeAction::UndeleteItem => state.deleted = false,
            ChangeAction::Setting { effect, .. } => match effect {
                Effect::Create => {
                    state.created = true;
                    state.deleted = false;
                }
                Effect::Delete => state.deleted = true,
                Effect::Update => {}
            },
            ChangeAction::AddLink
            | ChangeAction::RemoveLink
            | ChangeAction::UpdateItem
            | ChangeAction::ChangeLink
            | ChangeAction::UpdateLinkDetail
            | ChangeAction::UpdateFile => {}
        }
    }

    /// Whether `record`, touching `key`, belongs to a transient object.
    pub fn is_transient(&self, record: &ChangeLogRecord, key: &ObjectKey) -> bool {
        self.cancelled.contains(&record.id)
            || self
                .objects
                .get(key)
                .is_some_and(|state| state.created && state.deleted)
    }

    /// Number of created-then-deleted objects, counting each cancelled link once.
    pub fn transient_count(&self) -> usize {
        let objects = self
            .objects
            .values()
            .filter(|state| state.created && state.deleted)
            .count();
        objects + self.cancelled.len() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64, record_id: u64, action: ChangeAction) -> ChangeLogRecord {
        ChangeLogRecord::new(record_id, action, "wiser_item", id)
    }

    fn add_link(record_id: u64, source: &str, link_type: &str) -> ChangeLogRecord {
        ChangeLogRecord::new(record_id, ChangeAction::AddLink, "wiser_itemlink", 20)
            .with_field(&format!("{},1", link_type))
            .with_values(None, Some(source))
    }

    fn remove_link(record_id: u64, source: &str, link_type: &str) -> ChangeLogRecord {
        ChangeLogRecord::new(record_id, ChangeAction::RemoveLink, "wiser_itemlink", 20)
            .with_field(link_type)
            .with_values(Some(source), None)
    }

    fn transient(tracker: &LifecycleTracker, record: &ChangeLogRecord) -> bool {
        tracker.is_transient(record, &ObjectKey::for_record(record).unwrap())
    }

    #[test]
    fn test_created_then_deleted_is_transient() {
        let records = vec![
            item(10, 1, ChangeAction::CreateItem),
            item(10, 2, ChangeAction::UpdateItem),
            item(10, 3, ChangeAction::DeleteItem),
            item(11, 4, ChangeAction::DeleteItem),
        ];
        let tracker = LifecycleTracker::from_records(&records);
        assert!(transient(&tracker, &records[0]));
        assert!(transient(&tracker, &records[1]));
        assert!(!transient(&tracker, &records[3]));
        assert_eq!(tracker.transient_count(), 1);
    }

    #[test]
    fn test_undelete_clears_deleted_flag() {
        let records = vec![
            item(10, 1, ChangeAction::CreateItem),
            item(10, 2, ChangeAction::DeleteItem),
            item(10, 3, ChangeAction::UndeleteItem),
        ];
        let tracker = LifecycleTracker::from_records(&records);
        assert!(!transient(&tracker, &records[0]));
    }

    #[test]
    fn test_links_are_keyed_by_endpoints() {
        let add = add_link(1, "21", "3");
        let remove = remove_link(2, "21", "3");
        let other = remove_link(3, "21", "4");

        assert_eq!(
            ObjectKey::for_record(&add).unwrap(),
            ObjectKey::for_record(&remove).unwrap()
        );
        let tracker = LifecycleTracker::from_records(&[add.clone(), remove.clone(), other.clone()]);
        assert!(transient(&tracker, &add));
        assert!(transient(&tracker, &remove));
        assert!(!transient(&tracker, &other));
    }

    #[test]
    fn test_re_added_link_survives() {
        let records = vec![add_link(1, "2", "2"), remove_link(2, "2", "2"), add_link(3, "2", "2")];
        let tracker = LifecycleTracker::from_records(&records);
        assert!(transient(&tracker, &records[0]));
        assert!(transient(&tracker, &records[1]));
        assert!(!transient(&tracker, &records[2]));
        assert_eq!(tracker.transient_count(), 1);
    }

    #[test]
    fn test_removing_an_existing_link_is_kept() {
        let records = vec![remove_link(1, "2", "2"), add_link(2, "2", "2"), remove_link(3, "2", "2")];
        let tracker = LifecycleTracker::from_records(&records);
        assert!(!transient(&tracker, &records[0]));
        assert!(transient(&tracker, &records[1]));
        assert!(transient(&tracker, &records[2]));
    }

    #[test]
    fn test_prefixed_items_are_distinct() {
        let a = ChangeLogRecord::new(1, ChangeAction::CreateItem, "product_wiser_item", 5);
        let b = ChangeLogRecord::new(2, ChangeAction::DeleteItem, "wiser_item", 5);
        let tracker = LifecycleTracker::from_records(&[a.clone(), b]);
        assert!(!transient(&tracker, &a));
    }
}
