use crate::model::tables::{BRANCH_QUEUE_TABLE, COMMUNICATION_TABLE, ID_MAPPINGS_TABLE};

pub const BRANCH_QUEUE_DDL: &str = r#"CREATE TABLE IF NOT EXISTS `wiser_branch_queue` (
    `id` INT NOT NULL AUTO_INCREMENT,
    `name` VARCHAR(150) NOT NULL DEFAULT '',
    `action` VARCHAR(25) NOT NULL DEFAULT '',
    `data` MEDIUMTEXT NULL,
    `start_on` DATETIME NULL,
    `started_on` DATETIME NULL,
    `finished_on` DATETIME NULL,
    `success` TINYINT(1) NULL,
    `errors` MEDIUMTEXT NULL,
    `items_processed` INT NOT NULL DEFAULT 0,
    `total_items` INT NOT NULL DEFAULT 0,
    `added_by` VARCHAR(100) NOT NULL DEFAULT '',
    `user_id` BIGINT NOT NULL DEFAULT 0,
    `added_on` DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    KEY `idx_due` (`started_on`, `start_on`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#;

pub const ID_MAPPINGS_DDL: &str = r#"CREATE TABLE IF NOT EXISTS `wiser_id_mappings` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `table_name` VARCHAR(100) NOT NULL,
    `our_id` BIGINT NOT NULL,
    `production_id` BIGINT NOT NULL,
    PRIMARY KEY (`id`),
    UNIQUE KEY `idx_unique` (`table_name`, `our_id`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#;

pub const COMMUNICATION_DDL: &str = r#"CREATE TABLE IF NOT EXISTS `wiser_communication_generated` (
    `id` INT NOT NULL AUTO_INCREMENT,
    `communication_id` INT NOT NULL DEFAULT 0,
    `receiver` VARCHAR(255) NOT NULL DEFAULT '',
    `receiver_name` VARCHAR(255) NOT NULL DEFAULT '',
    `sender` VARCHAR(255) NOT NULL DEFAULT '',
    `sender_name` VARCHAR(255) NOT NULL DEFAULT '',
    `subject` VARCHAR(255) NOT NULL DEFAULT '',
    `content` MEDIUMTEXT NULL,
    `communicationtype` VARCHAR(50) NOT NULL DEFAULT 'email',
    `send_date` DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    `attempt_count` INT NOT NULL DEFAULT 0,
    `processed_date` DATETIME NULL,
    `added_by` VARCHAR(100) NOT NULL DEFAULT '',
    `added_on` DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#;

/// DDL for one of the engine's bookkeeping tables.
pub fn bookkeeping_ddl(table: &str) -> Option<&'static str> {
    match table.to_ascii_lowercase().as_str() {
        t if t == BRANCH_QUEUE_TABLE => Some(BRANCH_QUEUE_DDL),
        t if t == ID_MAPPINGS_TABLE => Some(ID_MAPPINGS_DDL),
        t if t == COMMUNICATION_TABLE => Some(COMMUNICATION_DDL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_bookkeeping_tables() {
        assert!(bookkeeping_ddl("WISER_ID_MAPPINGS").is_some());
        assert!(bookkeeping_ddl(BRANCH_QUEUE_TABLE).unwrap().contains("`wiser_branch_queue`"));
        assert!(bookkeeping_ddl("wiser_item").is_none());
    }
}
