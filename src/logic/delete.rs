use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::model::{BranchError, ConnectionSettings};
use crate::store::ConnectionFactory;

/// Only databases derived from production may be dropped, and never
/// production itself.
pub fn check_deletion_allowed(target: &str, production: &str) -> Result<(), BranchError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(BranchError::Configuration(
            "No database name given for the branch".to_string(),
        ));
    }
    if target.eq_ignore_ascii_case(production) {
        return Err(BranchError::Precondition(format!(
            "Refusing to delete '{}': it is the production database",
            target
        )));
    }
    if !target
        .to_ascii_lowercase()
        .starts_with(&production.to_ascii_lowercase())
    {
        return Err(BranchError::Precondition(format!(
            "Refusing to delete '{}': branch names start with '{}'",
            target, production
        )));
    }
    Ok(())
}

pub struct BranchDeleter {
    factory: Arc<dyn ConnectionFactory>,
}

impl BranchDeleter {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Drop `database_name` from the server of `branch`, after the safety gates.
    pub async fn delete(
        &self,
        production: &ConnectionSettings,
        branch: &ConnectionSettings,
        database_name: &str,
    ) -> Result<()> {
        check_deletion_allowed(database_name, &production.database_name)?;
        let helper = self
            .factory
            .helper(branch)
            .await
            .context("Failed to connect to the branch server")?;
        helper
            .drop_database(database_name.trim())
            .await
            .with_context(|| format!("Failed to drop database '{}'", database_name))?;
        info!("Dropped branch database '{}'", database_name.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_gates() {
        assert!(check_deletion_allowed("shop_spring", "shop").is_ok());
        assert!(check_deletion_allowed("SHOP_spring", "shop").is_ok());
        assert!(matches!(
            check_deletion_allowed("shop", "shop"),
            Err(BranchError::Precondition(_))
        ));
        assert!(matches!(
            check_deletion_allowed("other_db", "shop"),
            Err(BranchError::Precondition(_))
        ));
        assert!(matches!(
            check_deletion_allowed("  ", "shop"),
            Err(BranchError::Configuration(_))
        ));
    }
}
