use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;

use crate::logic::clone::SchemaCloner;
use crate::logic::seed::{DataSeeder, SeedReport};
use crate::model::tables::ID_MAPPINGS_TABLE;
use crate::model::{BranchError, ConnectionSettings, CreateBranchSettings};
use crate::services::{DataSelectorResolver, ItemService};
use crate::store::{ConnectionFactory, DatabaseHelper};

/// Summary of a created branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedBranch {
    pub database_name: String,
    pub tables: usize,
    pub seed: SeedReport,
    pub triggers: usize,
    pub routines: usize,
}

/// Builds a new branch database from production.
pub struct BranchCreator {
    factory: Arc<dyn ConnectionFactory>,
    data_selectors: Arc<dyn DataSelectorResolver>,
}

impl BranchCreator {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        data_selectors: Arc<dyn DataSelectorResolver>,
    ) -> Self {
        Self {
            factory,
            data_selectors,
        }
    }

    /// Create `branch.database_name` and fill it according to `settings`.
    ///
    /// `branch` must already carry decrypted credentials. A database that
    /// exists beforehand is never touched; one created here is dropped again
    /// if any later step fails.
    pub async fn create(
        &self,
        production: &ConnectionSettings,
        branch: &ConnectionSettings,
        settings: &CreateBranchSettings,
    ) -> Result<CreatedBranch> {
        let name = branch.require_database_name()?.to_string();
        for rule in &settings.entities {
            rule.validate()?;
        }

        let helper = self
            .factory
            .helper(branch)
            .await
            .context("Failed to connect to the branch server")?;
        if helper.database_exists(&name).await? {
            return Err(BranchError::Precondition(format!(
                "Database '{}' already exists",
                name
            ))
            .into());
        }

        helper
            .create_database(&name)
            .await
            .with_context(|| format!("Failed to create database '{}'", name))?;
        info!("Created database '{}', copying from '{}'", name, production.database_name);

        match self.build(production, branch, settings, helper.clone()).await {
            Ok(created) => Ok(created),
            Err(e) => {
                error!("Creating branch '{}' failed: {:#}", name, e);
                Self::discard(helper.as_ref(), &name).await;
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        production: &ConnectionSettings,
        branch: &ConnectionSettings,
        settings: &CreateBranchSettings,
        helper: Arc<dyn DatabaseHelper>,
    ) -> Result<CreatedBranch> {
        let source = self.factory.connect(production).await?;
        let target = self.factory.connect(branch).await?;
        let items: Arc<dyn ItemService> = self.factory.merge_session(production).await?.items;

        let cloner = SchemaCloner::new(source.clone(), target.clone());
        let tables = cloner.tables_to_clone(&settings.tables).await?;
        cloner.clone_tables(&tables).await?;

        let mut seeder = DataSeeder::new(
            source,
            target.clone(),
            helper.clone(),
            items,
            self.data_selectors.clone(),
        );
        let seed = seeder.seed(settings, &tables).await?;

        helper
            .ensure_tables_exist(target.database_name(), &[ID_MAPPINGS_TABLE])
            .await?;

        let triggers = cloner.clone_triggers().await?;
        let routines = cloner.clone_routines().await?;

        Ok(CreatedBranch {
            database_name: target.database_name().to_string(),
            tables: tables.len(),
            seed,
            triggers,
            routines,
        })
    }

    async fn discard(helper: &dyn DatabaseHelper, name: &str) {
        match helper.database_exists(name).await {
            Ok(true) => match helper.drop_database(name).await {
                Ok(()) => info!("Dropped partially created database '{}'", name),
                Err(e) => warn!("Could not drop partially created database '{}': {:#}", name, e),
            },
            Ok(false) => {}
            Err(e) => warn!("Could not check whether '{}' exists: {:#}", name, e),
        }
    }
}
