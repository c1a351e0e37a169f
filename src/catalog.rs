//! Challenge catalog
//!
//! Challenge content is owned by another service; the gateway only needs to
//! know whether a challenge exists, whether it is locked for a user, its XP
//! reward and its test cases. [`FileCatalog`] serves these from a TOML file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// One test case of a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub xp_reward: u32,
    /// Locked for everybody not listed in `unlocked_for`
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub unlocked_for: Vec<Uuid>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

#[async_trait]
pub trait ChallengeCatalog: Send + Sync {
    async fn find(&self, challenge_id: Uuid) -> Option<Challenge>;

    async fn is_locked(&self, challenge: &Challenge, user_id: Uuid) -> bool {
        challenge.locked && !challenge.unlocked_for.contains(&user_id)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    challenges: Vec<Challenge>,
}

/// Catalog loaded once from a TOML file
#[derive(Debug, Default)]
pub struct FileCatalog {
    challenges: HashMap<Uuid, Challenge>,
}

impl FileCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read challenge catalog {}", path.display()))?;
        let catalog = Self::from_toml(&content)
            .with_context(|| format!("Invalid challenge catalog {}", path.display()))?;
        info!(
            "Loaded {} challenges from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let mut challenges = HashMap::with_capacity(file.challenges.len());
        for challenge in file.challenges {
            let mut names = std::collections::HashSet::new();
            for test in &challenge.tests {
                // Test names are the reducer's dedup key
                if !names.insert(test.name.as_str()) {
                    anyhow::bail!(
                        "Duplicate test name '{}' in challenge {}",
                        test.name,
                        challenge.id
                    );
                }
            }
            let id = challenge.id;
            if challenges.insert(id, challenge).is_some() {
                anyhow::bail!("Duplicate challenge id {}", id);
            }
        }
        Ok(Self { challenges })
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }
}

#[async_trait]
impl ChallengeCatalog for FileCatalog {
    async fn find(&self, challenge_id: Uuid) -> Option<Challenge> {
        self.challenges.get(&challenge_id).cloned()
    }
}
