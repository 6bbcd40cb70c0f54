use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::ImageRef;
use super::version::SemVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Known vulnerability affecting versions in `[introduced, fixed)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAdvisory {
    pub id: String,
    /// Image repository, e.g. `nginx` or `registry.local/team/api`.
    pub repository: String,
    pub severity: Severity,
    #[serde(default)]
    pub summary: String,
    pub introduced: Option<String>,
    pub fixed: Option<String>,
}

impl SecurityAdvisory {
    pub fn affects(&self, version: &str) -> bool {
        let bounds = (self.introduced.as_deref(), self.fixed.as_deref());
        if bounds == (None, None) {
            return true;
        }
        let Some(v) = SemVersion::parse(version) else {
            return false;
        };
        let after_introduced = match bounds.0.and_then(SemVersion::parse) {
            Some(introduced) => v >= introduced,
            None => true,
        };
        let before_fixed = match bounds.1.and_then(SemVersion::parse) {
            Some(fixed) => v < fixed,
            None => true,
        };
        after_introduced && before_fixed
    }
}

pub trait AdvisorySource: Send + Sync {
    /// Advisories for `image` that affect `version`.
    fn advisories_for(&self, image: &ImageRef, version: &str) -> Vec<SecurityAdvisory>;
}

/// Advisories loaded once from configuration.
#[derive(Debug, Default)]
pub struct StaticAdvisoryDb {
    by_image: HashMap<String, Vec<SecurityAdvisory>>,
}

impl StaticAdvisoryDb {
    pub fn new(advisories: Vec<SecurityAdvisory>) -> Self {
        let mut by_image: HashMap<String, Vec<SecurityAdvisory>> = HashMap::new();
        for advisory in advisories {
            let Ok(image) = ImageRef::parse(&advisory.repository) else {
                tracing::warn!(
                    "Ignoring advisory {} with invalid repository {}",
                    advisory.id,
                    advisory.repository
                );
                continue;
            };
            by_image.entry(image.name()).or_default().push(advisory);
        }
        StaticAdvisoryDb { by_image }
    }

    pub fn len(&self) -> usize {
        self.by_image.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AdvisorySource for StaticAdvisoryDb {
    fn advisories_for(&self, image: &ImageRef, version: &str) -> Vec<SecurityAdvisory> {
        self.by_image
            .get(&image.name())
            .map(|list| {
                list.iter()
                    .filter(|a| a.affects(version))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
