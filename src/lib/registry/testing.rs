use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::types::{ImageInfo, ImageRef, RegistryClient, RegistryError, RegistryKind, RegistryResult};
use super::version::select_latest_tag;

/// Registry serving tags from memory, keyed by repository path.
#[derive(Default)]
pub struct FakeRegistry {
    tags: Mutex<HashMap<String, Vec<(String, String)>>>,
    failure: Mutex<Option<RegistryError>>,
    lookups: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        FakeRegistry::default()
    }

    /// Adds or replaces `repository:tag` with `digest`.
    pub fn add_tag(&self, repository: &str, tag: &str, digest: &str) {
        let mut tags = self.tags.lock().unwrap();
        let entries = tags.entry(repository.to_string()).or_default();
        entries.retain(|(t, _)| t != tag);
        entries.push((tag.to_string(), digest.to_string()));
    }

    pub fn fail_with(&self, err: Option<RegistryError>) {
        *self.failure.lock().unwrap() = err;
    }

    /// Number of latest-image lookups served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> RegistryResult<()> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Generic
    }

    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        self.check_failure()?;
        self.tags
            .lock()
            .unwrap()
            .get(&image.repository)
            .map(|entries| entries.iter().map(|(tag, _)| tag.clone()).collect())
            .ok_or_else(|| RegistryError::NotFound(image.name()))
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> RegistryResult<ImageInfo> {
        self.check_failure()?;
        let tags = self.tags.lock().unwrap();
        let digest = tags
            .get(&image.repository)
            .and_then(|entries| entries.iter().find(|(t, _)| t == tag))
            .map(|(_, digest)| digest.clone())
            .ok_or_else(|| RegistryError::NotFound(format!("{}:{}", image.name(), tag)))?;
        Ok(ImageInfo {
            tag: tag.to_string(),
            digest: Some(digest),
            published_at: None,
        })
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        self.check_failure()
    }

    async fn search_repositories(&self, query: &str) -> RegistryResult<Vec<String>> {
        self.check_failure()?;
        let mut repos: Vec<String> = self
            .tags
            .lock()
            .unwrap()
            .keys()
            .filter(|repo| repo.contains(query))
            .cloned()
            .collect();
        repos.sort();
        Ok(repos)
    }

    async fn get_latest_image_info(&self, image: &ImageRef) -> RegistryResult<ImageInfo> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let tags = self.list_tags(image).await?;
        let latest = select_latest_tag(&image.tag, &tags);
        self.tag_info(image, &latest).await
    }
}
