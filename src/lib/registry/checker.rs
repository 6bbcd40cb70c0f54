use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::advisories::AdvisorySource;
use super::resolver::RegistryResolver;
use super::types::{
    ImageInfo, ImageRef, RegistryError, RegistryResult, UpdateCheckResult, UpdatePolicy,
    UpdateRecommendation,
};
use super::version::{UpdateType, VersionOrdering, compare_versions};
use crate::lib::scheduler::window::MaintenanceWindow;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    registry: String,
    repository: String,
    tag: String,
    digest: Option<String>,
}

struct CacheEntry {
    stored_at: Instant,
    result: UpdateCheckResult,
}

impl UpdateCheckResult {
    /// Same tag, different content.
    pub fn is_rebuild(&self) -> bool {
        self.update_available && self.comparison.ordering == VersionOrdering::Same
    }
}

/// Builds the check result from what the registry reported. Pure.
pub fn evaluate(
    image: &ImageRef,
    current_digest: Option<&str>,
    latest: ImageInfo,
    advisories: &dyn AdvisorySource,
    checked_at: DateTime<Utc>,
) -> UpdateCheckResult {
    let mut comparison = compare_versions(&image.tag, &latest.tag);
    let digest_match = matches!(
        (current_digest, latest.digest.as_deref()),
        (Some(current), Some(newest)) if current == newest
    );

    let (update_available, update_type) = if digest_match {
        (false, UpdateType::None)
    } else {
        match comparison.ordering {
            VersionOrdering::Older => (true, comparison.update_type),
            // Digests are known and differ: the tag was rebuilt.
            VersionOrdering::Same if current_digest.is_some() && latest.digest.is_some() => {
                comparison.changes.push("image rebuilt under the same tag".to_string());
                (true, UpdateType::Unknown)
            }
            _ => (false, UpdateType::None),
        }
    };

    if digest_match {
        comparison.recommendation = "up to date (digest unchanged)".to_string();
    } else if update_available && comparison.ordering == VersionOrdering::Same {
        comparison.recommendation = "rebuilt image available".to_string();
    }

    let security_issues = advisories.advisories_for(image, &image.tag);
    comparison.security_issues = security_issues.clone();

    UpdateCheckResult {
        image: image.clone(),
        current_tag: image.tag.clone(),
        latest_tag: latest.tag,
        current_digest: current_digest.map(str::to_string),
        latest_digest: latest.digest,
        update_available,
        update_type,
        comparison,
        security_issues,
        published_at: latest.published_at,
        checked_at,
        from_cache: false,
    }
}

/// Maps a check result and a container's policy to what should happen.
pub fn decide(
    result: &UpdateCheckResult,
    policy: UpdatePolicy,
    window: Option<&dyn MaintenanceWindow>,
    now: DateTime<Utc>,
) -> UpdateRecommendation {
    if policy == UpdatePolicy::Disabled {
        return UpdateRecommendation::Skip {
            reason: "updates disabled".to_string(),
        };
    }
    if !result.update_available {
        return UpdateRecommendation::Skip {
            reason: "no update available".to_string(),
        };
    }

    match policy {
        UpdatePolicy::Auto => {
            if !result.security_issues.is_empty() {
                let ids: Vec<_> = result.security_issues.iter().map(|a| a.id.as_str()).collect();
                UpdateRecommendation::Apply {
                    reason: format!("security fix: {}", ids.join(", ")),
                }
            } else if matches!(result.update_type, UpdateType::Minor | UpdateType::Patch) {
                UpdateRecommendation::Apply {
                    reason: format!("{} update", result.update_type),
                }
            } else if result.is_rebuild() {
                UpdateRecommendation::Apply {
                    reason: "image rebuilt".to_string(),
                }
            } else {
                UpdateRecommendation::AwaitApproval {
                    reason: format!("{} update requires approval", result.update_type),
                }
            }
        }
        UpdatePolicy::Manual => UpdateRecommendation::AwaitApproval {
            reason: "manual update policy".to_string(),
        },
        UpdatePolicy::Scheduled => match window {
            Some(window) if window.is_open(now) => UpdateRecommendation::Apply {
                reason: "maintenance window open".to_string(),
            },
            Some(window) => UpdateRecommendation::Defer {
                until: window.next_opening(now),
            },
            None => UpdateRecommendation::Defer { until: None },
        },
        UpdatePolicy::Disabled => UpdateRecommendation::Skip {
            reason: "updates disabled".to_string(),
        },
    }
}

/// Registry-backed update checks with a TTL cache.
pub struct VersionChecker {
    resolver: Arc<RegistryResolver>,
    advisories: Arc<dyn AdvisorySource>,
    window: Option<Arc<dyn MaintenanceWindow>>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl VersionChecker {
    pub fn new(
        resolver: Arc<RegistryResolver>,
        advisories: Arc<dyn AdvisorySource>,
        window: Option<Arc<dyn MaintenanceWindow>>,
        cache_ttl: Duration,
    ) -> Self {
        VersionChecker {
            resolver,
            advisories,
            window,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check_update(
        &self,
        cancel: &CancellationToken,
        image_ref: &str,
        current_digest: Option<&str>,
        registry_url: Option<&str>,
    ) -> RegistryResult<UpdateCheckResult> {
        let image = ImageRef::parse(image_ref)?;
        let current_digest = current_digest
            .map(str::to_string)
            .or_else(|| image.digest.clone());

        let key = CacheKey {
            registry: registry_url
                .map(str::to_string)
                .unwrap_or_else(|| image.registry.clone()),
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest: current_digest.clone(),
        };

        if let Some(hit) = self.cached(&key) {
            debug!("Version check cache hit for {}", image);
            return Ok(hit);
        }

        let client = self.resolver.resolve(&image, registry_url)?;
        let latest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            latest = client.get_latest_image_info(&image) => latest?,
        };

        let result = evaluate(
            &image,
            current_digest.as_deref(),
            latest,
            self.advisories.as_ref(),
            Utc::now(),
        );
        if result.update_available {
            info!(
                "Update available for {}: {} -> {} ({})",
                image.name(),
                result.current_tag,
                result.latest_tag,
                result.update_type
            );
        }

        self.cache.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result: result.clone(),
            },
        );
        Ok(result)
    }

    fn cached(&self, key: &CacheKey) -> Option<UpdateCheckResult> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.cache_ttl)
            .map(|entry| UpdateCheckResult {
                from_cache: true,
                ..entry.result.clone()
            })
    }

    pub fn should_update(&self, result: &UpdateCheckResult, policy: UpdatePolicy) -> UpdateRecommendation {
        decide(result, policy, self.window.as_deref(), Utc::now())
    }

    /// Drops expired cache entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let before = cache.len();
        cache.retain(|_, entry| entry.stored_at.elapsed() < self.cache_ttl);
        before - cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::registry::advisories::{SecurityAdvisory, Severity, StaticAdvisoryDb};
    use crate::lib::registry::testing::FakeRegistry;
    use crate::lib::scheduler::window::CronMaintenanceWindow;
    use chrono::TimeZone;

    fn checker(registry: Arc<FakeRegistry>, ttl: Duration) -> VersionChecker {
        let resolver = Arc::new(RegistryResolver::new(Vec::new(), Duration::from_secs(5)));
        resolver.register("docker.io", registry);
        VersionChecker::new(resolver, Arc::new(StaticAdvisoryDb::default()), None, ttl)
    }

    fn nginx_registry() -> Arc<FakeRegistry> {
        let registry = Arc::new(FakeRegistry::new());
        registry.add_tag("library/nginx", "1.24.0", "sha256:aaa");
        registry.add_tag("library/nginx", "1.25.0", "sha256:bbb");
        registry
    }

    fn result_for(current: &str, latest: &str, current_digest: &str, latest_digest: &str) -> UpdateCheckResult {
        let image = ImageRef::parse(&format!("nginx:{}", current)).unwrap();
        evaluate(
            &image,
            Some(current_digest),
            ImageInfo {
                tag: latest.to_string(),
                digest: Some(latest_digest.to_string()),
                published_at: None,
            },
            &StaticAdvisoryDb::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn nginx_minor_update_is_detected() {
        let checker = checker(nginx_registry(), Duration::from_secs(300));
        let result = checker
            .check_update(&CancellationToken::new(), "nginx:1.24.0", Some("sha256:aaa"), None)
            .await
            .unwrap();
        assert!(result.update_available);
        assert_eq!(result.latest_tag, "1.25.0");
        assert_eq!(result.update_type, UpdateType::Minor);
        assert_eq!(result.latest_digest.as_deref(), Some("sha256:bbb"));
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn equal_digest_short_circuits() {
        let registry = Arc::new(FakeRegistry::new());
        registry.add_tag("library/redis", "7.2.4", "sha256:same");
        let checker = checker(registry, Duration::from_secs(300));
        let result = checker
            .check_update(&CancellationToken::new(), "redis:7.2.4", Some("sha256:same"), None)
            .await
            .unwrap();
        assert!(!result.update_available);
        assert_eq!(result.update_type, UpdateType::None);
    }

    #[tokio::test]
    async fn second_check_is_served_from_cache() {
        let registry = nginx_registry();
        let checker = checker(registry.clone(), Duration::from_secs(300));
        let cancel = CancellationToken::new();
        checker
            .check_update(&cancel, "nginx:1.24.0", Some("sha256:aaa"), None)
            .await
            .unwrap();
        let again = checker
            .check_update(&cancel, "nginx:1.24.0", Some("sha256:aaa"), None)
            .await
            .unwrap();
        assert!(again.from_cache);
        assert_eq!(registry.lookups(), 1);

        // A different current digest is a different cache entry.
        checker
            .check_update(&cancel, "nginx:1.24.0", Some("sha256:zzz"), None)
            .await
            .unwrap();
        assert_eq!(registry.lookups(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_purged() {
        let checker = checker(nginx_registry(), Duration::from_millis(10));
        checker
            .check_update(&CancellationToken::new(), "nginx:1.24.0", None, None)
            .await
            .unwrap();
        assert_eq!(checker.cache_len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(checker.purge_expired(), 1);
        assert_eq!(checker.cache_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_check_returns_cancelled() {
        let checker = checker(nginx_registry(), Duration::from_secs(300));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = checker
            .check_update(&cancel, "nginx:1.24.0", None, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Cancelled);
    }

    #[test]
    fn same_tag_rebuild_is_unknown_update() {
        let result = result_for("latest", "latest", "sha256:old", "sha256:new");
        assert!(result.update_available);
        assert!(result.is_rebuild());
        assert_eq!(result.update_type, UpdateType::Unknown);
        assert!(decide(&result, UpdatePolicy::Auto, None, Utc::now()).is_apply());
    }

    #[test]
    fn auto_policy_matrix() {
        let now = Utc::now();
        let minor = result_for("1.24.0", "1.25.0", "a", "b");
        assert!(decide(&minor, UpdatePolicy::Auto, None, now).is_apply());

        let major = result_for("1.24.0", "2.0.0", "a", "b");
        assert!(matches!(
            decide(&major, UpdatePolicy::Auto, None, now),
            UpdateRecommendation::AwaitApproval { .. }
        ));

        let none = result_for("1.25.0", "1.25.0", "b", "b");
        assert!(matches!(
            decide(&none, UpdatePolicy::Auto, None, now),
            UpdateRecommendation::Skip { .. }
        ));
    }

    #[test]
    fn security_issue_forces_apply_under_auto() {
        let db = StaticAdvisoryDb::new(vec![SecurityAdvisory {
            id: "CVE-2024-7347".to_string(),
            repository: "nginx".to_string(),
            severity: Severity::Critical,
            summary: String::new(),
            introduced: None,
            fixed: Some("2.0.0".to_string()),
        }]);
        let image = ImageRef::parse("nginx:1.24.0").unwrap();
        let latest = ImageInfo {
            tag: "2.0.0".to_string(),
            digest: Some("sha256:new".to_string()),
            published_at: None,
        };
        let result = evaluate(&image, Some("sha256:old"), latest, &db, Utc::now());
        assert_eq!(result.security_issues.len(), 1);
        assert_eq!(result.comparison.security_issues.len(), 1);
        let rec = decide(&result, UpdatePolicy::Auto, None, Utc::now());
        assert!(matches!(rec, UpdateRecommendation::Apply { reason } if reason.contains("CVE-2024-7347")));
    }

    #[test]
    fn manual_disabled_and_scheduled_policies() {
        let now = Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap();
        let minor = result_for("1.24.0", "1.25.0", "a", "b");
        assert!(matches!(
            decide(&minor, UpdatePolicy::Manual, None, now),
            UpdateRecommendation::AwaitApproval { .. }
        ));
        assert!(matches!(
            decide(&minor, UpdatePolicy::Disabled, None, now),
            UpdateRecommendation::Skip { .. }
        ));

        // Nightly window 02:00-04:00 UTC.
        let window = CronMaintenanceWindow::new("0 2 * * *", Duration::from_secs(2 * 3600), chrono_tz::UTC)
            .unwrap();
        match decide(&minor, UpdatePolicy::Scheduled, Some(&window), now) {
            UpdateRecommendation::Defer { until: Some(until) } => {
                assert_eq!(until, Utc.with_ymd_and_hms(2024, 6, 6, 2, 0, 0).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
        let inside = Utc.with_ymd_and_hms(2024, 6, 6, 3, 0, 0).unwrap();
        assert!(decide(&minor, UpdatePolicy::Scheduled, Some(&window), inside).is_apply());
        assert_eq!(
            decide(&minor, UpdatePolicy::Scheduled, None, now),
            UpdateRecommendation::Defer { until: None }
        );
    }
}
