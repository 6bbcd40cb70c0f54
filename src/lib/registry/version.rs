//! Tag parsing and comparison.
//!
//! Tags are compared semantically when both parse as semver, by date when
//! both parse as calendar dates, as content hashes when both look like hex
//! digests, and lexically otherwise.

use std::cmp::Ordering;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use super::advisories::SecurityAdvisory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionScheme {
    Semantic,
    Date,
    Hash,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Major,
    Minor,
    Patch,
    Unknown,
    None,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Patch => "patch",
            UpdateType::Unknown => "unknown",
            UpdateType::None => "none",
        };
        f.write_str(s)
    }
}

/// Where the current version sits relative to the latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrdering {
    Older,
    Same,
    Newer,
    Incomparable,
}

impl From<Ordering> for VersionOrdering {
    fn from(ord: Ordering) -> Self {
        match ord {
            Ordering::Less => VersionOrdering::Older,
            Ordering::Equal => VersionOrdering::Same,
            Ordering::Greater => VersionOrdering::Newer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionComparisonResult {
    pub current_version: String,
    pub latest_version: String,
    pub ordering: VersionOrdering,
    pub scheme: VersionScheme,
    pub update_type: UpdateType,
    pub changes: Vec<String>,
    pub security_issues: Vec<SecurityAdvisory>,
    pub recommendation: String,
}

const PRERELEASE_MARKERS: &[&str] = &["alpha", "beta", "rc", "pre", "dev", "snapshot", "preview"];

/// Semver-like image tag: `[v]MAJOR.MINOR[.PATCH][-pre][-flavour]`.
///
/// Anything after the numeric core that isn't a pre-release marker is a
/// build flavour (`alpine`, `bookworm-slim`). Flavours only break ties in
/// ordering, but must match when selecting a newer tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub flavour: Option<String>,
    /// Number of numeric components written in the tag (2 or 3).
    pub precision: u8,
}

impl SemVersion {
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.strip_prefix('v').unwrap_or(tag);
        let tag = tag.split_once('+').map(|(core, _)| core).unwrap_or(tag);
        let (core, rest) = match tag.split_once('-') {
            Some((core, rest)) => (core, Some(rest)),
            None => (tag, None),
        };

        let nums: Vec<&str> = core.split('.').collect();
        if !(2..=3).contains(&nums.len()) {
            return None;
        }
        let parse = |s: &str| -> Option<u64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        };
        let major = parse(nums[0])?;
        let minor = parse(nums[1])?;
        let patch = match nums.get(2) {
            Some(p) => parse(p)?,
            None => 0,
        };

        let (pre, flavour) = match rest {
            None => (None, None),
            Some("") => return None,
            Some(rest) => {
                let mut parts = rest.splitn(2, '-');
                let first = parts.next().unwrap_or_default();
                let lower = first.to_ascii_lowercase();
                if PRERELEASE_MARKERS.iter().any(|m| lower.starts_with(m)) {
                    (Some(first.to_string()), parts.next().map(str::to_string))
                } else {
                    (None, Some(rest.to_string()))
                }
            }
        };

        Some(SemVersion {
            major,
            minor,
            patch,
            pre,
            flavour,
            precision: nums.len() as u8,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }
}

impl Ord for SemVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => natural_cmp(a, b),
            })
            .then_with(|| self.flavour.cmp(&other.flavour))
            .then(self.precision.cmp(&other.precision))
    }
}

impl PartialOrd for SemVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders `rc2` before `rc10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let split = |s: &str| {
        let idx = s.find(|c: char| c.is_ascii_digit()).unwrap_or(s.len());
        let (text, num) = s.split_at(idx);
        (text.to_string(), num.trim_start_matches('.').parse::<u64>().ok())
    };
    let (ta, na) = split(a);
    let (tb, nb) = split(b);
    ta.cmp(&tb).then(na.cmp(&nb)).then(a.cmp(b))
}

pub fn parse_date_tag(tag: &str) -> Option<NaiveDate> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    for fmt in ["%Y%m%d", "%Y-%m-%d", "%Y.%m.%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(tag, fmt) {
            if date.year() >= 1970 {
                return Some(date);
            }
        }
    }
    None
}

pub fn is_hash_tag(tag: &str) -> bool {
    let hex = tag.strip_prefix("sha256:").unwrap_or(tag);
    (7..=64).contains(&hex.len()) && hex.bytes().all(|b| b.is_ascii_hexdigit())
        && hex.bytes().any(|b| b.is_ascii_alphabetic())
}

/// Compares two tags. Pure and deterministic.
pub fn compare_versions(current: &str, latest: &str) -> VersionComparisonResult {
    let (scheme, ordering, update_type, changes) =
        if let (Some(a), Some(b)) = (parse_date_tag(current), parse_date_tag(latest)) {
            let ordering = VersionOrdering::from(a.cmp(&b));
            let changes = match ordering {
                VersionOrdering::Older => vec![format!("newer build dated {}", b)],
                _ => Vec::new(),
            };
            (VersionScheme::Date, ordering, delta_unknown(ordering), changes)
        } else if let (Some(a), Some(b)) = (SemVersion::parse(current), SemVersion::parse(latest)) {
            let ordering = VersionOrdering::from(a.cmp(&b));
            let (update_type, changes) = if ordering == VersionOrdering::Older {
                semver_delta(&a, &b)
            } else {
                (UpdateType::None, Vec::new())
            };
            (VersionScheme::Semantic, ordering, update_type, changes)
        } else if is_hash_tag(current) && is_hash_tag(latest) {
            let ordering = if current == latest {
                VersionOrdering::Same
            } else {
                VersionOrdering::Incomparable
            };
            (VersionScheme::Hash, ordering, delta_unknown(ordering), Vec::new())
        } else {
            let ordering = VersionOrdering::from(current.cmp(latest));
            (VersionScheme::Unknown, ordering, delta_unknown(ordering), Vec::new())
        };

    let recommendation = match (ordering, update_type) {
        (VersionOrdering::Older, UpdateType::Major) => {
            "major update available; review breaking changes before applying"
        }
        (VersionOrdering::Older, UpdateType::Minor) => "minor update available; safe to apply",
        (VersionOrdering::Older, UpdateType::Patch) => "patch update available; apply soon",
        (VersionOrdering::Older, _) => "newer image available; impact unknown",
        (VersionOrdering::Same, _) => "up to date",
        (VersionOrdering::Newer, _) => "current version is ahead of the registry",
        (VersionOrdering::Incomparable, _) => "versions cannot be compared",
    };

    VersionComparisonResult {
        current_version: current.to_string(),
        latest_version: latest.to_string(),
        ordering,
        scheme,
        update_type,
        changes,
        security_issues: Vec::new(),
        recommendation: recommendation.to_string(),
    }
}

fn delta_unknown(ordering: VersionOrdering) -> UpdateType {
    match ordering {
        VersionOrdering::Older | VersionOrdering::Incomparable => UpdateType::Unknown,
        VersionOrdering::Same | VersionOrdering::Newer => UpdateType::None,
    }
}

fn semver_delta(a: &SemVersion, b: &SemVersion) -> (UpdateType, Vec<String>) {
    if a.major != b.major {
        (
            UpdateType::Major,
            vec![format!("major version {} -> {}", a.major, b.major)],
        )
    } else if a.minor != b.minor {
        (
            UpdateType::Minor,
            vec![format!("minor version {} -> {}", a.minor, b.minor)],
        )
    } else if a.patch != b.patch {
        (
            UpdateType::Patch,
            vec![format!("patch version {} -> {}", a.patch, b.patch)],
        )
    } else {
        (
            UpdateType::Unknown,
            vec![format!(
                "pre-release {} -> {}",
                a.pre.as_deref().unwrap_or("-"),
                b.pre.as_deref().unwrap_or("release")
            )],
        )
    }
}

/// Picks the newest tag on the same release line as `current`.
///
/// Semver tags only consider candidates with the same flavour and precision,
/// skipping pre-releases unless `current` is one. Date tags pick the latest
/// date. Anything else is a floating tag and is returned unchanged.
pub fn select_latest_tag(current: &str, tags: &[String]) -> String {
    if let Some(date) = parse_date_tag(current) {
        return tags
            .iter()
            .filter_map(|t| parse_date_tag(t).map(|d| (d, t)))
            .filter(|(d, _)| *d >= date)
            .max_by(|(a, ta), (b, tb)| a.cmp(b).then(ta.cmp(tb)))
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| current.to_string());
    }

    if let Some(cur) = SemVersion::parse(current) {
        return tags
            .iter()
            .filter_map(|t| SemVersion::parse(t).map(|v| (v, t)))
            .filter(|(v, _)| {
                v.flavour == cur.flavour
                    && v.precision == cur.precision
                    && (cur.is_prerelease() || !v.is_prerelease())
            })
            .filter(|(v, _)| *v >= cur)
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| current.to_string());
    }

    current.to_string()
}
