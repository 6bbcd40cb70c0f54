use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{ImageInfo, ImageRef, RegistryClient, RegistryError, RegistryKind, RegistryResult};

const HUB_API: &str = "https://hub.docker.com";
/// Tag listings are read newest first, so the cap only drops old tags.
const MAX_TAG_PAGES: usize = 10;
const TAG_PAGE_SIZE: usize = 100;
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

pub(crate) fn normalize_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

fn status_error(status: StatusCode, what: &str) -> RegistryError {
    match status.as_u16() {
        401 | 403 => RegistryError::Unauthorized(what.to_string()),
        404 => RegistryError::NotFound(what.to_string()),
        429 => RegistryError::RateLimited,
        code => RegistryError::Api {
            status: code,
            message: what.to_string(),
        },
    }
}

/// Shared HTTP plumbing for the registry clients.
struct HttpBase {
    http: Client,
    base_url: String,
    auth: Option<(String, String)>,
    timeout: Duration,
}

impl HttpBase {
    fn new(base_url: &str, auth: Option<(String, String)>, timeout: Duration) -> RegistryResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("r_keeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        Ok(HttpBase {
            http,
            base_url: normalize_url(base_url),
            auth,
            timeout,
        })
    }

    fn map_err(&self, err: reqwest::Error) -> RegistryError {
        if err.is_timeout() {
            RegistryError::Timeout(self.timeout)
        } else if err.is_decode() {
            RegistryError::InvalidResponse(err.to_string())
        } else {
            RegistryError::Network(err.to_string())
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> RegistryResult<Response> {
        let resp = builder.send().await.map_err(|e| self.map_err(e))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp.status(), what))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> RegistryResult<T> {
        debug!("registry GET {}", url);
        let resp = self.send(self.request(Method::GET, url), url).await?;
        resp.json::<T>().await.map_err(|e| self.map_err(e))
    }
}

#[derive(Debug, Deserialize)]
struct HubTagPage {
    next: Option<String>,
    #[serde(default)]
    results: Vec<HubTag>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
    digest: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    images: Vec<HubImage>,
}

#[derive(Debug, Deserialize)]
struct HubImage {
    digest: Option<String>,
}

impl HubTag {
    fn into_info(self) -> ImageInfo {
        let digest = self
            .digest
            .or_else(|| self.images.into_iter().find_map(|i| i.digest));
        ImageInfo {
            tag: self.name,
            digest,
            published_at: self.last_updated,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HubSearchPage {
    #[serde(default)]
    results: Vec<HubSearchHit>,
}

#[derive(Debug, Deserialize)]
struct HubSearchHit {
    repo_name: String,
}

/// Docker Hub, through the hub.docker.com tags API.
pub struct DockerHubClient {
    base: HttpBase,
}

impl DockerHubClient {
    pub fn new(api_url: Option<&str>, auth: Option<(String, String)>, timeout: Duration) -> RegistryResult<Self> {
        Ok(DockerHubClient {
            base: HttpBase::new(api_url.unwrap_or(HUB_API), auth, timeout)?,
        })
    }
}

#[async_trait]
impl RegistryClient for DockerHubClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::DockerHub
    }

    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let mut url = Some(format!(
            "{}/v2/repositories/{}/tags?page_size={}&ordering=last_updated",
            self.base.base_url, image.repository, TAG_PAGE_SIZE
        ));
        let mut tags = Vec::new();
        let mut pages = 0;
        while let Some(next) = url.take() {
            let page: HubTagPage = self.base.get_json(&next).await?;
            tags.extend(page.results.into_iter().map(|t| t.name));
            pages += 1;
            if pages < MAX_TAG_PAGES {
                url = page.next;
            }
        }
        Ok(tags)
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> RegistryResult<ImageInfo> {
        let url = format!(
            "{}/v2/repositories/{}/tags/{}",
            self.base.base_url,
            image.repository,
            urlencoding::encode(tag)
        );
        let tag: HubTag = self.base.get_json(&url).await?;
        Ok(tag.into_info())
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        let url = format!(
            "{}/v2/repositories/library/hello-world/tags?page_size=1",
            self.base.base_url
        );
        self.base
            .send(self.base.request(Method::GET, &url), &url)
            .await
            .map(|_| ())
    }

    async fn search_repositories(&self, query: &str) -> RegistryResult<Vec<String>> {
        let url = format!(
            "{}/v2/search/repositories/?query={}&page_size=25",
            self.base.base_url,
            urlencoding::encode(query)
        );
        let page: HubSearchPage = self.base.get_json(&url).await?;
        Ok(page.results.into_iter().map(|hit| hit.repo_name).collect())
    }
}

#[derive(Debug, Deserialize)]
struct HarborArtifact {
    digest: String,
    push_time: Option<DateTime<Utc>>,
    tags: Option<Vec<HarborTag>>,
}

#[derive(Debug, Deserialize)]
struct HarborTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HarborSearch {
    #[serde(default)]
    repository: Vec<HarborSearchHit>,
}

#[derive(Debug, Deserialize)]
struct HarborSearchHit {
    repository_name: String,
}

/// Harbor, through its `/api/v2.0` artifacts API.
pub struct HarborClient {
    base: HttpBase,
}

impl HarborClient {
    pub fn new(url: &str, auth: Option<(String, String)>, timeout: Duration) -> RegistryResult<Self> {
        Ok(HarborClient {
            base: HttpBase::new(url, auth, timeout)?,
        })
    }

    fn artifacts_url(&self, image: &ImageRef) -> RegistryResult<String> {
        let (project, repo) = harbor_path(&image.repository)?;
        Ok(format!(
            "{}/api/v2.0/projects/{}/repositories/{}/artifacts",
            self.base.base_url, project, repo
        ))
    }
}

/// Splits `project/repo/...` and double-encodes the repository part, which
/// Harbor requires for nested names.
fn harbor_path(repository: &str) -> RegistryResult<(String, String)> {
    let (project, repo) = repository
        .split_once('/')
        .ok_or_else(|| RegistryError::InvalidReference(repository.to_string()))?;
    let encoded = urlencoding::encode(repo).into_owned();
    Ok((project.to_string(), urlencoding::encode(&encoded).into_owned()))
}

fn harbor_page_url(artifacts_url: &str, page: usize) -> String {
    format!(
        "{}?with_tag=true&sort=-push_time&page={}&page_size={}",
        artifacts_url, page, TAG_PAGE_SIZE
    )
}

fn harbor_tag_names(artifacts: Vec<HarborArtifact>) -> impl Iterator<Item = String> {
    artifacts
        .into_iter()
        .flat_map(|a| a.tags.unwrap_or_default())
        .map(|t| t.name)
}

#[async_trait]
impl RegistryClient for HarborClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Harbor
    }

    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let artifacts_url = self.artifacts_url(image)?;
        let mut tags = Vec::new();
        for page in 1..=MAX_TAG_PAGES {
            let url = harbor_page_url(&artifacts_url, page);
            let artifacts: Vec<HarborArtifact> = self.base.get_json(&url).await?;
            let last = artifacts.len() < TAG_PAGE_SIZE;
            tags.extend(harbor_tag_names(artifacts));
            if last {
                break;
            }
        }
        Ok(tags)
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> RegistryResult<ImageInfo> {
        let url = format!(
            "{}/{}?with_tag=true",
            self.artifacts_url(image)?,
            urlencoding::encode(tag)
        );
        let artifact: HarborArtifact = self.base.get_json(&url).await?;
        Ok(ImageInfo {
            tag: tag.to_string(),
            digest: Some(artifact.digest),
            published_at: artifact.push_time,
        })
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        let url = format!("{}/api/v2.0/ping", self.base.base_url);
        self.base
            .send(self.base.request(Method::GET, &url), &url)
            .await
            .map(|_| ())
    }

    async fn search_repositories(&self, query: &str) -> RegistryResult<Vec<String>> {
        let url = format!(
            "{}/api/v2.0/search?q={}",
            self.base.base_url,
            urlencoding::encode(query)
        );
        let found: HarborSearch = self.base.get_json(&url).await?;
        Ok(found
            .repository
            .into_iter()
            .map(|hit| hit.repository_name)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
pub(crate) fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut values = HashMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        values.insert(key, value.to_string());
        rest = remaining.trim_start_matches(',').trim();
    }

    Some(BearerChallenge {
        realm: values.remove("realm")?,
        service: values.remove("service"),
        scope: values.remove("scope"),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

/// Any OCI distribution registry (`/v2/` API with the bearer token flow).
pub struct OciClient {
    base: HttpBase,
    tokens: Mutex<HashMap<String, String>>,
}

impl OciClient {
    pub fn new(url: &str, auth: Option<(String, String)>, timeout: Duration) -> RegistryResult<Self> {
        Ok(OciClient {
            base: HttpBase::new(url, auth, timeout)?,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn cached_token(&self, url: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .iter()
            .find(|(scope, _)| url.contains(scope.as_str()))
            .map(|(_, token)| token.clone())
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> RegistryResult<String> {
        let mut url = format!("{}?", challenge.realm);
        if let Some(service) = &challenge.service {
            url.push_str(&format!("service={}&", urlencoding::encode(service)));
        }
        if let Some(scope) = &challenge.scope {
            url.push_str(&format!("scope={}", urlencoding::encode(scope)));
        }
        let resp: TokenResponse = self.base.get_json(url.trim_end_matches(['?', '&'])).await?;
        resp.token
            .or(resp.access_token)
            .ok_or_else(|| RegistryError::InvalidResponse("token endpoint returned no token".to_string()))
    }

    /// Sends with a cached token if one matches; on a bearer challenge,
    /// fetches a token and retries once.
    async fn send_authorized(&self, method: Method, url: &str, repository: &str) -> RegistryResult<Response> {
        let mut builder = self.base.request(method.clone(), url).header(ACCEPT, MANIFEST_TYPES);
        if let Some(token) = self.cached_token(url) {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(|e| self.base.map_err(e))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return if resp.status().is_success() {
                Ok(resp)
            } else {
                Err(status_error(resp.status(), url))
            };
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| RegistryError::Unauthorized(url.to_string()))?;
        let token = self.fetch_token(&challenge).await?;
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format!("/v2/{}/", repository), token.clone());

        let retry = self
            .base
            .http
            .request(method, url)
            .header(ACCEPT, MANIFEST_TYPES)
            .bearer_auth(token);
        self.base.send(retry, url).await
    }
}

#[async_trait]
impl RegistryClient for OciClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Generic
    }

    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let url = format!("{}/v2/{}/tags/list", self.base.base_url, image.repository);
        let resp = self
            .send_authorized(Method::GET, &url, &image.repository)
            .await?;
        let list: TagList = resp.json().await.map_err(|e| self.base.map_err(e))?;
        Ok(list.tags.unwrap_or_default())
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> RegistryResult<ImageInfo> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base.base_url, image.repository, tag
        );
        let resp = self
            .send_authorized(Method::HEAD, &url, &image.repository)
            .await?;
        let digest = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(ImageInfo {
            tag: tag.to_string(),
            digest,
            published_at: None,
        })
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        let url = format!("{}/v2/", self.base.base_url);
        let resp = self
            .base
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| self.base.map_err(e))?;
        // 401 still proves a distribution API is answering.
        match resp.status() {
            s if s.is_success() || s == StatusCode::UNAUTHORIZED => Ok(()),
            s => Err(status_error(s, &url)),
        }
    }

    async fn search_repositories(&self, query: &str) -> RegistryResult<Vec<String>> {
        let url = format!("{}/v2/_catalog?n=1000", self.base.base_url);
        let catalog: Catalog = self.base.get_json(&url).await?;
        Ok(catalog
            .repositories
            .into_iter()
            .filter(|r| r.contains(query))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull")
        );

        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn hub_tag_falls_back_to_image_digest() {
        let json = r#"{
            "name": "1.25.0",
            "last_updated": "2024-01-15T10:00:00.123456Z",
            "images": [{"digest": "sha256:aaa"}, {"digest": "sha256:bbb"}]
        }"#;
        let tag: HubTag = serde_json::from_str(json).unwrap();
        let info = tag.into_info();
        assert_eq!(info.tag, "1.25.0");
        assert_eq!(info.digest.as_deref(), Some("sha256:aaa"));
        assert!(info.published_at.is_some());
    }

    #[test]
    fn harbor_artifacts_decode_with_null_tags() {
        let json = r#"[
            {"digest": "sha256:1", "push_time": "2024-02-01T00:00:00Z", "tags": [{"name": "2.1.0"}]},
            {"digest": "sha256:2", "push_time": null, "tags": null}
        ]"#;
        let artifacts: Vec<HarborArtifact> = serde_json::from_str(json).unwrap();
        let names: Vec<_> = harbor_tag_names(artifacts).collect();
        assert_eq!(names, vec!["2.1.0"]);
    }

    #[test]
    fn harbor_pages_newest_first() {
        let url = harbor_page_url("https://harbor.local/api/v2.0/projects/p/repositories/r/artifacts", 3);
        assert_eq!(
            url,
            "https://harbor.local/api/v2.0/projects/p/repositories/r/artifacts\
             ?with_tag=true&sort=-push_time&page=3&page_size=100"
        );
    }

    #[test]
    fn harbor_nested_repositories_are_double_encoded() {
        let (project, repo) = harbor_path("platform/tools/api").unwrap();
        assert_eq!(project, "platform");
        assert_eq!(repo, "tools%252Fapi");
        assert!(harbor_path("single").is_err());
    }

    #[test]
    fn urls_get_a_scheme() {
        assert_eq!(normalize_url("registry.local:5000/"), "https://registry.local:5000");
        assert_eq!(normalize_url("http://10.0.0.1"), "http://10.0.0.1");
    }

    #[test]
    fn status_codes_map_to_errors() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "x"),
            RegistryError::RateLimited
        );
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "x"),
            RegistryError::NotFound(_)
        ));
    }
}
