//! Registry-backed content store.
//!
//! Speaks the OCI distribution HTTP API through `reqwest`. Blob bodies are
//! streamed in both directions; nothing is buffered whole. Requests start
//! with basic credentials (when configured) and answer a `Bearer` challenge
//! by fetching a token for the repository scope, cached per scope.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use modpack_core::error::{PackError, Result};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use super::{BlobReader, Storage};
use crate::digest::{self, HashingReader};
use crate::spec::{Descriptor, Index, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Authentication credentials for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling
    /// back to anonymous.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Transport options for a registry.
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Use `http://` instead of `https://`
    pub plain_http: bool,
    /// Accept invalid TLS certificates
    pub insecure: bool,
    pub auth: RegistryAuth,
}

/// Content store backed by one OCI registry.
///
/// Repository keys are `<registry>/<name>`, matching the local store.
pub struct RemoteStore {
    registry: String,
    host: String,
    scheme: &'static str,
    client: reqwest::Client,
    auth: RegistryAuth,
    /// `scope` → bearer token
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl RemoteStore {
    pub fn new(registry: &str, options: RemoteOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.insecure)
            .user_agent(concat!("modpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PackError::RegistryError {
                registry: registry.to_string(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let host = if registry == DOCKER_HUB {
            DOCKER_HUB_API.to_string()
        } else {
            registry.to_string()
        };

        Ok(Self {
            registry: registry.to_string(),
            host,
            scheme: if options.plain_http { "http" } else { "https" },
            client,
            auth: options.auth,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository name within this registry.
    fn name<'a>(&self, repo: &'a str) -> Result<&'a str> {
        match repo.split_once('/') {
            Some((registry, name)) if registry == self.registry && !name.is_empty() => Ok(name),
            _ => Err(PackError::InvalidInput(format!(
                "repository {} does not belong to registry {}",
                repo, self.registry
            ))),
        }
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    fn repo_url(&self, name: &str, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url(), name, path)
    }

    fn err(&self, message: impl Into<String>) -> PackError {
        PackError::RegistryError {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        if let Some(token) = self.tokens.lock().get(scope) {
            return request.bearer_auth(token);
        }
        match self.auth.credentials() {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    /// Send a replayable request, answering one bearer challenge.
    async fn send<F>(&self, scope: &str, make: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let response = self
            .authorize(make(&self.client), scope)
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {}", e)))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, scope).await?;
        self.tokens.lock().insert(scope.to_string(), token);

        self.authorize(make(&self.client), scope)
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {}", e)))
    }

    async fn fetch_token(&self, challenge: &HashMap<String, String>, scope: &str) -> Result<String> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| self.err("bearer challenge without realm"))?;

        let mut query = vec![("scope", scope.to_string())];
        if let Some(service) = challenge.get("service") {
            query.push(("service", service.clone()));
        }

        let mut request = self.client.get(realm).query(&query);
        if let Some((user, pass)) = self.auth.credentials() {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.err(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(self.err(format!(
                "Authentication failed: token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.err(format!("invalid token response: {}", e)))?;
        tracing::debug!(registry = %self.registry, scope, "Obtained registry token");
        body.token
            .or(body.access_token)
            .ok_or_else(|| self.err("token response without token"))
    }

    async fn status_error(&self, response: Response, op: &str) -> PackError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        if body.is_empty() {
            self.err(format!("{} returned {}", op, status))
        } else {
            self.err(format!("{} returned {}: {}", op, status, body))
        }
    }

    /// Absolute upload URL from a `Location` header.
    fn upload_location(&self, headers: &HeaderMap) -> Result<String> {
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.err("upload response without Location"))?;
        Ok(resolve_location(&self.base_url(), location))
    }

    async fn start_upload(&self, name: &str, scope: &str) -> Result<String> {
        let url = self.repo_url(name, "blobs/uploads/");
        let response = self
            .send(scope, |c| c.post(&url).header(CONTENT_LENGTH, 0))
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(self.status_error(response, "start blob upload").await);
        }
        self.upload_location(response.headers())
    }

    async fn head(&self, name: &str, path: &str, accept: Option<&str>) -> Result<bool> {
        let url = self.repo_url(name, path);
        let scope = pull_scope(name);
        let response = self
            .send(&scope, |c| {
                let request = c.head(&url);
                match accept {
                    Some(accept) => request.header(ACCEPT, accept),
                    None => request,
                }
            })
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error(response, "HEAD").await),
        }
    }

    /// Collect a paginated JSON list, following `Link: <...>; rel="next"`.
    async fn paginate<T, F>(&self, first: String, scope: &str, mut extract: F) -> Result<Vec<String>>
    where
        T: serde::de::DeserializeOwned,
        F: FnMut(T) -> Vec<String>,
    {
        let mut out = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let response = self.send(scope, |c| c.get(&url)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(PackError::NotFound(url));
            }
            if !response.status().is_success() {
                return Err(self.status_error(response, "list").await);
            }
            next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link)
                .map(|link| resolve_location(&self.base_url(), &link));
            let page: T = response
                .json()
                .await
                .map_err(|e| self.err(format!("invalid list response: {}", e)))?;
            out.extend(extract(page));
        }
        Ok(out)
    }
}

#[async_trait]
impl Storage for RemoteStore {
    async fn get_index(&self, _repo: &str) -> Result<Index> {
        Err(PackError::Unsupported(
            "get_index is not available on a remote registry".to_string(),
        ))
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        let name = self.name(repo)?;
        let url = self.repo_url(name, &format!("manifests/{}", reference));
        let accept = format!("{}, {}", MEDIA_TYPE_MANIFEST, MEDIA_TYPE_INDEX);
        let response = self
            .send(&pull_scope(name), |c| c.get(&url).header(ACCEPT, &accept))
            .await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PackError::NotFound(format!("{}:{}", repo, reference)))
            }
            _ => return Err(self.status_error(response, "pull manifest").await),
        }

        let header_digest = header_digest(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| self.err(format!("Failed to read manifest body: {}", e)))?
            .to_vec();
        let digest = digest::sha256_digest(&body);
        if let Some(expected) = header_digest {
            if expected != digest {
                return Err(PackError::DigestMismatch {
                    expected,
                    actual: digest,
                });
            }
        }
        Ok((body, digest))
    }

    async fn push_manifest(&self, repo: &str, reference: &str, body: &[u8]) -> Result<String> {
        let name = self.name(repo)?;
        let media_type = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| MEDIA_TYPE_MANIFEST.to_string());
        let url = self.repo_url(name, &format!("manifests/{}", reference));
        let response = self
            .send(&push_scope(name), |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, &media_type)
                    .body(body.to_vec())
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, "push manifest").await);
        }

        let digest = digest::sha256_digest(body);
        tracing::debug!(repo, reference, digest = %digest, "Pushed manifest");
        Ok(digest)
    }

    async fn stat_manifest(&self, repo: &str, digest: &str) -> Result<bool> {
        let name = self.name(repo)?;
        let accept = format!("{}, {}", MEDIA_TYPE_MANIFEST, MEDIA_TYPE_INDEX);
        self.head(name, &format!("manifests/{}", digest), Some(&accept))
            .await
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let name = self.name(repo)?;
        let url = self.repo_url(name, &format!("manifests/{}", reference));
        let response = self
            .send(&delete_scope(name), |c| c.request(Method::DELETE, &url))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(PackError::NotFound(format!("{}:{}", repo, reference))),
            _ => Err(self.status_error(response, "delete manifest").await),
        }
    }

    async fn pull_blob(&self, repo: &str, digest: &str) -> Result<BlobReader> {
        digest::validate_digest(digest)?;
        let name = self.name(repo)?;
        let url = self.repo_url(name, &format!("blobs/{}", digest));
        let response = self.send(&pull_scope(name), |c| c.get(&url)).await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(PackError::NotFound(format!("{}@{}", repo, digest))),
            _ => return Err(self.status_error(response, "pull blob").await),
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn push_blob(
        &self,
        repo: &str,
        body: BlobReader,
        expected: Option<&Descriptor>,
    ) -> Result<(String, u64)> {
        let name = self.name(repo)?;
        let scope = push_scope(name);
        let location = self.start_upload(name, &scope).await?;

        match expected {
            Some(desc) => {
                digest::validate_digest(&desc.digest)?;
                let url = append_query(&location, "digest", &desc.digest);
                let request = self
                    .client
                    .put(&url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, desc.size)
                    .body(stream_body(body));
                let response = self
                    .authorize(request, &scope)
                    .send()
                    .await
                    .map_err(|e| self.err(format!("blob upload failed: {}", e)))?;
                if response.status() != StatusCode::CREATED {
                    return Err(self.status_error(response, "push blob").await);
                }
                tracing::debug!(repo, digest = %desc.digest, size = desc.size, "Pushed blob");
                Ok((desc.digest.clone(), desc.size))
            }
            None => {
                let hashing = HashingReader::new(body);
                let state = hashing.state();
                let request = self
                    .client
                    .patch(&location)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(stream_body(Box::new(hashing)));
                let response = self
                    .authorize(request, &scope)
                    .send()
                    .await
                    .map_err(|e| self.err(format!("blob upload failed: {}", e)))?;
                if response.status() != StatusCode::ACCEPTED {
                    return Err(self.status_error(response, "upload blob chunk").await);
                }
                let location = self.upload_location(response.headers())?;

                let (digest, size) = state.finish();
                let url = append_query(&location, "digest", &digest);
                let response = self
                    .send(&scope, |c| c.put(&url).header(CONTENT_LENGTH, 0))
                    .await?;
                if response.status() != StatusCode::CREATED {
                    return Err(self.status_error(response, "commit blob").await);
                }
                tracing::debug!(repo, digest = %digest, size, "Pushed blob");
                Ok((digest, size))
            }
        }
    }

    async fn mount_blob(&self, from: &str, to: &str, desc: &Descriptor) -> Result<()> {
        let from_name = self.name(from)?;
        let to_name = self.name(to)?;
        let url = self.repo_url(to_name, "blobs/uploads/");
        let scope = format!("{} repository:{}:pull", push_scope(to_name), from_name);
        let query = [("mount", desc.digest.as_str()), ("from", from_name)];
        let response = self
            .send(&scope, |c| c.post(&url).query(&query).header(CONTENT_LENGTH, 0))
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                tracing::debug!(from, to, digest = %desc.digest, "Mounted blob");
                Ok(())
            }
            StatusCode::ACCEPTED => {
                // Registry declined the mount; copy through this client instead.
                let reader = self.pull_blob(from, &desc.digest).await?;
                self.push_blob(to, reader, Some(desc)).await?;
                Ok(())
            }
            _ => Err(self.status_error(response, "mount blob").await),
        }
    }

    async fn stat_blob(&self, repo: &str, digest: &str) -> Result<bool> {
        let name = self.name(repo)?;
        self.head(name, &format!("blobs/{}", digest), None).await
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog", self.base_url());
        let names = self
            .paginate(url, "registry:catalog:*", |page: CatalogResponse| {
                page.repositories.unwrap_or_default()
            })
            .await?;
        let mut repos: Vec<String> = names
            .into_iter()
            .map(|n| format!("{}/{}", self.registry, n))
            .collect();
        repos.sort();
        Ok(repos)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let name = self.name(repo)?;
        let url = self.repo_url(name, "tags/list");
        self.paginate(url, &pull_scope(name), |page: TagsResponse| {
            page.tags.unwrap_or_default()
        })
        .await
    }

    async fn list_blobs(&self, _repo: &str) -> Result<Vec<String>> {
        Err(PackError::Unsupported(
            "listing blobs is not available on a remote registry".to_string(),
        ))
    }

    async fn cleanup_repo(
        &self,
        repo: &str,
        blobs: &HashSet<String>,
        remove_repo: bool,
    ) -> Result<usize> {
        let name = self.name(repo)?;
        let scope = delete_scope(name);
        let mut removed = 0;
        for digest in blobs {
            let url = self.repo_url(name, &format!("blobs/{}", digest));
            let response = self
                .send(&scope, |c| c.request(Method::DELETE, &url))
                .await?;
            match response.status() {
                s if s.is_success() => removed += 1,
                StatusCode::NOT_FOUND => {}
                _ => return Err(self.status_error(response, "delete blob").await),
            }
        }
        if remove_repo {
            tracing::debug!(repo, "Registries have no repository deletion; keeping repository");
        }
        Ok(removed)
    }

    async fn perform_gc(&self, _dry_run: bool, _remove_untagged: bool) -> Result<Vec<String>> {
        Err(PackError::Unsupported(
            "garbage collection is not available on a remote registry".to_string(),
        ))
    }
}

fn pull_scope(name: &str) -> String {
    format!("repository:{}:pull", name)
}

fn push_scope(name: &str) -> String {
    format!("repository:{}:pull,push", name)
}

fn delete_scope(name: &str) -> String {
    format!("repository:{}:delete", name)
}

fn header_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Request body streamed from a reader.
fn stream_body(reader: BlobReader) -> reqwest::Body {
    reqwest::Body::wrap_stream(SyncStream(Mutex::new(ReaderStream::new(reader))))
}

/// `reqwest::Body::wrap_stream` requires `Sync`; readers are only `Send`.
struct SyncStream<S>(Mutex<S>);

impl<S: Stream + Unpin> Stream for SyncStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.get_mut().poll_next_unpin(cx)
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` into its parameters.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match (escaped, c) {
                    (false, '\\') => escaped = true,
                    (false, '"') => break,
                    _ => {
                        value.push(c);
                        escaped = false;
                    }
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value);
    }
    Some(params)
}

/// Target of a `Link: <url>; rel="next"` header.
fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let url = url.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(url.to_string())
    })
}

fn resolve_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else if location.starts_with('/') {
        format!("{}{}", base, location)
    } else {
        format!("{}/{}", base, location)
    }
}

fn append_query(url: &str, key: &str, value: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, sep, key, value)
}
