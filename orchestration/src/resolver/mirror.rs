//! Secondary library source: GitHub repositories
//!
//! When the primary index has no usable release, the resolver looks the
//! library up as a GitHub repository and installs its default-branch
//! archive.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::source::Dependency;

/// Words that carry no identity in library names ("Arduino", "library")
const NOISE_WORDS: &[&str] = &["arduino", "library"];

/// A repository the mirror can serve an archive for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRepo {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
}

impl MirrorRepo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// File name used for the downloaded archive
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}-{}.zip", self.owner, self.name, self.default_branch)
            .replace(['/', '\\'], "_")
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror request failed: {0}")]
    Http(String),

    #[error("mirror returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("failed to write archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Source of library archives outside the primary index
#[async_trait]
pub trait LibraryMirror: Send + Sync {
    /// Find the repository that most plausibly hosts a dependency
    async fn find(&self, dependency: &Dependency) -> Result<Option<MirrorRepo>, MirrorError>;

    /// Download the repository's default-branch archive to `dest`.
    /// Returns the archive size in bytes.
    async fn fetch(&self, repo: &MirrorRepo, dest: &Path) -> Result<u64, MirrorError>;
}

/// Lower-case, alphanumerics only, noise words removed.
///
/// Falls back to the plain alphanumeric form when nothing else is left
/// (a library literally named "Arduino").
pub fn normalize_library_name(raw: &str) -> String {
    let plain: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let mut stripped = plain.clone();
    for word in NOISE_WORDS {
        stripped = stripped.replace(word, "");
    }
    if stripped.is_empty() {
        plain
    } else {
        stripped
    }
}

/// Pick the best candidate name for a dependency.
///
/// An exact normalized match wins over containment; among containment
/// matches the earliest candidate wins (search results arrive ranked).
pub fn best_candidate<'a>(dependency: &Dependency, candidates: &'a [String]) -> Option<&'a String> {
    let mut wanted = vec![normalize_library_name(&dependency.name)];
    if let Some(header) = &dependency.header {
        let stem = Dependency::from_header(header).name;
        let norm = normalize_library_name(&stem);
        if !wanted.contains(&norm) {
            wanted.push(norm);
        }
    }
    wanted.retain(|w| !w.is_empty());
    if wanted.is_empty() {
        return None;
    }

    if let Some(exact) = candidates
        .iter()
        .find(|c| c.eq_ignore_ascii_case(&dependency.name))
    {
        return Some(exact);
    }
    if let Some(normalized) = candidates
        .iter()
        .find(|c| wanted.contains(&normalize_library_name(c)))
    {
        return Some(normalized);
    }
    candidates.iter().find(|c| {
        let norm = normalize_library_name(c);
        wanted.iter().any(|w| norm.contains(w.as_str()))
    })
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    name: String,
    owner: SearchOwner,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct SearchOwner {
    login: String,
}

/// GitHub repository search + codeload archives
#[derive(Debug, Clone)]
pub struct GithubMirror {
    client: reqwest::Client,
    api_base: String,
    archive_base: String,
    token: Option<String>,
}

impl GithubMirror {
    pub const DEFAULT_API_BASE: &'static str = "https://api.github.com";
    pub const DEFAULT_ARCHIVE_BASE: &'static str = "https://codeload.github.com";

    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, MirrorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sketchforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            archive_base: Self::DEFAULT_ARCHIVE_BASE.to_string(),
            token: None,
        })
    }

    pub fn with_archive_base(mut self, base: impl Into<String>) -> Self {
        self.archive_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Authenticate API calls (raises the search rate limit)
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl LibraryMirror for GithubMirror {
    async fn find(&self, dependency: &Dependency) -> Result<Option<MirrorRepo>, MirrorError> {
        let url = format!("{}/search/repositories", self.api_base);
        let query = format!("{} in:name", dependency.name);
        let response = self
            .get(&url)
            .query(&[("q", query.as_str()), ("sort", "stars"), ("per_page", "10")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MirrorError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let body: SearchResponse = response.json().await?;
        let names: Vec<String> = body.items.iter().map(|i| i.name.clone()).collect();
        let Some(best) = best_candidate(dependency, &names) else {
            debug!(dependency = %dependency, results = names.len(), "No mirror repository matched");
            return Ok(None);
        };
        Ok(body
            .items
            .into_iter()
            .find(|item| &item.name == best)
            .map(|item| MirrorRepo {
                owner: item.owner.login,
                name: item.name,
                default_branch: item.default_branch.unwrap_or_else(|| "main".to_string()),
            }))
    }

    async fn fetch(&self, repo: &MirrorRepo, dest: &Path) -> Result<u64, MirrorError> {
        let url = format!(
            "{}/{}/{}/zip/refs/heads/{}",
            self.archive_base, repo.owner, repo.name, repo.default_branch
        );
        let response = self.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MirrorError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let bytes = response.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MirrorError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| MirrorError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_strips_noise() {
        assert_eq!(normalize_library_name("DHT sensor library"), "dhtsensor");
        assert_eq!(normalize_library_name("DHT-sensor-library"), "dhtsensor");
        assert_eq!(normalize_library_name("Arduino_JSON"), "json");
        assert_eq!(normalize_library_name("Arduino"), "arduino");
    }

    #[test]
    fn test_exact_normalized_match_beats_containment() {
        let dep = Dependency::named("DHT sensor library");
        let candidates = names(&["DHT-sensor-library-fork-extended", "DHT-sensor-library"]);
        assert_eq!(
            best_candidate(&dep, &candidates).map(String::as_str),
            Some("DHT-sensor-library")
        );
    }

    #[test]
    fn test_containment_takes_first_ranked() {
        let dep = Dependency::from_header("Adafruit_SSD1306.h");
        let candidates = names(&["Adafruit_SSD1306_Wemos", "SSD1306_Adafruit_SSD1306_port"]);
        assert_eq!(
            best_candidate(&dep, &candidates).map(String::as_str),
            Some("Adafruit_SSD1306_Wemos")
        );
    }

    #[test]
    fn test_header_stem_used_when_name_differs() {
        let dep = Dependency::named("DHT sensor library").with_header("DHT.h");
        let candidates = names(&["dht"]);
        assert_eq!(best_candidate(&dep, &candidates).map(String::as_str), Some("dht"));
    }

    #[test]
    fn test_no_match() {
        let dep = Dependency::named("FastLED");
        assert!(best_candidate(&dep, &names(&["NeoPixelBus", "WS2812"])).is_none());
    }

    #[test]
    fn test_archive_file_name() {
        let repo = MirrorRepo {
            owner: "adafruit".into(),
            name: "DHT-sensor-library".into(),
            default_branch: "feature/x".into(),
        };
        assert_eq!(repo.full_name(), "adafruit/DHT-sensor-library");
        assert_eq!(repo.archive_file_name(), "adafruit-DHT-sensor-library-feature_x.zip");
    }
}
