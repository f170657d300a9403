//! URL resolution
//!
//! A [`Resolver`] turns a page or media URL into a [`Descriptor`] naming the
//! concrete bytes to fetch, and expands profile/collection URLs into the
//! media URLs they contain. The set of resolvers is closed; the
//! [`ResolverRegistry`] routes each URL to one of them by host.

use crate::error::FetchError;
use mediafetch_types::Descriptor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Every resolver the engine knows how to dispatch to
#[derive(Debug, Clone)]
pub enum Resolver {
    Direct(DirectResolver),
    Catalog(CatalogResolver),
}

impl Resolver {
    pub async fn resolve(&self, url: &str) -> Result<Descriptor, FetchError> {
        match self {
            Resolver::Direct(resolver) => resolver.resolve(url),
            Resolver::Catalog(resolver) => resolver.resolve(url),
        }
    }

    /// Media URLs contained in a profile or collection, at most `limit`
    pub async fn expand(&self, url: &str, limit: usize) -> Result<Vec<String>, FetchError> {
        match self {
            Resolver::Direct(_) => Err(FetchError::Resolution {
                url: url.to_string(),
                reason: "direct links do not contain other media".to_string(),
            }),
            Resolver::Catalog(resolver) => resolver.expand(url, limit),
        }
    }
}

/// Treats the URL itself as the media location
#[derive(Debug, Clone, Default)]
pub struct DirectResolver;

impl DirectResolver {
    pub fn resolve(&self, url: &str) -> Result<Descriptor, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Resolution {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let suggested_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                urlencoding::decode(segment)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| segment.to_string())
            })
            .unwrap_or_else(|| parsed.host_str().unwrap_or("download").to_string());

        Ok(Descriptor {
            id: stable_id(url),
            source_url: url.to_string(),
            download_url: url.to_string(),
            suggested_name,
            size_hint: None,
            checksum: None,
            headers: Default::default(),
        })
    }
}

/// Pre-resolved descriptors and collections, keyed by source URL
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    items: HashMap<String, Descriptor>,
    collections: HashMap<String, Vec<String>>,
}

impl CatalogResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, descriptor: Descriptor) -> Self {
        self.items.insert(descriptor.source_url.clone(), descriptor);
        self
    }

    pub fn with_collection(
        mut self,
        url: impl Into<String>,
        items: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.collections
            .insert(url.into(), items.into_iter().map(Into::into).collect());
        self
    }

    pub fn resolve(&self, url: &str) -> Result<Descriptor, FetchError> {
        self.items
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Resolution {
                url: url.to_string(),
                reason: "not present in catalog".to_string(),
            })
    }

    pub fn expand(&self, url: &str, limit: usize) -> Result<Vec<String>, FetchError> {
        self.collections
            .get(url)
            .map(|items| items.iter().take(limit).cloned().collect())
            .ok_or_else(|| FetchError::Resolution {
                url: url.to_string(),
                reason: "unknown collection".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
struct Route {
    name: String,
    hosts: Vec<String>,
    resolver: Resolver,
}

impl Route {
    fn matches(&self, host: &str) -> bool {
        self.hosts.iter().any(|pattern| {
            host == pattern
                || host
                    .strip_suffix(pattern.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Routes URLs to resolvers by host
#[derive(Debug, Clone, Default)]
pub struct ResolverRegistry {
    routes: Vec<Route>,
    fallback: Option<Resolver>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that treats every URL without a more specific route as
    /// a direct media link
    pub fn with_direct_fallback() -> Self {
        Self {
            routes: Vec::new(),
            fallback: Some(Resolver::Direct(DirectResolver)),
        }
    }

    /// Route URLs whose host equals or is a subdomain of one of `hosts`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
        resolver: Resolver,
    ) -> &mut Self {
        self.routes.push(Route {
            name: name.into(),
            hosts: hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
            resolver,
        });
        self
    }

    pub fn set_fallback(&mut self, resolver: Resolver) -> &mut Self {
        self.fallback = Some(resolver);
        self
    }

    /// Names of the registered routes, in registration order
    pub fn names(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn lookup(&self, url: &str) -> Result<&Resolver, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::UnsupportedUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_default();

        if let Some(route) = self.routes.iter().find(|route| route.matches(&host)) {
            debug!("Routing {} to resolver '{}'", url, route.name);
            return Ok(&route.resolver);
        }

        self.fallback
            .as_ref()
            .ok_or_else(|| FetchError::UnsupportedUrl(url.to_string()))
    }

    pub async fn resolve(&self, url: &str) -> Result<Descriptor, FetchError> {
        self.lookup(url)?.resolve(url).await
    }

    pub async fn expand(&self, url: &str, limit: usize) -> Result<Vec<String>, FetchError> {
        self.lookup(url)?.expand(url, limit).await
    }
}

fn stable_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(source: &str, download: &str) -> Descriptor {
        Descriptor {
            id: "clip-1".into(),
            source_url: source.into(),
            download_url: download.into(),
            suggested_name: "clip.mp4".into(),
            size_hint: Some(10),
            checksum: None,
            headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn direct_names_come_from_the_decoded_last_segment() {
        let resolver = DirectResolver;
        let d = resolver
            .resolve("https://cdn.example.com/media/My%20Clip.mp4?sig=1")
            .unwrap();
        assert_eq!(d.suggested_name, "My Clip.mp4");
        assert_eq!(d.download_url, d.source_url);
        assert_eq!(d.id, resolver.resolve("https://cdn.example.com/media/My%20Clip.mp4?sig=1").unwrap().id);

        let bare = resolver.resolve("https://example.com/").unwrap();
        assert_eq!(bare.suggested_name, "example.com");
    }

    #[tokio::test]
    async fn routes_match_hosts_and_subdomains_only() {
        let catalog = CatalogResolver::new()
            .with_item(descriptor("https://www.video.test/watch/1", "https://cdn.test/1.mp4"))
            .with_collection("https://video.test/@someone", ["https://video.test/watch/1", "https://video.test/watch/2"]);

        let mut registry = ResolverRegistry::new();
        registry.register("video", ["video.test"], Resolver::Catalog(catalog));

        let d = registry.resolve("https://www.video.test/watch/1").await.unwrap();
        assert_eq!(d.download_url, "https://cdn.test/1.mp4");

        let items = registry.expand("https://video.test/@someone", 1).await.unwrap();
        assert_eq!(items, vec!["https://video.test/watch/1".to_string()]);

        let err = registry.resolve("https://notvideo.test/watch/1").await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn fallback_handles_unrouted_hosts() {
        let registry = ResolverRegistry::with_direct_fallback();
        let d = registry.resolve("http://files.test/a.bin").await.unwrap();
        assert_eq!(d.suggested_name, "a.bin");

        let err = registry.expand("http://files.test/a.bin", 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Resolution { .. }));
    }
}
