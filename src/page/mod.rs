pub mod dom;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use url::Url;

pub use dom::{Document, DomMutation, NodeId, NodeKind};

/// Identity of the page a content session runs in.
#[derive(Debug, Clone)]
pub struct PageLocation {
    url: Url,
}

impl PageLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid page url {raw}"))?;
        if url.host_str().is_none() {
            return Err(anyhow!("page url {raw} has no host"));
        }
        Ok(Self { url })
    }

    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Lowercase hex SHA-256 of the hostname.
    pub fn hostname_hash(&self) -> String {
        hash_domain(self.hostname())
    }
}

pub fn hash_domain(domain: &str) -> String {
    hex::encode(Sha256::digest(domain.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_hash_is_sha256_hex() {
        assert_eq!(
            hash_domain("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let page = PageLocation::parse("https://example.org/articles/1?x=y").unwrap();
        assert_eq!(page.hostname(), "example.org");
        assert_eq!(page.hostname_hash(), hash_domain("example.org"));
    }

    #[test]
    fn rejects_hostless_urls() {
        assert!(PageLocation::parse("about:blank").is_err());
    }
}
