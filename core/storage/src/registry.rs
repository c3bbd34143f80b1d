//! Repository resolution.
//!
//! A location string is offered to each registered opener in registration
//! order; the first opener that claims it opens the repository. Nothing
//! claiming a location, or a claimed location holding no repository, is a
//! resolution failure.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::crypt::CryptRepositoryProxy;
use crate::local::LocalRepositoryProxy;
use crate::proxy::RepositoryProxy;
use reposync_common::{Error, Result, SensitiveBytes};
use reposync_crypto::KdfParams;
use reposync_manifest::Manifest;

/// Source of the passphrase for encrypted repositories.
pub type PassphraseProvider = Arc<dyn Fn(&str) -> Result<SensitiveBytes> + Send + Sync>;

/// Opens (and creates) repositories of one transport.
#[async_trait]
pub trait RepositoryOpener: Send + Sync {
    /// Transport name, unique within a registry.
    fn name(&self) -> &str;

    /// If this transport handles `location`, the transport-specific
    /// remainder of it.
    fn claim(&self, location: &str) -> Option<String>;

    /// Open the existing repository at a claimed location.
    async fn open(&self, claimed: &str) -> Result<Arc<dyn RepositoryProxy>>;

    /// Create a new repository at a claimed location.
    async fn create(&self, claimed: &str, manifest: Manifest) -> Result<Arc<dyn RepositoryProxy>>;
}

/// Ordered set of repository openers.
pub struct ProxyRegistry {
    openers: Vec<Box<dyn RepositoryOpener>>,
}

impl ProxyRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            openers: Vec::new(),
        }
    }

    /// Register an opener after those already present.
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&mut self, opener: Box<dyn RepositoryOpener>) -> Result<()> {
        if self.has_opener(opener.name()) {
            return Err(Error::AlreadyExists(format!(
                "Opener '{}' is already registered",
                opener.name()
            )));
        }
        self.openers.push(opener);
        Ok(())
    }

    fn claim(&self, location: &str) -> Result<(&dyn RepositoryOpener, String)> {
        self.openers
            .iter()
            .find_map(|opener| {
                opener
                    .claim(location)
                    .map(|claimed| (opener.as_ref(), claimed))
            })
            .ok_or_else(|| Error::Resolution(format!("No transport recognizes '{}'", location)))
    }

    /// Open the repository at `location`.
    ///
    /// # Errors
    /// - `Resolution` if no opener claims the location or nothing is there
    /// - `Crypto` for a wrong passphrase
    pub async fn resolve(&self, location: &str) -> Result<Arc<dyn RepositoryProxy>> {
        let (opener, claimed) = self.claim(location)?;
        opener.open(&claimed).await.map_err(|e| match e {
            Error::NotFound(msg) => Error::Resolution(format!("{}: {}", location, msg)),
            other => other,
        })
    }

    /// Create a repository at `location`.
    pub async fn create(
        &self,
        location: &str,
        manifest: Manifest,
    ) -> Result<Arc<dyn RepositoryProxy>> {
        let (opener, claimed) = self.claim(location)?;
        opener.create(&claimed, manifest).await
    }

    /// Registered opener names, in probe order.
    pub fn openers(&self) -> Vec<String> {
        self.openers.iter().map(|o| o.name().to_string()).collect()
    }

    /// Check if an opener is registered.
    pub fn has_opener(&self, name: &str) -> bool {
        self.openers.iter().any(|o| o.name() == name)
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain directories, as `local:<path>` or a bare path.
pub struct LocalOpener;

#[async_trait]
impl RepositoryOpener for LocalOpener {
    fn name(&self) -> &str {
        "local"
    }

    fn claim(&self, location: &str) -> Option<String> {
        if let Some(rest) = location.strip_prefix("local:") {
            return Some(rest.to_string());
        }
        if location.is_empty() || location.contains("://") {
            return None;
        }
        Some(location.to_string())
    }

    async fn open(&self, claimed: &str) -> Result<Arc<dyn RepositoryProxy>> {
        let root = PathBuf::from(claimed);
        if !root.is_dir() {
            return Err(Error::NotFound(format!("{} is not a directory", claimed)));
        }
        Ok(Arc::new(LocalRepositoryProxy::open(root)?))
    }

    async fn create(&self, claimed: &str, manifest: Manifest) -> Result<Arc<dyn RepositoryProxy>> {
        Ok(Arc::new(LocalRepositoryProxy::create(claimed, manifest)?))
    }
}

/// Encrypted repositories inside a local one, as `crypt:<path>`.
pub struct CryptOpener {
    passphrase: PassphraseProvider,
    params: KdfParams,
}

impl CryptOpener {
    pub fn new(passphrase: PassphraseProvider) -> Self {
        Self {
            passphrase,
            params: KdfParams::default(),
        }
    }

    /// KDF parameters for newly created repositories.
    pub fn with_params(mut self, params: KdfParams) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
impl RepositoryOpener for CryptOpener {
    fn name(&self) -> &str {
        "crypt"
    }

    fn claim(&self, location: &str) -> Option<String> {
        location.strip_prefix("crypt:").map(String::from)
    }

    async fn open(&self, claimed: &str) -> Result<Arc<dyn RepositoryProxy>> {
        let inner = LocalOpener.open(claimed).await?;
        if !CryptRepositoryProxy::is_crypt_repository(inner.as_ref()).await? {
            return Err(Error::NotFound(format!(
                "{} holds no encrypted repository",
                claimed
            )));
        }
        let passphrase = (self.passphrase)(claimed)?;
        Ok(Arc::new(
            CryptRepositoryProxy::open(inner, passphrase.as_bytes()).await?,
        ))
    }

    async fn create(&self, claimed: &str, manifest: Manifest) -> Result<Arc<dyn RepositoryProxy>> {
        // The inner repository only holds blobs; it gets its own identity.
        let inner_manifest = Manifest::new(
            format!("{} (encrypted store)", manifest.name()),
            manifest.default_hash_algorithm(),
        );
        let passphrase = (self.passphrase)(claimed)?;
        let inner: Arc<dyn RepositoryProxy> =
            Arc::new(LocalRepositoryProxy::create(claimed, inner_manifest)?);
        Ok(Arc::new(
            CryptRepositoryProxy::create(inner, passphrase.as_bytes(), self.params.clone(), manifest)
                .await?,
        ))
    }
}

/// Registry with the encrypted and local transports, probed in that order.
pub fn create_default_registry(passphrase: PassphraseProvider) -> Result<ProxyRegistry> {
    let mut registry = ProxyRegistry::new();
    registry.register(Box::new(CryptOpener::new(passphrase)))?;
    registry.register(Box::new(LocalOpener))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposync_manifest::HashAlgorithm;
    use tempfile::TempDir;

    fn passphrase() -> PassphraseProvider {
        Arc::new(|_| Ok(SensitiveBytes::new(b"test passphrase".to_vec())))
    }

    fn registry() -> ProxyRegistry {
        let mut registry = ProxyRegistry::new();
        registry
            .register(Box::new(
                CryptOpener::new(passphrase()).with_params(KdfParams::moderate()),
            ))
            .unwrap();
        registry.register(Box::new(LocalOpener)).unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProxyRegistry::new();
        registry.register(Box::new(LocalOpener)).unwrap();
        assert!(registry.register(Box::new(LocalOpener)).is_err());
        assert_eq!(registry.openers(), vec!["local".to_string()]);
    }

    #[test]
    fn test_default_registry_order() {
        let registry = create_default_registry(passphrase()).unwrap();
        assert_eq!(registry.openers(), vec!["crypt".to_string(), "local".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_local() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().to_str().unwrap().to_string();
        let registry = registry();

        registry
            .create(&location, Manifest::new("r", HashAlgorithm::Sha256))
            .await
            .unwrap();
        let proxy = registry.resolve(&location).await.unwrap();
        assert_eq!(proxy.name(), "local");
        let proxy = registry.resolve(&format!("local:{}", location)).await.unwrap();
        assert_eq!(proxy.manifest().await.unwrap().name(), "r");
    }

    #[tokio::test]
    async fn test_resolution_failures() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let missing = dir.path().join("nothing-here");

        for location in [
            missing.to_str().unwrap().to_string(),
            dir.path().to_str().unwrap().to_string(),
            "https://example.com/repo".to_string(),
            format!("crypt:{}", dir.path().to_str().unwrap()),
        ] {
            assert!(
                matches!(registry.resolve(&location).await, Err(Error::Resolution(_))),
                "{} should not resolve",
                location
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_crypt() {
        let dir = TempDir::new().unwrap();
        let location = format!("crypt:{}", dir.path().to_str().unwrap());
        let registry = registry();

        let created = registry
            .create(&location, Manifest::new("vault", HashAlgorithm::Sha256))
            .await
            .unwrap();
        let guid = created.manifest().await.unwrap().guid();
        created.flush().await.unwrap();

        let opened = registry.resolve(&location).await.unwrap();
        assert_eq!(opened.name(), "crypt");
        assert_eq!(opened.manifest().await.unwrap().guid(), guid);

        // The plain path resolves to the inner store, not the encrypted view.
        let inner = registry.resolve(dir.path().to_str().unwrap()).await.unwrap();
        assert_ne!(inner.manifest().await.unwrap().guid(), guid);
    }
}
