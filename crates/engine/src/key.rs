//! Object key resolution.

use std::future::Future;
use std::pin::Pin;

use uplink_transfer::SessionId;

use crate::error::UploadError;

pub type KeyFuture<'a> = Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + 'a>>;

/// Chooses the object key for a file. Runs once per session; the result is
/// kept across resets.
pub trait KeyResolver: Send + Sync {
    fn resolve<'a>(&'a self, session: &'a SessionId, file_name: &'a str) -> KeyFuture<'a>;
}

/// Random UUID plus the file's extension, optionally under a prefix.
#[derive(Debug, Clone, Default)]
pub struct UuidKeyResolver {
    prefix: Option<String>,
}

impl UuidKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn key_for(&self, file_name: &str) -> String {
        let id = uuid::Uuid::new_v4();
        let name = match extension(file_name) {
            Some(ext) => format!("{id}.{ext}"),
            None => id.to_string(),
        };
        match &self.prefix {
            Some(prefix) => format!("{}/{name}", prefix.trim_end_matches('/')),
            None => name,
        }
    }
}

fn extension(file_name: &str) -> Option<&str> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}

impl KeyResolver for UuidKeyResolver {
    fn resolve<'a>(&'a self, _session: &'a SessionId, file_name: &'a str) -> KeyFuture<'a> {
        let key = self.key_for(file_name);
        Box::pin(async move { Ok(key) })
    }
}

/// Resolver backed by a synchronous closure.
pub struct FnKeyResolver<F> {
    f: F,
}

impl<F> FnKeyResolver<F>
where
    F: Fn(&SessionId, &str) -> Result<String, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> KeyResolver for FnKeyResolver<F>
where
    F: Fn(&SessionId, &str) -> Result<String, String> + Send + Sync,
{
    fn resolve<'a>(&'a self, session: &'a SessionId, file_name: &'a str) -> KeyFuture<'a> {
        let result = (self.f)(session, file_name).map_err(UploadError::KeyResolution);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uuid_key_keeps_extension() {
        let r = UuidKeyResolver::new();
        let key = r.resolve(&"s1".into(), "holiday.photo.JPG").await.unwrap();
        assert!(key.ends_with(".JPG"));
        assert_eq!(key.len(), 36 + 4);
    }

    #[tokio::test]
    async fn uuid_key_without_extension() {
        let r = UuidKeyResolver::new();
        assert_eq!(r.resolve(&"s1".into(), "README").await.unwrap().len(), 36);
        assert_eq!(r.resolve(&"s1".into(), ".bashrc").await.unwrap().len(), 36);
    }

    #[tokio::test]
    async fn uuid_keys_differ_and_honour_prefix() {
        let r = UuidKeyResolver::with_prefix("uploads/");
        let a = r.resolve(&"s1".into(), "a.txt").await.unwrap();
        let b = r.resolve(&"s1".into(), "a.txt").await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("uploads/"));
        assert!(!a.starts_with("uploads//"));
    }

    #[tokio::test]
    async fn closure_resolver_maps_errors() {
        let r = FnKeyResolver::new(|id: &SessionId, name: &str| {
            if name.is_empty() {
                Err("no name".to_string())
            } else {
                Ok(format!("{id}/{name}"))
            }
        });
        assert_eq!(r.resolve(&"s1".into(), "a.txt").await.unwrap(), "s1/a.txt");
        assert!(matches!(
            r.resolve(&"s1".into(), "").await,
            Err(UploadError::KeyResolution(_))
        ));
    }
}
