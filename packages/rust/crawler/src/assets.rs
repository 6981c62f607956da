//! Image downloads into a flat `<assets_dir>/<id>.<ext>` directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use larder_shared::{AssetStore, ItemId, LarderError, Result};

use crate::net;

/// Extensions an asset may be stored under.
const KNOWN_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// [`AssetStore`] that downloads over HTTP and writes to the local filesystem.
pub struct HttpAssetStore {
    client: Client,
    root: PathBuf,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpAssetStore {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: net::build_client(timeout)?,
            root: root.into(),
            allow_localhost: false,
        })
    }

    /// Allow fetching from localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Path of the stored asset for `id`, if one exists.
    pub fn find(&self, id: &ItemId) -> Option<PathBuf> {
        KNOWN_EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{id}.{ext}")))
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn exists(&self, id: &ItemId) -> Result<bool> {
        Ok(self.find(id).is_some())
    }

    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = Url::parse(url)
            .map_err(|e| LarderError::validation(format!("invalid asset url '{url}': {e}")))?;
        let bytes = net::get(&self.client, &parsed, self.allow_localhost)
            .await?
            .bytes()
            .await
            .map_err(|e| net::send_error(&parsed, e))?;

        if bytes.is_empty() {
            return Err(LarderError::NotFound(format!("{url}: empty body")));
        }
        debug!(len = bytes.len(), "asset downloaded");
        Ok(bytes.to_vec())
    }

    async fn save(&self, id: &ItemId, url: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| LarderError::io(&self.root, e))?;

        let ext = sniff_extension(bytes)
            .or_else(|| extension_from_url(url))
            .unwrap_or("jpg");
        let target = self.root.join(format!("{id}.{ext}"));
        let tmp = self.root.join(format!(".{id}.{}.tmp", Uuid::now_v7()));

        // Synced before the rename so a crash never leaves a truncated asset
        // behind a committed checkpoint.
        if let Err(e) = write_synced(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LarderError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LarderError::io(&target, e));
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Detect the image type from magic bytes.
fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("jpg"),
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        _ => None,
    }
}

/// Take a known image extension from the URL path, ignoring the query.
fn extension_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next()?;
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    KNOWN_EXTENSIONS.iter().copied().find(|k| *k == ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    fn store(dir: &Path) -> HttpAssetStore {
        HttpAssetStore::new(dir, Duration::from_secs(5))
            .unwrap()
            .allow_localhost()
    }

    #[test]
    fn extension_detection() {
        assert_eq!(sniff_extension(PNG), Some("png"));
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpg"));
        assert_eq!(sniff_extension(b"hello"), None);
        assert_eq!(extension_from_url("https://x.com/a/b.JPEG?w=300"), Some("jpeg"));
        assert_eq!(extension_from_url("https://x.com/a/b.php"), None);
    }

    #[tokio::test]
    async fn save_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = ItemId::from("77");

        assert!(!store.exists(&id).await.unwrap());
        store
            .save(&id, "https://x.com/77.jpg", PNG)
            .await
            .expect("save");
        assert!(store.exists(&id).await.unwrap());
        assert_eq!(store.find(&id).unwrap(), dir.path().join("77.png"));

        // No temp files left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn save_replaces_with_the_full_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = ItemId::from("12");
        let large: Vec<u8> = PNG.iter().copied().chain((0..64 * 1024).map(|i| i as u8)).collect();

        store.save(&id, "https://x.com/12.png", PNG).await.unwrap();
        store.save(&id, "https://x.com/12.png", &large).await.unwrap();

        let stored = std::fs::read(dir.path().join("12.png")).unwrap();
        assert_eq!(stored, large);
    }

    #[tokio::test]
    async fn fetch_maps_missing_asset_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(path("/img/ok.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG))
            .mount(&server)
            .await;
        Mock::given(path("/img/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/img/empty.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let bytes = store
            .fetch(&format!("{}/img/ok.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, PNG);

        let err = store
            .fetch(&format!("{}/img/gone.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .fetch(&format!("{}/img/empty.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
