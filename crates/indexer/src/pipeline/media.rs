//! Hosted media storage.
//!
//! Fetched assets are written under a local root and served from a
//! configured base URL. Paths are deterministic per token so a re-fetch
//! overwrites in place.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use nfttrack_core::lowercase_address;
use std::path::PathBuf;

use crate::config::MediaConfig;

/// Writes token assets to disk and hands back their public URLs.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    base_url: String,
}

/// What kind of asset a path is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Animation,
}

impl AssetKind {
    fn label(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Animation => "animation",
        }
    }
}

impl MediaStore {
    /// Build a store rooted at the configured directory.
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Relative path of one token asset, e.g.
    /// `1/0xabc…/42.image.png`.
    fn relative_path(
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        kind: AssetKind,
        ext: &str,
    ) -> String {
        format!(
            "{}/{}/{}.{}{}",
            chain_id,
            lowercase_address(contract),
            token_id,
            kind.label(),
            ext
        )
    }

    /// Store asset bytes and return the public URL.
    pub async fn store(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        kind: AssetKind,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let relative = Self::relative_path(
            chain_id,
            contract,
            token_id,
            kind,
            extension_for(content_type),
        );
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create media directory {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write media file {}", path.display()))?;

        Ok(format!("{}/{relative}", self.base_url))
    }
}

/// File extension for a content type; empty for unrecognized types so
/// the path stays valid either way.
fn extension_for(content_type: &str) -> &'static str {
    // Parameters like "; charset=utf-8" are not part of the type.
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "audio/mpeg" => ".mp3",
        "model/gltf-binary" => ".glb",
        "text/html" => ".html",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[tokio::test]
    async fn test_store_writes_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(&MediaConfig {
            root: dir.path().to_string_lossy().into_owned(),
            base_url: "https://assets.example/".to_string(),
        });

        let contract = address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d");
        let token = U256::from(42u64);
        let url = store
            .store(1, &contract, &token, AssetKind::Image, "image/png", b"png")
            .await
            .unwrap();

        let expected_rel = format!("1/{}/42.image.png", lowercase_address(&contract));
        assert_eq!(url, format!("https://assets.example/{expected_rel}"));
        assert_eq!(
            std::fs::read(dir.path().join(&expected_rel)).unwrap(),
            b"png"
        );

        // A refresh overwrites in place.
        store
            .store(1, &contract, &token, AssetKind::Image, "image/png", b"new")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join(&expected_rel)).unwrap(),
            b"new"
        );
    }

    #[test]
    fn test_extension_mapping_ignores_parameters() {
        assert_eq!(extension_for("image/jpeg; charset=utf-8"), ".jpg");
        assert_eq!(extension_for("application/x-unknown"), "");
    }
}
