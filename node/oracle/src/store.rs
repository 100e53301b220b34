use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// How long to wait for a storage node to start serving a hash before
/// concluding no provider has it.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no provider served {hash} within the network timeout")]
    NotFound { hash: String },
    #[error("content hash mismatch: requested {requested}, got {actual}")]
    Integrity { requested: String, actual: String },
    #[error("storage api error: {0}")]
    Api(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Fetches artifacts by content hash from the local IPFS node. Retrieved
/// bytes are only accepted once the node re-derives the same content
/// address for them, so a misbehaving storage peer cannot substitute the
/// payload.
pub struct ArchiveStore {
    api_base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl ArchiveStore {
    pub fn new(api_base: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Streams the content addressed by `content_hash` to `dest`, then
    /// verifies the retrieved bytes hash back to the requested address.
    pub async fn fetch(&self, content_hash: &str, dest: &Path) -> Result<(), FetchError> {
        let url = format!("{}/api/v0/cat?arg={}", self.api_base, content_hash);
        let mut response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| classify(content_hash, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                hash: content_hash.to_string(),
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Api(format!("cat returned {}: {}", status, body)));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify(content_hash, e))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = self.content_address(dest).await?;
        if actual != content_hash {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(FetchError::Integrity {
                requested: content_hash.to_string(),
                actual,
            });
        }

        Ok(())
    }

    /// Asks the storage node to re-derive the content address of the file
    /// without pinning it.
    async fn content_address(&self, path: &Path) -> Result<String, FetchError> {
        let bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(bytes).file_name("archive");
        let form = Form::new().part("file", part);

        let url = format!("{}/api/v0/add?only-hash=true&cid-version=0", self.api_base);
        let response = self.http.post(&url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Api(format!("add returned {}", response.status())));
        }

        let added: AddResponse = response.json().await?;
        Ok(added.hash)
    }
}

fn classify(hash: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::NotFound {
            hash: hash.to_string(),
        }
    } else {
        FetchError::Http(err)
    }
}
