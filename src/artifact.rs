//! Artifact channel: publishes generated images and returns a public URL

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// Error type for artifact uploads
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("image host returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("image host returned no URL")]
    MissingUrl,
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Somewhere images can be uploaded to
#[async_trait]
pub trait ImageHost: Send + Sync {
    /// Upload `data` under a suggested `filename`, returning a retrievable URL
    async fn upload(&self, data: Vec<u8>, filename: &str) -> Result<String, ArtifactError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

/// Image host accepting a multipart `file` field and answering with either
/// `{"url": "..."}` or the bare URL as text
#[derive(Clone)]
pub struct HttpImageHost {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpImageHost {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ImageHost for HttpImageHost {
    async fn upload(&self, data: Vec<u8>, filename: &str) -> Result<String, ArtifactError> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.client.post(&self.endpoint).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ArtifactError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let url = match serde_json::from_str::<UploadResponse>(&body) {
            Ok(parsed) => parsed.url,
            Err(_) => Some(body.trim().to_string()),
        };
        match url {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(url),
            _ => Err(ArtifactError::MissingUrl),
        }
    }
}

/// Image "host" writing plots into a local directory and returning
/// `file://` URLs, for single-host setups without an upload endpoint
#[derive(Debug, Clone)]
pub struct DirectoryImageHost {
    dir: PathBuf,
}

impl DirectoryImageHost {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ImageHost for DirectoryImageHost {
    async fn upload(&self, data: Vec<u8>, filename: &str) -> Result<String, ArtifactError> {
        let io_error = |path: &std::path::Path| {
            let path = path.display().to_string();
            move |source: std::io::Error| ArtifactError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;
        let stored = format!("{}-{}", Uuid::now_v7(), filename);
        let path = self.dir.join(stored);
        tokio::fs::write(&path, data).await.map_err(io_error(&path))?;

        let absolute = tokio::fs::canonicalize(&path).await.map_err(io_error(&path))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_upload_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"url": "https://img.example/abc.png"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let host = HttpImageHost::new(format!("{}/upload", server.uri()));
        let url = host.upload(vec![0x89, 0x50], "image.png").await.unwrap();
        assert_eq!(url, "https://img.example/abc.png");
    }

    #[tokio::test]
    async fn test_upload_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://img.example/x.png\n"))
            .mount(&server)
            .await;

        let host = HttpImageHost::new(server.uri());
        let url = host.upload(vec![1], "image.png").await.unwrap();
        assert_eq!(url, "https://img.example/x.png");
    }

    #[tokio::test]
    async fn test_upload_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;

        let host = HttpImageHost::new(server.uri());
        let err = host.upload(vec![1], "image.png").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_upload_without_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"id": 3}"#, "application/json"))
            .mount(&server)
            .await;

        let host = HttpImageHost::new(server.uri());
        let err = host.upload(vec![1], "image.png").await.unwrap_err();
        assert!(matches!(err, ArtifactError::MissingUrl));
    }

    #[tokio::test]
    async fn test_directory_host_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryImageHost::new(dir.path().join("images"));
        let url = host.upload(vec![1, 2, 3], "image.png").await.unwrap();

        assert!(url.starts_with("file://"));
        assert!(url.ends_with("-image.png"));
        let written = std::fs::read(url.trim_start_matches("file://")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("image.png"), "image/png");
        assert_eq!(mime_for("photo.JPG"), "image/jpeg");
        assert_eq!(mime_for("blob"), "application/octet-stream");
    }
}
