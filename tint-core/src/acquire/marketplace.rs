use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use reqwest::{
    blocking::Client,
    header::{CONTENT_LENGTH, RANGE},
    StatusCode,
};
use tracing::{debug, info};

use super::{DownloadBackend, ModelSource};

const MARKETPLACE_ENDPOINT: &str = "https://civitai.com";

/// Single-file download from the model marketplace via its direct link.
///
/// Bytes are appended to the staging file; a leftover staging file from an
/// interrupted transfer is continued with a `Range` request.
pub struct MarketplaceHttp {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl MarketplaceHttp {
    pub fn new(
        token: Option<String>,
        connect_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(transfer_timeout)
            .build()
            .context("failed to build marketplace HTTP client")?;
        Ok(Self {
            client,
            endpoint: MARKETPLACE_ENDPOINT.to_string(),
            token,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn download_url(&self, version_id: &str) -> String {
        let url = format!("{}/api/download/models/{version_id}", self.endpoint);
        match &self.token {
            Some(token) => format!("{url}?token={token}"),
            None => url,
        }
    }
}

impl DownloadBackend for MarketplaceHttp {
    fn name(&self) -> &str {
        "marketplace-http"
    }

    fn supports(&self, source: &ModelSource) -> bool {
        matches!(source, ModelSource::Marketplace { .. })
    }

    fn fetch(&self, source: &ModelSource, staging: &Path) -> Result<()> {
        let ModelSource::Marketplace { version_id, filename } = source else {
            bail!("marketplace download cannot fetch {source:?}");
        };

        let offset = fs::metadata(staging).map(|m| m.len()).unwrap_or(0);
        let mut request = self.client.get(self.download_url(version_id));
        if offset > 0 {
            info!("resuming {filename} at byte {offset}");
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        // The download link carries the token, so errors drop the URL.
        let mut response = request
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("request for marketplace model {version_id} failed"))?;

        let append = match response.status() {
            StatusCode::PARTIAL_CONTENT if offset > 0 => true,
            // The staging file already holds every byte.
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => return Ok(()),
            status if status.is_success() => false,
            status => bail!("marketplace download of {version_id} returned {status}"),
        };
        let expected = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(staging)
            .with_context(|| format!("failed to open {staging:?}"))?;
        let written = response
            .copy_to(&mut file)
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("transfer of {filename} was interrupted"))?;
        file.flush()?;
        file.sync_all()?;

        if let Some(expected) = expected {
            if written != expected {
                bail!("transfer of {filename} stopped after {written} of {expected} bytes");
            }
        }
        debug!("wrote {written} bytes of {filename}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::{self, JoinHandle},
    };

    use super::*;

    /// Serves `response` to a single connection and hands back the request head.
    fn serve_once(response: Vec<u8>) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            stream.write_all(&response).unwrap();
            stream.flush().unwrap();
            String::from_utf8_lossy(&head).to_lowercase()
        });
        (endpoint, server)
    }

    fn http_response(status: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {status}\r\ncontent-length: {content_length}\r\nconnection: close\r\n\r\n"
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    fn source() -> ModelSource {
        ModelSource::Marketplace {
            version_id: "1".into(),
            filename: "model.safetensors".into(),
        }
    }

    fn backend(token: Option<&str>) -> MarketplaceHttp {
        MarketplaceHttp::new(
            token.map(str::to_string),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn download_link_carries_version_and_token() {
        assert_eq!(
            backend(Some("abc")).download_url("4384"),
            "https://civitai.com/api/download/models/4384?token=abc"
        );
        assert_eq!(
            backend(None)
                .with_endpoint("http://localhost:8080/")
                .download_url("7"),
            "http://localhost:8080/api/download/models/7"
        );
    }

    #[test]
    fn fresh_download_writes_the_whole_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        let (endpoint, server) = serve_once(http_response("200 OK", 11, b"hello world"));

        backend(None).with_endpoint(endpoint).fetch(&source(), &staging)?;

        assert!(!server.join().unwrap().contains("range:"));
        assert_eq!(fs::read(&staging)?, b"hello world");
        Ok(())
    }

    #[test]
    fn partial_file_is_resumed_with_a_range_request() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        fs::write(&staging, b"hello ")?;
        let (endpoint, server) = serve_once(http_response("206 Partial Content", 5, b"world"));

        backend(None).with_endpoint(endpoint).fetch(&source(), &staging)?;

        assert!(server.join().unwrap().contains("range: bytes=6-"));
        assert_eq!(fs::read(&staging)?, b"hello world");
        Ok(())
    }

    #[test]
    fn unsatisfiable_range_means_already_complete() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        fs::write(&staging, b"hello world")?;
        let (endpoint, server) = serve_once(http_response("416 Range Not Satisfiable", 0, b""));

        backend(None).with_endpoint(endpoint).fetch(&source(), &staging)?;

        server.join().unwrap();
        assert_eq!(fs::read(&staging)?, b"hello world");
        Ok(())
    }

    #[test]
    fn full_response_to_a_range_request_replaces_the_partial_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        fs::write(&staging, b"stale")?;
        let (endpoint, server) = serve_once(http_response("200 OK", 11, b"hello world"));

        backend(None).with_endpoint(endpoint).fetch(&source(), &staging)?;

        server.join().unwrap();
        assert_eq!(fs::read(&staging)?, b"hello world");
        Ok(())
    }

    #[test]
    fn short_transfer_fails_and_keeps_the_partial_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        let (endpoint, server) = serve_once(http_response("200 OK", 20, b"hello"));

        let result = backend(None).with_endpoint(endpoint).fetch(&source(), &staging);

        server.join().unwrap();
        assert!(result.is_err());
        assert!(staging.is_file());
        Ok(())
    }

    #[test]
    fn token_never_appears_in_errors() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        let backend = backend(Some("SECRET_TOKEN")).with_endpoint("http://127.0.0.1:9");

        let err = backend.fetch(&source(), &staging).unwrap_err();

        assert!(!format!("{err:#}").contains("SECRET_TOKEN"));
        assert!(!format!("{err:?}").contains("SECRET_TOKEN"));
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_fails() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let staging = temp.path().join("model.safetensors.part");
        let backend = backend(None).with_endpoint("http://127.0.0.1:9");
        let source = ModelSource::Marketplace {
            version_id: "1".into(),
            filename: "model.safetensors".into(),
        };
        assert!(backend.fetch(&source, &staging).is_err());
        Ok(())
    }
}
