use crate::constants::user_agent;
use crate::errors;
use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::ACCEPT_ENCODING;

pub struct HttpBody {
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, anyhow::Result<Vec<u8>>>,
}

/// Transport for manifests and artifacts. Nothing it returns is trusted.
pub trait HttpFetcher: Send + Sync + 'static {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<HttpBody>>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()
            .context(errors::update::FAILED_TO_CREATE_CLIENT)?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<HttpBody>> {
        async move {
            tracing::debug!("Fetching {}", url);
            let response = self
                .client
                .get(url)
                .header(ACCEPT_ENCODING, "identity")
                .send()
                .await
                .with_context(|| errors::update::request_failed(url))?
                .error_for_status()
                .with_context(|| errors::update::request_failed(url))?;

            Ok(HttpBody {
                content_length: response.content_length(),
                chunks: response
                    .bytes_stream()
                    .map_ok(|chunk| chunk.to_vec())
                    .map_err(anyhow::Error::from)
                    .boxed(),
            })
        }
        .boxed()
    }
}

/// Reads a whole body, failing once it grows past `limit` bytes.
pub async fn read_limited(body: HttpBody, limit: u64) -> anyhow::Result<Vec<u8>> {
    if let Some(length) = body.content_length {
        anyhow::ensure!(length <= limit, errors::update::response_too_large(limit));
    }

    let mut data = Vec::new();
    let mut chunks = body.chunks;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.context(errors::update::READ_INTERRUPTED)?;
        anyhow::ensure!(
            (data.len() + chunk.len()) as u64 <= limit,
            errors::update::response_too_large(limit)
        );
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves fixed bodies by URL.
    #[derive(Default)]
    pub(crate) struct StaticFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        pub(crate) chunk_size: usize,
    }

    impl StaticFetcher {
        pub(crate) fn new() -> Self {
            Self {
                bodies: Mutex::new(HashMap::new()),
                chunk_size: 7,
            }
        }

        pub(crate) fn serve(&self, url: &str, body: Vec<u8>) {
            self.bodies.lock().unwrap().insert(url.to_string(), body);
        }
    }

    impl HttpFetcher for StaticFetcher {
        fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<HttpBody>> {
            let body = self.bodies.lock().unwrap().get(url).cloned();
            let chunk_size = self.chunk_size.max(1);
            async move {
                let body = body.ok_or_else(|| anyhow::anyhow!("404 Not Found: {}", url))?;
                let chunks: Vec<anyhow::Result<Vec<u8>>> =
                    body.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
                Ok(HttpBody {
                    content_length: Some(body.len() as u64),
                    chunks: futures_util::stream::iter(chunks).boxed(),
                })
            }
            .boxed()
        }
    }

    fn body(chunks: Vec<anyhow::Result<Vec<u8>>>, content_length: Option<u64>) -> HttpBody {
        HttpBody {
            content_length,
            chunks: futures_util::stream::iter(chunks).boxed(),
        }
    }

    #[tokio::test]
    async fn test_read_limited_collects_chunks() {
        let data = read_limited(body(vec![Ok(b"abc".to_vec()), Ok(b"def".to_vec())], None), 16)
            .await
            .unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_read_limited_rejects_oversized() {
        let declared = read_limited(body(Vec::new(), Some(100)), 16).await;
        assert!(declared.unwrap_err().to_string().contains("larger than"));

        let streamed = read_limited(body(vec![Ok(vec![0; 10]), Ok(vec![0; 10])], None), 16).await;
        assert!(streamed.is_err());
    }

    #[tokio::test]
    async fn test_read_limited_requires_clean_end() {
        let result = read_limited(
            body(vec![Ok(b"abc".to_vec()), Err(anyhow::anyhow!("reset"))], None),
            16,
        )
        .await;
        assert!(result.is_err());
    }
}
