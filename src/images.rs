use edgekv_config::Config;
use http::{header, HeaderValue};
use log::debug;
use serde::{Deserialize, Serialize};

const DEFAULT_API_URL: &str = "https://api.unsplash.com";

#[derive(Deserialize, Debug)]
pub struct SearchRequest {
    pub query: String,
}

#[derive(Deserialize, Debug)]
pub struct UnsplashResponse<T> {
    pub results: T,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Deserialize, Debug)]
pub struct SearchResult {
    id: String,
    urls: ImageUrls,
    links: ImageLinks,
}

#[derive(Deserialize, Debug)]
struct ImageUrls {
    small: String,
}

#[derive(Deserialize, Debug)]
struct ImageLinks {
    html: String,
}

/// Shape of one image as returned to our clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub image: String,
    pub link: String,
}

impl From<SearchResult> for Image {
    fn from(r: SearchResult) -> Self {
        Image { id: r.id, image: r.urls.small, link: r.links.html }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("no CLIENT_ID configured for the image search API")]
    MissingCredential,
    #[error("image search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("image search API responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// Client for the photo search API.
#[derive(Clone)]
pub struct ImageSearch {
    http: reqwest::Client,
    base_url: String,
    client_id: Option<String>,
}

impl ImageSearch {
    pub fn new(base_url: &str, client_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    pub fn from_config(config: &dyn Config) -> Self {
        let base_url = config.get_opt("UNSPLASH_API_URL").unwrap_or_else(||DEFAULT_API_URL.to_string());
        Self::new(&base_url, config.get_opt("CLIENT_ID"))
    }

    /// Searches photos for `query`. Failures are reported as they are, no retry.
    pub async fn search(&self, query: &str) -> Result<Vec<Image>, UpstreamError> {
        let client_id = self.client_id.as_deref().ok_or(UpstreamError::MissingCredential)?;

        let resp = self.http
        .get(format!("{}/search/photos", self.base_url))
        .query(&[("query", query)])
        .header(header::AUTHORIZATION, format!("Client-ID {client_id}"))
        .send()
        .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        let data = resp.json::<UnsplashResponse<Vec<SearchResult>>>().await?;
        debug!("search for '{query}' returned {} results ({} total, {} pages)", data.results.len(), data.total, data.total_pages);
        Ok(data.results.into_iter().map(Image::from).collect())
    }
}

/// Origins the image endpoint answers to. Empty means every origin.
#[derive(Clone, Debug, Default)]
pub struct AllowedOrigins(Vec<String>);

impl AllowedOrigins {
    /// Parses a comma separated list, ignoring blank entries.
    pub fn parse(list: &str) -> Self {
        Self(list
            .split(',')
            .map(str::trim)
            .filter(|o|!o.is_empty())
            .map(String::from)
            .collect())
    }

    /// Origin to put into `Access-Control-Allow-Origin` for a request.
    ///
    /// A request origin that is not allowed gets the first allowed origin,
    /// which makes browsers refuse to continue.
    pub fn check(&self, origin: Option<&str>) -> String {
        let (origin, first) = match (origin, self.0.first()) {
            (Some(origin), Some(first)) => (origin, first),
            _ => return "*".to_string(),
        };
        self.0
        .iter()
        .find(|allowed|allowed.contains(origin))
        .unwrap_or(first)
        .clone()
    }
}

/// CORS headers attached to every image search response.
pub fn cors_headers(origin: &str) -> [(header::HeaderName, HeaderValue); 3] {
    let origin = HeaderValue::from_str(origin).unwrap_or_else(|_|HeaderValue::from_static("*"));
    [
        (header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*")),
        (header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST")),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin),
    ]
}

#[test]
fn test_allowed_origins_check() {
    let all = AllowedOrigins::parse("");
    assert_eq!(all.check(Some("https://evil.example")), "*");
    assert_eq!(all.check(None), "*");

    let some = AllowedOrigins::parse("https://viewer.pages.dev, http://localhost:3000,");
    assert_eq!(some.check(None), "*");
    assert_eq!(some.check(Some("http://localhost:3000")), "http://localhost:3000");
    assert_eq!(some.check(Some("https://evil.example")), "https://viewer.pages.dev");
}

#[test]
fn test_search_result_reshaping() {
    let raw = r#"{
        "total": 1,
        "total_pages": 1,
        "results": [
            {"id": "abc", "urls": {"small": "https://img/small.jpg", "raw": "x"}, "links": {"html": "https://site/abc"}, "likes": 3}
        ]
    }"#;
    let data: UnsplashResponse<Vec<SearchResult>> = serde_json::from_str(raw).unwrap();
    let images: Vec<Image> = data.results.into_iter().map(Image::from).collect();

    assert_eq!(images, vec![Image {
        id: "abc".to_string(),
        image: "https://img/small.jpg".to_string(),
        link: "https://site/abc".to_string(),
    }]);
}
