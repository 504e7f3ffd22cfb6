use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::models::{PoiQuery, PoiResponse};
use super::{ApiError, PoiApi};

/// HTTP client for the AMap v3 place-in-polygon endpoint
pub struct AMapClient {
    client: Client,
    base_url: Url,
}

impl AMapClient {
    /// Create a client for the given endpoint
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = Url::parse(base_url)?;

        Ok(Self { client, base_url })
    }

    fn request_url(&self, query: &PoiQuery) -> Result<Url, ApiError> {
        let page = query.page.to_string();
        let offset = query.page_size.to_string();

        let url = Url::parse_with_params(
            self.base_url.as_str(),
            &[
                ("key", query.key.as_str()),
                ("polygon", query.polygon.as_str()),
                ("keywords", query.keywords.as_str()),
                ("types", query.types.as_str()),
                ("extensions", query.extension.as_str()),
                ("page", page.as_str()),
                ("offset", offset.as_str()),
                ("output", "json"),
            ],
        )?;

        Ok(url)
    }
}

#[async_trait]
impl PoiApi for AMapClient {
    async fn query(&self, query: &PoiQuery) -> Result<PoiResponse, ApiError> {
        let url = self.request_url(query)?;
        debug!(polygon = %query.polygon, page = query.page, "Querying POI service");

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::Extension;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> PoiQuery {
        PoiQuery {
            key: "abc123".to_string(),
            polygon: "114.1,30.6|114.3,30.4".to_string(),
            keywords: "cafe|tea".to_string(),
            types: "".to_string(),
            extension: Extension::Base,
            page: 2,
            page_size: 20,
        }
    }

    #[tokio::test]
    async fn test_query_sends_parameters_and_parses_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v3/place/polygon"))
            .and(query_param("key", "abc123"))
            .and(query_param("polygon", "114.1,30.6|114.3,30.4"))
            .and(query_param("keywords", "cafe|tea"))
            .and(query_param("page", "2"))
            .and(query_param("offset", "20"))
            .and(query_param("extensions", "base"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"status":"1","count":"21","info":"OK","infocode":"10000","pois":[{"id":"B1","name":"Tea House","location":"114.2,30.5"}]}"#,
            ))
            .mount(&mock_server)
            .await;

        let client = AMapClient::new(
            &format!("{}/v3/place/polygon", mock_server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = client.query(&query()).await.unwrap();
        assert_eq!(response.total(), Some(21));
        assert_eq!(response.pois.unwrap()[0].name.as_deref(), Some("Tea House"));
    }

    #[tokio::test]
    async fn test_garbled_body_is_a_decode_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&mock_server)
            .await;

        let client = AMapClient::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        let result = client.query(&query()).await;

        assert!(matches!(result, Err(ApiError::Decode(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let client = AMapClient::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        assert!(matches!(client.query(&query()).await, Err(ApiError::Http(_))));
    }
}
