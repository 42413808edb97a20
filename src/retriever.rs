//! Retrieval of reference passages from a vector index.
//!
//! [`Retriever`] is the seam the pipeline depends on.  [`PineconeRetriever`]
//! implements it against a Pinecone serverless index: the query is embedded
//! with Pinecone's hosted inference API and the resulting vector is matched
//! against the index.

use std::time::Duration;

use reqwest::Client as ReqwestClient;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use url::Url;

use crate::config::RagConfig;
use crate::error::{Error, ProviderFailure, Result};
use crate::http::{self, Provider};
use crate::types::Fragment;

const PINECONE_API_VERSION: &str = "2025-01";

/// Source of reference passages for a query.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Returns at most `k` fragments relevant to `query`, most relevant first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Fragment>>;
}

/// Retriever backed by a Pinecone index and Pinecone-hosted embeddings.
#[derive(Clone)]
pub struct PineconeRetriever {
    api_key: String,
    client: ReqwestClient,
    control_url: Url,
    index_name: String,
    index_host: OnceCell<Url>,
    namespace: String,
    embedding_model: String,
    text_key: String,
    timeout: Duration,
}

impl std::fmt::Debug for PineconeRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PineconeRetriever")
            .field("control_url", &self.control_url.as_str())
            .field("index_name", &self.index_name)
            .field("index_host", &self.index_host.get().map(Url::as_str))
            .field("namespace", &self.namespace)
            .field("embedding_model", &self.embedding_model)
            .field("text_key", &self.text_key)
            .finish_non_exhaustive()
    }
}

impl PineconeRetriever {
    /// Creates a retriever from the startup configuration.
    pub fn new(config: &RagConfig) -> Result<Self> {
        let api_key = config.pinecone_api_key.clone().ok_or_else(|| {
            Error::configuration(
                "Pinecone API key not provided and PINECONE_API_KEY not set",
                Some("pinecone_api_key".to_string()),
            )
        })?;
        HeaderValue::from_str(&api_key).map_err(|_| {
            Error::configuration(
                "Pinecone API key contains characters not allowed in a header",
                Some("pinecone_api_key".to_string()),
            )
        })?;
        let index_name = config.index_name.clone().ok_or_else(|| {
            Error::configuration(
                "Pinecone index not provided and PINECONE_INDEX not set",
                Some("index_name".to_string()),
            )
        })?;
        let control_url = http::base_url(&config.pinecone_control_url)?;
        let index_host = OnceCell::new();
        if let Some(host) = &config.index_host {
            // A preset cell is never initialized again.
            let _ = index_host.set(host_url(host)?);
        }
        Ok(Self {
            api_key,
            client: http::build_client(config.request_timeout)?,
            control_url,
            index_name,
            index_host,
            namespace: config.namespace.clone(),
            embedding_model: config.embedding_model.clone(),
            text_key: config.text_key.clone(),
            timeout: config.request_timeout,
        })
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(&self.api_key).map_err(|_| {
                Error::configuration(
                    "Pinecone API key is not a valid header value",
                    Some("pinecone_api_key".to_string()),
                )
            })?,
        );
        headers.insert(
            "X-Pinecone-API-Version",
            HeaderValue::from_static(PINECONE_API_VERSION),
        );
        Ok(headers)
    }

    fn embed_url(&self) -> Result<Url> {
        Ok(self.control_url.join("embed")?)
    }

    fn index_url(&self) -> Result<Url> {
        Ok(self.control_url.join(&format!("indexes/{}", self.index_name))?)
    }

    /// Embeds `query` with the configured hosted embedding model.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let url = self.embed_url()?;
        let request = EmbedRequest {
            model: &self.embedding_model,
            parameters: EmbedParameters {
                input_type: "query",
                truncate: "END",
            },
            inputs: vec![EmbedInput { text: query }],
        };
        let response = self
            .client
            .post(url)
            .headers(self.default_headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| http::send_error(Provider::Retrieval, e, self.timeout))?;
        if !response.status().is_success() {
            return Err(http::error_response(Provider::Retrieval, response).await);
        }
        let body: EmbedResponse = http::json_body(Provider::Retrieval, response).await?;
        body.into_vector()
    }

    /// Returns the data-plane URL of the index, looking it up once.
    pub async fn index_host(&self) -> Result<&Url> {
        self.index_host
            .get_or_try_init(|| async {
                let url = self.index_url()?;
                let response = self
                    .client
                    .get(url)
                    .headers(self.default_headers()?)
                    .send()
                    .await
                    .map_err(|e| http::send_error(Provider::Retrieval, e, self.timeout))?;
                if !response.status().is_success() {
                    return Err(http::error_response(Provider::Retrieval, response).await);
                }
                let description: IndexDescription =
                    http::json_body(Provider::Retrieval, response).await?;
                tracing::debug!(
                    index = %self.index_name,
                    host = %description.host,
                    "resolved index host"
                );
                let host: Url = host_url(&description.host)?;
                Ok::<Url, Error>(host)
            })
            .await
    }

    async fn query(&self, vector: Vec<f32>, k: usize) -> Result<QueryResponse> {
        let url = self.index_host().await?.join("query")?;
        let request = QueryRequest {
            vector,
            top_k: k,
            namespace: &self.namespace,
            include_metadata: true,
            include_values: false,
        };
        let response = self
            .client
            .post(url)
            .headers(self.default_headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| http::send_error(Provider::Retrieval, e, self.timeout))?;
        if !response.status().is_success() {
            return Err(http::error_response(Provider::Retrieval, response).await);
        }
        http::json_body(Provider::Retrieval, response).await
    }
}

#[async_trait::async_trait]
impl Retriever for PineconeRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Fragment>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embed_query(query).await?;
        let response = self.query(vector, k).await?;
        Ok(response.into_fragments(&self.text_key, k))
    }
}

fn host_url(host: &str) -> Result<Url> {
    if host.starts_with("http://") || host.starts_with("https://") {
        http::base_url(host)
    } else {
        http::base_url(&format!("https://{host}"))
    }
}

////////////////////////////////////////////// Wire ////////////////////////////////////////////////

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    parameters: EmbedParameters,
    inputs: Vec<EmbedInput<'a>>,
}

#[derive(Serialize)]
struct EmbedParameters {
    input_type: &'static str,
    truncate: &'static str,
}

#[derive(Serialize)]
struct EmbedInput<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    #[serde(default)]
    values: Vec<f32>,
}

impl EmbedResponse {
    fn into_vector(self) -> Result<Vec<f32>> {
        self.data
            .into_iter()
            .next()
            .map(|d| d.values)
            .filter(|values| !values.is_empty())
            .ok_or_else(|| {
                Error::retrieval(
                    ProviderFailure::MalformedResponse,
                    "embedding response contained no dense vector",
                    None,
                )
            })
    }
}

#[derive(Deserialize)]
struct IndexDescription {
    host: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: Vec<f32>,
    top_k: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    namespace: &'a str,
    include_metadata: bool,
    include_values: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl QueryResponse {
    fn into_fragments(self, text_key: &str, k: usize) -> Vec<Fragment> {
        let mut fragments: Vec<Fragment> = self
            .matches
            .into_iter()
            .filter_map(|m| {
                let mut metadata = m.metadata.unwrap_or_default();
                let text = match metadata.remove(text_key) {
                    Some(Value::String(text)) => text,
                    _ => {
                        tracing::debug!(id = %m.id, text_key, "match has no text; skipping");
                        return None;
                    }
                };
                let mut fragment = Fragment::new(text).with_id(m.id).with_metadata(metadata);
                fragment.score = m.score;
                Some(fragment)
            })
            .collect();
        // The index already ranks matches; a stable sort keeps its order on ties.
        fragments.sort_by(|a, b| {
            b.score
                .unwrap_or(f32::NEG_INFINITY)
                .total_cmp(&a.score.unwrap_or(f32::NEG_INFINITY))
        });
        fragments.truncate(k);
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, to_value};

    fn config() -> RagConfig {
        RagConfig::new()
            .with_pinecone_api_key("pc-test")
            .with_index_name("news")
    }

    #[test]
    fn query_request_wire_format() {
        let request = QueryRequest {
            vector: vec![0.5, 0.25],
            top_k: 5,
            namespace: "",
            include_metadata: true,
            include_values: false,
        };
        assert_eq!(
            to_value(&request).unwrap(),
            json!({
                "vector": [0.5, 0.25],
                "topK": 5,
                "includeMetadata": true,
                "includeValues": false
            })
        );
    }

    #[test]
    fn embed_request_wire_format() {
        let request = EmbedRequest {
            model: "multilingual-e5-large",
            parameters: EmbedParameters {
                input_type: "query",
                truncate: "END",
            },
            inputs: vec![EmbedInput { text: "What is X?" }],
        };
        assert_eq!(
            to_value(&request).unwrap(),
            json!({
                "model": "multilingual-e5-large",
                "parameters": {"input_type": "query", "truncate": "END"},
                "inputs": [{"text": "What is X?"}]
            })
        );
    }

    #[test]
    fn embed_response_yields_first_vector() {
        let body: EmbedResponse = serde_json::from_value(json!({
            "model": "multilingual-e5-large",
            "vector_type": "dense",
            "data": [{"values": [0.1, 0.2, 0.3], "vector_type": "dense"}],
            "usage": {"total_tokens": 6}
        }))
        .unwrap();
        assert_eq!(body.into_vector().unwrap(), vec![0.1, 0.2, 0.3]);

        let empty: EmbedResponse = serde_json::from_value(json!({"data": []})).unwrap();
        let err = empty.into_vector().unwrap_err();
        assert!(err.is_retrieval());
        assert_eq!(err.provider_failure(), Some(ProviderFailure::MalformedResponse));
    }

    #[test]
    fn matches_become_ranked_fragments() {
        let response: QueryResponse = serde_json::from_value(json!({
            "matches": [
                {"id": "b", "score": 0.4, "metadata": {"body": "second", "source": "feed"}},
                {"id": "a", "score": 0.9, "metadata": {"body": "first"}},
                {"id": "c", "score": 0.8, "metadata": {"title": "no body"}},
                {"id": "d", "score": 0.1, "metadata": {"body": "fourth"}}
            ],
            "namespace": ""
        }))
        .unwrap();
        let fragments = response.into_fragments("body", 2);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].text, "first");
        assert_eq!(fragments[0].id.as_deref(), Some("a"));
        assert_eq!(fragments[1].text, "second");
        assert_eq!(fragments[1].metadata.get("source"), Some(&json!("feed")));
        assert!(!fragments[1].metadata.contains_key("body"));
    }

    #[test]
    fn control_url_without_trailing_slash_keeps_its_path() {
        let mut config = config();
        config.pinecone_control_url = "http://localhost:5080/pinecone".to_string();
        let retriever = PineconeRetriever::new(&config).unwrap();
        assert_eq!(
            retriever.embed_url().unwrap().as_str(),
            "http://localhost:5080/pinecone/embed"
        );
        assert_eq!(
            retriever.index_url().unwrap().as_str(),
            "http://localhost:5080/pinecone/indexes/news"
        );
        assert_eq!(retriever.control_url.as_str(), "http://localhost:5080/pinecone/");
    }

    #[test]
    fn host_urls_are_normalized() {
        assert_eq!(
            host_url("news-abc.svc.pinecone.io").unwrap().as_str(),
            "https://news-abc.svc.pinecone.io/"
        );
        assert_eq!(
            host_url("http://localhost:5080/").unwrap().as_str(),
            "http://localhost:5080/"
        );
    }

    #[tokio::test]
    async fn configured_host_skips_lookup() {
        let config = config().with_index_host("news-abc.svc.pinecone.io");
        let retriever = PineconeRetriever::new(&config).unwrap();
        let host = retriever.index_host().await.unwrap();
        assert_eq!(host.as_str(), "https://news-abc.svc.pinecone.io/");
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = PineconeRetriever::new(&RagConfig::new().with_index_name("news")).unwrap_err();
        assert!(err.is_configuration());
        let err = PineconeRetriever::new(&RagConfig::new().with_pinecone_api_key("k")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn zero_k_returns_nothing_without_calling_out() {
        let retriever = PineconeRetriever::new(&config()).unwrap();
        assert!(retriever.retrieve("anything", 0).await.unwrap().is_empty());
    }
}
