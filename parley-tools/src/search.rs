use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, optional_u64, require_string};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_ENDPOINT: &str = "https://api.exa.ai/search";
const DEFAULT_NUM_RESULTS: u64 = 5;
const MAX_SNIPPET_CHARS: usize = 500;

/// Web search over an Exa-compatible API, exposed to models as the
/// `web_search` capability.
pub struct SearchTool {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl SearchTool {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn search(&self, query: &str, num_results: u64) -> Result<Vec<SearchResult>> {
        let request = SearchRequest {
            query: query.to_string(),
            num_results,
            contents: ContentsSpec { text: true },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "search status={status} body={body}"
            )));
        }

        let parsed: SearchResponse = serde_json::from_str(&body)?;
        Ok(parsed.results)
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information. Returns result titles, URLs and text snippets.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    },
                    "num_results": {
                        "type": "integer",
                        "description": "Number of results to return (default: 5)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, arguments: &serde_json::Value) -> Result<String> {
        let query = require_string(arguments, "query")?;
        let num_results =
            optional_u64(arguments, "num_results")?.unwrap_or(DEFAULT_NUM_RESULTS);

        let results = self.search(&query, num_results).await?;
        Ok(format_for_llm(&results))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    num_results: u64,
    contents: ContentsSpec,
}

#[derive(Debug, Serialize)]
struct ContentsSpec {
    text: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    published_date: Option<String>,
}

/// Render results as plain-text context for the follow-up model turn.
fn format_for_llm(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }

    let mut out = String::from("Web search results:\n");
    for (i, result) in results.iter().enumerate() {
        let title = result.title.as_deref().unwrap_or("(untitled)");
        out.push_str(&format!("\n{}. {title}\n   {}\n", i + 1, result.url));
        if let Some(date) = result.published_date.as_deref() {
            out.push_str(&format!("   Published: {date}\n"));
        }
        if let Some(text) = result.text.as_deref() {
            let snippet: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
            out.push_str(&format!("   {}\n", snippet.trim()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_numbers_results_and_truncates_snippets() {
        let results = vec![
            SearchResult {
                title: Some("Rust Book".to_string()),
                url: "https://doc.rust-lang.org/book".to_string(),
                text: Some("x".repeat(1000)),
                published_date: Some("2024-01-01".to_string()),
            },
            SearchResult {
                title: None,
                url: "https://example.com".to_string(),
                text: None,
                published_date: None,
            },
        ];

        let rendered = format_for_llm(&results);
        assert!(rendered.contains("1. Rust Book"));
        assert!(rendered.contains("Published: 2024-01-01"));
        assert!(rendered.contains("2. (untitled)"));
        // Long snippets are truncated.
        assert!(!rendered.contains(&"x".repeat(MAX_SNIPPET_CHARS + 1)));
    }

    #[test]
    fn empty_results_render_a_placeholder() {
        assert_eq!(format_for_llm(&[]), "No search results found.");
    }

    #[test]
    fn response_parsing_tolerates_missing_fields() {
        let body = r#"{"results": [{"url": "https://example.com"}]}"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results[0].title.is_none());
    }

    #[test]
    fn spec_declares_query_as_required() {
        let tool = SearchTool::new("test-key");
        let spec = tool.spec();
        assert_eq!(spec.name, "web_search");
        assert_eq!(spec.parameters_schema["required"][0], "query");
    }
}
