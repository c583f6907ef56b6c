//! DuckDuckGo 搜索工具
//!
//! 请求 DuckDuckGo 的 HTML 端点，从结果页解析标题、摘要与链接，最多返回 num_results 条，
//! 每条一行 `snippet: ..., title: ..., link: ...`。摘要与标题中的标签和实体经 html2text 还原为纯文本。

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{parameters_for, Tool};

const DEFAULT_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// 搜索参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 搜索关键词
    pub query: String,
}

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

impl SearchHit {
    fn render(&self) -> String {
        format!("snippet: {}, title: {}, link: {}", self.snippet, self.title, self.link)
    }
}

/// DuckDuckGo 搜索
pub struct DuckDuckGoSearchTool {
    client: Client,
    endpoint: String,
    num_results: usize,
    title_re: Regex,
    snippet_re: Regex,
    tag_re: Regex,
}

impl DuckDuckGoSearchTool {
    pub fn new(num_results: usize) -> Result<Self, regex::Error> {
        Self::with_endpoint(DEFAULT_ENDPOINT, num_results)
    }

    pub fn with_endpoint(endpoint: &str, num_results: usize) -> Result<Self, regex::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            num_results,
            title_re: Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)?,
            snippet_re: Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#)?,
            tag_re: Regex::new(r"<[^>]+>")?,
        })
    }

    /// 标签去掉后交给 html2text 解码实体，再压缩空白
    fn to_text(&self, fragment: &str) -> String {
        let stripped = self.tag_re.replace_all(fragment, "");
        let decoded = html2text::from_read(stripped.as_bytes(), 10_000)
            .unwrap_or_else(|_| stripped.to_string());
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// 解析结果页
    pub fn parse_results(&self, html: &str) -> Vec<SearchHit> {
        let snippets: Vec<String> = self
            .snippet_re
            .captures_iter(html)
            .map(|c| self.to_text(&c[1]))
            .collect();

        self.title_re
            .captures_iter(html)
            .enumerate()
            .map(|(i, c)| SearchHit {
                link: resolve_link(&c[1]),
                title: self.to_text(&c[2]),
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
            .take(self.num_results)
            .collect()
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .form(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        Ok(self.parse_results(&body))
    }
}

/// DuckDuckGo 的跳转链接 `//duckduckgo.com/l/?uddg=<url>` 还原为目标地址
fn resolve_link(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };
    reqwest::Url::parse(&absolute)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

#[async_trait]
impl Tool for DuckDuckGoSearchTool {
    fn name(&self) -> &str {
        "duckduckgo_results_json"
    }

    fn description(&self) -> &str {
        "A wrapper around Duck Duck Go Search. Useful for when you need to answer questions about current events. Input should be a search query."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<SearchArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<String, String> {
        let args: SearchArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        let hits = self.search(&args.query).await?;
        tracing::debug!(query = %args.query, hits = hits.len(), "search_completed");
        if hits.is_empty() {
            return Ok("No good DuckDuckGo Search Result was found".to_string());
        }
        Ok(hits.iter().map(SearchHit::render).collect::<Vec<_>>().join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fweather.example%2Fparis&amp;rut=abc">Paris <b>Weather</b></a>
  </h2>
  <a class="result__snippet" href="//duckduckgo.com/l/?uddg=x">Currently 15&deg;C &amp; cloudy in <b>Paris</b>.</a>
</div>
<div class="result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="https://example.org/forecast">Forecast</a>
  </h2>
  <a class="result__snippet" href="https://example.org/forecast">Rain tomorrow.</a>
</div>
"#;

    #[test]
    fn test_parse_results() {
        let tool = DuckDuckGoSearchTool::new(10).unwrap();
        let hits = tool.parse_results(PAGE);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Paris Weather");
        assert_eq!(hits[0].link, "https://weather.example/paris");
        assert!(hits[0].snippet.contains("cloudy in Paris"));
        assert_eq!(hits[1].link, "https://example.org/forecast");
    }

    #[test]
    fn test_num_results_limit() {
        let tool = DuckDuckGoSearchTool::new(1).unwrap();
        assert_eq!(tool.parse_results(PAGE).len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let tool = DuckDuckGoSearchTool::new(10).unwrap();
        let err = tool.invoke(serde_json::json!({"q": 1})).await.unwrap_err();
        assert!(err.starts_with("Invalid arguments"));
    }

    #[test]
    fn test_schema_requires_query() {
        let schema = DuckDuckGoSearchTool::new(10).unwrap().parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["query"]));
    }
}
