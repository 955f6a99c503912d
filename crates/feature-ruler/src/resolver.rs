//! 远程参数解析
//!
//! 上下文缺少某个远程绑定参数时，通过解析桥按解析器名称计算其值。
//! 一次调用携带完整的当前上下文以及待加载的参数列表。

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use ruler_shared::config::ResolverBridgeConfig;
use ruler_shared::observability::tracing::inject_current_context;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{Result, RulerError};
use crate::value::Value;

/// 解析请求体
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveRequest {
    pub context: serde_json::Value,
    pub load: Vec<String>,
}

/// 解析响应体
///
/// `errors` 或 `error` 非空表示解析器明确报告了失败，
/// 与传输层失败（[`RulerError::ResolutionFailed`]）区分开。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResolveResponse {
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: BTreeMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResolveResponse {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// 汇总解析器报告的错误信息
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages: Vec<String> = self
            .errors
            .iter()
            .map(|(param, message)| format!("{param}: {}", message.to_text()))
            .collect();
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            messages.push(error.to_string());
        }
        messages
    }
}

/// 远程参数解析能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParamResolver: Send + Sync {
    async fn resolve(&self, resolver: &str, request: ResolveRequest) -> Result<ResolveResponse>;
}

/// 基于 HTTP 的解析桥客户端
///
/// `POST {base_url}/resolve/{resolver}`，超时独立于入站请求的截止时间。
#[derive(Debug, Clone)]
pub struct BridgeResolver {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl BridgeResolver {
    pub fn new(
        base_url: impl Into<String>,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RulerError::Config(format!("无法创建解析桥客户端: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: header_map(headers)?,
        })
    }

    pub fn from_config(config: &ResolverBridgeConfig) -> Result<Self> {
        Self::new(config.url.clone(), &config.all_headers(), config.timeout())
    }
}

#[async_trait]
impl ParamResolver for BridgeResolver {
    #[instrument(skip(self, request), fields(resolver = %resolver, load = ?request.load))]
    async fn resolve(&self, resolver: &str, request: ResolveRequest) -> Result<ResolveResponse> {
        let url = format!("{}/resolve/{}", self.base_url, resolver);

        let mut trace_headers = HashMap::new();
        inject_current_context(&mut trace_headers);

        let mut builder = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&request);
        for (name, value) in trace_headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "解析桥请求失败");
            RulerError::resolution_failed(resolver, e)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "解析桥返回非成功状态");
            return Err(RulerError::resolution_failed(resolver, format!("HTTP {status}")));
        }

        let body = response
            .json::<ResolveResponse>()
            .await
            .map_err(|e| RulerError::resolution_failed(resolver, format!("响应解码失败: {e}")))?;

        debug!(resolved = body.context.len(), has_errors = body.has_errors(), "解析桥响应");
        Ok(body)
    }
}

/// 将配置中的 header 转换为 HeaderMap
pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RulerError::Config(format!("无效的 header 名称 {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RulerError::Config(format!("无效的 header 值: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn request() -> ResolveRequest {
        ResolveRequest {
            context: json!({"mystring": "teste"}),
            load: vec!["param_name".to_string()],
        }
    }

    #[tokio::test]
    async fn test_resolve_posts_context_and_load_list() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/resolve/resolver_name")
            .match_header("private-token", "secret")
            .match_body(Matcher::Json(json!({
                "context": {"mystring": "teste"},
                "load": ["param_name"]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"context": {"param_name": 42}}"#)
            .create_async()
            .await;

        let headers = HashMap::from([("Private-Token".to_string(), "secret".to_string())]);
        let resolver = BridgeResolver::new(server.url(), &headers, Duration::from_secs(5)).unwrap();

        let response = resolver.resolve("resolver_name", request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.context.get("param_name"), Some(&Value::Integer(42)));
        assert!(!response.has_errors());
    }

    #[tokio::test]
    async fn test_reported_errors_are_not_transport_failures() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/resolve/resolver_name")
            .with_status(200)
            .with_body(r#"{"errors": {"myparam": "myerror"}}"#)
            .create_async()
            .await;

        let resolver =
            BridgeResolver::new(server.url(), &HashMap::new(), Duration::from_secs(5)).unwrap();
        let response = resolver.resolve("resolver_name", request()).await.unwrap();

        assert!(response.has_errors());
        assert_eq!(response.error_messages(), vec!["myparam: myerror".to_string()]);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_resolution_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/resolve/resolver_name")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let resolver =
            BridgeResolver::new(server.url(), &HashMap::new(), Duration::from_secs(5)).unwrap();
        let err = resolver.resolve("resolver_name", request()).await.unwrap_err();

        assert!(matches!(err, RulerError::ResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_resolution_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/resolve/resolver_name")
            .with_status(503)
            .create_async()
            .await;

        let resolver =
            BridgeResolver::new(server.url(), &HashMap::new(), Duration::from_secs(5)).unwrap();
        let err = resolver.resolve("resolver_name", request()).await.unwrap_err();

        assert_eq!(err.code(), "RESOLUTION_FAILED");
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = BridgeResolver::new("http://localhost", &headers, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RulerError::Config(_)));
    }

    #[test]
    fn test_single_error_field() {
        let response: ResolveResponse =
            serde_json::from_str(r#"{"error": "resolver offline"}"#).unwrap();
        assert!(response.has_errors());
        assert_eq!(response.error_messages(), vec!["resolver offline".to_string()]);
    }
}
