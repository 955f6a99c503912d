//! 规则表加载器
//!
//! 按知识库名称与版本获取规则表原文。支持三种来源：
//! HTTP（模板化 URL）、对象存储（模板化路径）、本地文件（模板化路径）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use ruler_shared::config::{ResourceLoaderConfig, ResourceLoaderKind};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::{Result, RulerError};
use crate::resolver::header_map;

const KNOWLEDGE_BASE_PLACEHOLDER: &str = "{knowledgeBase}";
const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("规则表不存在: {0}")]
    NotFound(String),

    #[error("规则表获取失败: {0}")]
    Transport(String),
}

/// 规则表加载能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleSheetLoader: Send + Sync {
    async fn load(&self, name: &str, version: &str) -> std::result::Result<String, LoadError>;
}

/// 名称或版本能否安全地替换进路径或 URL
///
/// 不能为空，不能含路径分隔符、`..`、URL 保留字符或控制字符。
fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains("..")
        && !segment
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_control())
}

/// 替换模板中的 `{knowledgeBase}` 与 `{version}`
///
/// 名称或版本不安全时返回 [`LoadError::NotFound`]。
pub fn render_template(
    template: &str,
    name: &str,
    version: &str,
) -> std::result::Result<String, LoadError> {
    if !is_safe_segment(name) || !is_safe_segment(version) {
        warn!(
            name = %name.escape_debug(),
            version = %version.escape_debug(),
            "拒绝不安全的知识库名称或版本"
        );
        return Err(LoadError::NotFound(format!(
            "{}@{}",
            name.escape_debug(),
            version.escape_debug()
        )));
    }
    Ok(template
        .replace(KNOWLEDGE_BASE_PLACEHOLDER, name)
        .replace(VERSION_PLACEHOLDER, version))
}

#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: reqwest::Client,
    url_template: String,
    headers: HeaderMap,
}

impl HttpLoader {
    pub fn new(
        url_template: impl Into<String>,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RulerError::Config(format!("无法创建规则表 HTTP 客户端: {e}")))?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            headers: header_map(headers)?,
        })
    }
}

#[async_trait]
impl RuleSheetLoader for HttpLoader {
    #[instrument(skip(self))]
    async fn load(&self, name: &str, version: &str) -> std::result::Result<String, LoadError> {
        let url = render_template(&self.url_template, name, version)?;
        debug!(url = %url, "下载规则表");

        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(LoadError::NotFound(url)),
            status if !status.is_success() => {
                warn!(url = %url, status = %status, "规则表下载失败");
                Err(LoadError::Transport(format!("HTTP {status}")))
            }
            _ => response
                .text()
                .await
                .map_err(|e| LoadError::Transport(e.to_string())),
        }
    }
}

/// 对象存储能力，只关心按桶与键读取对象
///
/// 对象不存在时返回 `Ok(None)`。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

pub struct ObjectStorageLoader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    path_template: String,
}

impl ObjectStorageLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            path_template: path_template.into(),
        }
    }
}

#[async_trait]
impl RuleSheetLoader for ObjectStorageLoader {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn load(&self, name: &str, version: &str) -> std::result::Result<String, LoadError> {
        let key = render_template(&self.path_template, name, version)?;

        let bytes = self
            .store
            .get_object(&self.bucket, &key)
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?
            .ok_or_else(|| LoadError::NotFound(format!("{}/{}", self.bucket, key)))?;

        String::from_utf8(bytes).map_err(|e| LoadError::Transport(format!("规则表不是 UTF-8 文本: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct FileLoader {
    path_template: String,
}

impl FileLoader {
    pub fn new(path_template: impl Into<String>) -> Self {
        Self {
            path_template: path_template.into(),
        }
    }
}

#[async_trait]
impl RuleSheetLoader for FileLoader {
    async fn load(&self, name: &str, version: &str) -> std::result::Result<String, LoadError> {
        let path = PathBuf::from(render_template(&self.path_template, name, version)?);
        match tokio::fs::read_to_string(&path).await {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(LoadError::Transport(format!("{}: {e}", path.display()))),
        }
    }
}

/// 根据配置构建加载器
///
/// 对象存储方式需要调用方注入 [`ObjectStore`] 实现。
pub fn loader_from_config(
    config: &ResourceLoaderConfig,
    object_store: Option<Arc<dyn ObjectStore>>,
    timeout: Duration,
) -> Result<Arc<dyn RuleSheetLoader>> {
    match config.kind {
        ResourceLoaderKind::Http => {
            if config.http.url.trim().is_empty() {
                return Err(RulerError::Config("resource_loader.http.url 未配置".to_string()));
            }
            let loader = HttpLoader::new(config.http.url.clone(), &config.http.all_headers(), timeout)?;
            Ok(Arc::new(loader))
        }
        ResourceLoaderKind::ObjectStorage => {
            let store = object_store.ok_or_else(|| {
                RulerError::Config("对象存储加载方式需要提供 ObjectStore 实现".to_string())
            })?;
            let storage = &config.object_storage;
            Ok(Arc::new(ObjectStorageLoader::new(
                store,
                storage.bucket.clone(),
                storage.path_template.clone(),
            )))
        }
        ResourceLoaderKind::File => Ok(Arc::new(FileLoader::new(config.file.path_template.clone()))),
    }
}
