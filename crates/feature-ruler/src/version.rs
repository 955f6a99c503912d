//! latest 版本解析
//!
//! 将符号版本 `latest` 转换为具体的数字版本：查询包仓库中某知识库的全部版本，
//! 只保留构建成功的整数版本并取最大值。结果按 TTL 缓存，同一名称的并发查询合并为一次。

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use reqwest::header::HeaderMap;
use ruler_shared::observability::metrics;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RulerError};
use crate::resolver::header_map;

/// 构建成功的状态值
pub const BUILD_SUCCESS: &str = "success";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionResolutionError {
    #[error("版本仓库不可用: {0}")]
    Registry(String),

    #[error("知识库 {0} 没有可用的版本")]
    NoEligibleVersion(String),
}

/// 仓库中的一个版本快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: String,
    pub build_status: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl VersionRecord {
    pub fn new(version: impl Into<String>, build_status: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build_status: build_status.into(),
            created_at: None,
        }
    }

    /// 整数版本号，非整数版本返回 None
    pub fn numeric_version(&self) -> Option<u64> {
        self.version.parse().ok()
    }

    pub fn is_eligible(&self) -> bool {
        self.build_status == BUILD_SUCCESS && self.numeric_version().is_some()
    }
}

/// 版本仓库
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionRegistry: Send + Sync {
    async fn list_versions(
        &self,
        name: &str,
    ) -> std::result::Result<Vec<VersionRecord>, VersionResolutionError>;
}

/// 从记录中选出最大的合格版本
///
/// 数值相同的版本（如 `7` 与 `07`）之间任选其一。
pub fn select_latest(records: &[VersionRecord]) -> Option<&VersionRecord> {
    records
        .iter()
        .filter(|r| r.build_status == BUILD_SUCCESS)
        .filter_map(|r| r.numeric_version().map(|n| (n, r)))
        .max_by_key(|(n, _)| *n)
        .map(|(_, r)| r)
}

#[derive(Debug, Clone)]
struct CachedVersion {
    version: String,
    expires_at: Instant,
}

pub struct VersionResolver {
    registry: Arc<dyn VersionRegistry>,
    ttl: Duration,
    cache: DashMap<String, CachedVersion>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl VersionResolver {
    pub fn new(registry: Arc<dyn VersionRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            cache: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    fn cached(&self, name: &str) -> Option<String> {
        let entry = self.cache.get(name)?;
        if entry.expires_at > Instant::now() {
            Some(entry.version.clone())
        } else {
            None
        }
    }

    /// 解析知识库的最新版本
    #[instrument(skip(self))]
    pub async fn resolve_latest(
        &self,
        name: &str,
    ) -> std::result::Result<String, VersionResolutionError> {
        if let Some(version) = self.cached(name) {
            metrics::record_version_lookup("cached");
            return Ok(version);
        }

        let gate = self
            .inflight
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        let resolved = {
            let _guard = gate.lock().await;
            self.query_registry(name).await
        };

        // 没有其他等待者时移除该名称的门闩
        drop(gate);
        self.inflight.remove_if(name, |_, gate| Arc::strong_count(gate) == 1);
        resolved
    }

    async fn query_registry(&self, name: &str) -> std::result::Result<String, VersionResolutionError> {
        // 等锁期间其他任务可能已经完成查询
        if let Some(version) = self.cached(name) {
            metrics::record_version_lookup("cached");
            return Ok(version);
        }

        let records = self.registry.list_versions(name).await.inspect_err(|e| {
            metrics::record_version_lookup("registry_error");
            warn!(error = %e, "查询版本仓库失败");
        })?;

        let Some(latest) = select_latest(&records) else {
            metrics::record_version_lookup("no_eligible_version");
            return Err(VersionResolutionError::NoEligibleVersion(name.to_string()));
        };

        let version = latest.version.clone();
        self.cache.insert(
            name.to_string(),
            CachedVersion {
                version: version.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        metrics::record_version_lookup("resolved");
        info!(version = %version, candidates = records.len(), "latest 版本已解析");
        Ok(version)
    }
}

#[derive(Debug, Deserialize)]
struct PackagePipeline {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct PackageVersion {
    #[serde(default)]
    name: Option<String>,
    version: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pipeline: Option<PackagePipeline>,
}

impl From<PackageVersion> for VersionRecord {
    fn from(package: PackageVersion) -> Self {
        Self {
            version: package.version,
            build_status: package.pipeline.map(|p| p.status).unwrap_or_default(),
            created_at: package.created_at,
        }
    }
}

/// 包仓库 HTTP 客户端
///
/// 列出 `{base_url}?package_type=generic&package_name={name}` 下的通用包版本。
#[derive(Debug, Clone)]
pub struct PackageRegistry {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl PackageRegistry {
    pub fn new(
        base_url: impl Into<String>,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RulerError::Config(format!("无法创建版本仓库客户端: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            headers: header_map(headers)?,
        })
    }

    /// 根据规则表加载地址推导仓库地址
    pub fn from_loader_url(
        loader_url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = registry_base_url(loader_url)?;
        Self::new(base_url, headers, timeout)
    }
}

static REGISTRY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://.*?packages").expect("registry prefix regex is valid"));

/// 截取加载地址中直到 `packages` 的前缀
pub fn registry_base_url(loader_url: &str) -> Result<String> {
    REGISTRY_PREFIX
        .find(loader_url)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| RulerError::Config(format!("加载地址 {loader_url} 无法推导版本仓库地址")))
}

#[async_trait]
impl VersionRegistry for PackageRegistry {
    #[instrument(skip(self))]
    async fn list_versions(
        &self,
        name: &str,
    ) -> std::result::Result<Vec<VersionRecord>, VersionResolutionError> {
        debug!(url = %self.base_url, "请求包仓库版本列表");

        let response = self
            .client
            .get(&self.base_url)
            .headers(self.headers.clone())
            .query(&[("package_type", "generic"), ("package_name", name)])
            .send()
            .await
            .map_err(|e| VersionResolutionError::Registry(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VersionResolutionError::Registry(format!("HTTP {status}")));
        }

        let packages = response
            .json::<Vec<PackageVersion>>()
            .await
            .map_err(|e| VersionResolutionError::Registry(format!("响应解码失败: {e}")))?;

        Ok(packages
            .into_iter()
            .filter(|p| p.name.as_deref().is_none_or(|n| n == name))
            .map(VersionRecord::from)
            .collect())
    }
}
