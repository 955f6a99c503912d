//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 规则表加载方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLoaderKind {
    #[default]
    Http,
    ObjectStorage,
    File,
}

/// HTTP 加载器配置
///
/// `url` 中的 `{knowledgeBase}` 与 `{version}` 会在加载时被替换。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpLoaderConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// 逗号分隔的 `Name:Value` 列表，便于通过单个环境变量注入
    pub headers_str: String,
}

impl HttpLoaderConfig {
    /// 合并结构化 headers 与字符串形式的 headers
    pub fn all_headers(&self) -> HashMap<String, String> {
        merge_headers(&self.headers, &self.headers_str)
    }
}

/// 对象存储加载器配置
///
/// 连接参数由调用方注入的对象存储客户端自行管理，这里只描述规则表的位置。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub bucket: String,
    pub path_template: String,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            path_template: "{knowledgeBase}/{version}.grl".to_string(),
        }
    }
}

/// 本地文件加载器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileLoaderConfig {
    pub path_template: String,
}

impl Default for FileLoaderConfig {
    fn default() -> Self {
        Self {
            path_template: "rules/{knowledgeBase}/{version}.grl".to_string(),
        }
    }
}

/// 规则表加载配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceLoaderConfig {
    pub kind: ResourceLoaderKind,
    pub http: HttpLoaderConfig,
    pub object_storage: ObjectStorageConfig,
    pub file: FileLoaderConfig,
}

/// 远程参数解析桥配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverBridgeConfig {
    /// 为空时禁用远程参数解析
    pub url: String,
    pub headers: HashMap<String, String>,
    pub headers_str: String,
    pub timeout_seconds: u64,
}

impl Default for ResolverBridgeConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            headers_str: String::new(),
            timeout_seconds: 10,
        }
    }
}

impl ResolverBridgeConfig {
    pub fn all_headers(&self) -> HashMap<String, String> {
        merge_headers(&self.headers, &self.headers_str)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// 知识库（规则表）缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub default_name: String,
    pub default_version: String,
    /// 非数字版本（标签）的缓存有效期，同时用于 latest 版本映射
    pub version_ttl_seconds: u64,
    pub registry_timeout_seconds: u64,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            default_name: "default".to_string(),
            default_version: "latest".to_string(),
            version_ttl_seconds: 300,
            registry_timeout_seconds: 10,
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn version_ttl(&self) -> Duration {
        Duration::from_secs(self.version_ttl_seconds)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_seconds)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub tracing_enabled: bool,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
            tracing_enabled: false,
            tracing_endpoint: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub resource_loader: ResourceLoaderConfig,
    pub resolver_bridge: ResolverBridgeConfig,
    pub knowledge_base: KnowledgeBaseConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（RULER_ 前缀，层级用双下划线，如
    ///    RULER_KNOWLEDGE_BASE__VERSION_TTL_SECONDS -> knowledge_base.version_ttl_seconds）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("RULER_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    /// 从指定目录加载配置（便于测试）
    pub fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("RULER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

/// 解析 `Name:Value,Other:Value` 形式的 header 列表
///
/// 不是恰好一个冒号分隔的片段会被忽略。
pub fn parse_header_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(value), None) if !name.trim().is_empty() => {
                    Some((name.trim().to_string(), value.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

fn merge_headers(headers: &HashMap<String, String>, raw: &str) -> HashMap<String, String> {
    let mut merged = headers.clone();
    merged.extend(parse_header_list(raw));
    merged
}
