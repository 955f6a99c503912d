//! 评估服务
//!
//! 组装知识库缓存、远程解析与规则引擎，完成一次评估：
//! 获取知识库租约 → 执行规则 → 释放租约 → 检查必填参数 → 合并结果。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ruler_shared::config::AppConfig;
use ruler_shared::observability::metrics;
use ruler_shared::observability::tracing::current_trace_id;
use serde::{Serialize, Serializer};
use tracing::{info, instrument, warn};

use crate::context::EvaluationContext;
use crate::engine::{Bindings, RuleEngine, execute_guarded};
use crate::error::{Result, RulerError};
use crate::knowledge_base::{KnowledgeBaseCache, KnowledgeBaseKey};
use crate::loader::{ObjectStore, loader_from_config};
use crate::processor::Processor;
use crate::resolver::{BridgeResolver, ParamResolver};
use crate::result::FeatureSet;
use crate::typed_map::TypedMap;
use crate::version::{PackageRegistry, VersionResolver};

pub const DEFAULT_KNOWLEDGE_BASE: &str = "default";
pub const DEFAULT_VERSION: &str = "latest";

/// 一次评估的输出
///
/// 序列化为特征映射本身，非空时并入 `errors` 与 `requiredParamErrors` 两个顶层键。
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub knowledge_base: KnowledgeBaseKey,
    pub features: FeatureSet,
    pub errors: BTreeMap<String, Vec<String>>,
    pub required_param_errors: BTreeMap<String, String>,
}

impl EvaluationOutcome {
    /// 存在参数错误时为部分成功
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() || !self.required_param_errors.is_empty()
    }

    /// 缺少必填参数时返回 400，其余情况 200
    pub fn status_code(&self) -> u16 {
        if self.required_param_errors.is_empty() {
            200
        } else {
            400
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = match self.features.to_json() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if !self.errors.is_empty() {
            body.insert("errors".to_string(), serde_json::json!(self.errors));
        }
        if !self.required_param_errors.is_empty() {
            body.insert(
                "requiredParamErrors".to_string(),
                serde_json::json!(self.required_param_errors),
            );
        }
        serde_json::Value::Object(body)
    }
}

impl Serialize for EvaluationOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

pub struct RulerService<E: RuleEngine> {
    cache: Arc<KnowledgeBaseCache<E>>,
    resolver: Option<Arc<dyn ParamResolver>>,
    processor: Processor,
    default_name: String,
    default_version: String,
}

impl<E: RuleEngine> RulerService<E> {
    pub fn new(cache: Arc<KnowledgeBaseCache<E>>) -> Self {
        Self {
            cache,
            resolver: None,
            processor: Processor::new(),
            default_name: DEFAULT_KNOWLEDGE_BASE.to_string(),
            default_version: DEFAULT_VERSION.to_string(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_defaults(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.default_name = name.into();
        self.default_version = version.into();
        self
    }

    /// 按应用配置组装服务
    ///
    /// HTTP 加载方式下从加载地址推导包仓库用于解析 `latest`；
    /// 解析桥地址为空时不启用远程参数解析。
    pub fn from_config(
        engine: Arc<E>,
        config: &AppConfig,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        let kb = &config.knowledge_base;
        let loader = loader_from_config(&config.resource_loader, object_store, kb.registry_timeout())?;

        let mut cache = KnowledgeBaseCache::new(engine, loader, kb.version_ttl());
        let http = &config.resource_loader.http;
        if !http.url.is_empty() {
            match PackageRegistry::from_loader_url(&http.url, &http.all_headers(), kb.registry_timeout()) {
                Ok(registry) => {
                    let versions = VersionResolver::new(Arc::new(registry), kb.version_ttl());
                    cache = cache.with_version_resolver(Arc::new(versions));
                }
                Err(e) => warn!(error = %e, "未启用 latest 版本解析"),
            }
        }

        let mut service = Self::new(Arc::new(cache))
            .with_defaults(kb.default_name.clone(), kb.default_version.clone());
        if config.resolver_bridge.is_enabled() {
            let bridge = BridgeResolver::from_config(&config.resolver_bridge)?;
            service = service.with_resolver(Arc::new(bridge));
        }

        info!(
            service = %config.service_name,
            environment = %config.environment,
            loader = ?config.resource_loader.kind,
            remote_resolution = config.resolver_bridge.is_enabled(),
            "评估服务已初始化"
        );
        Ok(service)
    }

    pub fn cache(&self) -> &Arc<KnowledgeBaseCache<E>> {
        &self.cache
    }

    /// 以请求参数创建上下文，并挂接远程解析器
    pub fn new_context(&self, params: TypedMap) -> EvaluationContext {
        let ctx = EvaluationContext::from_values(params);
        match &self.resolver {
            Some(resolver) => ctx.with_resolver(resolver.clone()),
            None => ctx,
        }
    }

    /// 从 JSON 请求体创建上下文，请求体必须是对象
    pub fn context_from_json(&self, body: &str) -> Result<EvaluationContext> {
        let params: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body)?;
        Ok(self.new_context(TypedMap::from(params)))
    }

    /// 执行一次评估
    ///
    /// 名称或版本为空时使用默认值。知识库不存在或加载失败时整体失败；
    /// 参数错误与必填参数缺失随结果一起返回。
    #[instrument(skip(self, ctx))]
    pub async fn evaluate(
        &self,
        name: &str,
        version: &str,
        mut ctx: EvaluationContext,
    ) -> Result<EvaluationOutcome> {
        let name = if name.is_empty() { self.default_name.as_str() } else { name };
        let version = if version.is_empty() { self.default_version.as_str() } else { version };

        let started = Instant::now();
        let outcome = self.run(name, version, &mut ctx).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &outcome {
            Ok(outcome) => {
                let status = if outcome.is_partial() { "partial" } else { "success" };
                metrics::record_evaluation(status, elapsed);
                info!(
                    knowledge_base = %outcome.knowledge_base,
                    features = outcome.features.len(),
                    status,
                    "评估完成"
                );
            }
            Err(e) => {
                metrics::record_evaluation(e.code(), elapsed);
                warn!(error = %e, code = e.code(), trace_id = ?current_trace_id(), "评估失败");
            }
        }
        outcome
    }

    async fn run(
        &self,
        name: &str,
        version: &str,
        ctx: &mut EvaluationContext,
    ) -> Result<EvaluationOutcome> {
        let lease = self.cache.get_or_load(name, version).await?;
        let knowledge_base = lease.key().clone();

        let mut features = FeatureSet::new();
        let bindings = Bindings {
            ctx: &mut *ctx,
            result: &mut features,
            processor: &self.processor,
        };
        execute_guarded(self.cache.engine().as_ref(), &*lease, bindings).await?;
        drop(lease);

        ctx.check_required_params().await;
        let errors = ctx.errors().clone();
        let required_param_errors = ctx.required_param_errors().clone();

        Ok(EvaluationOutcome {
            knowledge_base,
            features,
            errors,
            required_param_errors,
        })
    }

    /// 在截止时间内完成评估，超时返回 [`RulerError::DeadlineExceeded`]
    pub async fn evaluate_with_deadline(
        &self,
        name: &str,
        version: &str,
        ctx: EvaluationContext,
        deadline: Duration,
    ) -> Result<EvaluationOutcome> {
        tokio::time::timeout(deadline, self.evaluate(name, version, ctx))
            .await
            .map_err(|_| RulerError::DeadlineExceeded)?
    }
}
