//! 评估上下文
//!
//! 在 [`TypedMap`] 之上增加两项能力：
//!
//! - 远程绑定参数的惰性解析：读取本地缺失的远程绑定参数时调用解析桥，
//!   结果写回本地，同一参数在一个上下文内最多尝试解析一次（失败也不重试）。
//! - 必填参数跟踪：评估结束后仍缺失的必填参数记录为
//!   `parameter X is required`。
//!
//! 上下文是单一所有者对象，所有可能触发解析的方法都需要 `&mut self`。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use ruler_shared::observability::metrics;
use tracing::{debug, warn};

use crate::resolver::{ParamResolver, ResolveRequest};
use crate::typed_map::{self, TypedMap};
use crate::value::{ConversionError, Value};

pub const NOT_REGISTERED_FOR_REMOTE: &str = "parameter is not registered for remote loading";
const NO_RESOLVER_CONFIGURED: &str = "no remote resolver configured";
const NO_VALUE_RETURNED: &str = "resolver returned no value";

/// 远程绑定：参数由哪个解析器、根据哪个源参数计算
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBinding {
    pub resolver: String,
    pub from: String,
}

#[derive(Default)]
pub struct EvaluationContext {
    values: TypedMap,
    remote: BTreeMap<String, RemoteBinding>,
    required: BTreeSet<String>,
    errors: BTreeMap<String, Vec<String>>,
    required_errors: BTreeMap<String, String>,
    attempted: HashSet<String>,
    resolver: Option<Arc<dyn ParamResolver>>,
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("values", &self.values)
            .field("remote", &self.remote)
            .field("required", &self.required)
            .field("errors", &self.errors)
            .field("required_errors", &self.required_errors)
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: TypedMap) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.put(key, value);
    }

    /// 仅检查本地值，不触发远程解析
    pub fn has(&self, key: &str) -> bool {
        self.values.has(key)
    }

    pub fn values(&self) -> &TypedMap {
        &self.values
    }

    pub fn register_required_params<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
    }

    pub fn is_required(&self, key: &str) -> bool {
        self.required.contains(key)
    }

    /// 注册远程绑定，源参数与参数同名
    pub fn register_remote_binding(&mut self, param: &str, resolver: &str) {
        self.register_remote_binding_from(param, resolver, param);
    }

    pub fn register_remote_binding_from(&mut self, param: &str, resolver: &str, from: &str) {
        self.remote.insert(
            param.to_string(),
            RemoteBinding {
                resolver: resolver.to_string(),
                from: from.to_string(),
            },
        );
    }

    pub fn is_remote(&self, key: &str) -> bool {
        self.remote.contains_key(key)
    }

    pub fn remote_binding(&self, key: &str) -> Option<&RemoteBinding> {
        self.remote.get(key)
    }

    /// 读取参数，本地缺失且存在远程绑定时惰性解析
    pub async fn get(&mut self, key: &str) -> Option<Value> {
        self.ensure_loaded(key).await;
        self.values.get(key).cloned()
    }

    pub async fn get_string(&mut self, key: &str) -> String {
        self.ensure_loaded(key).await;
        typed_map::string_of(self.values.get(key))
    }

    pub async fn get_int(&mut self, key: &str) -> Result<i64, ConversionError> {
        self.ensure_loaded(key).await;
        typed_map::int_of(self.values.get(key))
    }

    pub async fn get_float(&mut self, key: &str) -> Result<f64, ConversionError> {
        self.ensure_loaded(key).await;
        typed_map::float_of(self.values.get(key))
    }

    pub async fn get_bool(&mut self, key: &str) -> bool {
        self.ensure_loaded(key).await;
        typed_map::bool_of(self.values.get(key))
    }

    /// # Panics
    ///
    /// 值存在但不是序列时 panic，与 [`TypedMap::get_slice`] 一致。
    pub async fn get_slice(&mut self, key: &str) -> Vec<Value> {
        self.ensure_loaded(key).await;
        typed_map::slice_of(key, self.values.get(key))
    }

    pub async fn get_map(&mut self, key: &str) -> Result<Option<TypedMap>, ConversionError> {
        self.ensure_loaded(key).await;
        typed_map::map_of(self.values.get(key))
    }

    /// 显式加载远程参数
    ///
    /// 参数未注册远程绑定时记录错误并返回 false。
    pub async fn load(&mut self, key: &str) -> bool {
        if !self.is_remote(key) {
            self.add_error(key, NOT_REGISTERED_FOR_REMOTE);
            return false;
        }
        self.ensure_loaded(key).await;
        self.values.has(key)
    }

    async fn ensure_loaded(&mut self, key: &str) {
        if self.values.has(key) || self.attempted.contains(key) {
            return;
        }
        let Some(binding) = self.remote.get(key).cloned() else {
            return;
        };
        self.attempted.insert(key.to_string());
        self.resolve_remote(key, &binding).await;
    }

    async fn resolve_remote(&mut self, param: &str, binding: &RemoteBinding) {
        let Some(resolver) = self.resolver.clone() else {
            warn!(param = %param, "参数有远程绑定但未配置解析器");
            self.add_error(param, NO_RESOLVER_CONFIGURED);
            return;
        };

        let request = ResolveRequest {
            context: self.values.to_json(),
            load: vec![binding.from.clone()],
        };

        match resolver.resolve(&binding.resolver, request).await {
            Ok(mut response) => {
                if response.has_errors() {
                    metrics::record_remote_resolution(&binding.resolver, "reported_error");
                    for message in response.error_messages() {
                        self.add_error(param, message);
                    }
                    return;
                }
                match response.context.remove(&binding.from) {
                    Some(value) => {
                        metrics::record_remote_resolution(&binding.resolver, "success");
                        debug!(param = %param, resolver = %binding.resolver, "远程参数解析成功");
                        self.values.put(param, value);
                    }
                    None => {
                        metrics::record_remote_resolution(&binding.resolver, "empty");
                        self.add_error(param, NO_VALUE_RETURNED);
                    }
                }
            }
            Err(e) => {
                metrics::record_remote_resolution(&binding.resolver, "failed");
                warn!(param = %param, resolver = %binding.resolver, error = %e, "远程参数解析失败");
                self.add_error(param, e.to_string());
            }
        }
    }

    /// 为参数追加一条错误信息
    pub fn add_error(&mut self, param: &str, message: impl Into<String>) {
        self.errors
            .entry(param.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn errors(&self) -> &BTreeMap<String, Vec<String>> {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// 检查必填参数
    ///
    /// 未访问过的远程绑定必填参数在此处尝试解析；仍缺失的参数各产生一条记录。
    pub async fn check_required_params(&mut self) -> &BTreeMap<String, String> {
        let required: Vec<String> = self.required.iter().cloned().collect();
        for param in required {
            self.ensure_loaded(&param).await;
            if !self.values.has(&param) {
                self.required_errors
                    .entry(param.clone())
                    .or_insert_with(|| format!("parameter {param} is required"));
            }
        }
        &self.required_errors
    }

    pub fn required_param_errors(&self) -> &BTreeMap<String, String> {
        &self.required_errors
    }

    pub fn has_required_errors(&self) -> bool {
        !self.required_errors.is_empty()
    }

    /// 拆分出错误集合，供结果合并
    pub fn into_errors(self) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, String>) {
        (self.errors, self.required_errors)
    }
}

impl From<TypedMap> for EvaluationContext {
    fn from(values: TypedMap) -> Self {
        Self::from_values(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RulerError;
    use crate::resolver::{MockParamResolver, ResolveResponse};
    use mockall::predicate::eq;

    fn response(pairs: &[(&str, Value)]) -> ResolveResponse {
        ResolveResponse {
            context: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_remote_param_resolved_once() {
        let mut resolver = MockParamResolver::new();
        resolver
            .expect_resolve()
            .with(eq("customer"), mockall::predicate::always())
            .times(1)
            .returning(|_, request| {
                assert_eq!(request.load, vec!["segment".to_string()]);
                Ok(response(&[("segment", Value::from("gold"))]))
            });

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.register_remote_binding("segment", "customer");

        assert_eq!(ctx.get_string("segment").await, "gold");
        assert_eq!(ctx.get_string("segment").await, "gold");
        assert_eq!(ctx.get("segment").await, Some(Value::from("gold")));
        assert!(ctx.has("segment"));
    }

    #[tokio::test]
    async fn test_request_bundles_current_context() {
        let mut resolver = MockParamResolver::new();
        resolver.expect_resolve().times(1).returning(|_, request| {
            assert_eq!(request.context, serde_json::json!({"account": "0341-9"}));
            assert_eq!(request.load, vec!["account".to_string()]);
            Ok(response(&[("account", Value::Integer(1200))]))
        });

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.put("account", "0341-9");
        ctx.register_remote_binding_from("balance", "ledger", "account");

        assert_eq!(ctx.get_int("balance").await, Ok(1200));
    }

    #[tokio::test]
    async fn test_failed_resolution_recorded_and_not_retried() {
        let mut resolver = MockParamResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|name, _| Err(RulerError::resolution_failed(name, "connection refused")));

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.register_remote_binding("score", "bureau");

        assert_eq!(ctx.get_int("score").await, Ok(0));
        assert_eq!(ctx.get_int("score").await, Ok(0));
        assert_eq!(ctx.errors()["score"].len(), 1);
        assert!(ctx.errors()["score"][0].contains("connection refused"));
    }

    #[tokio::test]
    async fn test_reported_error_recorded_per_param() {
        let mut resolver = MockParamResolver::new();
        resolver.expect_resolve().times(1).returning(|_, _| {
            let mut response = ResolveResponse::default();
            response
                .errors
                .insert("score".to_string(), Value::from("unknown customer"));
            Ok(response)
        });

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.register_remote_binding("score", "bureau");

        assert!(ctx.get("score").await.is_none());
        assert_eq!(
            ctx.errors()["score"],
            vec!["score: unknown customer".to_string()]
        );
    }

    #[tokio::test]
    async fn test_local_value_wins_over_binding() {
        let mut resolver = MockParamResolver::new();
        resolver.expect_resolve().never();

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.put("segment", "local");
        ctx.register_remote_binding("segment", "customer");

        assert_eq!(ctx.get_string("segment").await, "local");
    }

    #[tokio::test]
    async fn test_load_unbound_param_records_error() {
        let mut ctx = EvaluationContext::new();
        assert!(!ctx.load("myparam").await);
        assert_eq!(
            ctx.errors()["myparam"],
            vec![NOT_REGISTERED_FOR_REMOTE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_binding_without_resolver_records_error() {
        let mut ctx = EvaluationContext::new();
        ctx.register_remote_binding("segment", "customer");
        assert!(ctx.get("segment").await.is_none());
        assert_eq!(ctx.errors()["segment"], vec![NO_RESOLVER_CONFIGURED.to_string()]);
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let mut ctx = EvaluationContext::new();
        ctx.put("age", "21");
        ctx.register_required_params(["age", "income"]);

        let errors = ctx.check_required_params().await.clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors["income"], "parameter income is required");

        // 重复检查不产生重复记录
        assert_eq!(ctx.check_required_params().await.len(), 1);
    }

    #[tokio::test]
    async fn test_required_remote_param_resolved_at_check() {
        let mut resolver = MockParamResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_, _| Ok(response(&[("income", Value::Float(5300.5))])));

        let mut ctx = EvaluationContext::new().with_resolver(Arc::new(resolver));
        ctx.register_remote_binding("income", "payroll");
        ctx.register_required_params(["income"]);

        assert!(ctx.check_required_params().await.is_empty());
        assert_eq!(ctx.get_float("income").await, Ok(5300.5));
    }

    #[tokio::test]
    async fn test_typed_getters_follow_map_policies() {
        let mut ctx = EvaluationContext::from_values(TypedMap::from_iter([
            ("age".to_string(), Value::from("21")),
            ("flag".to_string(), Value::from("T")),
            ("tags".to_string(), Value::Sequence(vec![Value::from("a")])),
        ]));

        assert_eq!(ctx.get_int("age").await, Ok(21));
        assert!(ctx.get_bool("flag").await);
        assert_eq!(ctx.get_slice("tags").await, vec![Value::from("a")]);
        assert_eq!(ctx.get_map("missing").await, Ok(None));
    }
}
