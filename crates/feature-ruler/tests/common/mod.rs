//! 集成测试共用的引擎、加载器与解析器
//!
//! `ScriptEngine` 把规则表的每一行当作一条规则，按行执行简单指令：
//!
//! ```text
//! require a,b               注册必填参数
//! remote param resolver     注册远程绑定（可选第四列为源参数）
//! set feature value         写入常量特征
//! copy feature param        把上下文参数复制为特征
//! adult feature param       processor.boolean(param >= 18)
//! sleep millis              模拟耗时规则
//! panic                     模拟引擎内部故障
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ruler::{
    Bindings, CompiledKnowledgeBase, LoadError, ParamResolver, ResolveRequest, ResolveResponse,
    RuleEngine, RuleSheetLoader, Value, VersionRecord, VersionRegistry, VersionResolutionError,
};

#[derive(Debug)]
pub struct Script {
    pub version: String,
    pub lines: Vec<String>,
}

impl CompiledKnowledgeBase for Script {
    fn rule_count(&self) -> usize {
        self.lines.len()
    }
}

pub struct ScriptEngine;

#[async_trait]
impl RuleEngine for ScriptEngine {
    type KnowledgeBase = Script;

    fn compile(&self, _name: &str, version: &str, source: &str) -> anyhow::Result<Script> {
        Ok(Script {
            version: version.to_string(),
            lines: source
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        })
    }

    async fn execute(&self, script: &Script, bindings: Bindings<'_>) -> anyhow::Result<()> {
        for line in &script.lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["require", params] => bindings.ctx.register_required_params(params.split(',')),
                ["remote", param, resolver] => {
                    bindings.ctx.register_remote_binding(param, resolver)
                }
                ["remote", param, resolver, from] => {
                    bindings.ctx.register_remote_binding_from(param, resolver, from)
                }
                ["set", feature, value] => bindings.result.put(*feature, *value),
                ["copy", feature, param] => {
                    if let Some(value) = bindings.ctx.get(param).await {
                        bindings.result.put(*feature, value);
                    }
                }
                ["adult", feature, param] => {
                    let age = bindings.ctx.get_int(param).await?;
                    bindings
                        .result
                        .put(*feature, bindings.processor.boolean(age >= 18));
                }
                ["sleep", millis] => {
                    tokio::time::sleep(Duration::from_millis(millis.parse()?)).await;
                }
                ["panic"] => panic!("rule engine invariant violated"),
                _ => anyhow::bail!("unknown instruction: {line}"),
            }
        }
        Ok(())
    }
}

/// 内存规则表，记录加载次数
#[derive(Default)]
pub struct MemoryLoader {
    sheets: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, name: &str, version: &str, source: &str) {
        self.sheets
            .lock()
            .insert(format!("{name}/{version}"), source.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleSheetLoader for MemoryLoader {
    async fn load(&self, name: &str, version: &str) -> Result<String, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let key = format!("{name}/{version}");
        self.sheets
            .lock()
            .get(&key)
            .cloned()
            .ok_or(LoadError::NotFound(key))
    }
}

/// 固定版本列表的仓库
pub struct StaticRegistry {
    records: Vec<VersionRecord>,
    calls: AtomicUsize,
}

impl StaticRegistry {
    pub fn new(versions: &[(&str, &str)]) -> Self {
        Self {
            records: versions
                .iter()
                .map(|(v, status)| VersionRecord::new(*v, *status))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionRegistry for StaticRegistry {
    async fn list_versions(&self, _name: &str) -> Result<Vec<VersionRecord>, VersionResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.records.clone())
    }
}

/// 按源参数名返回固定值的解析器
#[derive(Default)]
pub struct StaticResolver {
    values: HashMap<String, Value>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(values: &[(&str, Value)]) -> Self {
        Self {
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParamResolver for StaticResolver {
    async fn resolve(&self, _resolver: &str, request: ResolveRequest) -> ruler::Result<ResolveResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = ResolveResponse::default();
        for param in &request.load {
            match self.values.get(param) {
                Some(value) => {
                    response.context.insert(param.clone(), value.clone());
                }
                None => {
                    response
                        .errors
                        .insert(param.clone(), Value::from("no data for parameter"));
                }
            }
        }
        Ok(response)
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
