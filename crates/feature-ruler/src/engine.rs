//! 规则引擎边界
//!
//! 规则语言的编译与执行由外部引擎负责。这里只约定：
//! 引擎把规则表原文编译成不透明的知识库句柄，
//! 执行时接收上下文（`ctx`）、结果（`result`）与工具对象（`processor`）三个绑定。

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::context::EvaluationContext;
use crate::error::{Result, RulerError};
use crate::processor::Processor;
use crate::result::FeatureSet;

/// 编译后的知识库句柄
pub trait CompiledKnowledgeBase: Send + Sync + 'static {
    /// 句柄包含的规则数，为 0 表示知识库为空
    fn rule_count(&self) -> usize;
}

/// 执行期绑定
pub struct Bindings<'a> {
    pub ctx: &'a mut EvaluationContext,
    pub result: &'a mut FeatureSet,
    pub processor: &'a Processor,
}

#[async_trait]
pub trait RuleEngine: Send + Sync + 'static {
    type KnowledgeBase: CompiledKnowledgeBase;

    fn compile(
        &self,
        name: &str,
        version: &str,
        source: &str,
    ) -> anyhow::Result<Self::KnowledgeBase>;

    async fn execute(
        &self,
        knowledge_base: &Self::KnowledgeBase,
        bindings: Bindings<'_>,
    ) -> anyhow::Result<()>;
}

/// 执行规则并把引擎错误与 panic 统一转换为 [`RulerError::EvaluationFault`]
pub async fn execute_guarded<E: RuleEngine>(
    engine: &E,
    knowledge_base: &E::KnowledgeBase,
    bindings: Bindings<'_>,
) -> Result<()> {
    match AssertUnwindSafe(engine.execute(knowledge_base, bindings))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "规则执行失败");
            Err(RulerError::EvaluationFault(format!("{e:#}")))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "规则执行 panic");
            Err(RulerError::EvaluationFault(format!("recovered from panic: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
