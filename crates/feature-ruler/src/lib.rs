//! 特征规则评估
//!
//! 按请求参数执行版本化的规则表并返回计算出的特征值，提供：
//! - 带 TTL 与加载协调的知识库缓存
//! - latest 版本解析
//! - 支持远程参数惰性解析与必填检查的评估上下文
//! - HTTP / 对象存储 / 本地文件规则表加载

pub mod context;
pub mod engine;
pub mod error;
pub mod knowledge_base;
pub mod loader;
pub mod processor;
pub mod resolver;
pub mod result;
pub mod service;
pub mod typed_map;
pub mod value;
pub mod version;

pub use context::{EvaluationContext, RemoteBinding};
pub use engine::{Bindings, CompiledKnowledgeBase, RuleEngine};
pub use error::{Result, RulerError};
pub use knowledge_base::{KnowledgeBaseCache, KnowledgeBaseKey, KnowledgeBaseLease, KnowledgeBaseState};
pub use loader::{FileLoader, HttpLoader, LoadError, ObjectStorageLoader, ObjectStore, RuleSheetLoader};
pub use processor::Processor;
pub use resolver::{BridgeResolver, ParamResolver, ResolveRequest, ResolveResponse};
pub use result::FeatureSet;
pub use service::{EvaluationOutcome, RulerService};
pub use typed_map::TypedMap;
pub use value::{ConversionError, Value};
pub use version::{PackageRegistry, VersionRecord, VersionRegistry, VersionResolutionError, VersionResolver};
