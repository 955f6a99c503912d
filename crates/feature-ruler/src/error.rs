//! 规则服务错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulerError {
    #[error("知识库或版本不存在: {knowledge_base}@{version}")]
    NotFound {
        knowledge_base: String,
        version: String,
    },

    #[error("知识库加载失败: {knowledge_base}@{version}: {reason}")]
    LoadFailed {
        knowledge_base: String,
        version: String,
        reason: String,
    },

    #[error("远程解析失败: {target}: {reason}")]
    ResolutionFailed { target: String, reason: String },

    #[error("parameter {param} is required")]
    MissingRequiredParameter { param: String },

    #[error("规则执行失败: {0}")]
    EvaluationFault(String),

    #[error("评估超时")]
    DeadlineExceeded,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RulerError>;

impl RulerError {
    pub(crate) fn not_found(knowledge_base: &str, version: &str) -> Self {
        Self::NotFound {
            knowledge_base: knowledge_base.to_string(),
            version: version.to_string(),
        }
    }

    pub(crate) fn load_failed(knowledge_base: &str, version: &str, reason: impl ToString) -> Self {
        Self::LoadFailed {
            knowledge_base: knowledge_base.to_string(),
            version: version.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn resolution_failed(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::ResolutionFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::LoadFailed { .. } => "LOAD_FAILED",
            Self::ResolutionFailed { .. } => "RESOLUTION_FAILED",
            Self::MissingRequiredParameter { .. } => "MISSING_REQUIRED_PARAMETER",
            Self::EvaluationFault(_) => "EVALUATION_FAULT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// 转换为边界层的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::MissingRequiredParameter { .. } | Self::Json(_) => 400,
            Self::ResolutionFailed { .. } => 502,
            Self::DeadlineExceeded => 504,
            Self::LoadFailed { .. } | Self::EvaluationFault(_) | Self::Config(_) => 500,
        }
    }
}
