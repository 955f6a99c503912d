//! 动态类型值
//!
//! 上下文与结果中存放的参数值，以及各目标类型的强制转换规则。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// 参数值
///
/// 从 JSON 反序列化时整数优先于浮点数，超出 i64 范围的数字落入 `Float`。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

/// 类型转换错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("无法将 {actual} 转换为 {expected}")]
pub struct ConversionError {
    pub expected: &'static str,
    pub actual: &'static str,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: &'static str) -> ConversionError {
        ConversionError {
            expected,
            actual: self.type_name(),
        }
    }

    /// 转换为文本
    ///
    /// 任何值都有文本形式：null 为空串，序列与映射为 JSON 文本。
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::Sequence(_) | Self::Mapping(_) => self.to_json().to_string(),
        }
    }

    /// 转换为整数
    ///
    /// null 与无法解析的字符串得到 0；浮点数向零截断；
    /// 布尔、序列、映射返回转换错误。
    pub fn to_int(&self) -> Result<i64, ConversionError> {
        match self {
            Self::Null => Ok(0),
            Self::Integer(i) => Ok(*i),
            Self::Float(f) => Ok(*f as i64),
            Self::String(s) => Ok(s.trim().parse().unwrap_or(0)),
            _ => Err(self.mismatch("integer")),
        }
    }

    /// 转换为浮点数，规则同 [`Value::to_int`]
    pub fn to_float(&self) -> Result<f64, ConversionError> {
        match self {
            Self::Null => Ok(0.0),
            Self::Integer(i) => Ok(*i as f64),
            Self::Float(f) => Ok(*f),
            Self::String(s) => Ok(s.trim().parse().unwrap_or(0.0)),
            _ => Err(self.mismatch("float")),
        }
    }

    /// 转换为布尔
    ///
    /// 仅识别规范文本（1/t/T/TRUE/true/True 与 0/f/F/FALSE/false/False），其余为 false。
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            other => parse_bool(&other.to_text()).unwrap_or(false),
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// 转换为 serde_json 值，非有限浮点数变为 null
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// 解析规范布尔文本
pub fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Mapping(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Sequence(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Mapping(value)
    }
}
