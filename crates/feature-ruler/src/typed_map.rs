//! 带类型访问器的有序键值容器
//!
//! 上下文与结果共用的存储结构。各访问器的转换策略：
//!
//! | 访问器        | 缺失 / null | 错误形态                  |
//! |---------------|-------------|---------------------------|
//! | `get_string`  | 空串        | 不会失败                  |
//! | `get_int`     | 0           | `ConversionError`         |
//! | `get_float`   | 0.0         | `ConversionError`         |
//! | `get_bool`    | false       | 非规范文本为 false        |
//! | `get_map`     | `None`      | `ConversionError`         |
//! | `get_slice`   | 空序列      | panic（调用方编程错误）   |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::{ConversionError, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedMap {
    entries: BTreeMap<String, Value>,
}

impl TypedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, Value> {
        self.entries
    }

    pub fn get_string(&self, key: &str) -> String {
        string_of(self.get(key))
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ConversionError> {
        int_of(self.get(key))
    }

    pub fn get_float(&self, key: &str) -> Result<f64, ConversionError> {
        float_of(self.get(key))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        bool_of(self.get(key))
    }

    /// # Panics
    ///
    /// 值存在但不是序列时 panic。
    pub fn get_slice(&self, key: &str) -> Vec<Value> {
        slice_of(key, self.get(key))
    }

    pub fn get_map(&self, key: &str) -> Result<Option<TypedMap>, ConversionError> {
        map_of(self.get(key))
    }

    /// 向序列条目追加一个元素，条目不存在时先创建
    ///
    /// # Panics
    ///
    /// 条目存在但不是序列时 panic。
    pub fn add_item(&mut self, key: &str, item: impl Into<Value>) -> &[Value] {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Sequence(Vec::new()));
        if entry.is_null() {
            *entry = Value::Sequence(Vec::new());
        }
        match entry {
            Value::Sequence(items) => {
                items.push(item.into());
                items.as_slice()
            }
            other => panic!("参数 {key} 不是序列: {}", other.type_name()),
        }
    }

    pub fn add_items<I, V>(&mut self, key: &str, items: I) -> &[Value]
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for item in items {
            self.add_item(key, item);
        }
        self.sequence_entry(key)
    }

    fn sequence_entry(&mut self, key: &str) -> &[Value] {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Sequence(Vec::new()));
        entry.as_sequence().unwrap_or(&[])
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, Value>> for TypedMap {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for TypedMap {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            entries: map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        }
    }
}

impl FromIterator<(String, Value)> for TypedMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// 以下转换函数同时供 EvaluationContext 复用，保证两侧策略一致

pub(crate) fn string_of(value: Option<&Value>) -> String {
    value.map(Value::to_text).unwrap_or_default()
}

pub(crate) fn int_of(value: Option<&Value>) -> Result<i64, ConversionError> {
    value.map_or(Ok(0), Value::to_int)
}

pub(crate) fn float_of(value: Option<&Value>) -> Result<f64, ConversionError> {
    value.map_or(Ok(0.0), Value::to_float)
}

pub(crate) fn bool_of(value: Option<&Value>) -> bool {
    value.is_some_and(Value::to_bool)
}

pub(crate) fn slice_of(key: &str, value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items.clone(),
        Some(other) => panic!("参数 {key} 不是序列: {}", other.type_name()),
    }
}

pub(crate) fn map_of(value: Option<&Value>) -> Result<Option<TypedMap>, ConversionError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(map)) => Ok(Some(TypedMap::from(map.clone()))),
        Some(other) => Err(ConversionError {
            expected: "mapping",
            actual: other.type_name(),
        }),
    }
}
