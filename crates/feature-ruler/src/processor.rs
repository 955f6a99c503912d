//! 规则执行期可用的无状态工具对象

use crate::typed_map::TypedMap;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct Processor;

impl Processor {
    pub fn new() -> Self {
        Self
    }

    /// 布尔值的文本形式
    pub fn boolean(&self, value: bool) -> String {
        value.to_string()
    }

    pub fn contains(&self, items: &[Value], value: &Value) -> bool {
        items.iter().any(|item| item == value)
    }

    /// 将 JSON 对象文本解析为映射，无法解析时返回空映射
    pub fn to_map(&self, text: &str) -> TypedMap {
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text)
            .map(TypedMap::from)
            .unwrap_or_default()
    }
}
