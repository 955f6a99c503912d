//! 评估结果
//!
//! 每次评估新建一个 [`FeatureSet`]，规则执行期间只写，结束后只读。

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::Serialize;

use crate::typed_map::TypedMap;
use crate::value::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureSet(TypedMap);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(&self) -> &BTreeMap<String, Value> {
        self.0.entries()
    }

    pub fn into_features(self) -> BTreeMap<String, Value> {
        self.0.into_entries()
    }
}

impl Deref for FeatureSet {
    type Target = TypedMap;

    fn deref(&self) -> &TypedMap {
        &self.0
    }
}

impl DerefMut for FeatureSet {
    fn deref_mut(&mut self) -> &mut TypedMap {
        &mut self.0
    }
}

impl From<TypedMap> for FeatureSet {
    fn from(map: TypedMap) -> Self {
        Self(map)
    }
}
