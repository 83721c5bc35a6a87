//! 附件模型：与请求/响应主体并行传递的带外负载。
//!
//! # 教案式概览
//! - **意图（Why）**：RPC 调用常需携带与结构化参数无关的数据，例如大块二进制或追踪元数据。
//!   把它们放在主体之外，业务方法与协议编解码都不必为此改变签名。
//! - **契约（What）**：
//!   - 二进制附件直接使用 [`bytes::Bytes`]，`None` 与“空字节序列”语义不同：前者表示缺席，
//!     后者表示存在但不可读；
//!   - 键值附件 [`KvAttachment`] 是扁平的字符串到字符串映射，键唯一，不做嵌套或类型转换。
//! - **风险提示（Trade-offs）**：`KvAttachment` 以 `BTreeMap` 保存，迭代顺序稳定但插入成本为
//!   `O(log n)`；附件通常只有少量条目，可以接受。

use std::collections::{BTreeMap, btree_map};

use bytes::Bytes;

/// 判断二进制附件是否“可读”，即存在且长度非零。
pub fn is_readable(attachment: Option<&Bytes>) -> bool {
    attachment.is_some_and(|bytes| !bytes.is_empty())
}

/// 扁平的字符串键值附件。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvAttachment {
    entries: BTreeMap<String, String>,
}

impl KvAttachment {
    /// 构造空附件。
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入键值，返回被覆盖的旧值。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// 读取键对应的值。
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// 删除键，返回旧值。
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按键的字典序迭代。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for KvAttachment
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl IntoIterator for KvAttachment {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
