//! 文字列ラベルとクラスインデックスの対応表

use anyhow::Result;
use std::collections::BTreeSet;

/// ソート済みのラベル語彙（未知語・マスク用のスロットなし）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVocabulary {
    labels: Vec<String>,
}

impl LabelVocabulary {
    /// ラベル列から重複を除いてソートした語彙を作る
    pub fn from_labels<'a, I>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let unique: BTreeSet<&str> = labels.into_iter().collect();
        if unique.is_empty() {
            anyhow::bail!("Cannot build a label vocabulary from zero labels");
        }
        Ok(Self {
            labels: unique.into_iter().map(str::to_string).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// 語彙にないラベルはエラー
    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.labels
            .binary_search_by(|candidate| candidate.as_str().cmp(label))
            .map_err(|_| anyhow::anyhow!("Unknown label '{}'", label))
    }

    pub fn one_hot(&self, label: &str) -> Result<Vec<f32>> {
        let index = self.index_of(label)?;
        let mut encoded = vec![0.0; self.labels.len()];
        encoded[index] = 1.0;
        Ok(encoded)
    }
}
