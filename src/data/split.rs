//! 層化サンプリングによる学習/検証データ分割

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

use crate::data::metadata::LesionRecord;

/// 各ラベルの比率を保ったまま学習用と検証用に分割する
///
/// ラベルごとに `round(n * validation_ratio)` 件（`1..=n-1` に収める）を検証用に回す。
/// サンプルが2件未満のラベルは層化できないためエラー。
pub fn stratified_split(
    records: Vec<LesionRecord>,
    validation_ratio: f64,
    seed: u64,
) -> Result<(Vec<LesionRecord>, Vec<LesionRecord>)> {
    if !(validation_ratio > 0.0 && validation_ratio < 1.0) {
        anyhow::bail!("validation_ratio must be in (0, 1), got {}", validation_ratio);
    }

    // ラベル名順にグループ化して、シード固定時の結果を決定的にする
    let mut groups: BTreeMap<String, Vec<LesionRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.label.clone()).or_default().push(record);
    }

    let too_small: Vec<&str> = groups
        .iter()
        .filter(|(_, members)| members.len() < 2)
        .map(|(label, _)| label.as_str())
        .collect();
    if !too_small.is_empty() {
        anyhow::bail!(
            "Classes with fewer than 2 samples cannot be stratified: {}",
            too_small.join(", ")
        );
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    for (_, mut members) in groups {
        members.shuffle(&mut rng);
        let n = members.len();
        let n_val = ((n as f64 * validation_ratio).round() as usize).clamp(1, n - 1);
        let rest = members.split_off(n_val);
        validation.extend(members);
        train.extend(rest);
    }

    // クラスごとに固まらないよう全体も混ぜておく
    train.shuffle(&mut rng);
    validation.shuffle(&mut rng);

    Ok((train, validation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::metadata::class_counts;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn records(counts: &[(&str, usize)]) -> Vec<LesionRecord> {
        let mut out = Vec::new();
        for (label, count) in counts {
            for i in 0..*count {
                let image_id = format!("{}_{}", label, i);
                out.push(LesionRecord {
                    image_path: PathBuf::from(format!("{}.jpg", image_id)),
                    image_id,
                    label: label.to_string(),
                });
            }
        }
        out
    }

    #[test]
    fn test_split_preserves_class_proportions() {
        let all = records(&[("nv", 50), ("mel", 10), ("df", 5)]);
        let (train, val) = stratified_split(all, 0.2, 42).unwrap();

        let val_counts = class_counts(&val);
        assert_eq!(val_counts["nv"], 10);
        assert_eq!(val_counts["mel"], 2);
        assert_eq!(val_counts["df"], 1);
        assert_eq!(train.len() + val.len(), 65);
    }

    #[test]
    fn test_split_is_disjoint_and_deterministic() {
        let (train_a, val_a) = stratified_split(records(&[("bcc", 9), ("bkl", 7)]), 0.3, 7).unwrap();
        let (train_b, val_b) = stratified_split(records(&[("bcc", 9), ("bkl", 7)]), 0.3, 7).unwrap();
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);

        let train_ids: HashSet<_> = train_a.iter().map(|r| r.image_id.clone()).collect();
        assert!(val_a.iter().all(|r| !train_ids.contains(&r.image_id)));
    }

    #[test]
    fn test_every_class_in_both_sets() {
        let (train, val) = stratified_split(records(&[("vasc", 2), ("akiec", 3)]), 0.1, 1).unwrap();
        let train_labels: HashSet<_> = train.iter().map(|r| r.label.as_str()).collect();
        let val_labels: HashSet<_> = val.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(train_labels, val_labels);
    }

    #[test]
    fn test_singleton_class_is_error() {
        let err = stratified_split(records(&[("nv", 10), ("df", 1)]), 0.2, 42).unwrap_err();
        assert!(err.to_string().contains("df"));
    }

    #[test]
    fn test_invalid_ratio_is_error() {
        assert!(stratified_split(records(&[("nv", 10)]), 0.0, 42).is_err());
        assert!(stratified_split(records(&[("nv", 10)]), 1.0, 42).is_err());
    }
}
