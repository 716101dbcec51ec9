use crate::alert::{AlertRecord, Detection, MalformedAlert};

use std::collections::HashMap;

/// Collapse records into one per object, keeping the whole known history.
///
/// Records are grouped by object id in order of first appearance. A lone
/// record passes through untouched. Otherwise the record with the latest
/// current detection wins; its `jdstarthist` becomes the earliest across
/// the group and its previous detections become the union of every other
/// current and previous detection, most recent first.
pub fn merge(records: Vec<AlertRecord>) -> Result<Vec<AlertRecord>, MalformedAlert> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<AlertRecord>> = HashMap::new();
    for record in records {
        if !groups.contains_key(&record.object_id) {
            order.push(record.object_id.clone());
        }
        groups
            .entry(record.object_id.clone())
            .or_default()
            .push(record);
    }

    order
        .into_iter()
        .filter_map(|object_id| groups.remove(&object_id))
        .map(merge_group)
        .collect()
}

fn merge_group(mut group: Vec<AlertRecord>) -> Result<AlertRecord, MalformedAlert> {
    if group.len() == 1 {
        return Ok(group.remove(0));
    }

    let mut winner = 0;
    let mut latest = f64::NEG_INFINITY;
    for (i, record) in group.iter().enumerate() {
        let jd = record.jd()?;
        if jd > latest {
            latest = jd;
            winner = i;
        }
    }

    let earliest_start = group
        .iter()
        .filter_map(|record| record.candidate.jdstarthist)
        .min_by(f64::total_cmp);

    let winning_candidate = group[winner].candidate.clone();
    let mut history: Vec<Detection> = Vec::new();
    for record in group.iter() {
        for detection in record.history() {
            if *detection != winning_candidate && !history.contains(detection) {
                history.push(detection.clone());
            }
        }
    }
    // stable, so entries sharing a time keep their first-seen order
    history.sort_by(|a, b| {
        b.jd.unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&a.jd.unwrap_or(f64::NEG_INFINITY))
    });

    let mut merged = group.swap_remove(winner);
    if earliest_start.is_some() {
        merged.candidate.jdstarthist = earliest_start;
    }
    merged.prv_candidates = history;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(jd: f64, candid: i64) -> Detection {
        Detection {
            jd: Some(jd),
            candid: Some(candid),
            isdiffpos: Some(true),
            jdstarthist: Some(jd - 1.0),
            ..Default::default()
        }
    }

    fn record(object_id: &str, current: Detection, prv: Vec<Detection>) -> AlertRecord {
        AlertRecord {
            object_id: object_id.to_string(),
            candid: current.candid,
            candidate: current,
            prv_candidates: prv,
        }
    }

    #[test]
    fn test_single_record_passes_through() {
        let r = record("ZTF1", detection(3.0, 3), vec![detection(1.0, 1)]);
        assert_eq!(merge(vec![r.clone()]).unwrap(), vec![r]);
    }

    #[test]
    fn test_latest_wins_and_earliest_start_kept() {
        let a = record("ZTF1", detection(2.0, 2), vec![detection(1.0, 1)]);
        let b = record("ZTF1", detection(5.0, 5), vec![]);
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(merged.len(), 1);
        let merged = &merged[0];
        assert_eq!(merged.candidate.candid, Some(5));
        assert_eq!(merged.candidate.jdstarthist, Some(1.0));
        let prv: Vec<_> = merged.prv_candidates.iter().map(|d| d.candid).collect();
        assert_eq!(prv, vec![Some(2), Some(1)]);
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let merged = merge(vec![
            record("ZTF2", detection(1.0, 1), vec![]),
            record("ZTF1", detection(1.0, 2), vec![]),
            record("ZTF2", detection(2.0, 3), vec![]),
        ])
        .unwrap();
        let ids: Vec<_> = merged.iter().map(|r| r.object_id.as_str()).collect();
        assert_eq!(ids, vec!["ZTF2", "ZTF1"]);
    }

    #[test]
    fn test_missing_time_is_malformed() {
        let mut bad = detection(1.0, 1);
        bad.jd = None;
        let err = merge(vec![
            record("ZTF1", bad, vec![]),
            record("ZTF1", detection(2.0, 2), vec![]),
        ])
        .unwrap_err();
        assert_eq!(err.field, "candidate.jd");
    }
}
