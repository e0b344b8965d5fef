use dsync_protocol::FailureRecord;
use indexmap::IndexMap;

/// Keeps the latest record per `(index, uuid)` and groups the survivors by
/// lock, both in first-seen order.
///
/// A later record for the same document replaces the earlier one and moves
/// to the position of the later one.
pub(crate) fn dedup_and_group(records: Vec<FailureRecord>) -> Vec<Vec<FailureRecord>> {
    let mut latest: IndexMap<(String, String), FailureRecord> = IndexMap::new();
    for record in records {
        let key = (record.index_name.clone(), record.uuid.clone());
        latest.shift_remove(&key);
        latest.insert(key, record);
    }

    let mut groups: IndexMap<String, Vec<FailureRecord>> = IndexMap::new();
    for record in latest.into_values() {
        groups.entry(record.group_key()).or_default().push(record);
    }
    groups.into_values().collect()
}
