use super::FieldOperation;
use crate::core::{Result, Value};
use im::OrdMap;
use uuid::Uuid;

/// One save generation's worth of uncommitted field mutations.
///
/// Keys keep their insertion order; the id identifies the generation when a
/// save result comes back.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSet {
    id: String,
    save_later: bool,
    ops: Vec<(String, FieldOperation)>,
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSet {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            save_later: false,
            ops: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this generation was handed to the durable command cache.
    pub fn is_save_later(&self) -> bool {
        self.save_later
    }

    pub(crate) fn mark_save_later(&mut self) {
        self.save_later = true;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldOperation> {
        self.ops.iter().find(|(k, _)| k == key).map(|(_, op)| op)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldOperation)> {
        self.ops.iter().map(|(k, op)| (k.as_str(), op))
    }

    /// Replaces the operation for `key`, keeping its original position.
    pub fn put(&mut self, key: impl Into<String>, op: FieldOperation) {
        let key = key.into();
        match self.ops.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = op,
            None => self.ops.push((key, op)),
        }
    }

    /// Records a new operation, merging it with whatever this set already
    /// holds for the same key.
    pub fn record(&mut self, key: &str, op: FieldOperation) -> Result<()> {
        let merged = op.merge_with_previous(self.get(key))?;
        self.put(key, merged);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldOperation> {
        let index = self.ops.iter().position(|(k, _)| k == key)?;
        Some(self.ops.remove(index).1)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Folds an older generation into this one; for shared keys this set's
    /// operation is merged on top of the older one.
    pub fn merge_from(&mut self, older: &OperationSet) -> Result<()> {
        for (key, older_op) in &older.ops {
            let merged = match self.get(key) {
                Some(newer) => newer.merge_with_previous(Some(older_op))?,
                None => older_op.clone(),
            };
            self.put(key.clone(), merged);
        }
        Ok(())
    }

    /// Applies every operation in order to `data`.
    pub fn apply_to(&self, data: &mut OrdMap<String, Value>) -> Result<()> {
        for (key, op) in &self.ops {
            match op.apply(data.get(key), key)? {
                Some(value) => {
                    data.insert(key.clone(), value);
                }
                None => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_merges_same_key() {
        let mut set = OperationSet::new();
        set.record("count", FieldOperation::increment(2).unwrap())
            .unwrap();
        set.record("count", FieldOperation::increment(3).unwrap())
            .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get("count"),
            Some(&FieldOperation::Increment(Value::Integer(5)))
        );
    }

    #[test]
    fn merge_from_carries_older_keys_forward() {
        let mut older = OperationSet::new();
        older.record("x", FieldOperation::Set(Value::Integer(2))).unwrap();
        older.record("n", FieldOperation::increment(1).unwrap()).unwrap();

        let mut newer = OperationSet::new();
        newer.record("y", FieldOperation::Set(Value::Integer(3))).unwrap();
        newer.record("n", FieldOperation::increment(4).unwrap()).unwrap();

        newer.merge_from(&older).unwrap();

        assert_eq!(newer.get("x"), Some(&FieldOperation::Set(Value::Integer(2))));
        assert_eq!(newer.get("y"), Some(&FieldOperation::Set(Value::Integer(3))));
        assert_eq!(
            newer.get("n"),
            Some(&FieldOperation::Increment(Value::Integer(5)))
        );
    }

    #[test]
    fn apply_to_removes_tombstoned_keys() {
        let mut data = OrdMap::new();
        data.insert("a".to_string(), Value::Integer(1));
        data.insert("b".to_string(), Value::Integer(2));

        let mut set = OperationSet::new();
        set.record("a", FieldOperation::Delete).unwrap();
        set.record("b", FieldOperation::increment(1).unwrap()).unwrap();
        set.apply_to(&mut data).unwrap();

        assert!(!data.contains_key("a"));
        assert_eq!(data.get("b"), Some(&Value::Integer(3)));
    }

    #[test]
    fn put_keeps_insertion_order() {
        let mut set = OperationSet::new();
        set.put("b", FieldOperation::Delete);
        set.put("a", FieldOperation::Delete);
        set.put("b", FieldOperation::Set(Value::Null));
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn generations_get_distinct_ids() {
        assert_ne!(OperationSet::new().id(), OperationSet::new().id());
    }
}
