use crate::core::{Relation, Result, SyncError, Value};
use crate::entity::Entity;

/// A single pending mutation of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOperation {
    Set(Value),
    Delete,
    /// Numeric increment; the amount is always `Value::Integer` or `Value::Float`.
    Increment(Value),
    Add(Vec<Value>),
    AddUnique(Vec<Value>),
    Remove(Vec<Value>),
    Relation {
        target_class: Option<String>,
        add: Vec<Entity>,
        remove: Vec<Entity>,
    },
}

impl FieldOperation {
    pub fn increment(amount: impl Into<Value>) -> Result<Self> {
        let amount = amount.into();
        if !amount.is_numeric() {
            return Err(SyncError::InvalidValue(format!(
                "Increment amount must be a number, got {}",
                amount.type_name()
            )));
        }
        amount.validate_storable()?;
        Ok(Self::Increment(amount))
    }

    /// Builds a relation change, checking every entity belongs to one class.
    pub fn relation(add: Vec<Entity>, remove: Vec<Entity>) -> Result<Self> {
        let mut target_class: Option<String> = None;
        for entity in add.iter().chain(remove.iter()) {
            let class_name = entity.class_name();
            match &target_class {
                Some(existing) if existing != &class_name => {
                    return Err(SyncError::InvalidValue(format!(
                        "Related entities must share a class: '{}' and '{}'",
                        existing, class_name
                    )));
                }
                Some(_) => {}
                None => target_class = Some(class_name),
            }
        }
        Ok(Self::Relation {
            target_class,
            add,
            remove,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Set(_) => "Set",
            Self::Delete => "Delete",
            Self::Increment(_) => "Increment",
            Self::Add(_) => "Add",
            Self::AddUnique(_) => "AddUnique",
            Self::Remove(_) => "Remove",
            Self::Relation { .. } => "Relation",
        }
    }

    /// Applies the operation to the current value of `key`.
    ///
    /// `Ok(None)` is a tombstone: the key must be removed.
    pub fn apply(&self, old: Option<&Value>, key: &str) -> Result<Option<Value>> {
        match self {
            Self::Set(value) => Ok(Some(value.clone())),
            Self::Delete => Ok(None),
            Self::Increment(amount) => match old {
                None | Some(Value::Null) => Ok(Some(amount.clone())),
                Some(current) if current.is_numeric() => Ok(Some(current.add_numbers(amount)?)),
                Some(current) => Err(type_error(key, "number", current)),
            },
            Self::Add(objects) => {
                let mut items = existing_list(old, key)?;
                items.extend(objects.iter().cloned());
                Ok(Some(Value::List(items)))
            }
            Self::AddUnique(objects) => {
                let mut items = existing_list(old, key)?;
                for object in objects {
                    match items.iter().position(|item| item == object) {
                        // a newer handle of the same entity replaces the stale one
                        Some(index) if matches!(object, Value::Entity(_)) => {
                            items[index] = object.clone()
                        }
                        Some(_) => {}
                        None => items.push(object.clone()),
                    }
                }
                Ok(Some(Value::List(items)))
            }
            Self::Remove(objects) => {
                let mut items = existing_list(old, key)?;
                items.retain(|item| !objects.contains(item));
                Ok(Some(Value::List(items)))
            }
            Self::Relation {
                target_class,
                add,
                remove,
            } => {
                let mut relation = match old {
                    None | Some(Value::Null) => Relation::new(target_class.clone()),
                    Some(Value::Relation(existing)) => existing.clone(),
                    Some(current) => return Err(type_error(key, "relation", current)),
                };
                match (&relation.target_class, target_class) {
                    (Some(existing), Some(incoming)) if existing != incoming => {
                        return Err(SyncError::InvalidValue(format!(
                            "Relation '{}' targets '{}', not '{}'",
                            key, existing, incoming
                        )));
                    }
                    (None, Some(incoming)) => relation.target_class = Some(incoming.clone()),
                    _ => {}
                }
                for entity in add {
                    if !relation.contains(entity) {
                        relation.known.push(entity.clone());
                    }
                }
                relation
                    .known
                    .retain(|known| !remove.iter().any(|r| r.same_identity(known)));
                Ok(Some(Value::Relation(relation)))
            }
        }
    }

    /// Folds `previous` (the older operation on the same field) into `self`,
    /// returning one operation with the same effect as applying both in order.
    pub fn merge_with_previous(&self, previous: Option<&FieldOperation>) -> Result<FieldOperation> {
        let Some(previous) = previous else {
            return Ok(self.clone());
        };

        match (self, previous) {
            (Self::Set(_) | Self::Delete, _) => Ok(self.clone()),

            (Self::Increment(amount), Self::Delete) => Ok(Self::Set(amount.clone())),
            (Self::Increment(amount), Self::Set(value)) if value.is_numeric() => {
                Ok(Self::Set(value.add_numbers(amount)?))
            }
            (Self::Increment(amount), Self::Increment(prior)) => {
                Ok(Self::Increment(prior.add_numbers(amount)?))
            }

            (Self::Add(objects), Self::Delete) => Ok(Self::Set(Value::List(objects.clone()))),
            (Self::Add(objects), Self::Add(prior)) => {
                let mut merged = prior.clone();
                merged.extend(objects.iter().cloned());
                Ok(Self::Add(merged))
            }

            (Self::AddUnique(objects), Self::AddUnique(prior)) => {
                let merged = Self::AddUnique(objects.clone())
                    .apply(Some(&Value::List(prior.clone())), "")?;
                match merged {
                    Some(Value::List(items)) => Ok(Self::AddUnique(items)),
                    _ => Err(SyncError::Inconsistent(
                        "AddUnique merge produced a non-list".to_string(),
                    )),
                }
            }

            (Self::Remove(objects), Self::Remove(prior)) => {
                let mut merged = prior.clone();
                for object in objects {
                    if !merged.contains(object) {
                        merged.push(object.clone());
                    }
                }
                Ok(Self::Remove(merged))
            }

            // after a delete or a list set, list edits collapse into a set
            (Self::AddUnique(_) | Self::Remove(_), Self::Delete) => {
                Ok(Self::Set(self.apply(None, "")?.unwrap_or(Value::Null)))
            }
            (Self::Add(_) | Self::AddUnique(_) | Self::Remove(_), Self::Set(value))
                if matches!(value, Value::List(_)) =>
            {
                Ok(Self::Set(self.apply(Some(value), "")?.unwrap_or(Value::Null)))
            }

            (
                Self::Relation {
                    target_class,
                    add,
                    remove,
                },
                Self::Relation {
                    target_class: prior_class,
                    add: prior_add,
                    remove: prior_remove,
                },
            ) => {
                let target_class = match (prior_class, target_class) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(SyncError::InvalidValue(format!(
                            "Related entities must share a class: '{}' and '{}'",
                            a, b
                        )));
                    }
                    (Some(a), _) => Some(a.clone()),
                    (None, b) => b.clone(),
                };

                let mut merged_add: Vec<Entity> = prior_add
                    .iter()
                    .filter(|e| !remove.iter().any(|r| r.same_identity(e)))
                    .cloned()
                    .collect();
                let mut merged_remove: Vec<Entity> = prior_remove
                    .iter()
                    .filter(|e| !add.iter().any(|a| a.same_identity(e)))
                    .cloned()
                    .collect();
                push_unique(&mut merged_add, add);
                push_unique(&mut merged_remove, remove);

                Ok(Self::Relation {
                    target_class,
                    add: merged_add,
                    remove: merged_remove,
                })
            }

            (current, previous) => Err(SyncError::InvalidValue(format!(
                "{} cannot follow {}",
                current.name(),
                previous.name()
            ))),
        }
    }
}

fn existing_list(old: Option<&Value>, key: &str) -> Result<Vec<Value>> {
    match old {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::List(items)) => Ok(items.clone()),
        Some(other) => Err(type_error(key, "list", other)),
    }
}

fn push_unique(target: &mut Vec<Entity>, incoming: &[Entity]) {
    for entity in incoming {
        if !target.iter().any(|e| e.same_identity(entity)) {
            target.push(entity.clone());
        }
    }
}

fn type_error(key: &str, expected: &str, found: &Value) -> SyncError {
    SyncError::InvalidValue(format!(
        "Field '{}' holds {}, expected {}",
        key,
        found.type_name(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc(amount: i64) -> FieldOperation {
        FieldOperation::increment(amount).unwrap()
    }

    #[test]
    fn merged_increments_match_sequential_application() {
        for (a, b, v) in [(1, 2, 10), (-5, 7, 0), (100, -100, 3)] {
            let merged = inc(b).merge_with_previous(Some(&inc(a))).unwrap();
            let start = Value::Integer(v);
            let via_merge = merged.apply(Some(&start), "n").unwrap();
            let step = inc(a).apply(Some(&start), "n").unwrap();
            let sequential = inc(b).apply(step.as_ref(), "n").unwrap();
            assert_eq!(via_merge, sequential);
        }
    }

    #[test]
    fn increment_after_delete_becomes_set() {
        let merged = inc(4).merge_with_previous(Some(&FieldOperation::Delete)).unwrap();
        assert_eq!(merged, FieldOperation::Set(Value::Integer(4)));
    }

    #[test]
    fn increment_after_numeric_set_folds() {
        let merged = inc(4)
            .merge_with_previous(Some(&FieldOperation::Set(Value::Integer(6))))
            .unwrap();
        assert_eq!(merged, FieldOperation::Set(Value::Integer(10)));
    }

    #[test]
    fn increment_after_text_set_is_rejected() {
        let err = inc(1)
            .merge_with_previous(Some(&FieldOperation::Set(Value::from("x"))))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidValue(_)));
    }

    #[test]
    fn set_after_delete_discards_the_delete() {
        let set = FieldOperation::Set(Value::from("fresh"));
        let merged = set.merge_with_previous(Some(&FieldOperation::Delete)).unwrap();
        assert_eq!(merged, set);
    }

    #[test]
    fn delete_applies_as_tombstone() {
        let result = FieldOperation::Delete
            .apply(Some(&Value::Integer(1)), "gone")
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn add_unique_merges_as_deduplicated_union() {
        let first = FieldOperation::AddUnique(vec![Value::from("a"), Value::from("b")]);
        let second = FieldOperation::AddUnique(vec![Value::from("b"), Value::from("c")]);
        let merged = second.merge_with_previous(Some(&first)).unwrap();
        assert_eq!(
            merged,
            FieldOperation::AddUnique(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
    }

    #[test]
    fn add_after_list_set_becomes_set() {
        let set = FieldOperation::Set(Value::from(vec![1]));
        let merged = FieldOperation::Add(vec![Value::Integer(2)])
            .merge_with_previous(Some(&set))
            .unwrap();
        assert_eq!(merged, FieldOperation::Set(Value::from(vec![1, 2])));
    }

    #[test]
    fn remove_filters_existing_items() {
        let old = Value::from(vec!["a", "b", "a", "c"]);
        let result = FieldOperation::Remove(vec![Value::from("a")])
            .apply(Some(&old), "tags")
            .unwrap();
        assert_eq!(result, Some(Value::from(vec!["b", "c"])));
    }

    #[test]
    fn remove_after_delete_yields_empty_list() {
        let merged = FieldOperation::Remove(vec![Value::from("a")])
            .merge_with_previous(Some(&FieldOperation::Delete))
            .unwrap();
        assert_eq!(merged, FieldOperation::Set(Value::List(Vec::new())));
    }

    #[test]
    fn add_to_non_list_is_rejected() {
        let err = FieldOperation::Add(vec![Value::Integer(1)])
            .apply(Some(&Value::from("text")), "tags")
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidValue(_)));
    }

    #[test]
    fn add_cannot_follow_increment() {
        let err = FieldOperation::Add(vec![Value::Integer(1)])
            .merge_with_previous(Some(&inc(1)))
            .unwrap_err();
        assert!(err.to_string().contains("Add cannot follow Increment"));
    }
}
