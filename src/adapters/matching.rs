//! Match-predicate evaluation and field-merge semantics shared by the
//! document store backends.

use std::cmp::Ordering;

use super::{Document, Pagination, SortSpec};

/// True when every field of `matcher` is satisfied by `doc`.
///
/// A matcher field is either a literal (exact equality) or an operator object
/// from the recognized subset: `$ne`, `$in`, `$exists`.
pub fn matches(doc: &Document, matcher: &serde_json::Value) -> bool {
    let Some(fields) = matcher.as_object() else {
        // A non-object matcher (null, absent) matches everything.
        return true;
    };
    fields
        .iter()
        .all(|(field, expected)| field_matches(doc.get(field), expected))
}

fn field_matches(actual: Option<&serde_json::Value>, expected: &serde_json::Value) -> bool {
    if let Some(ops) = expected.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, arg)| match op.as_str() {
                "$ne" => actual != Some(arg),
                "$in" => match (arg.as_array(), actual) {
                    (Some(allowed), Some(value)) => allowed.contains(value),
                    _ => false,
                },
                "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
                _ => false,
            });
        }
    }
    actual == Some(expected)
}

/// Shallow merge: every field of `update` overwrites the same field on `doc`;
/// fields not named in `update` are left untouched.
pub fn merge_fields(doc: &mut Document, update: &Document) {
    for (key, value) in update {
        doc.insert(key.clone(), value.clone());
    }
}

pub fn sort_documents(docs: &mut [Document], sort: &SortSpec) {
    docs.sort_by(|a, b| {
        let ordering = compare_values(a.get(&sort.field), b.get(&sort.field));
        if sort.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

pub fn paginate(docs: Vec<Document>, pagination: &Pagination) -> Vec<Document> {
    docs.into_iter()
        .skip(pagination.skip)
        .take(if pagination.limit == 0 {
            usize::MAX
        } else {
            pagination.limit
        })
        .collect()
}
