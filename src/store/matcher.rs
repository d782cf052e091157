//! Filter matching and update operators for [`MemoryStore`](super::MemoryStore).
//!
//! Filters are equality-only on (dotted) field paths. Updates accept
//! `$set`, `$unset`, `$inc` and `$setOnInsert`.

use crate::core::{StoreError, StoreResult};
use bson::{Bson, Document};

pub fn matches(document: &Document, filter: &Document) -> StoreResult<bool> {
    for (path, expected) in filter {
        if path.starts_with('$') {
            return Err(unsupported_filter(path));
        }
        if let Bson::Document(inner) = expected {
            if let Some(op) = inner.keys().find(|key| key.starts_with('$')) {
                return Err(unsupported_filter(op));
            }
        }
        if get_path(document, path) != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Apply an update document in place. Returns `true` if the document changed.
pub fn apply_update(document: &mut Document, update: &Document) -> StoreResult<bool> {
    validate_update(update)?;
    let before = document.clone();

    for (op, fields) in update {
        let fields = operator_fields(op, fields)?;
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone())?;
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(document, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = get_path(document, path).cloned();
                    let next = increment(path, current, delta)?;
                    set_path(document, path, next)?;
                }
            }
            "$setOnInsert" => {}
            other => {
                return Err(StoreError::write(format!(
                    "Unknown modifier: {other}. Expected a valid update modifier"
                )));
            }
        }
    }

    Ok(*document != before)
}

/// Build the document an upsert creates when nothing matched `filter`.
pub fn upsert_document(filter: &Document, update: &Document) -> StoreResult<Document> {
    validate_update(update)?;
    let mut seeded = Document::new();
    for (path, value) in filter {
        if !path.starts_with('$') {
            set_path(&mut seeded, path, value.clone())?;
        }
    }

    if let Some(fields) = update.get("$setOnInsert") {
        for (path, value) in operator_fields("$setOnInsert", fields)? {
            set_path(&mut seeded, path, value.clone())?;
        }
    }
    apply_update(&mut seeded, update)?;
    Ok(seeded)
}

pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        match current {
            Bson::Document(inner) => current = inner.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

pub fn set_path(document: &mut Document, path: &str, value: Bson) -> StoreResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match child {
                Bson::Document(inner) => set_path(inner, rest, value),
                other => Err(StoreError::write(format!(
                    "Cannot create field '{rest}' in element {{{head}: {other}}}"
                ))),
            }
        }
    }
}

pub fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

pub fn validate_update(update: &Document) -> StoreResult<()> {
    if update.is_empty() {
        return Err(StoreError::write("Update document must not be empty"));
    }
    if let Some(key) = update.keys().find(|key| !key.starts_with('$')) {
        return Err(StoreError::write(format!(
            "Update document requires atomic operators, found '{key}'"
        )));
    }
    Ok(())
}

fn operator_fields<'a>(op: &str, fields: &'a Bson) -> StoreResult<&'a Document> {
    match fields {
        Bson::Document(inner) => Ok(inner),
        other => Err(StoreError::write(format!(
            "Modifier {op} expects a document, found {other}"
        ))),
    }
}

fn increment(path: &str, current: Option<Bson>, delta: &Bson) -> StoreResult<Bson> {
    let current = current.unwrap_or(Bson::Int32(0));
    let widened = |a: i64, b: i64| {
        a.checked_add(b).map(Bson::Int64).ok_or_else(|| {
            StoreError::write(format!(
                "Cannot apply $inc to field '{path}': integer overflow"
            ))
        })
    };
    let next = match (&current, delta) {
        // An Int32 sum that overflows is promoted to Int64.
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => widened(i64::from(*a), i64::from(*b))?,
        },
        (Bson::Int32(a), Bson::Int64(b)) => widened(i64::from(*a), *b)?,
        (Bson::Int64(a), Bson::Int32(b)) => widened(*a, i64::from(*b))?,
        (Bson::Int64(a), Bson::Int64(b)) => widened(*a, *b)?,
        (Bson::Double(a), Bson::Double(b)) => Bson::Double(a + b),
        (Bson::Double(a), Bson::Int32(b)) => Bson::Double(a + f64::from(*b)),
        (Bson::Int32(a), Bson::Double(b)) => Bson::Double(f64::from(*a) + b),
        _ => {
            return Err(StoreError::write(format!(
                "Cannot apply $inc to field '{path}' with value {current} and delta {delta}"
            )));
        }
    };
    Ok(next)
}

fn unsupported_filter(op: &str) -> StoreError {
    StoreError::write(format!("Unsupported filter operator: {op}"))
}
