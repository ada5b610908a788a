//! Delta engine (C2): diff, apply, three-way merge, optimize and checksum
//! over arbitrary `serde_json::Value` documents.
//!
//! Pure functions only — no I/O, no shared state — so every entry point
//! here is safe to call from any task.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// A single change in a delta, following the JSON Patch (RFC 6902)
/// vocabulary tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { path: String, from: String },
    Copy { path: String, from: String },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Add { path, .. }
            | Change::Remove { path }
            | Change::Replace { path, .. }
            | Change::Move { path, .. }
            | Change::Copy { path, .. } => path,
        }
    }
}

/// Ordered list of changes transforming one JSON value into another.
pub type Delta = Vec<Change>;

/// A per-path conflict surfaced by [`three_way_merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub path: String,
    pub local_value: Value,
    pub remote_value: Value,
}

// ── JSON-pointer navigation ─────────────────────────────────────────────

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn tokens(path: &str) -> Vec<String> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').skip(1).map(unescape_token).collect()
    }
}

fn join_path(base: &str, token: &str) -> String {
    format!("{base}/{}", escape_token(token))
}

fn get<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = root;
    for token in tokens(path) {
        cur = match cur {
            Value::Object(map) => map.get(&token)?,
            Value::Array(arr) => arr.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn get_mut<'v>(root: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    let mut cur = root;
    for token in tokens(path) {
        cur = match cur {
            Value::Object(map) => map.get_mut(&token)?,
            Value::Array(arr) => arr.get_mut(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn split_parent(path: &str) -> SyncResult<(String, String)> {
    let toks = tokens(path);
    let last = toks.last().cloned().ok_or_else(|| SyncError::InvalidDelta {
        path: path.to_string(),
        reason: "root path has no parent".to_string(),
    })?;
    let parent = toks[..toks.len() - 1]
        .iter()
        .fold(String::new(), |acc, t| join_path(&acc, t));
    Ok((parent, last))
}

fn insert_at(root: &mut Value, path: &str, value: Value) -> SyncResult<()> {
    let (parent_path, key) = split_parent(path)?;
    let parent = get_mut(root, &parent_path).ok_or_else(|| SyncError::InvalidDelta {
        path: path.to_string(),
        reason: "parent path does not exist".to_string(),
    })?;
    match parent {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(arr) => {
            if key == "-" {
                arr.push(value);
                return Ok(());
            }
            let idx: usize = key.parse().map_err(|_| SyncError::InvalidDelta {
                path: path.to_string(),
                reason: "array index is not a number".to_string(),
            })?;
            if idx > arr.len() {
                return Err(SyncError::InvalidDelta {
                    path: path.to_string(),
                    reason: "array index out of bounds".to_string(),
                });
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(SyncError::InvalidDelta {
            path: path.to_string(),
            reason: "parent is not a container".to_string(),
        }),
    }
}

fn remove_at(root: &mut Value, path: &str) -> SyncResult<Value> {
    let (parent_path, key) = split_parent(path)?;
    let parent = get_mut(root, &parent_path).ok_or_else(|| SyncError::InvalidDelta {
        path: path.to_string(),
        reason: "parent path does not exist".to_string(),
    })?;
    match parent {
        Value::Object(map) => map.remove(&key).ok_or_else(|| SyncError::InvalidDelta {
            path: path.to_string(),
            reason: "key does not exist".to_string(),
        }),
        Value::Array(arr) => {
            let idx: usize = key.parse().map_err(|_| SyncError::InvalidDelta {
                path: path.to_string(),
                reason: "array index is not a number".to_string(),
            })?;
            if idx >= arr.len() {
                return Err(SyncError::InvalidDelta {
                    path: path.to_string(),
                    reason: "array index out of bounds".to_string(),
                });
            }
            Ok(arr.remove(idx))
        }
        _ => Err(SyncError::InvalidDelta {
            path: path.to_string(),
            reason: "parent is not a container".to_string(),
        }),
    }
}

fn replace_at(root: &mut Value, path: &str, value: Value) -> SyncResult<()> {
    let slot = get_mut(root, path).ok_or_else(|| SyncError::InvalidDelta {
        path: path.to_string(),
        reason: "path does not exist".to_string(),
    })?;
    *slot = value;
    Ok(())
}

// ── diff ────────────────────────────────────────────────────────────────

/// `diff(before, after)`: produces a change sequence that, applied in
/// order to `before`, reproduces `after`.
pub fn diff(before: &Value, after: &Value) -> Delta {
    let mut changes = Vec::new();
    diff_value("", before, after, &mut changes);
    changes
}

fn diff_value(path: &str, before: &Value, after: &Value, changes: &mut Delta) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for key in b.keys() {
                if !a.contains_key(key) {
                    changes.push(Change::Remove {
                        path: join_path(path, key),
                    });
                }
            }
            for (key, av) in a.iter() {
                match b.get(key) {
                    None => changes.push(Change::Add {
                        path: join_path(path, key),
                        value: av.clone(),
                    }),
                    Some(bv) if bv != av => diff_value(&join_path(path, key), bv, av, changes),
                    Some(_) => {}
                }
            }
        }
        (Value::Array(b), Value::Array(a)) => {
            let common = b.len().min(a.len());
            for i in 0..common {
                if b[i] != a[i] {
                    changes.push(Change::Replace {
                        path: join_path(path, &i.to_string()),
                        value: a[i].clone(),
                    });
                }
            }
            if a.len() > b.len() {
                for (i, item) in a.iter().enumerate().skip(common) {
                    changes.push(Change::Add {
                        path: join_path(path, &i.to_string()),
                        value: item.clone(),
                    });
                }
            } else if b.len() > a.len() {
                for i in (a.len()..b.len()).rev() {
                    changes.push(Change::Remove {
                        path: join_path(path, &i.to_string()),
                    });
                }
            }
        }
        _ => changes.push(Change::Replace {
            path: path.to_string(),
            value: after.clone(),
        }),
    }
}

// ── apply ───────────────────────────────────────────────────────────────

/// `apply(state, delta)`: executes changes in order against a clone of
/// `state`. Fails with `INVALID_DELTA` on an unresolvable path.
pub fn apply(state: &Value, delta: &Delta) -> SyncResult<Value> {
    let mut result = state.clone();
    for change in delta {
        match change {
            Change::Add { path, value } => insert_at(&mut result, path, value.clone())?,
            Change::Remove { path } => {
                remove_at(&mut result, path)?;
            }
            Change::Replace { path, value } => replace_at(&mut result, path, value.clone())?,
            Change::Move { path, from } => {
                let value = get(&result, from)
                    .cloned()
                    .ok_or_else(|| SyncError::InvalidDelta {
                        path: from.clone(),
                        reason: "move source does not exist".to_string(),
                    })?;
                remove_at(&mut result, from)?;
                insert_at(&mut result, path, value)?;
            }
            Change::Copy { path, from } => {
                let value = get(&result, from)
                    .cloned()
                    .ok_or_else(|| SyncError::InvalidDelta {
                        path: from.clone(),
                        reason: "copy source does not exist".to_string(),
                    })?;
                insert_at(&mut result, path, value)?;
            }
        }
    }
    Ok(result)
}

// ── three-way merge ────────────────────────────────────────────────────

/// `three_way_merge(base, local, remote)`: merges two divergent documents
/// against a common ancestor, recursing into objects but not into
/// primitives — a conflicting primitive surfaces at its own path and keeps
/// `base`'s value in the merged result.
pub fn three_way_merge(base: &Value, local: &Value, remote: &Value) -> (Value, Vec<MergeConflict>) {
    let mut conflicts = Vec::new();
    let merged = merge_value("", base, local, remote, &mut conflicts);
    (merged, conflicts)
}

fn merge_value(path: &str, base: &Value, local: &Value, remote: &Value, conflicts: &mut Vec<MergeConflict>) -> Value {
    if local == remote {
        return local.clone();
    }
    if local == base {
        return remote.clone();
    }
    if remote == base {
        return local.clone();
    }

    if let (Value::Object(l), Value::Object(r)) = (local, remote) {
        // No common ancestor (`base` is `Null`, e.g. MERGE with no
        // happens-before event for this entity) is treated as an empty
        // object: every key either side added is a disjoint ADD, not a
        // whole-document conflict.
        let empty = Map::new();
        let b = match base {
            Value::Object(b) => b,
            Value::Null => &empty,
            _ => {
                conflicts.push(MergeConflict {
                    path: path.to_string(),
                    local_value: local.clone(),
                    remote_value: remote.clone(),
                });
                return base.clone();
            }
        };
        return Value::Object(merge_objects(path, b, l, r, conflicts));
    }

    conflicts.push(MergeConflict {
        path: path.to_string(),
        local_value: local.clone(),
        remote_value: remote.clone(),
    });
    base.clone()
}

fn merge_objects(
    path: &str,
    base: &Map<String, Value>,
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    conflicts: &mut Vec<MergeConflict>,
) -> Map<String, Value> {
    let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    let mut merged = Map::new();

    for key in keys {
        let key_path = join_path(path, key);
        let b = base.get(key);
        let l = local.get(key);
        let r = remote.get(key);

        match (b, l, r) {
            (None, Some(lv), None) => {
                merged.insert(key.clone(), lv.clone());
            }
            (None, None, Some(rv)) => {
                merged.insert(key.clone(), rv.clone());
            }
            (None, Some(lv), Some(rv)) => {
                if lv == rv {
                    merged.insert(key.clone(), lv.clone());
                } else {
                    conflicts.push(MergeConflict {
                        path: key_path,
                        local_value: lv.clone(),
                        remote_value: rv.clone(),
                    });
                }
            }
            (Some(bv), Some(lv), None) => {
                if lv != bv {
                    conflicts.push(MergeConflict {
                        path: key_path,
                        local_value: lv.clone(),
                        remote_value: Value::Null,
                    });
                    merged.insert(key.clone(), bv.clone());
                }
                // else: local unchanged, remote deleted it — take the deletion.
            }
            (Some(bv), None, Some(rv)) => {
                if rv != bv {
                    conflicts.push(MergeConflict {
                        path: key_path,
                        local_value: Value::Null,
                        remote_value: rv.clone(),
                    });
                    merged.insert(key.clone(), bv.clone());
                }
                // else: remote unchanged, local deleted it — take the deletion.
            }
            (Some(_), None, None) => {
                // both sides deleted the key.
            }
            (Some(bv), Some(lv), Some(rv)) => {
                let merged_v = merge_value(&key_path, bv, lv, rv, conflicts);
                merged.insert(key.clone(), merged_v);
            }
            (None, None, None) => unreachable!("key drawn from the union of all three maps"),
        }
    }

    merged
}

// ── optimize ────────────────────────────────────────────────────────────

/// `optimize(delta)`: cancels an ADD immediately followed by a REMOVE at
/// the same path, and collapses consecutive REPLACEs at the same path to
/// the last value.
pub fn optimize(delta: &Delta) -> Delta {
    let mut collapsed: Delta = Vec::new();
    for change in delta {
        if let Change::Replace { path, .. } = change {
            if let Some(Change::Replace { path: prev_path, .. }) = collapsed.last() {
                if path == prev_path {
                    collapsed.pop();
                }
            }
        }
        collapsed.push(change.clone());
    }

    let mut result: Delta = Vec::new();
    let mut iter = collapsed.into_iter().peekable();
    while let Some(change) = iter.next() {
        if let Change::Add { path, .. } = &change {
            if let Some(Change::Remove { path: rpath }) = iter.peek() {
                if path == rpath {
                    iter.next();
                    continue;
                }
            }
        }
        result.push(change);
    }
    result
}

// ── checksum ────────────────────────────────────────────────────────────

/// `checksum(value)`: a stable content hash over the canonicalized
/// (sorted-key) JSON form, for end-to-end verification.
pub fn checksum(value: &Value) -> String {
    let canonical = canonical_string(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_json_string(s),
        Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonical_string).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", escape_json_string(k), canonical_string(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
