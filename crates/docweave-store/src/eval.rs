//! In-process evaluation of pipeline operations over JSON documents
//!
//! Covers the operation subset docweave pipelines use. Anything else is
//! rejected with [`StoreError::UnsupportedOperation`] rather than guessed at.

use std::cmp::Ordering;
use std::collections::HashMap;

use docweave_core::{Document, Namespace};
use serde_json::{Map, Number, Value};

use crate::adapter::StoreError;

/// Read access to namespaces while a pipeline runs
pub(crate) trait Catalog {
    fn read(&self, namespace: &Namespace) -> Result<Vec<Document>, StoreError>;
}

/// `"name"` or `{"db": ..., "coll": ...}`
pub(crate) fn parse_namespace(value: &Value) -> Result<Namespace, StoreError> {
    match value {
        Value::String(name) => Ok(Namespace::new(name.clone())),
        Value::Object(target) => {
            let name = target
                .get("coll")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::InvalidProgram(format!("target without coll: {value}")))?;
            Ok(Namespace {
                database: target.get("db").and_then(Value::as_str).map(str::to_string),
                name: name.to_string(),
            })
        }
        other => Err(StoreError::InvalidProgram(format!("invalid target: {other}"))),
    }
}

/// Split an operation document into its name and body
pub(crate) fn operation_parts(op: &Document) -> Result<(&str, &Value), StoreError> {
    let mut entries = op.iter();
    match (entries.next(), entries.next()) {
        (Some((name, body)), None) => Ok((name.as_str(), body)),
        _ => Err(StoreError::InvalidProgram(format!(
            "operation must have exactly one key: {}",
            Value::Object(op.clone())
        ))),
    }
}

/// Run read-only operations over `docs`
pub(crate) fn run_pipeline(
    mut docs: Vec<Document>,
    operations: &[Document],
    catalog: &dyn Catalog,
) -> Result<Vec<Document>, StoreError> {
    for op in operations {
        let (name, body) = operation_parts(op)?;
        docs = match name {
            "$match" => {
                let filter = as_object(name, body)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches_filter(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let settings = as_object(name, body)?;
                docs.iter().map(|doc| project(doc, settings)).collect::<Result<_, _>>()?
            }
            "$addFields" | "$set" => {
                let settings = as_object(name, body)?;
                docs.into_iter()
                    .map(|mut doc| {
                        let values = settings
                            .iter()
                            .map(|(path, expr)| Ok((path, eval_expr(&doc, expr)?)))
                            .collect::<Result<Vec<_>, StoreError>>()?;
                        for (path, value) in values {
                            set_path(&mut doc, path, value);
                        }
                        Ok(doc)
                    })
                    .collect::<Result<_, StoreError>>()?
            }
            "$unset" => {
                let paths: Vec<&str> = match body {
                    Value::String(path) => vec![path.as_str()],
                    Value::Array(paths) => paths.iter().filter_map(Value::as_str).collect(),
                    _ => return Err(invalid(name, "expects a field name or a list of names")),
                };
                docs.into_iter()
                    .map(|mut doc| {
                        for path in &paths {
                            remove_path(&mut doc, path);
                        }
                        doc
                    })
                    .collect()
            }
            "$group" => group(docs, as_object(name, body)?)?,
            "$sort" => {
                let settings = as_object(name, body)?;
                let keys: Vec<(&str, bool)> = settings
                    .iter()
                    .map(|(path, dir)| (path.as_str(), dir.as_i64().unwrap_or(1) >= 0))
                    .collect();
                docs.sort_by(|a, b| {
                    for (path, ascending) in &keys {
                        let ordering = compare(
                            get_path(a, path).unwrap_or(&Value::Null),
                            get_path(b, path).unwrap_or(&Value::Null),
                        );
                        let ordering = if *ascending { ordering } else { ordering.reverse() };
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    Ordering::Equal
                });
                docs
            }
            "$limit" => {
                let n = body.as_u64().ok_or_else(|| invalid(name, "expects a non-negative integer"))?;
                docs.truncate(n as usize);
                docs
            }
            "$skip" => {
                let n = body.as_u64().ok_or_else(|| invalid(name, "expects a non-negative integer"))?;
                docs.into_iter().skip(n as usize).collect()
            }
            "$count" => {
                let field = body.as_str().ok_or_else(|| invalid(name, "expects a field name"))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut doc = Map::new();
                    doc.insert(field.to_string(), Value::from(docs.len() as u64));
                    vec![doc]
                }
            }
            "$unwind" => unwind(docs, body)?,
            "$lookup" => lookup(docs, as_object(name, body)?, catalog)?,
            "$unionWith" => {
                let (target, nested) = match body {
                    Value::Object(settings) => (
                        settings.get("coll").ok_or_else(|| invalid(name, "requires coll"))?,
                        settings.get("pipeline"),
                    ),
                    other => (other, None),
                };
                let mut other = catalog.read(&parse_namespace(target)?)?;
                if let Some(nested) = nested {
                    other = run_pipeline(other, &as_operations(name, nested)?, catalog)?;
                }
                docs.extend(other);
                docs
            }
            "$out" | "$merge" => {
                return Err(StoreError::InvalidProgram(format!(
                    "{name} must be the last operation"
                )))
            }
            other => return Err(StoreError::UnsupportedOperation(other.to_string())),
        };
    }

    Ok(docs)
}

fn invalid(operation: &str, message: &str) -> StoreError {
    StoreError::InvalidProgram(format!("{operation} {message}"))
}

fn as_object<'a>(operation: &str, body: &'a Value) -> Result<&'a Map<String, Value>, StoreError> {
    body.as_object().ok_or_else(|| invalid(operation, "expects an object"))
}

fn as_operations(operation: &str, value: &Value) -> Result<Vec<Document>, StoreError> {
    let Value::Array(items) = value else {
        return Err(invalid(operation, "pipeline must be an array"));
    };
    items
        .iter()
        .map(|item| {
            item.as_object()
                .cloned()
                .ok_or_else(|| invalid(operation, "pipeline entries must be objects"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: by type bracket, then by value
pub(crate) fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ordering = compare(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality with numbers compared by value (`1 == 1.0`)
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// $match
// ---------------------------------------------------------------------------

fn matches_filter(doc: &Document, filter: &Map<String, Value>) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| invalid(key, "expects an array"))?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let clause = clause.as_object().ok_or_else(|| invalid(key, "expects objects"))?;
                    results.push(matches_filter(doc, clause)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            op if op.starts_with('$') => return Err(StoreError::UnsupportedOperation(op.to_string())),
            path => matches_condition(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn equals_field(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn matches_condition(field: Option<&Value>, condition: &Value) -> Result<bool, StoreError> {
    if !is_operator_object(condition) {
        return Ok(equals_field(field, condition));
    }

    let Value::Object(operators) = condition else {
        return Ok(false);
    };
    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals_field(field, operand),
            "$ne" => !equals_field(field, operand),
            "$gt" | "$gte" | "$lt" | "$lte" => match field {
                Some(value) if type_rank(value) == type_rank(operand) => {
                    let ordering = compare(value, operand);
                    match op.as_str() {
                        "$gt" => ordering == Ordering::Greater,
                        "$gte" => ordering != Ordering::Less,
                        "$lt" => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    }
                }
                _ => false,
            },
            "$in" | "$nin" => {
                let candidates = operand.as_array().ok_or_else(|| invalid(op, "expects an array"))?;
                let found = candidates.iter().any(|candidate| equals_field(field, candidate));
                if op == "$in" { found } else { !found }
            }
            "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
            other => return Err(StoreError::UnsupportedOperation(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

pub(crate) fn eval_expr(doc: &Document, expr: &Value) -> Result<Value, StoreError> {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, args) = map.iter().next().ok_or_else(|| invalid("expression", "is empty"))?;
            eval_operator(doc, op, args)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), eval_expr(doc, value)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|item| eval_expr(doc, item)).collect::<Result<_, _>>()?,
        )),
        literal => Ok(literal.clone()),
    }
}

fn eval_operator(doc: &Document, op: &str, args: &Value) -> Result<Value, StoreError> {
    if op == "$literal" {
        return Ok(args.clone());
    }

    let values: Vec<Value> = match args {
        Value::Array(items) => items.iter().map(|item| eval_expr(doc, item)).collect::<Result<_, _>>()?,
        single => vec![eval_expr(doc, single)?],
    };

    match op {
        "$ifNull" => Ok(values.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "$concat" => {
            let mut out = String::new();
            for value in &values {
                match value {
                    Value::String(s) => out.push_str(s),
                    Value::Null => return Ok(Value::Null),
                    other => return Err(StoreError::Execution(format!("$concat only supports strings, got {other}"))),
                }
            }
            Ok(Value::String(out))
        }
        "$add" | "$subtract" | "$multiply" | "$divide" => arithmetic(op, &values),
        other => Err(StoreError::UnsupportedOperation(other.to_string())),
    }
}

fn arithmetic(op: &str, values: &[Value]) -> Result<Value, StoreError> {
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let numbers: Vec<&Number> = values
        .iter()
        .map(|v| match v {
            Value::Number(n) => Ok(n),
            other => Err(StoreError::Execution(format!("{op} only supports numbers, got {other}"))),
        })
        .collect::<Result<_, _>>()?;

    if op == "$subtract" || op == "$divide" {
        let [a, b] = numbers.as_slice() else {
            return Err(invalid(op, "expects exactly two arguments"));
        };
        if op == "$subtract" {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                if let Some(r) = x.checked_sub(y) {
                    return Ok(Value::from(r));
                }
            }
            return Ok(float(a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0)));
        }
        let divisor = b.as_f64().unwrap_or(0.0);
        if divisor == 0.0 {
            return Err(StoreError::Execution("$divide by zero".to_string()));
        }
        return Ok(float(a.as_f64().unwrap_or(0.0) / divisor));
    }

    let integers: Option<Vec<i64>> = numbers.iter().map(|n| n.as_i64()).collect();
    if let Some(integers) = integers {
        let folded = if op == "$add" {
            integers.iter().try_fold(0i64, |acc, x| acc.checked_add(*x))
        } else {
            integers.iter().try_fold(1i64, |acc, x| acc.checked_mul(*x))
        };
        if let Some(result) = folded {
            return Ok(Value::from(result));
        }
    }

    let floats = numbers.iter().map(|n| n.as_f64().unwrap_or(0.0));
    Ok(float(if op == "$add" { floats.sum() } else { floats.product() }))
}

fn float(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// $project
// ---------------------------------------------------------------------------

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|x| x != 0.0),
        _ => None,
    }
}

fn project(doc: &Document, settings: &Map<String, Value>) -> Result<Document, StoreError> {
    let exclusion = settings
        .iter()
        .any(|(key, value)| key != "_id" && flag(value) == Some(false));

    if exclusion {
        if settings.iter().any(|(key, value)| key != "_id" && flag(value) != Some(false)) {
            return Err(invalid("$project", "cannot mix inclusion and exclusion"));
        }
        let mut out = doc.clone();
        for key in settings.keys() {
            remove_path(&mut out, key);
        }
        if settings.get("_id").and_then(flag) == Some(false) {
            out.remove("_id");
        }
        return Ok(out);
    }

    let mut out = Map::new();
    if settings.get("_id").and_then(flag) != Some(false) {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (key, value) in settings {
        match flag(value) {
            Some(true) => {
                if let Some(found) = get_path(doc, key) {
                    set_path(&mut out, key, found.clone());
                }
            }
            Some(false) => {}
            None => set_path(&mut out, key, eval_expr(doc, value)?),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

enum Accumulator {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, StoreError> {
        Ok(match op {
            "$sum" => Self::Sum { int: 0, float: 0.0, is_float: false },
            "$avg" => Self::Avg { total: 0.0, count: 0 },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$first" => Self::First(None),
            "$last" => Self::Last(Value::Null),
            "$push" => Self::Push(Vec::new()),
            "$addToSet" => Self::AddToSet(Vec::new()),
            other => return Err(StoreError::UnsupportedOperation(other.to_string())),
        })
    }

    fn add(&mut self, value: Value) {
        match self {
            Self::Sum { int, float, is_float } => {
                let Value::Number(n) = &value else { return };
                match (n.as_i64(), *is_float) {
                    (Some(x), false) => match int.checked_add(x) {
                        Some(sum) => *int = sum,
                        None => {
                            *is_float = true;
                            *float = *int as f64 + x as f64;
                        }
                    },
                    _ => {
                        if !*is_float {
                            *is_float = true;
                            *float = *int as f64;
                        }
                        *float += n.as_f64().unwrap_or(0.0);
                    }
                }
            }
            Self::Avg { total, count } => {
                if let Some(x) = value.as_f64() {
                    *total += x;
                    *count += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, Ordering::Less),
            Self::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Self::Last(current) => *current = value,
            Self::Push(items) => items.push(value),
            Self::AddToSet(items) => {
                if !items.iter().any(|item| values_equal(item, &value)) {
                    items.push(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum { int, float: f, is_float } => {
                if is_float {
                    float(f)
                } else {
                    Value::from(int)
                }
            }
            Self::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    float(total / count as f64)
                }
            }
            Self::Min(value) | Self::Max(value) | Self::First(value) => value.unwrap_or(Value::Null),
            Self::Last(value) => value,
            Self::Push(items) | Self::AddToSet(items) => Value::Array(items),
        }
    }
}

/// Nulls never win a `$min`/`$max`
fn keep_extreme(current: &mut Option<Value>, value: Value, want: Ordering) {
    if value.is_null() {
        return;
    }
    let replace = current
        .as_ref()
        .map_or(true, |existing| compare(&value, existing) == want);
    if replace {
        *current = Some(value);
    }
}

fn group(docs: Vec<Document>, settings: &Map<String, Value>) -> Result<Vec<Document>, StoreError> {
    let id_expr = settings
        .get("_id")
        .ok_or_else(|| invalid("$group", "requires an _id"))?;

    let mut fields: Vec<(&str, &str, &Value)> = Vec::new();
    for (field, accumulator) in settings.iter().filter(|(k, _)| k.as_str() != "_id") {
        let Some((op, expr)) = accumulator.as_object().and_then(|a| a.iter().next()) else {
            return Err(invalid("$group", "fields must be accumulator objects"));
        };
        fields.push((field.as_str(), op.as_str(), expr));
    }

    // Groups keep first-seen order
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();

    for doc in &docs {
        let key = eval_expr(doc, id_expr)?;
        let slot = key.to_string();
        let position = match index.get(&slot) {
            Some(&position) => position,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>, _>>()?;
                groups.push((key, accumulators));
                index.insert(slot, groups.len() - 1);
                groups.len() - 1
            }
        };

        for ((_, _, expr), accumulator) in fields.iter().zip(groups[position].1.iter_mut()) {
            accumulator.add(eval_expr(doc, expr)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((field, _, _), accumulator) in fields.iter().zip(accumulators) {
                out.insert(field.to_string(), accumulator.finish());
            }
            out
        })
        .collect())
}

// ---------------------------------------------------------------------------
// $unwind / $lookup
// ---------------------------------------------------------------------------

fn unwind(docs: Vec<Document>, body: &Value) -> Result<Vec<Document>, StoreError> {
    let (path, preserve) = match body {
        Value::String(path) => (path.as_str(), false),
        Value::Object(settings) => (
            settings.get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("$unwind", "requires a path"))?,
            settings.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => return Err(invalid("$unwind", "expects a path or an object")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| invalid("$unwind", "path must start with $"))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup(
    docs: Vec<Document>,
    settings: &Map<String, Value>,
    catalog: &dyn Catalog,
) -> Result<Vec<Document>, StoreError> {
    let from = parse_namespace(settings.get("from").ok_or_else(|| invalid("$lookup", "requires from"))?)?;
    let as_field = settings
        .get("as")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("$lookup", "requires as"))?;
    let local = settings.get("localField").and_then(Value::as_str);
    let foreign = settings.get("foreignField").and_then(Value::as_str);
    let nested = settings
        .get("pipeline")
        .map(|p| as_operations("$lookup", p))
        .transpose()?;

    let foreign_docs = catalog.read(&from)?;

    let (local, foreign) = match (local, foreign) {
        (Some(local), Some(foreign)) => (local, foreign),
        (None, None) => {
            // Uncorrelated join: same matches for every input document
            let matched = match &nested {
                Some(ops) => run_pipeline(foreign_docs, ops, catalog)?,
                None => foreign_docs,
            };
            let matched = Value::Array(matched.into_iter().map(Value::Object).collect());
            return Ok(docs
                .into_iter()
                .map(|mut doc| {
                    set_path(&mut doc, as_field, matched.clone());
                    doc
                })
                .collect());
        }
        _ => return Err(invalid("$lookup", "needs both localField and foreignField")),
    };

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let key = get_path(&doc, local).cloned().unwrap_or(Value::Null);
        let mut matched: Vec<Document> = foreign_docs
            .iter()
            .filter(|candidate| {
                let candidate_key = get_path(candidate, foreign).unwrap_or(&Value::Null);
                match &key {
                    Value::Array(keys) => keys.iter().any(|k| values_equal(k, candidate_key)),
                    key => values_equal(key, candidate_key),
                }
            })
            .cloned()
            .collect();
        if let Some(ops) = &nested {
            matched = run_pipeline(matched, ops, catalog)?;
        }
        set_path(
            &mut doc,
            as_field,
            Value::Array(matched.into_iter().map(Value::Object).collect()),
        );
        out.push(doc);
    }
    Ok(out)
}
