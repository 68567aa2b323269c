//! `{{stepId.path}}` references: parsing, discovery, and resolution.
//!
//! A reference is parsed into a small AST: the source step id plus path
//! segments. Segments are field names, numeric indices (`.0` or `[0]`), or
//! `[]`, which plucks the rest of the path over every element of an array.
//! A trailing `|all` keeps a `[]` reference whole instead of driving
//! implicit iteration.
//!
//! Real steps are addressed through their result envelope
//! (`{{fetch.data.items}}`, `{{fetch.tokens_used}}`). The reserved bindings
//! `input` and `loop` are addressed directly (`{{input.customer}}`,
//! `{{loop.item.email}}`).
//!
//! Resolution rules:
//! - the step must have a result, otherwise `Unresolved`;
//! - a null anywhere along the path resolves to `null`;
//! - a missing key or out-of-range index resolves to `null` when it is the
//!   last segment, and is `InvalidPath` when more segments follow;
//! - indexing into a string, number, or bool is `InvalidPath`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use neuronforge_types::error::{ErrorKind, StepError};
use neuronforge_types::execution::ResultMap;
use neuronforge_types::step::{Step, StepKind};
use serde::Serialize;
use serde_json::{Map, Value};

/// Binding holding the run's initial input.
pub const INPUT_BINDING: &str = "input";

/// Binding holding `{item, index}` inside loop and scatter-gather bodies.
pub const LOOP_BINDING: &str = "loop";

/// Whether an id names a reserved binding rather than a step.
pub fn is_reserved(id: &str) -> bool {
    id == INPUT_BINDING || id == LOOP_BINDING
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReferenceError {
    #[error("unresolved reference '{reference}': step '{step_id}' has no result")]
    Unresolved { step_id: String, reference: String },

    #[error("invalid path in '{reference}': {reason}")]
    InvalidPath { reference: String, reason: String },

    #[error(
        "array references disagree on length: '{first}' has {first_len} elements, '{other}' has {other_len}"
    )]
    MismatchedArrays {
        first: String,
        first_len: usize,
        other: String,
        other_len: usize,
    },
}

impl From<ReferenceError> for StepError {
    fn from(err: ReferenceError) -> Self {
        let kind = match &err {
            ReferenceError::Unresolved { .. } => ErrorKind::UnresolvedReference,
            ReferenceError::InvalidPath { .. } | ReferenceError::MismatchedArrays { .. } => {
                ErrorKind::InvalidPath
            }
        };
        StepError::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    /// `[]`: apply the rest of the path to every element.
    Each,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Each => f.write_str("[]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step_id: String,
    pub path: Vec<PathSegment>,
    /// `|all`: substitute the plucked array instead of iterating.
    pub whole: bool,
    /// Original text between the braces, trimmed.
    pub raw: String,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Reference {
    /// Parse the text between `{{` and `}}`. Returns `None` when the text is
    /// not a well-formed reference.
    pub fn parse(expr: &str) -> Option<Self> {
        let raw = expr.trim();
        let (body, whole) = match raw.rsplit_once('|') {
            Some((body, modifier)) if modifier.trim() == "all" => (body.trim_end(), true),
            Some(_) => return None,
            None => (raw, false),
        };

        let id_end = body.find(|c: char| !is_ident_char(c)).unwrap_or(body.len());
        if id_end == 0 {
            return None;
        }
        let step_id = body[..id_end].to_string();

        let mut path = Vec::new();
        let mut rest = &body[id_end..];
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| !is_ident_char(c)).unwrap_or(after.len());
                if end == 0 {
                    return None;
                }
                path.push(PathSegment::Field(after[..end].to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']')?;
                let inner = after[..close].trim();
                if inner.is_empty() {
                    path.push(PathSegment::Each);
                } else {
                    path.push(PathSegment::Index(inner.parse().ok()?));
                }
                rest = &after[close + 1..];
            } else {
                return None;
            }
        }

        Some(Self {
            step_id,
            path,
            whole,
            raw: raw.to_string(),
        })
    }

    /// Whether the reference contains a `[]` segment.
    pub fn is_array(&self) -> bool {
        self.path.iter().any(|s| *s == PathSegment::Each)
    }

    /// Number of `[]` segments.
    pub fn array_depth(&self) -> usize {
        self.path.iter().filter(|s| **s == PathSegment::Each).count()
    }

    /// Whether this reference drives implicit iteration.
    pub fn iterates(&self) -> bool {
        self.is_array() && !self.whole
    }

    /// Dot-path rendering, e.g. `data.items[].email`.
    pub fn path_string(&self) -> String {
        let joined: String = self.path.iter().map(ToString::to_string).collect();
        joined.strip_prefix('.').unwrap_or(&joined).to_string()
    }

    /// Split at the first `[]`: the path to the driving array and the
    /// remainder applied to each element.
    fn split_at_each(&self) -> Option<(&[PathSegment], &[PathSegment])> {
        let pos = self.path.iter().position(|s| *s == PathSegment::Each)?;
        Some((&self.path[..pos], &self.path[pos + 1..]))
    }
}

/// An array reference found in a step's params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArrayReference {
    pub step_id: String,
    pub path: String,
    pub array_depth: usize,
}

impl From<&Reference> for ArrayReference {
    fn from(r: &Reference) -> Self {
        Self {
            step_id: r.step_id.clone(),
            path: r.path_string(),
            array_depth: r.array_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexing and discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart<'a> {
    Text(&'a str),
    Ref(Reference),
}

/// Split a string into literal text and references. Malformed `{{...}}`
/// spans stay literal.
pub fn parse_template(input: &str) -> Vec<TemplatePart<'_>> {
    let mut parts = Vec::new();
    let mut cursor = 0;
    let mut text_start = 0;

    while let Some(open) = input[cursor..].find("{{") {
        let open = cursor + open;
        let Some(close) = input[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        match Reference::parse(&input[open + 2..close]) {
            Some(reference) => {
                if open > text_start {
                    parts.push(TemplatePart::Text(&input[text_start..open]));
                }
                parts.push(TemplatePart::Ref(reference));
                text_start = close + 2;
                cursor = close + 2;
            }
            None => cursor = open + 2,
        }
    }

    if text_start < input.len() {
        parts.push(TemplatePart::Text(&input[text_start..]));
    }
    parts
}

/// The reference when `input` is exactly one reference (surrounding
/// whitespace allowed).
fn sole_reference(input: &str) -> Option<Reference> {
    let mut parts = parse_template(input.trim());
    match (parts.pop(), parts.is_empty()) {
        (Some(TemplatePart::Ref(reference)), true) => Some(reference),
        _ => None,
    }
}

pub fn find_references(input: &str) -> Vec<Reference> {
    parse_template(input)
        .into_iter()
        .filter_map(|part| match part {
            TemplatePart::Ref(r) => Some(r),
            TemplatePart::Text(_) => None,
        })
        .collect()
}

/// Collect references from every string inside a JSON value.
pub fn collect_value_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => out.extend(find_references(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_value_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_value_references(v, out)),
        _ => {}
    }
}

/// Every reference a step makes to data outside itself: params, the AI
/// prompt, loop/scatter `items`, and references from nested steps that
/// point outside the nested list.
pub fn step_references(step: &Step) -> Vec<Reference> {
    let mut refs = Vec::new();
    for value in step.params.values() {
        collect_value_references(value, &mut refs);
    }

    match &step.kind {
        StepKind::AiProcessing { prompt, .. } => refs.extend(find_references(prompt)),
        StepKind::Loop { items, steps, .. } | StepKind::ScatterGather { items, steps, .. } => {
            refs.extend(find_references(items));
            let inner: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
            for nested in steps {
                refs.extend(
                    step_references(nested)
                        .into_iter()
                        .filter(|r| !inner.contains(r.step_id.as_str())),
                );
            }
        }
        StepKind::PluginAction { .. } | StepKind::Transform { .. } | StepKind::Conditional { .. } => {}
    }
    refs
}

// ---------------------------------------------------------------------------
// Path walking
// ---------------------------------------------------------------------------

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Walk `path` inside `value`. Returns the reason on failure.
fn walk(value: &Value, path: &[PathSegment]) -> Result<Value, String> {
    let Some((segment, rest)) = path.split_first() else {
        return Ok(value.clone());
    };

    match (segment, value) {
        (_, Value::Null) => Ok(Value::Null),
        (PathSegment::Field(name), Value::Object(map)) => match map.get(name) {
            Some(next) => walk(next, rest),
            None if rest.is_empty() => Ok(Value::Null),
            None => Err(format!("field '{name}' is missing")),
        },
        (PathSegment::Field(name), Value::Array(items)) => match name.parse::<usize>() {
            Ok(i) => walk_index(items, i, rest),
            Err(_) => Err(format!("cannot read field '{name}' of an array")),
        },
        (PathSegment::Index(i), Value::Array(items)) => walk_index(items, *i, rest),
        (PathSegment::Each, Value::Array(items)) => items
            .iter()
            .map(|item| walk(item, rest))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (PathSegment::Field(name), other) => {
            Err(format!("cannot read field '{name}' of {}", type_name(other)))
        }
        (PathSegment::Index(i), other) => Err(format!("cannot index [{i}] into {}", type_name(other))),
        (PathSegment::Each, other) => Err(format!("cannot iterate over {}", type_name(other))),
    }
}

fn walk_index(items: &[Value], i: usize, rest: &[PathSegment]) -> Result<Value, String> {
    match items.get(i) {
        Some(next) => walk(next, rest),
        None if rest.is_empty() => Ok(Value::Null),
        None => Err(format!("index [{i}] is out of range for {} items", items.len())),
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Output of resolving one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    /// Params with every reference substituted. `[]` references hold the
    /// full plucked array.
    pub params: Value,
    /// AI prompt with references interpolated.
    pub prompt: Option<String>,
    /// Loop/scatter-gather element array.
    pub items: Option<Value>,
    pub array_references: Vec<ArrayReference>,
    /// Per-element params when the step iterates implicitly.
    pub iterations: Option<Vec<Value>>,
}

/// Stateless resolver over a read-only results snapshot.
pub struct ReferenceResolver;

/// Substitution mode: whole values, or element `i` of every iterating
/// reference.
#[derive(Clone, Copy)]
enum Mode<'c> {
    Whole,
    Element(usize, &'c HashMap<String, Vec<Value>>),
}

impl ReferenceResolver {
    /// Resolve a step's params (plus prompt and items) against `results`.
    pub fn resolve_step(step: &Step, results: &ResultMap) -> Result<ResolvedStep, ReferenceError> {
        let params = Value::Object(step.params.clone());
        let resolved_params = Self::substitute(&params, results, Mode::Whole)?;

        let mut refs = Vec::new();
        collect_value_references(&params, &mut refs);
        let array_references: Vec<ArrayReference> =
            refs.iter().filter(|r| r.is_array()).map(ArrayReference::from).collect();

        let (prompt, items) = match &step.kind {
            StepKind::AiProcessing { prompt, .. } => (Some(Self::resolve_text(prompt, results)?), None),
            StepKind::Loop { items, .. } | StepKind::ScatterGather { items, .. } => {
                (None, Some(Self::resolve_value(&Value::String(items.clone()), results)?))
            }
            _ => (None, None),
        };

        let iterations = if supports_implicit_iteration(&step.kind) {
            Self::expand_iterations(&params, &refs, results)?
        } else {
            None
        };

        Ok(ResolvedStep {
            params: resolved_params,
            prompt,
            items,
            array_references,
            iterations,
        })
    }

    /// Resolve every reference inside a JSON value.
    pub fn resolve_value(value: &Value, results: &ResultMap) -> Result<Value, ReferenceError> {
        Self::substitute(value, results, Mode::Whole)
    }

    /// Interpolate references into text.
    pub fn resolve_text(text: &str, results: &ResultMap) -> Result<String, ReferenceError> {
        Self::interpolate(text, results, Mode::Whole)
    }

    /// Resolve a single parsed reference.
    pub fn lookup(reference: &Reference, results: &ResultMap) -> Result<Value, ReferenceError> {
        Self::walk_reference(reference, &reference.path, results)
    }

    fn walk_reference(
        reference: &Reference,
        path: &[PathSegment],
        results: &ResultMap,
    ) -> Result<Value, ReferenceError> {
        let result = results
            .get(&reference.step_id)
            .ok_or_else(|| ReferenceError::Unresolved {
                step_id: reference.step_id.clone(),
                reference: reference.raw.clone(),
            })?;

        let walked = if is_reserved(&reference.step_id) {
            walk(&result.data, path)
        } else {
            match path.split_first() {
                Some((PathSegment::Field(first), rest)) if first == "data" => {
                    walk(result.visible_data(), rest)
                }
                _ => walk(&result.envelope(), path),
            }
        };

        walked.map_err(|reason| ReferenceError::InvalidPath {
            reference: reference.raw.clone(),
            reason,
        })
    }

    fn resolve_reference(
        reference: &Reference,
        results: &ResultMap,
        mode: Mode<'_>,
    ) -> Result<Value, ReferenceError> {
        if let (Mode::Element(i, elements), true) = (mode, reference.iterates()) {
            let rest = reference.split_at_each().map(|(_, rest)| rest).unwrap_or_default();
            let element = elements
                .get(&reference.raw)
                .and_then(|items| items.get(i))
                .cloned()
                .unwrap_or(Value::Null);
            return walk(&element, rest).map_err(|reason| ReferenceError::InvalidPath {
                reference: reference.raw.clone(),
                reason,
            });
        }
        Self::lookup(reference, results)
    }

    fn substitute(value: &Value, results: &ResultMap, mode: Mode<'_>) -> Result<Value, ReferenceError> {
        match value {
            Value::String(s) => {
                if let Some(reference) = sole_reference(s) {
                    Self::resolve_reference(&reference, results, mode)
                } else if s.contains("{{") {
                    Self::interpolate(s, results, mode).map(Value::String)
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|v| Self::substitute(v, results, mode))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, v) in map {
                    out.insert(key.clone(), Self::substitute(v, results, mode)?);
                }
                Ok(Value::Object(out))
            }
            _ => Ok(value.clone()),
        }
    }

    fn interpolate(text: &str, results: &ResultMap, mode: Mode<'_>) -> Result<String, ReferenceError> {
        let mut out = String::with_capacity(text.len());
        for part in parse_template(text) {
            match part {
                TemplatePart::Text(t) => out.push_str(t),
                TemplatePart::Ref(reference) => {
                    let value = Self::resolve_reference(&reference, results, mode)?;
                    out.push_str(&value_to_text(&value));
                }
            }
        }
        Ok(out)
    }

    /// Per-element params for implicit iteration, or `None` when no
    /// reference iterates.
    fn expand_iterations(
        params: &Value,
        refs: &[Reference],
        results: &ResultMap,
    ) -> Result<Option<Vec<Value>>, ReferenceError> {
        let mut elements: HashMap<String, Vec<Value>> = HashMap::new();
        let mut driver: Option<(String, usize)> = None;

        for reference in refs.iter().filter(|r| r.iterates()) {
            if elements.contains_key(&reference.raw) {
                continue;
            }
            let prefix = reference.split_at_each().map(|(prefix, _)| prefix).unwrap_or_default();
            let items = match Self::walk_reference(reference, prefix, results)? {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(ReferenceError::InvalidPath {
                        reference: reference.raw.clone(),
                        reason: format!("cannot iterate over {}", type_name(&other)),
                    });
                }
            };

            match &driver {
                Some((first, first_len)) if *first_len != items.len() => {
                    return Err(ReferenceError::MismatchedArrays {
                        first: first.clone(),
                        first_len: *first_len,
                        other: reference.raw.clone(),
                        other_len: items.len(),
                    });
                }
                Some(_) => {}
                None => driver = Some((reference.raw.clone(), items.len())),
            }
            elements.insert(reference.raw.clone(), items);
        }

        let Some((_, len)) = driver else {
            return Ok(None);
        };

        (0..len)
            .map(|i| Self::substitute(params, results, Mode::Element(i, &elements)))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Step kinds that run once per element when their params iterate.
pub fn supports_implicit_iteration(kind: &StepKind) -> bool {
    matches!(
        kind,
        StepKind::PluginAction { .. } | StepKind::AiProcessing { .. } | StepKind::Transform { .. }
    )
}

/// Text form of a value inside an interpolated string. Null renders empty.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
