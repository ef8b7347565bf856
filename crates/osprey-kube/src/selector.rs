//! Label and field selectors with pluggable attribute extraction.
//!
//! # Purpose
//! List and watch requests filter objects through a selection predicate:
//! a label selector, a field selector, and a kind-specific attribute
//! extractor that decides which fields a kind exposes (Secret additionally
//! exposes `type`). Both selectors default to match-everything.
//!
//! The label grammar covers the forms Kubernetes clients actually send:
//! `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k`, `!k`, joined
//! by top-level commas. Field selectors support the equality forms only.

use crate::object::KubeObject;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Labels and fields one object exposes to selector matching.
#[derive(Clone, Debug, Default)]
pub struct Attributes {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

/// Kind-specific attribute extractor supplied at registration time.
pub type AttrFn<O> = Arc<dyn Fn(&O) -> Attributes + Send + Sync>;

/// Default extractor for namespace-scoped kinds: labels plus
/// `metadata.name` / `metadata.namespace`.
pub fn namespace_scoped_attrs<O: KubeObject>() -> AttrFn<O> {
    Arc::new(|obj: &O| {
        let mut fields = BTreeMap::new();
        fields.insert("metadata.name".to_string(), obj.name().to_string());
        fields.insert("metadata.namespace".to_string(), obj.namespace().to_string());
        Attributes {
            labels: obj.labels(),
            fields,
        }
    })
}

/// Default extractor for cluster-scoped kinds: labels plus `metadata.name`.
pub fn cluster_scoped_attrs<O: KubeObject>() -> AttrFn<O> {
    Arc::new(|obj: &O| {
        let mut fields = BTreeMap::new();
        fields.insert("metadata.name".to_string(), obj.name().to_string());
        Attributes {
            labels: obj.labels(),
            fields,
        }
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, attrs: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Eq(key, value) => attrs.get(key).is_some_and(|v| v == value),
            Requirement::NotEq(key, value) => attrs.get(key).is_none_or(|v| v != value),
            Requirement::In(key, values) => attrs.get(key).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(key, values) => attrs.get(key).is_none_or(|v| !values.contains(v)),
            Requirement::Exists(key) => attrs.contains_key(key),
            Requirement::DoesNotExist(key) => !attrs.contains_key(key),
        }
    }
}

/// Splits on commas that are not inside a `(...)` value set.
fn split_requirements(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}

fn parse_value_set(raw: &str) -> Result<Vec<String>, String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("expected a parenthesized value set, got {trimmed:?}"))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

fn parse_requirement(raw: &str) -> Result<Requirement, String> {
    let req = raw.trim();
    if req.is_empty() {
        return Err("empty selector requirement".to_string());
    }
    if let Some(key) = req.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key.trim().to_string()));
    }
    if let Some((key, values)) = req.split_once(" notin ") {
        return Ok(Requirement::NotIn(
            key.trim().to_string(),
            parse_value_set(values)?,
        ));
    }
    if let Some((key, values)) = req.split_once(" in ") {
        return Ok(Requirement::In(
            key.trim().to_string(),
            parse_value_set(values)?,
        ));
    }
    if let Some((key, value)) = req.split_once("!=") {
        return Ok(Requirement::NotEq(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = req.split_once("==") {
        return Ok(Requirement::Eq(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = req.split_once('=') {
        return Ok(Requirement::Eq(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }
    Ok(Requirement::Exists(req.to_string()))
}

/// Parsed label selector. An empty selector matches everything.
#[derive(Clone, Debug, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::everything());
        }
        let requirements = split_requirements(input)
            .iter()
            .map(|part| parse_requirement(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Parsed field selector: equality forms only, matching upstream semantics.
#[derive(Clone, Debug, Default)]
pub struct FieldSelector {
    requirements: Vec<Requirement>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::everything());
        }
        let mut requirements = Vec::new();
        for part in split_requirements(input) {
            let req = parse_requirement(&part)?;
            match req {
                Requirement::Eq(..) | Requirement::NotEq(..) => requirements.push(req),
                _ => return Err(format!("invalid field selector requirement: {part:?}")),
            }
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, fields: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(fields))
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Raw selector strings as they arrive on a list/watch request.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Label selector + field selector + attribute extractor for one kind.
pub struct SelectionPredicate<O> {
    label: LabelSelector,
    field: FieldSelector,
    attrs: AttrFn<O>,
}

impl<O> Clone for SelectionPredicate<O> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            field: self.field.clone(),
            attrs: Arc::clone(&self.attrs),
        }
    }
}

impl<O: KubeObject> SelectionPredicate<O> {
    pub fn new(label: LabelSelector, field: FieldSelector, attrs: AttrFn<O>) -> Self {
        Self { label, field, attrs }
    }

    /// Builds a predicate from raw request options. Unparsable selectors are
    /// a caller error, reported as `BadRequest` by the storage layer.
    pub fn from_options(options: &ListOptions, attrs: AttrFn<O>) -> Result<Self, String> {
        let label = match &options.label_selector {
            Some(raw) => LabelSelector::parse(raw)?,
            None => LabelSelector::everything(),
        };
        let field = match &options.field_selector {
            Some(raw) => FieldSelector::parse(raw)?,
            None => FieldSelector::everything(),
        };
        Ok(Self::new(label, field, attrs))
    }

    pub fn matches(&self, obj: &O) -> bool {
        if self.label.is_everything() && self.field.is_everything() {
            return true;
        }
        let attrs = (self.attrs)(obj);
        self.label.matches(&attrs.labels) && self.field.matches(&attrs.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::parse("").expect("parse");
        assert!(sel.is_everything());
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("app", "x")])));
    }

    #[test]
    fn equality_and_inequality() {
        let sel = LabelSelector::parse("app=x,tier!=db").expect("parse");
        assert!(sel.matches(&labels(&[("app", "x"), ("tier", "web")])));
        assert!(sel.matches(&labels(&[("app", "x")])));
        assert!(!sel.matches(&labels(&[("app", "x"), ("tier", "db")])));
        assert!(!sel.matches(&labels(&[("app", "y")])));
    }

    #[test]
    fn set_based_requirements() {
        let sel = LabelSelector::parse("env in (prod, staging),region notin (eu)").expect("parse");
        assert!(sel.matches(&labels(&[("env", "prod"), ("region", "us")])));
        assert!(sel.matches(&labels(&[("env", "staging")])));
        assert!(!sel.matches(&labels(&[("env", "dev")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("region", "eu")])));
    }

    #[test]
    fn existence_requirements() {
        let sel = LabelSelector::parse("app,!legacy").expect("parse");
        assert!(sel.matches(&labels(&[("app", "x")])));
        assert!(!sel.matches(&labels(&[("app", "x"), ("legacy", "true")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn field_selector_rejects_set_based_forms() {
        assert!(FieldSelector::parse("type=Opaque").is_ok());
        assert!(FieldSelector::parse("metadata.name!=a").is_ok());
        assert!(FieldSelector::parse("type in (a,b)").is_err());
    }

    #[test]
    fn predicate_combines_labels_and_fields() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm1".to_string());
        cm.metadata.namespace = Some("osprey-system".to_string());
        cm.metadata.labels = Some(labels(&[("app", "x")]));

        let options = ListOptions {
            label_selector: Some("app=x".to_string()),
            field_selector: Some("metadata.name=cm1".to_string()),
        };
        let predicate =
            SelectionPredicate::from_options(&options, namespace_scoped_attrs::<ConfigMap>())
                .expect("predicate");
        assert!(predicate.matches(&cm));

        let miss = ListOptions {
            label_selector: Some("app=x".to_string()),
            field_selector: Some("metadata.name=other".to_string()),
        };
        let predicate =
            SelectionPredicate::from_options(&miss, namespace_scoped_attrs::<ConfigMap>())
                .expect("predicate");
        assert!(!predicate.matches(&cm));
    }
}
