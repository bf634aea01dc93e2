//! Label selector expressions for store list queries

use crate::metadata::Metadata;
use std::collections::{BTreeMap, BTreeSet};

type Map = BTreeMap<String, String>;

/// A single selector term. Terms AND together inside a [`Selector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    /// `key == value`
    Equal(String, String),
    /// `key` present, any value (including empty)
    Exists(String),
    /// `key` absent
    NotExists(String),
    /// `key` present and value one of the given set
    In(String, BTreeSet<String>),
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::NotExists(key) => !labels.contains_key(key),
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
        }
    }
}

/// AND-composition of label [`Expression`]s plus an optional id prefix.
///
/// An empty selector matches everything in the queried `(type, namespace)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    expressions: Vec<Expression>,
    id_prefix: Option<String>,
}

impl Selector {
    /// Require `key == value`.
    #[must_use]
    pub fn equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expressions
            .push(Expression::Equal(key.into(), value.into()));
        self
    }

    /// Require `key` to be present.
    #[must_use]
    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.expressions.push(Expression::Exists(key.into()));
        self
    }

    /// Require `key` to be absent.
    #[must_use]
    pub fn not_exists(mut self, key: impl Into<String>) -> Self {
        self.expressions.push(Expression::NotExists(key.into()));
        self
    }

    /// Require the value of `key` to be one of `values`.
    #[must_use]
    pub fn is_in<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expressions.push(Expression::In(
            key.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Restrict matches to ids starting with `prefix`.
    #[must_use]
    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    /// Whether this selector matches every resource.
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.expressions.is_empty() && self.id_prefix.is_none()
    }

    /// The selector terms, in insertion order.
    #[must_use]
    pub fn expressions(&self) -> &[Expression] {
        &self.expressions
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !metadata.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.matches_labels(&metadata.labels)
    }

    pub fn matches_labels(&self, labels: &Map) -> bool {
        self.expressions.iter().all(|expr| expr.matches(labels))
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Selector {
            expressions: iter
                .into_iter()
                .map(|(k, v)| Expression::Equal(k, v))
                .collect(),
            id_prefix: None,
        }
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Selector {
            expressions: vec![value],
            id_prefix: None,
        }
    }
}
