//! Query model: filters, ordering and paging bounds.
//!
//! A [`Query`] is an ordered conjunction of [`Filter`]s plus an optional
//! sort key, limit, offset and cursor. Stores translate it to their native
//! query language; [`Filter::matches`] gives the reference semantics.

use crate::document::{get_path, Document, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator of a single filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Field equals any element of the array operand.
    In,
    /// Array field contains the operand.
    ArrayContains,
    /// Array field contains any element of the array operand.
    ArrayContainsAny,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOp::Eq => "==",
            FilterOp::NotEq => "!=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::In => "in",
            FilterOp::ArrayContains => "array-contains",
            FilterOp::ArrayContainsAny => "array-contains-any",
        };
        f.write_str(s)
    }
}

/// `(field, operator, value)` triple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Filter {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::new(field, FilterOp::Eq, value)
    }

    /// Evaluate the filter against a document.
    ///
    /// A missing field never matches, including for `!=`, which mirrors how
    /// managed document stores treat absent fields.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = get_path(doc, &self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual.loose_eq(&self.value),
            FilterOp::NotEq => !actual.loose_eq(&self.value) && !actual.is_null(),
            FilterOp::Lt => same_kind(actual, &self.value) && actual.total_cmp(&self.value).is_lt(),
            FilterOp::Lte => same_kind(actual, &self.value) && actual.total_cmp(&self.value).is_le(),
            FilterOp::Gt => same_kind(actual, &self.value) && actual.total_cmp(&self.value).is_gt(),
            FilterOp::Gte => same_kind(actual, &self.value) && actual.total_cmp(&self.value).is_ge(),
            FilterOp::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| actual.loose_eq(c)),
                _ => false,
            },
            FilterOp::ArrayContains => match actual {
                Value::Array(items) => items.iter().any(|i| i.loose_eq(&self.value)),
                _ => false,
            },
            FilterOp::ArrayContainsAny => match (actual, &self.value) {
                (Value::Array(items), Value::Array(candidates)) => items
                    .iter()
                    .any(|i| candidates.iter().any(|c| i.loose_eq(c))),
                _ => false,
            },
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.field, self.op, self.value)
    }
}

/// Range filters only match values of the same type class.
fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Integer(_) | Value::Double(_), Value::Integer(_) | Value::Double(_))
            | (Value::String(_), Value::String(_))
            | (Value::Timestamp(_), Value::Timestamp(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Sort key and direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Store query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Resume after the document with this id (in query order).
    pub start_after: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn with_filters(filters: impl IntoIterator<Item = Filter>) -> Self {
        Query {
            filters: filters.into_iter().collect(),
            ..Query::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn start_after(mut self, id: impl Into<String>) -> Self {
        self.start_after = Some(id.into());
        self
    }

    /// True when every filter matches.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::document_from_json;
    use serde_json::json;

    fn doc() -> Document {
        document_from_json(json!({
            "name": "Widget",
            "price": 12.5,
            "stock": 3,
            "tags": ["sale", "new"],
            "status": "active"
        }))
        .unwrap()
    }

    #[test]
    fn test_comparison_operators() {
        let d = doc();
        assert!(Filter::new("price", FilterOp::Gt, 10).matches(&d));
        assert!(Filter::new("stock", FilterOp::Lte, 3).matches(&d));
        assert!(!Filter::new("stock", FilterOp::Lt, 3).matches(&d));
        assert!(Filter::new("name", FilterOp::NotEq, "Gadget").matches(&d));
        assert!(!Filter::new("name", FilterOp::Gt, 1).matches(&d));
    }

    #[test]
    fn test_membership_operators() {
        let d = doc();
        assert!(Filter::new("status", FilterOp::In, vec!["active", "draft"]).matches(&d));
        assert!(Filter::new("tags", FilterOp::ArrayContains, "sale").matches(&d));
        assert!(Filter::new("tags", FilterOp::ArrayContainsAny, vec!["x", "new"]).matches(&d));
        assert!(!Filter::new("tags", FilterOp::ArrayContainsAny, vec!["x"]).matches(&d));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let d = doc();
        assert!(!Filter::new("brand", FilterOp::NotEq, "acme").matches(&d));
        assert!(!Filter::eq("brand", Value::Null).matches(&d));
    }

    #[test]
    fn test_query_is_conjunction() {
        let d = doc();
        let q = Query::new()
            .filter(Filter::eq("status", "active"))
            .filter(Filter::new("stock", FilterOp::Gt, 5));
        assert!(!q.matches(&d));
    }
}
