//! Indexed search model.
//!
//! A [`FindQuery`] combines a [`Filter`] tree over indexed fields with an
//! ordered list of [`SortKey`]s and a limit/offset window. Backends reject
//! filters and sorts that reference unindexed fields.

use std::{cmp::Ordering, collections::BTreeSet, fmt};

use serde_json::Value;
use vm_inventory_types::RecordValue;

/// Page size the store applies when a search does not set a limit.
pub const DEFAULT_FIND_LIMIT: usize = 1000;

/// Predicate over the indexed fields of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every record.
    All,
    /// Field equals the value. On array fields, any element equals it.
    Eq(String, Value),
    /// Negation of [`Filter::Eq`]; matches records without the field.
    Ne(String, Value),
    /// Field is strictly less than the value.
    Lt(String, Value),
    /// Field is less than or equal to the value.
    Le(String, Value),
    /// Field is strictly greater than the value.
    Gt(String, Value),
    /// Field is greater than or equal to the value.
    Ge(String, Value),
    /// Field is set and not null.
    Present(String),
    /// Field is unset or null.
    Absent(String),
    /// Every sub-filter matches.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// `field = value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// Field is unset or null.
    pub fn absent(field: impl Into<String>) -> Self {
        Self::Absent(field.into())
    }

    /// Field is set.
    pub fn present(field: impl Into<String>) -> Self {
        Self::Present(field.into())
    }

    /// Conjunction, collapsing the trivial cases.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut filters: Vec<Filter> =
            filters.into_iter().filter(|f| !matches!(f, Self::All)).collect();
        match filters.len() {
            0 => Self::All,
            1 => filters.remove(0),
            _ => Self::And(filters),
        }
    }

    /// Disjunction.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    /// Returns every field the filter references.
    #[must_use]
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::All => {},
            Self::Eq(f, _)
            | Self::Ne(f, _)
            | Self::Lt(f, _)
            | Self::Le(f, _)
            | Self::Gt(f, _)
            | Self::Ge(f, _)
            | Self::Present(f)
            | Self::Absent(f) => {
                out.insert(f.as_str());
            },
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            },
        }
    }

    /// Evaluates the filter against a record value.
    #[must_use]
    pub fn matches(&self, record: &RecordValue) -> bool {
        match self {
            Self::All => true,
            Self::Eq(f, v) => field_matches(record, f, |o| o == Ordering::Equal, v),
            Self::Ne(f, v) => !field_matches(record, f, |o| o == Ordering::Equal, v),
            Self::Lt(f, v) => field_matches(record, f, |o| o == Ordering::Less, v),
            Self::Le(f, v) => field_matches(record, f, |o| o != Ordering::Greater, v),
            Self::Gt(f, v) => field_matches(record, f, |o| o == Ordering::Greater, v),
            Self::Ge(f, v) => field_matches(record, f, |o| o != Ordering::Less, v),
            Self::Present(f) => record.get(f).is_some_and(|v| !v.is_null()),
            Self::Absent(f) => record.get(f).is_none_or(Value::is_null),
            Self::And(children) => children.iter().all(|c| c.matches(record)),
            Self::Or(children) => children.iter().any(|c| c.matches(record)),
        }
    }
}

/// Applies `accept` to the ordering of the field against `value`. Array
/// fields match if any element does.
fn field_matches(
    record: &RecordValue,
    field: &str,
    accept: impl Fn(Ordering) -> bool,
    value: &Value,
) -> bool {
    match record.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) if !value.is_array() => {
            items.iter().any(|item| compare_values(item, value).is_some_and(&accept))
        },
        Some(stored) => compare_values(stored, value).is_some_and(accept),
    }
}

/// Compares two scalar values of the same JSON type.
///
/// Returns `None` for mismatched or non-comparable types.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                match compare_values(l, r)? {
                    Ordering::Equal => {},
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        },
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

/// Total order used for sorting: values of one type compare naturally,
/// mixed types by type, and missing or null values sort last.
fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare_values(x, y)
            .unwrap_or_else(|| type_rank(x).cmp(&type_rank(y))),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    /// Parses `ASC` or `DESC`, ignoring case.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("ASC") {
            Some(Self::Asc)
        } else if raw.eq_ignore_ascii_case("DESC") {
            Some(Self::Desc)
        } else {
            None
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sort key of a search.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    /// Indexed field.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl SortKey {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), order: SortOrder::Asc }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), order: SortOrder::Desc }
    }

    /// Compares two records on this key.
    #[must_use]
    pub fn compare(&self, a: &RecordValue, b: &RecordValue) -> Ordering {
        let ordering = sort_cmp(a.get(&self.field), b.get(&self.field));
        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Compares two records on a list of sort keys.
#[must_use]
pub fn compare_records(sort: &[SortKey], a: &RecordValue, b: &RecordValue) -> Ordering {
    sort.iter()
        .map(|key| key.compare(a, b))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// An indexed search.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// Records must match this filter.
    pub filter: Filter,
    /// Sort keys, most significant first.
    pub sort: Vec<SortKey>,
    /// Maximum number of records returned.
    pub limit: usize,
    /// Records skipped before the window starts.
    pub offset: usize,
}

impl FindQuery {
    /// Creates an unsorted search with the default limit.
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self { filter, sort: Vec::new(), limit: DEFAULT_FIND_LIMIT, offset: 0 }
    }

    /// Appends a sort key.
    #[must_use]
    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Sets the limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Returns every field referenced by the filter or the sort.
    #[must_use]
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut fields = self.filter.fields();
        fields.extend(self.sort.iter().map(|k| k.field.as_str()));
        fields
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("(*)"),
            Self::Eq(k, v) => write!(f, "({k}={v})"),
            Self::Ne(k, v) => write!(f, "(!({k}={v}))"),
            Self::Lt(k, v) => write!(f, "({k}<{v})"),
            Self::Le(k, v) => write!(f, "({k}<={v})"),
            Self::Gt(k, v) => write!(f, "({k}>{v})"),
            Self::Ge(k, v) => write!(f, "({k}>={v})"),
            Self::Present(k) => write!(f, "({k}=*)"),
            Self::Absent(k) => write!(f, "(!({k}=*))"),
            Self::And(children) | Self::Or(children) => {
                f.write_str(if matches!(self, Self::And(_)) { "(&" } else { "(|" })?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            },
        }
    }
}
