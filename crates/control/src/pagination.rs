//! Marker-based pagination.
//!
//! A listing sorted on `field.ORDER` is resumed from a marker: a JSON object
//! holding the sort field's value and the total-order field's value (`uuid`)
//! of the last record the client saw. Because the total-order field is unique
//! and always breaks ties, the resume predicate
//!
//! ```text
//! (field > m) OR (field = m AND uuid > u)        -- ASC
//! (field < m) OR (field = m AND uuid > u)        -- DESC
//! ```
//!
//! selects exactly the records after the marker, even while records are
//! inserted or removed between pages. Records missing the sort field sort
//! after every other record in ascending order and before them in
//! descending order; the predicate accounts for them as well.
//!
//! Markers are validated against the sort before they are used:
//!
//! - the marker must contain the total-order field
//! - the sort field must be a marker key
//! - every other marker key must be the sort field

use std::fmt;

use chrono::DateTime;
use serde_json::{Map, Value};
use vm_inventory_store::{Filter, FindQuery, SortKey, SortOrder, query::compare_values};
use vm_inventory_types::{
    Record,
    config::{FieldKind, PaginationConfig},
};

/// A parsed pagination marker.
pub type Marker = Map<String, Value>;

/// Result of [`MarkerPaginator::parse_marker`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedMarker {
    /// The marker, present when parsing produced no error.
    pub marker: Option<Marker>,
    /// One message per problem.
    pub errors: Vec<String>,
}

/// A parsed `field[.ORDER]` sort.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortCriteria {
    /// Sorted field.
    pub field: String,
    /// Direction, ascending when omitted.
    pub order: SortOrder,
}

impl SortCriteria {
    /// Sort key for the store.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey { field: self.field.clone(), order: self.order }
    }
}

impl fmt::Display for SortCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.field, self.order)
    }
}

/// Validates markers and sorts, and turns them into page queries.
#[derive(Debug, Clone, Default)]
pub struct MarkerPaginator {
    config: PaginationConfig,
}

impl MarkerPaginator {
    /// Creates a paginator.
    #[must_use]
    pub fn new(config: PaginationConfig) -> Self {
        Self { config }
    }

    /// Field breaking ties in every sort.
    #[must_use]
    pub fn total_order_field(&self) -> &str {
        &self.config.total_order_field
    }

    // =========================================================================
    // Sort criteria
    // =========================================================================

    /// Parses `field[.ORDER]`. An empty string means no explicit sort.
    ///
    /// # Errors
    ///
    /// Returns a message if the field is not sortable or the order is
    /// neither `ASC` nor `DESC` (in any case).
    pub fn parse_sort(&self, raw: &str) -> Result<Option<SortCriteria>, String> {
        if raw.is_empty() {
            return Ok(None);
        }
        let (field, order) = match raw.split_once('.') {
            Some((field, order)) => {
                let order = SortOrder::parse(order)
                    .ok_or_else(|| format!("invalid sort order {order:?} in {raw:?}"))?;
                (field, order)
            },
            None => (raw, SortOrder::Asc),
        };
        if !self.config.is_sortable(field) {
            return Err(format!("invalid sort field {field:?}"));
        }
        Ok(Some(SortCriteria { field: field.to_string(), order }))
    }

    /// Returns true if `raw` is a valid sort, or empty.
    #[must_use]
    pub fn is_valid_sort_criteria(&self, raw: &str) -> bool {
        self.parse_sort(raw).is_ok()
    }

    // =========================================================================
    // Markers
    // =========================================================================

    /// Parses a marker from its JSON form. Never fails; problems are
    /// reported in [`ParsedMarker::errors`].
    ///
    /// Timestamp fields may be given as RFC 3339 strings or epoch
    /// milliseconds and are normalized to epoch milliseconds. Other values
    /// must match the field's indexed type or be null.
    #[must_use]
    pub fn parse_marker(&self, raw: &str) -> ParsedMarker {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return ParsedMarker { marker: None, errors: vec![format!("marker is not valid JSON: {e}")] };
            },
        };
        let Value::Object(object) = value else {
            return ParsedMarker {
                marker: None,
                errors: vec!["marker must be a JSON object".to_string()],
            };
        };

        let mut errors = Vec::new();
        let mut marker = Marker::new();
        for (key, value) in object {
            if !self.config.is_sortable(&key) {
                errors.push(format!("marker key {key:?} is not a sortable field"));
                continue;
            }
            if self.config.is_timestamp(&key) {
                match timestamp_millis(&value) {
                    Some(ms) => {
                        marker.insert(key, ms);
                    },
                    None => errors.push(format!("marker key {key:?} is not a valid timestamp")),
                }
                continue;
            }
            let kind = self.config.field_kind(&key);
            if !value_has_kind(&value, kind) {
                errors.push(format!("marker key {key:?} must be {}", kind.as_str()));
                continue;
            }
            marker.insert(key, value);
        }

        if errors.is_empty() {
            ParsedMarker { marker: Some(marker), errors }
        } else {
            ParsedMarker { marker: None, errors }
        }
    }

    /// Checks a marker against the sort it resumes.
    ///
    /// Returns one message per violated rule; empty means the pair defines
    /// a total order.
    #[must_use]
    pub fn validate_marker(&self, marker: &Marker, sort: Option<&SortCriteria>) -> Vec<String> {
        let total = self.total_order_field();
        let mut errors = Vec::new();

        if marker.get(total).is_none_or(Value::is_null) {
            errors.push(format!("marker must contain {total}"));
        }
        if let Some(sort) = sort
            && sort.field != total
            && !marker.contains_key(&sort.field)
        {
            errors.push(format!("marker must contain the sort field {}", sort.field));
        }
        for key in marker.keys() {
            if key != total && sort.is_none_or(|s| s.field != *key) {
                errors.push(format!("marker key {key} is not the sort field"));
            }
        }
        errors
    }

    /// Returns true if every marker key equals the record's field value.
    #[must_use]
    pub fn marker_identifies_record(&self, marker: &Marker, record: &Record) -> bool {
        marker.iter().all(|(key, expected)| match (record.field(key), expected) {
            (None | Some(Value::Null), Value::Null) => true,
            (Some(actual), expected) => {
                compare_values(actual, expected) == Some(std::cmp::Ordering::Equal)
            },
            (None, _) => false,
        })
    }

    /// Builds the marker resuming after `record`.
    ///
    /// Returns `None` if the record has no total-order value.
    #[must_use]
    pub fn marker_from_record(&self, record: &Record, sort: Option<&SortCriteria>) -> Option<Marker> {
        let total = self.total_order_field();
        let mut marker = Marker::new();
        marker.insert(total.to_string(), record.field(total).filter(|v| !v.is_null())?.clone());
        if let Some(sort) = sort.filter(|s| s.field != total) {
            marker.insert(sort.field.clone(), record.field(&sort.field).cloned().unwrap_or(Value::Null));
        }
        Some(marker)
    }

    // =========================================================================
    // Page queries
    // =========================================================================

    /// Builds the query for one page.
    ///
    /// `filter` restricts the listing; the marker, when given, must pass
    /// [`validate_marker`](Self::validate_marker).
    ///
    /// # Errors
    ///
    /// Returns the marker validation errors.
    pub fn page_query(
        &self,
        filter: Filter,
        sort: Option<&SortCriteria>,
        marker: Option<&Marker>,
        limit: usize,
    ) -> Result<FindQuery, Vec<String>> {
        let total = self.total_order_field();
        let sort = sort.filter(|s| s.field != total || s.order == SortOrder::Desc);

        let mut query = match sort {
            Some(s) if s.field == total => FindQuery::new(Filter::All).with_sort(s.sort_key()),
            Some(s) => FindQuery::new(Filter::All)
                .with_sort(s.sort_key())
                .with_sort(SortKey::asc(total)),
            None => FindQuery::new(Filter::All).with_sort(SortKey::asc(total)),
        };

        let resume = match marker {
            None => Filter::All,
            Some(marker) => {
                let errors = self.validate_marker(marker, sort);
                if !errors.is_empty() {
                    return Err(errors);
                }
                let last = marker.get(total).cloned().unwrap_or(Value::Null);
                match sort {
                    None => Filter::Gt(total.to_string(), last),
                    Some(s) if s.field == total => Filter::Lt(total.to_string(), last),
                    Some(s) => {
                        let value = marker.get(&s.field).cloned().unwrap_or(Value::Null);
                        resume_after(&s.field, s.order, value, total, last)
                    },
                }
            },
        };

        query.filter = Filter::and([filter, resume]);
        query.limit = limit;
        Ok(query)
    }
}

/// Predicate for records strictly after `(value, last)` in a
/// `field ORDER, total ASC` sort where missing values sort last.
fn resume_after(field: &str, order: SortOrder, value: Value, total: &str, last: Value) -> Filter {
    let tie_break = Filter::Gt(total.to_string(), last);
    if value.is_null() {
        let rest_of_missing = Filter::and([Filter::absent(field), tie_break]);
        return match order {
            SortOrder::Asc => rest_of_missing,
            SortOrder::Desc => Filter::or([Filter::present(field), rest_of_missing]),
        };
    }
    let ties = Filter::and([Filter::Eq(field.to_string(), value.clone()), tie_break]);
    match order {
        SortOrder::Asc => {
            Filter::or([Filter::Gt(field.to_string(), value), ties, Filter::absent(field)])
        },
        SortOrder::Desc => Filter::or([Filter::Lt(field.to_string(), value), ties]),
    }
}

/// Normalizes a marker timestamp to epoch milliseconds.
fn timestamp_millis(value: &Value) -> Option<Value> {
    match value {
        Value::Null => Some(Value::Null),
        Value::Number(n) => n.as_i64().map(Value::from),
        Value::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Some(Value::from(ms));
            }
            DateTime::parse_from_rfc3339(s).ok().map(|dt| Value::from(dt.timestamp_millis()))
        },
        _ => None,
    }
}

/// Null is accepted for every kind: records may lack the field.
fn value_has_kind(value: &Value, kind: FieldKind) -> bool {
    match (value, kind) {
        (Value::Null, _)
        | (Value::String(_), FieldKind::String)
        | (Value::Number(_), FieldKind::Number)
        | (Value::Bool(_), FieldKind::Boolean) => true,
        (Value::Array(items), FieldKind::StringArray) => items.iter().all(Value::is_string),
        _ => false,
    }
}
