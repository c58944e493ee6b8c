//! Marker pagination configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

fn default_total_order_field() -> String {
    "uuid".to_string()
}

/// Fields of the `vms` bucket that are indexed and may be sorted on.
fn default_sortable_fields() -> Vec<String> {
    [
        "uuid",
        "owner_uuid",
        "image_uuid",
        "billing_id",
        "server_uuid",
        "package_name",
        "package_version",
        "tags",
        "brand",
        "state",
        "alias",
        "max_physical_memory",
        "create_timestamp",
        "docker",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_timestamp_fields() -> Vec<String> {
    vec!["create_timestamp".to_string()]
}

fn default_number_fields() -> Vec<String> {
    vec!["max_physical_memory".to_string(), "create_timestamp".to_string()]
}

fn default_boolean_fields() -> Vec<String> {
    vec!["docker".to_string()]
}

fn default_array_fields() -> Vec<String> {
    vec!["tags".to_string()]
}

/// JSON type a marker value must have for a sortable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Boolean,
    /// An array of strings.
    StringArray,
}

impl FieldKind {
    /// Lowercase name used in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::StringArray => "an array of strings",
        }
    }
}

/// Sort and marker rules for paginated listings.
///
/// The total-order field must be unique per record; it breaks ties so that
/// every sort produces a total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PaginationConfig {
    /// Field unique per record, required in every marker.
    #[serde(default = "default_total_order_field")]
    pub total_order_field: String,
    /// Allow-list of indexed fields usable in sorts and markers.
    #[serde(default = "default_sortable_fields")]
    pub sortable_fields: Vec<String>,
    /// Sortable fields holding timestamps, converted to epoch milliseconds
    /// when parsed from a marker.
    #[serde(default = "default_timestamp_fields")]
    pub timestamp_fields: Vec<String>,
    /// Sortable fields indexed as numbers.
    #[serde(default = "default_number_fields")]
    pub number_fields: Vec<String>,
    /// Sortable fields indexed as booleans.
    #[serde(default = "default_boolean_fields")]
    pub boolean_fields: Vec<String>,
    /// Sortable fields indexed as string arrays. Every other sortable field
    /// is a string.
    #[serde(default = "default_array_fields")]
    pub array_fields: Vec<String>,
}

#[bon::bon]
impl PaginationConfig {
    /// Creates a new pagination configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the total-order field or a
    /// typed field is not sortable.
    #[builder]
    pub fn new(
        #[builder(default = default_total_order_field())] total_order_field: String,
        #[builder(default = default_sortable_fields())] sortable_fields: Vec<String>,
        #[builder(default = default_timestamp_fields())] timestamp_fields: Vec<String>,
        #[builder(default = default_number_fields())] number_fields: Vec<String>,
        #[builder(default = default_boolean_fields())] boolean_fields: Vec<String>,
        #[builder(default = default_array_fields())] array_fields: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            total_order_field,
            sortable_fields,
            timestamp_fields,
            number_fields,
            boolean_fields,
            array_fields,
        };
        config.validate()?;
        Ok(config)
    }
}

impl PaginationConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on an inconsistent field set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_sortable(&self.total_order_field) {
            return Err(ConfigError::Validation {
                message: format!(
                    "total_order_field {} must be one of sortable_fields",
                    self.total_order_field
                ),
            });
        }
        let typed = [
            ("timestamp", &self.timestamp_fields),
            ("number", &self.number_fields),
            ("boolean", &self.boolean_fields),
            ("array", &self.array_fields),
        ];
        for (kind, fields) in typed {
            if let Some(field) = fields.iter().find(|f| !self.is_sortable(f)) {
                return Err(ConfigError::Validation {
                    message: format!("{kind} field {field} must be one of sortable_fields"),
                });
            }
        }
        let kinds = [&self.number_fields, &self.boolean_fields, &self.array_fields];
        for (i, fields) in kinds.iter().enumerate() {
            if let Some(field) =
                fields.iter().find(|f| kinds[i + 1..].iter().any(|other| other.contains(f)))
            {
                return Err(ConfigError::Validation {
                    message: format!("field {field} has more than one type"),
                });
            }
        }
        Ok(())
    }

    /// Returns true if `field` is in the sortable allow-list.
    #[must_use]
    pub fn is_sortable(&self, field: &str) -> bool {
        self.sortable_fields.iter().any(|f| f == field)
    }

    /// Returns true if `field` holds a timestamp.
    #[must_use]
    pub fn is_timestamp(&self, field: &str) -> bool {
        self.timestamp_fields.iter().any(|f| f == field)
    }

    /// JSON type of a sortable field's marker value.
    #[must_use]
    pub fn field_kind(&self, field: &str) -> FieldKind {
        let listed = |fields: &[String]| fields.iter().any(|f| f == field);
        if listed(&self.number_fields) {
            FieldKind::Number
        } else if listed(&self.boolean_fields) {
            FieldKind::Boolean
        } else if listed(&self.array_fields) {
            FieldKind::StringArray
        } else {
            FieldKind::String
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            total_order_field: default_total_order_field(),
            sortable_fields: default_sortable_fields(),
            timestamp_fields: default_timestamp_fields(),
            number_fields: default_number_fields(),
            boolean_fields: default_boolean_fields(),
            array_fields: default_array_fields(),
        }
    }
}
