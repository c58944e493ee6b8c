//! Buckets and data migrations of the VM inventory.

use serde_json::{Map, Value};
use vm_inventory_types::{BucketDescriptor, DATA_VERSION_FIELD, IndexDefinition, IndexType, Record};

use crate::migrations::{DataMigration, ModelMigrations};

/// Bucket holding VM objects, keyed by VM UUID.
pub const VMS_BUCKET: &str = "vms";
/// Bucket mapping servers to the VMs they host.
pub const SERVER_VMS_BUCKET: &str = "server_vms";
/// Bucket holding role tags per VM.
pub const VM_ROLE_TAGS_BUCKET: &str = "vm_role_tags";
/// Bucket holding VM migration records.
pub const VM_MIGRATIONS_BUCKET: &str = "vm_migrations";

/// Field derived from `internal_metadata` so it can be searched.
pub const INTERNAL_METADATA_SEARCH_FIELD: &str = "internal_metadata_search_array";

/// Schema of the `vms` bucket.
///
/// Version 2 added the `internal_metadata_search_array` index.
#[must_use]
pub fn vms_bucket() -> BucketDescriptor {
    let string_array = IndexDefinition::new(IndexType::StringArray);
    BucketDescriptor::new(VMS_BUCKET, 2)
        .with_index("uuid", IndexDefinition::string().unique())
        .with_index("owner_uuid", IndexDefinition::string())
        .with_index("image_uuid", IndexDefinition::string())
        .with_index("billing_id", IndexDefinition::string())
        .with_index("server_uuid", IndexDefinition::string())
        .with_index("package_name", IndexDefinition::string())
        .with_index("package_version", IndexDefinition::string())
        .with_index("tags", string_array)
        .with_index("brand", IndexDefinition::string())
        .with_index("state", IndexDefinition::string())
        .with_index("alias", IndexDefinition::string())
        .with_index("max_physical_memory", IndexDefinition::number())
        .with_index("create_timestamp", IndexDefinition::number())
        .with_index("docker", IndexDefinition::boolean())
        .with_index(INTERNAL_METADATA_SEARCH_FIELD, string_array)
        .with_index(DATA_VERSION_FIELD, IndexDefinition::number())
}

/// Every bucket the inventory needs.
#[must_use]
pub fn buckets() -> Vec<BucketDescriptor> {
    vec![
        vms_bucket(),
        BucketDescriptor::new(SERVER_VMS_BUCKET, 1),
        BucketDescriptor::new(VM_ROLE_TAGS_BUCKET, 1)
            .with_index("role_tags", IndexDefinition::new(IndexType::StringArray)),
        BucketDescriptor::new(VM_MIGRATIONS_BUCKET, 1)
            .with_index("vm_uuid", IndexDefinition::string())
            .with_index("source_server_uuid", IndexDefinition::string())
            .with_index("target_server_uuid", IndexDefinition::string())
            .with_index("phase", IndexDefinition::string())
            .with_index("state", IndexDefinition::string())
            .with_index("created_timestamp", IndexDefinition::number()),
    ]
}

/// Every model's data migrations.
#[must_use]
pub fn migrations() -> Vec<ModelMigrations> {
    vec![ModelMigrations::new("vms", VMS_BUCKET).with_migration(DataMigration::new(
        1,
        "add-internal-metadata-search-array",
        add_internal_metadata_search_array,
    ))]
}

/// Sets `internal_metadata_search_array` to one `key=value` entry per scalar
/// in `internal_metadata`.
///
/// `internal_metadata` may be stored as an object or as a JSON string
/// encoding one. Records without it get no search array.
pub fn add_internal_metadata_search_array(mut record: Record) -> Record {
    let metadata = match record.field("internal_metadata") {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(raw)) => serde_json::from_str::<Map<String, Value>>(raw).ok(),
        _ => None,
    };
    let Some(metadata) = metadata else {
        return record;
    };

    let search: Vec<Value> = metadata
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some(Value::String(format!("{key}={rendered}")))
        })
        .collect();
    record.value.insert(INTERNAL_METADATA_SEARCH_FIELD.to_string(), Value::Array(search));
    record
}
