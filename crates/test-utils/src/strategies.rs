//! Proptest strategies for VM inventory domain types.
//!
//! Generators for the pagination properties: sorts, markers, and VM records
//! whose sortable fields collide often and are sometimes missing.
//!
//! # Usage
//!
//! ```no_run
//! use proptest::prelude::*;
//! use vm_inventory_test_utils::strategies;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(sort in strategies::arb_sort_string()) {
//!         // test invariant with a randomly generated sort
//!     }
//! }
//! ```

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use uuid::Uuid;
use vm_inventory_store::SortOrder;
use vm_inventory_types::{Record, config::PaginationConfig};

/// Generates an arbitrary UUID.
pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// Generates one of the default sortable fields.
pub fn arb_sort_field() -> impl Strategy<Value = String> {
    prop::sample::select(PaginationConfig::default().sortable_fields)
}

/// Generates `ASC` or `DESC`.
pub fn arb_sort_order() -> impl Strategy<Value = SortOrder> {
    prop_oneof![Just(SortOrder::Asc), Just(SortOrder::Desc)]
}

/// Generates a sort in wire form: `field`, `field.ASC`, `field.desc`, ...
pub fn arb_sort_string() -> impl Strategy<Value = String> {
    (arb_sort_field(), prop::sample::select(vec!["", ".ASC", ".DESC", ".asc", ".desc", ".Desc"]))
        .prop_map(|(field, suffix)| format!("{field}{suffix}"))
}

/// Generates a marker over any subset of sortable fields, with or without
/// the total-order field. Values are not type-checked.
pub fn arb_marker() -> impl Strategy<Value = Map<String, Value>> {
    (prop::sample::subsequence(PaginationConfig::default().sortable_fields, 0..4), arb_uuid())
        .prop_map(|(fields, uuid)| {
            let mut marker = Map::new();
            for field in fields {
                let value = if field == "uuid" { json!(uuid) } else { json!(format!("v-{field}")) };
                marker.insert(field, value);
            }
            marker
        })
}

/// Generates up to `max` VM records with distinct UUIDs.
///
/// `state` and `max_physical_memory` come from small domains so ties are
/// common, and each is absent from roughly one record in five.
pub fn arb_vm_records(max: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::btree_map(
        arb_uuid(),
        (
            prop::option::weighted(0.8, prop::sample::select(vec!["running", "stopped", "failed"])),
            prop::option::weighted(0.8, prop::sample::select(vec![128u64, 256, 1024])),
            0i64..5,
        ),
        0..=max,
    )
    .prop_map(|vms| {
        vms.into_iter()
            .map(|(uuid, (state, memory, day))| {
                vm_record(uuid, state, memory, 1_441_785_600_000 + day * 86_400_000)
            })
            .collect()
    })
}

/// Builds a VM record keyed by its UUID. `None` fields are left unset.
#[must_use]
pub fn vm_record(uuid: Uuid, state: Option<&str>, memory: Option<u64>, create_timestamp: i64) -> Record {
    let mut value = Map::new();
    value.insert("uuid".to_string(), json!(uuid));
    value.insert("owner_uuid".to_string(), json!(Uuid::nil()));
    value.insert("create_timestamp".to_string(), json!(create_timestamp));
    if let Some(state) = state {
        value.insert("state".to_string(), json!(state));
    }
    if let Some(memory) = memory {
        value.insert("max_physical_memory".to_string(), json!(memory));
    }
    Record::new(uuid.to_string(), value)
}
