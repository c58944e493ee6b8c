//! Fuzz target for pagination marker parsing.
//!
//! `parse_marker` must never panic on arbitrary input, and any marker that
//! passes validation must turn into a page query.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vm_inventory_control::MarkerPaginator;
use vm_inventory_store::Filter;

const SORTS: [Option<&str>; 4] =
    [None, Some("uuid.ASC"), Some("state.DESC"), Some("max_physical_memory.ASC")];

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let sort_raw = SORTS[usize::from(data[0]) % SORTS.len()];
    let Ok(raw) = std::str::from_utf8(&data[1..]) else {
        return;
    };

    let paginator = MarkerPaginator::default();
    let sort = sort_raw.and_then(|s| paginator.parse_sort(s).ok().flatten());
    let parsed = paginator.parse_marker(raw);
    let Some(marker) = parsed.marker else {
        return;
    };

    let errors = paginator.validate_marker(&marker, sort.as_ref());
    let query = paginator.page_query(Filter::All, sort.as_ref(), Some(&marker), 10);
    assert_eq!(errors.is_empty(), query.is_ok(), "validation and query construction disagree");
});
