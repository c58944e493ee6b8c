//! Fuzz target for sort criteria parsing.
//!
//! `parse_sort` must never panic, must agree with `is_valid_sort_criteria`,
//! and accepted criteria must re-parse to themselves.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vm_inventory_control::MarkerPaginator;

fuzz_target!(|raw: &str| {
    let paginator = MarkerPaginator::default();
    let parsed = paginator.parse_sort(raw);
    assert_eq!(parsed.is_ok(), paginator.is_valid_sort_criteria(raw));

    if let Ok(Some(sort)) = parsed {
        let reparsed = paginator.parse_sort(&sort.to_string());
        assert_eq!(reparsed, Ok(Some(sort)), "accepted sort does not round-trip");
    }
});
