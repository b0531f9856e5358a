//! Shared contract suites and fixtures for catchup backends and listeners.
//!
//! Backends prove they honor the [`ProgressStore`](catchup_types::ProgressStore)
//! and [`StreamSource`](catchup_types::StreamSource) contracts by invoking
//! [`progress_store_contract_tests!`] and [`stream_source_contract_tests!`]
//! from an integration test:
//!
//! ```ignore
//! use catchup_testing::contract::progress_store_contract_tests;
//!
//! progress_store_contract_tests! {
//!     suite = in_memory,
//!     make_store = catchup_memory::InMemoryProgressStore::new,
//! }
//! ```

#![deny(warnings)]
#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_qualifications,
    unused_results,
    unused_variables
)]

pub mod contract;
pub mod fixtures;

pub use fixtures::RecordingListener;
