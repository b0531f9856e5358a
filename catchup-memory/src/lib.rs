//! In-memory collaborators for the catch-up invoker.
//!
//! [`InMemoryProgressStore`] and [`InMemoryStreamSource`] keep all state in
//! process memory behind a mutex. They are the reference implementations the
//! contract suites in `catchup-testing` are calibrated against, and are
//! suitable for tests and single-process deployments that do not need
//! progress to survive a restart.
//!
//! Both types are cheap to clone; clones share state.

mod progress;
mod source;

pub use progress::InMemoryProgressStore;
pub use source::InMemoryStreamSource;
