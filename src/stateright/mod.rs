//! Stateright model checking for the journal's concurrency protocols
//!
//! ## Available Models
//!
//! - `group_commit`: one stream's copy / flush / rotate protocol
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Exhaustive checks are marked #[ignore] to keep CI fast
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod group_commit;
