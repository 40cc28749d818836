//! sd-core: shared foundation for the spindb simulation-run database.
//!
//! Contains:
//! - numeric (Real + tolerances + vector comparisons)
//! - options (model, spinup and derivative options)
//! - error (shared error types)

pub mod error;
pub mod numeric;
pub mod options;

pub use error::{CoreError, CoreResult};
pub use numeric::*;
pub use options::*;
