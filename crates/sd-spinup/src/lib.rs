//! sd-spinup: run chains and the policy deciding whether a chain satisfies
//! requested spinup options or has to be extended.

pub mod chain;
pub mod error;
pub mod layout;
pub mod policy;

pub use chain::{RunChain, RunRecord};
pub use error::{SpinupError, SpinupResult};
pub use layout::DatabaseLayout;
pub use policy::{MatchOutcome, RunTemplate, SpinupPolicy, SpinupRequest, assess};
