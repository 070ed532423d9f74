pub mod error;
pub mod types;

pub use error::{EvoError, Result};
pub use types::{
    Candidate, DecodedCandidate, EvalContext, RunEvent, RunObserver, RunState, SelectionRequest,
    UpdatePolicy,
};
