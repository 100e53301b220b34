pub mod contracts;
pub mod types;

pub use types::{ExecutionRecord, VerificationRequest};
