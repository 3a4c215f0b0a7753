pub mod approvals;
pub mod engine;
pub mod errors;
pub mod message;
pub mod persistence;
pub mod policy;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod stream;
