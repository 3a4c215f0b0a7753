//! Palaver is the session orchestration layer of an interactive AI
//! assistant: it owns turn streaming, tool-permission negotiation, and
//! the readiness of the context-protocol servers offered to the
//! completion engine.
//!
//! The crate is organized around two collaborating layers:
//! - [`core`] owns sessions, the turn pipeline, stream accumulation,
//!   the policy chain with interactive approvals, and persistence.
//! - [`mcp`] owns server descriptors, the connectivity prober, and the
//!   readiness manager that warms servers up concurrently at startup.
//!
//! The completion engine itself, descriptor configuration, and
//! credential refresh stay behind traits ([`core::engine::CompletionEngine`],
//! [`mcp::descriptor::DescriptorStore`], [`mcp::descriptor::CredentialSource`]);
//! embedders supply those and drive everything through
//! [`core::registry::SessionRegistry`] and [`mcp::readiness::ReadinessManager`].

pub mod core;
pub mod logging;
pub mod mcp;
