pub mod descriptor;
pub mod events;
pub mod probe;
pub mod readiness;
pub mod wire;
