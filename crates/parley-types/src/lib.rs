//! Types shared by every parley crate: domain models, gateway frames,
//! REST payloads and the room role policy.

pub mod api;
pub mod events;
pub mod models;
pub mod policy;
