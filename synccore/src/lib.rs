//! Runtime-agnostic core of the chat synchronization client.
//!
//! Everything in here is plain data and pure logic: the room and message
//! model, deduplication, the typing presence set, the row-change event model,
//! cache scoping, and the collaborator traits the platform layer drives.

pub mod dedupe;
pub mod events;
pub mod net;
pub mod presence;
pub mod store;
pub mod types;
