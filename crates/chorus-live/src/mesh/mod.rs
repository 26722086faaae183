//! Peer connection mesh: exactly one link per pair of active transmitters
//! that includes the local participant, and none otherwise.

mod link;
mod manager;

pub use link::{offerer_for, LinkRole, NegotiationState, PeerLink};
pub use manager::{plan, MeshAction, MeshManager, PeerTarget, ReconcilePlan};

#[cfg(test)]
mod tests;
