//! Client-side consumers of the server protocol

pub mod reconciler;

pub use reconciler::{ClockOffset, EntityInterpolator, RenderPose, SnapshotReconciler};
