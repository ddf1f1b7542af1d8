//! Joining parallel split-flow branches

pub mod rendezvous;

pub use rendezvous::{CompletedSplitFlow, CompletionRendezvous, SplitOutcome};
