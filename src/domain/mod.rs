pub mod dunning;
pub mod entities;
pub mod policy;
pub mod state_machine;
