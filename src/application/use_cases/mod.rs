pub mod audit;
pub mod dunning;
pub mod ledger;
pub mod reconcile;
pub mod retry;
pub mod subscription;
