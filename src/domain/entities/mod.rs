pub mod audit;
pub mod billing_event;
pub mod ledger;
pub mod payment_failure;
pub mod retry;
pub mod subscription;
