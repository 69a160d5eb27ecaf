pub mod entitlement;
pub mod notifier;
