pub mod http;
pub mod notifier;
pub mod persistence;
