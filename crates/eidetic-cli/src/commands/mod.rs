pub mod config;
pub mod consolidate;
pub mod patterns;
pub mod recall;
pub mod stats;
pub mod store;

pub use config::ConfigCommand;
pub use consolidate::ConsolidateCommand;
pub use patterns::PatternsCommand;
pub use recall::RecallCommand;
pub use stats::StatsCommand;
pub use store::StoreCommand;
