pub mod admin;
pub mod commands;
pub mod context;
pub mod cycler;
pub mod logger;
pub mod placement;
pub mod provider_manager;
pub mod reconciliation;
pub mod scaler;
pub mod seed;
pub mod settings;
pub mod store;
pub mod synchronizer;
pub mod userdata;
