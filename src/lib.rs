pub mod config;
pub mod device_service_client;
pub mod events;
pub mod http_client;
pub mod identity;
pub mod orchestrator;
pub mod services;
pub mod sink;
pub mod update_client;
