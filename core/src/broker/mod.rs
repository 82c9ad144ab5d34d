pub mod adapters;
pub mod bridge;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod prober;
pub mod request_normalizer;
pub mod telemetry;
pub mod types;
pub mod types_chat;
