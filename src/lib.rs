#![forbid(unsafe_code)]

// chatload library - concurrent load-testing harness for real-time chat services

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod sampler;
pub mod scenario;

pub use auth::CredentialProvider;
pub use client::{ConnectionState, Inbox, SimulatedClient};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use metrics::{MetricsError, MetricsSummary, PerformanceMetrics, SampleKind};
pub use registry::ClientRegistry;
pub use sampler::LatencySampler;
pub use scenario::{sweep, LoadScenario, ScenarioConfig, ScenarioContext, ScenarioReport, SweepReport};
