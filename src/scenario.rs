#![forbid(unsafe_code)]

// Load scenarios - provisioning, concurrent connects, message fan-out, sweeps

use crate::auth::CredentialProvider;
use crate::client::{ConnectionState, SimulatedClient};
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::metrics::{MetricsSummary, PerformanceMetrics};
use crate::registry::ClientRegistry;
use crate::sampler::LatencySampler;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHURN_MESSAGE: &str = "Stress test message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScenarioConfig {
    pub user_count: usize,
    pub messages_per_user: usize,
}

impl ScenarioConfig {
    pub fn new(user_count: usize, messages_per_user: usize) -> Self {
        Self {
            user_count,
            messages_per_user,
        }
    }

    pub fn label(&self) -> String {
        format!("{} users x {} messages", self.user_count, self.messages_per_user)
    }

    /// Parses `USERS:MESSAGES`, e.g. `25:40`.
    pub fn parse(s: &str) -> Option<Self> {
        let (users, messages) = s.split_once(':')?;
        Some(Self::new(users.trim().parse().ok()?, messages.trim().parse().ok()?))
    }
}

/// Light, medium and heavy load.
pub fn default_scenarios() -> Vec<ScenarioConfig> {
    vec![
        ScenarioConfig::new(10, 20),
        ScenarioConfig::new(25, 40),
        ScenarioConfig::new(50, 60),
    ]
}

/// Everything a scenario's tasks share. One per scenario so metrics,
/// credentials and clients never leak between runs.
#[derive(Clone)]
pub struct ScenarioContext {
    pub config: HarnessConfig,
    pub provider: Arc<CredentialProvider>,
    pub registry: ClientRegistry,
    pub metrics: Arc<PerformanceMetrics>,
    pub sampler: LatencySampler,
}

impl ScenarioContext {
    pub fn new(config: &HarnessConfig, http: reqwest::Client) -> Self {
        let provider = Arc::new(CredentialProvider::new(
            http,
            config.base_url.as_str(),
            config.provision_concurrency,
        ));
        let registry = ClientRegistry::new(provider.clone(), config.ws_url.as_str(), config.connect_timeout);
        let metrics = Arc::new(PerformanceMetrics::new());
        let sampler = LatencySampler::new(metrics.clone(), config.wait_window, config.poll_interval);
        Self {
            config: config.clone(),
            provider,
            registry,
            metrics,
            sampler,
        }
    }

    /// Registers `count` users named `<prefix>_<i>_<run_id>` concurrently.
    /// A username the service already knows is logged in instead. Users
    /// that cannot be provisioned are logged and left out.
    pub async fn provision_users(&self, prefix: &str, count: usize, run_id: &str) -> Vec<String> {
        let mut tasks = JoinSet::new();
        for i in 0..count {
            let provider = self.provider.clone();
            let username = format!("{prefix}_{i}_{run_id}");
            let password = format!("LoadTest123!_{i}");
            tasks.spawn(async move {
                let result = match provider.register(&username, &password).await {
                    Err(e) if e.status() == Some(409) => provider.login(&username, &password).await,
                    other => other,
                };
                match result {
                    Ok(_) => Some((i, username)),
                    Err(e) => {
                        error!("Failed to create user {}: {}", i, e);
                        None
                    }
                }
            });
        }

        let mut users = Vec::with_capacity(count);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(user)) => users.push(user),
                Ok(None) => {}
                Err(e) => error!("Provisioning task failed: {}", e),
            }
        }
        users.sort_by_key(|(i, _)| *i);
        users.into_iter().map(|(_, name)| name).collect()
    }

    /// Connects every user concurrently, sampling connection time.
    pub async fn connect_all(&self, users: &[String]) -> ConnectOutcome {
        let mut tasks = JoinSet::new();
        for username in users {
            let sampler = self.sampler.clone();
            let registry = self.registry.clone();
            let username = username.clone();
            tasks.spawn(async move { sampler.measure_connection(&registry, &username).await });
        }

        let mut outcome = ConnectOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(client)) => {
                    outcome.attempts += 1;
                    outcome.connected.push(client);
                }
                Ok(Err(HarnessError::NotAuthenticated(user))) => {
                    error!("Setup without credential for {}", user);
                    outcome.violation.get_or_insert(HarnessError::NotAuthenticated(user));
                }
                Ok(Err(e)) => {
                    outcome.attempts += 1;
                    debug!("{}", e);
                }
                Err(e) => error!("Connect task failed: {}", e),
            }
        }
        outcome
    }
}

/// Result of a concurrent connect phase
#[derive(Default)]
pub struct ConnectOutcome {
    pub connected: Vec<Arc<SimulatedClient>>,
    /// Connects attempted, successful or not
    pub attempts: u64,
    /// First contract violation seen, if any
    pub violation: Option<HarnessError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub label: String,
    pub config: ScenarioConfig,
    pub provisioned_users: usize,
    pub connected_users: usize,
    pub summary: Option<MetricsSummary>,
    pub error: Option<String>,
}

impl ScenarioReport {
    fn failed(config: ScenarioConfig, err: &HarnessError) -> Self {
        Self {
            label: config.label(),
            config,
            provisioned_users: 0,
            connected_users: 0,
            summary: None,
            error: Some(err.to_string()),
        }
    }

    pub fn print_summary(&self) {
        println!("\n=== Scenario: {} ===", self.label);
        println!("  Users: {} provisioned, {} connected", self.provisioned_users, self.connected_users);
        if let Some(err) = &self.error {
            println!("  Error: {}", err);
        }
        match &self.summary {
            Some(summary) => summary.print_summary(),
            None => println!("  No summary (no operations recorded)"),
        }
    }
}

/// Pass/fail bounds applied to a scenario summary
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Percent
    pub min_success_rate: f64,
    pub max_message_p95: f64,
    pub max_connection_p95: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 95.0,
            max_message_p95: 1.0,
            max_connection_p95: 2.0,
        }
    }
}

impl Thresholds {
    /// A missing latency sequence fails its bound.
    pub fn check(&self, summary: &MetricsSummary) -> bool {
        summary.success_rate >= self.min_success_rate
            && summary.message_latency_p95.is_some_and(|p| p <= self.max_message_p95)
            && summary.connection_time_p95.is_some_and(|p| p <= self.max_connection_p95)
    }
}

/// One load run: provision, connect, fan out messages, finalize, tear down.
pub struct LoadScenario {
    config: ScenarioConfig,
}

impl LoadScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// Fails only when the context's configuration is unusable, before
    /// anything is measured. Failures during the run are counted in the
    /// metrics, and a contract violation is carried in `ScenarioReport.error`
    /// alongside whatever was measured.
    pub async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioReport, HarnessError> {
        ctx.config.validate()?;
        let run_id = Uuid::new_v4().simple().to_string();
        info!(
            "Starting load test with {} users, {} messages per user",
            self.config.user_count, self.config.messages_per_user
        );

        let users = ctx.provision_users("load_test_user", self.config.user_count, &run_id).await;
        info!("Provisioned {}/{} users", users.len(), self.config.user_count);

        Ok(self.run_with_users(ctx, users).await)
    }

    /// Connect, fan out, finalize and tear down for already provisioned users.
    async fn run_with_users(&self, ctx: &ScenarioContext, users: Vec<String>) -> ScenarioReport {
        let outcome = ctx.connect_all(&users).await;
        let connected_users = outcome.connected.len();
        info!("Connected {}/{} users", connected_users, users.len());

        let plan = self.plan_messages(ctx, &users, &outcome.connected);
        let message_attempts = plan.len() as u64;
        info!("Sending {} messages", message_attempts);

        let mut tasks = JoinSet::new();
        for (sender, receiver, round) in plan {
            let sampler = ctx.sampler.clone();
            tasks.spawn(async move {
                let text = format!("Load test message {round}");
                sampler.measure_message_latency(&sender, &receiver, &text).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("{}", e),
                Err(e) => error!("Message task failed: {}", e),
            }
        }

        ctx.metrics.add_operations(outcome.attempts + message_attempts);
        let summary = match ctx.metrics.summary() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("{}: {}", self.config.label(), e);
                None
            }
        };

        ctx.registry.teardown_all().await;

        let error = outcome.violation.map(|violation| {
            error!("{}: {}", self.config.label(), violation);
            violation.to_string()
        });

        ScenarioReport {
            label: self.config.label(),
            config: self.config,
            provisioned_users: users.len(),
            connected_users,
            summary,
            error,
        }
    }

    /// For each round and each connected sender, one receiver drawn uniformly
    /// from the other provisioned users. Receivers with no registry entry are
    /// skipped; receivers that failed to connect are kept.
    fn plan_messages(
        &self,
        ctx: &ScenarioContext,
        users: &[String],
        senders: &[Arc<SimulatedClient>],
    ) -> Vec<(Arc<SimulatedClient>, Arc<SimulatedClient>, usize)> {
        let mut rng = rand::thread_rng();
        let mut plan = Vec::with_capacity(senders.len() * self.config.messages_per_user);

        for round in 0..self.config.messages_per_user {
            for sender in senders {
                let peers: Vec<&String> = users.iter().filter(|u| u.as_str() != sender.username()).collect();
                let Some(peer) = peers.choose(&mut rng) else {
                    continue;
                };
                match ctx.registry.get(peer) {
                    Some(receiver) => plan.push((sender.clone(), receiver, round)),
                    None => debug!("{}: skipping untracked receiver {}", sender.username(), peer),
                }
            }
        }
        plan
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub scenarios: Vec<ScenarioReport>,
}

impl SweepReport {
    pub fn print_summary(&self) {
        println!("\n=== Load Test Sweep ({} scenarios) ===", self.scenarios.len());
        for report in &self.scenarios {
            report.print_summary();
        }
        println!("========================\n");
    }
}

/// Runs `scenarios` one after another with a stabilisation pause between
/// them. Each scenario gets fresh metrics. A failed scenario is recorded and
/// the sweep moves on.
pub async fn sweep(config: &HarnessConfig, http: reqwest::Client, scenarios: &[ScenarioConfig]) -> SweepReport {
    let mut reports = Vec::with_capacity(scenarios.len());

    for (idx, scenario) in scenarios.iter().enumerate() {
        if idx > 0 {
            info!("Waiting {:?} for connections to stabilize...", config.stabilize_pause);
            tokio::time::sleep(config.stabilize_pause).await;
        }

        info!("Running scenario: {}", scenario.label());
        let ctx = ScenarioContext::new(config, http.clone());
        let report = match LoadScenario::new(*scenario).run(&ctx).await {
            Ok(report) => report,
            Err(e) => {
                error!("Scenario {} failed: {}", scenario.label(), e);
                ScenarioReport::failed(*scenario, &e)
            }
        };
        reports.push(report);
    }

    SweepReport { scenarios: reports }
}

/// Rapid connect / send / disconnect cycles for a single user.
pub struct ChurnScenario {
    pub cycles: usize,
    pub pause: Duration,
}

impl Default for ChurnScenario {
    fn default() -> Self {
        Self {
            cycles: 10,
            pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub cycles: usize,
    pub connected_cycles: usize,
    /// Cycles whose client was `Disconnected` after teardown
    pub clean_disconnects: usize,
    pub summary: Option<MetricsSummary>,
}

impl ChurnScenario {
    pub async fn run(&self, ctx: &ScenarioContext) -> Result<ChurnReport, HarnessError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let username = format!("stress_test_user_{run_id}");
        let password = format!("LoadTest123!_{run_id}");
        ctx.provider.register(&username, &password).await?;

        let mut connected_cycles = 0;
        let mut clean_disconnects = 0;
        for cycle in 0..self.cycles {
            match ctx.sampler.measure_connection(&ctx.registry, &username).await {
                Ok(client) => {
                    connected_cycles += 1;
                    if !client.send(CHURN_MESSAGE).await {
                        warn!("{}: send failed in cycle {}", username, cycle);
                    }
                    ctx.registry.remove(&username).await;
                    if client.state() == ConnectionState::Disconnected {
                        clean_disconnects += 1;
                    }
                }
                Err(e @ HarnessError::NotAuthenticated(_)) => return Err(e),
                Err(e) => {
                    warn!("Cycle {}: {}", cycle, e);
                    ctx.registry.remove(&username).await;
                }
            }
            tokio::time::sleep(self.pause).await;
        }

        ctx.metrics.add_operations(self.cycles as u64);
        Ok(ChurnReport {
            cycles: self.cycles,
            connected_cycles,
            clean_disconnects,
            summary: ctx.metrics.summary().ok(),
        })
    }
}

/// Connects many users at once and reports how many made it.
pub struct ConnectionCapacity {
    pub user_count: usize,
    /// Minimum connected fraction for `passed`
    pub threshold: f64,
}

impl Default for ConnectionCapacity {
    fn default() -> Self {
        Self {
            user_count: 50,
            threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub requested: usize,
    pub provisioned: usize,
    pub connected: usize,
    pub connected_ratio: f64,
    pub passed: bool,
    /// Contract violation seen while connecting, if any
    pub error: Option<String>,
}

impl ConnectionCapacity {
    pub async fn run(&self, ctx: &ScenarioContext) -> Result<CapacityReport, HarnessError> {
        ctx.config.validate()?;
        let run_id = Uuid::new_v4().simple().to_string();
        let users = ctx.provision_users("concurrent_user", self.user_count, &run_id).await;
        let outcome = ctx.connect_all(&users).await;
        ctx.metrics.add_operations(outcome.attempts);

        // Count live connections, not just successful handshakes.
        let connected = ctx.registry.connected_count();
        ctx.registry.teardown_all().await;
        let error = outcome.violation.map(|violation| {
            error!("Connection capacity: {}", violation);
            violation.to_string()
        });

        let connected_ratio = if self.user_count == 0 {
            1.0
        } else {
            connected as f64 / self.user_count as f64
        };
        info!("Connection capacity: {}/{} connected", connected, self.user_count);
        Ok(CapacityReport {
            requested: self.user_count,
            provisioned: users.len(),
            connected,
            connected_ratio,
            passed: connected_ratio >= self.threshold,
            error,
        })
    }
}
