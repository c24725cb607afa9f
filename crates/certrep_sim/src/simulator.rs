//! The simulation driver.

use crate::error::{SimError, SimResult};
use crate::params::SimParams;
use crate::storage::{SimStorage, SimStorageEngine};
use certrep_core::{
    ClientMode, ClientState, Key, KeyType, ReplResult, ServerConfig, ServerState, ServerStatus,
    StatsSnapshot, StatusReporter, TransactionState,
};
use certrep_loopback::{LoopbackConfig, LoopbackGroup, LoopbackProvider};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    /// Server name.
    pub name: String,
    /// Replication counters.
    pub stats: StatsSnapshot,
    /// Transactions committed by this server's clients, replays included.
    pub committed: u64,
    /// Transactions that ended in rollback.
    pub aborted: u64,
    /// Simulated lock conflicts.
    pub bf_attempts: u64,
    /// Simulated lock conflicts that aborted the victim.
    pub bf_accepted: u64,
    /// Last seqno committed on the node.
    pub last_committed: i64,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Seed the run used.
    pub seed: u64,
    /// Per-server results.
    pub servers: Vec<ServerReport>,
    /// Counters summed over all servers.
    pub totals: StatsSnapshot,
    /// Committed transactions.
    pub committed: u64,
    /// Rolled back transactions.
    pub aborted: u64,
    /// Last seqno the group assigned.
    pub last_seqno: i64,
    /// Wall clock time of the load phase in milliseconds.
    pub elapsed_ms: u64,
}

impl SimReport {
    /// Committed transactions per second.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.committed as f64 * 1000.0 / self.elapsed_ms as f64
    }

    /// Prints a human readable summary.
    pub fn print_summary(&self) {
        for server in &self.servers {
            let s = &server.stats;
            println!(
                "{}: commits {} replays {} rollbacks {} cert_failures {} bf_aborts {} applied {} last_committed {}",
                server.name,
                s.commits,
                s.replays,
                s.rollbacks,
                s.cert_failures,
                s.bf_aborts,
                s.applied,
                server.last_committed,
            );
        }
        println!("\n=== certsim ===");
        println!("Seed: {}", self.seed);
        println!("Committed: {}", self.committed);
        println!("Aborted: {}", self.aborted);
        println!("Last seqno: {}", self.last_seqno);
        println!("Duration: {} ms", self.elapsed_ms);
        println!("Throughput: {:.2} trx/sec", self.throughput());
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    committed: u64,
    aborted: u64,
}

struct SimServer {
    server: Arc<ServerState>,
    provider: Arc<LoopbackProvider>,
    engine: Arc<SimStorageEngine>,
}

/// Runs a cluster of loopback servers under synthetic load.
#[derive(Debug, Clone)]
pub struct Simulator {
    params: SimParams,
}

impl Simulator {
    /// Creates a simulator.
    pub fn new(params: SimParams) -> Self {
        Self { params }
    }

    /// Returns the parameters.
    pub fn params(&self) -> &SimParams {
        &self.params
    }

    /// Starts the cluster, runs every client to completion and shuts the
    /// cluster down.
    pub fn run(&self) -> SimResult<SimReport> {
        self.params.validate()?;
        let seed = self.params.seed.unwrap_or_else(rand::random);
        info!(
            servers = self.params.servers,
            clients = self.params.clients,
            transactions = self.params.transactions,
            seed,
            "starting simulation"
        );

        let group = LoopbackGroup::new(LoopbackConfig::new().with_cluster_name("certsim"));
        let mut servers = Vec::with_capacity(self.params.servers);
        for index in 0..self.params.servers {
            match self.start_server(&group, index, seed) {
                Ok(server) => servers.push(server),
                Err(err) => {
                    stop_all(&servers);
                    return Err(err);
                }
            }
        }

        let started = Instant::now();
        let outcome = self.run_clients(&servers, seed);
        let elapsed = started.elapsed();

        let drained = drain(&group, &servers);
        if !drained {
            warn!(
                last_seqno = group.last_seqno().get(),
                "appliers did not catch up before shutdown"
            );
        }
        let report = outcome.map(|tallies| self.report(&group, &servers, &tallies, seed, elapsed));
        stop_all(&servers);

        for sim in &servers {
            if let Some(message) = sim.server.fatal_error() {
                return Err(SimError::ServerFatal {
                    server: sim.server.name().to_string(),
                    message,
                });
            }
        }
        report
    }

    fn start_server(
        &self,
        group: &Arc<LoopbackGroup>,
        index: usize,
        seed: u64,
    ) -> SimResult<SimServer> {
        let name = format!("server-{index}");
        let config = ServerConfig::new()
            .name(name.clone())
            .address(format!("loopback://{name}"))
            .rollback_mode(self.params.rollback_mode)
            .debug_log_level(self.params.debug_log_level);
        let provider = Arc::new(LoopbackProvider::new(Arc::clone(group), config.id, &name));
        let server = ServerState::new(config, provider.clone());

        if index == 0 {
            if let Some(path) = &self.params.reporter_file {
                server.set_reporter(Arc::new(StatusReporter::new(path)?));
            }
        }

        let engine = SimStorageEngine::new(&server, self.params.alg_freq, seed ^ index as u64);
        server.connect("certsim", &format!("loopback://{name}"), index == 0)?;
        server.start_applier(Arc::new(SimStorage::new(Arc::clone(&engine))))?;
        if !server.wait_until_state(ServerStatus::Synced, SYNC_TIMEOUT) {
            // Stop the applier that was already started.
            let _ = server.shutdown();
            return Err(SimError::SyncTimeout { server: name });
        }
        Ok(SimServer {
            server,
            provider,
            engine,
        })
    }

    fn run_clients(&self, servers: &[SimServer], seed: u64) -> SimResult<Vec<Tally>> {
        let mut workers = Vec::new();
        for (s, sim) in servers.iter().enumerate() {
            for c in 0..self.params.clients {
                let server = Arc::clone(&sim.server);
                let engine = Arc::clone(&sim.engine);
                let params = self.params.clone();
                let client_seed = seed
                    .wrapping_add((s * self.params.clients + c) as u64)
                    .wrapping_mul(0x9e37_79b9_7f4a_7c15);
                let name = format!("certsim-{s}-{c}");
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || run_client(&server, engine, &params, client_seed))?;
                workers.push((s, c, name, handle));
            }
        }

        let mut tallies = vec![Tally::default(); servers.len()];
        let mut first_error = None;
        for (s, c, name, handle) in workers {
            match handle.join() {
                Ok(Ok(tally)) => {
                    tallies[s].committed += tally.committed;
                    tallies[s].aborted += tally.aborted;
                }
                Ok(Err(source)) => {
                    first_error.get_or_insert(SimError::Client {
                        server: servers[s].server.name().to_string(),
                        client: c,
                        source,
                    });
                }
                Err(_) => {
                    first_error.get_or_insert(SimError::WorkerPanicked(name));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(tallies),
        }
    }

    fn report(
        &self,
        group: &LoopbackGroup,
        servers: &[SimServer],
        tallies: &[Tally],
        seed: u64,
        elapsed: Duration,
    ) -> SimReport {
        let mut totals = StatsSnapshot::default();
        let servers: Vec<ServerReport> = servers
            .iter()
            .zip(tallies)
            .map(|(sim, tally)| {
                let stats = sim.server.stats();
                totals.accumulate(&stats);
                ServerReport {
                    name: sim.server.name().to_string(),
                    stats,
                    committed: tally.committed,
                    aborted: tally.aborted,
                    bf_attempts: sim.engine.bf_attempts(),
                    bf_accepted: sim.engine.bf_accepted(),
                    last_committed: sim.provider.last_committed().get(),
                }
            })
            .collect();
        SimReport {
            seed,
            committed: tallies.iter().map(|t| t.committed).sum(),
            aborted: tallies.iter().map(|t| t.aborted).sum(),
            servers,
            totals,
            last_seqno: group.last_seqno().get(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Waits until every node committed everything the group ordered.
fn drain(group: &LoopbackGroup, servers: &[SimServer]) -> bool {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    let target = group.last_seqno();
    loop {
        if servers.iter().all(|s| s.provider.last_committed() >= target) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn stop_all(servers: &[SimServer]) {
    for sim in servers {
        if let Err(err) = sim.server.shutdown() {
            warn!(server = %sim.server.name(), "shutdown failed: {err}");
        }
    }
}

fn run_client(
    server: &ServerState,
    engine: Arc<SimStorageEngine>,
    params: &SimParams,
    seed: u64,
) -> ReplResult<Tally> {
    let storage = Arc::new(SimStorage::new(engine));
    let client = server.open_client(ClientMode::Replicating, storage.clone())?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tally = Tally::default();

    for _ in 0..params.transactions {
        match run_transaction(&client, &storage, params, &mut rng) {
            Ok(true) => tally.committed += 1,
            Ok(false) => tally.aborted += 1,
            Err(err) => {
                let _ = server.close_client(client.id());
                return Err(err);
            }
        }
    }
    server.close_client(client.id())?;
    Ok(tally)
}

/// Runs one transaction as two commands: one writes rows, the next
/// commits. The connection is idle in between, where BF-aborts are
/// handled by the rollback mode. Returns whether it committed.
fn run_transaction(
    client: &ClientState,
    storage: &SimStorage,
    params: &SimParams,
    rng: &mut StdRng,
) -> ReplResult<bool> {
    command(client, || {
        client.begin()?;
        let rows = rng.gen_range(1..=3);
        for _ in 0..rows {
            let row = rng.gen_range(0..params.keys);
            client.append_key(
                &Key::new(KeyType::Exclusive)
                    .with_part("rows")
                    .with_part(row.to_be_bytes().to_vec()),
            )?;
            storage.stage(&row.to_be_bytes());
        }
        Ok(())
    })?;
    if !client.transaction().active() {
        return Ok(false);
    }

    command(client, || {
        if params.two_phase {
            client.before_prepare()?;
            client.after_prepare()?;
        }
        client.commit()
    })?;
    Ok(client.transaction_state() == TransactionState::Committed)
}

/// Runs `body` as one single-statement command. Only fatal errors are
/// returned; transaction failures are left to the statement hooks.
fn command(client: &ClientState, body: impl FnOnce() -> ReplResult<()>) -> ReplResult<()> {
    let started = client.before_command();
    if started.is_ok() {
        tolerate(client.before_statement().and_then(|()| body()))?;
        tolerate(client.after_statement())?;
    } else {
        tolerate(started)?;
    }
    tolerate(client.after_command_before_result())?;
    tolerate(client.after_command_after_result())
}

fn tolerate(result: ReplResult<()>) -> ReplResult<()> {
    match result {
        Err(err) if err.is_fatal() => Err(err),
        _ => Ok(()),
    }
}
