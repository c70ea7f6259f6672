//! Test harness for multi-server Raft clusters running over `LocalNetwork`.
//!
//! Every delivered entry is recorded per server and checked on arrival: the
//! same index must carry the same command everywhere, and each server
//! incarnation must deliver indices 1, 2, 3... with no gaps or repeats.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use raft_core::{PersistentState, RaftConfig};
use raft_server::{ApplyMsg, LocalNetwork, Raft};
use raft_storage::{InMemoryStorage, Storage, StorageError};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

/// Upper bound for a cluster to notice a failure and elect a replacement
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> RaftConfig {
    RaftConfig::default()
}

pub fn cmd(tag: &str, n: usize) -> Vec<u8> {
    format!("{tag}-{n}").into_bytes()
}

#[derive(Default)]
struct Applied {
    /// per server: every (index, command) it ever delivered, across restarts
    logs: Vec<HashMap<u64, Vec<u8>>>,
    /// per server: last index delivered by the current incarnation
    last: Vec<u64>,
    /// per server: incarnation counter, bumped on every start
    generation: Vec<u64>,
    errors: Vec<String>,
}

impl Applied {
    fn new(n: usize) -> Self {
        Self {
            logs: vec![HashMap::new(); n],
            last: vec![0; n],
            generation: vec![0; n],
            errors: Vec::new(),
        }
    }

    fn record(&mut self, server: usize, generation: u64, msg: ApplyMsg) {
        // a dead incarnation may still drain its channel; only check content then
        if generation == self.generation[server] {
            if msg.index != self.last[server] + 1 {
                self.errors.push(format!(
                    "server {} delivered index {} right after {}",
                    server + 1,
                    msg.index,
                    self.last[server]
                ));
            }
            self.last[server] = msg.index;
        }

        for (other, log) in self.logs.iter().enumerate() {
            if let Some(seen) = log.get(&msg.index) {
                if *seen != msg.command {
                    self.errors.push(format!(
                        "index {}: server {} delivered {:?} but server {} delivered {:?}",
                        msg.index,
                        server + 1,
                        String::from_utf8_lossy(&msg.command),
                        other + 1,
                        String::from_utf8_lossy(seen)
                    ));
                }
            }
        }
        self.logs[server].insert(msg.index, msg.command);
    }
}

/// Storage that starts refusing writes once `fail` is called
#[derive(Clone)]
pub struct FailingStorage {
    inner: InMemoryStorage,
    failing: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn new(inner: InMemoryStorage) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<PersistentState> {
        self.inner.snapshot()
    }
}

impl Storage for FailingStorage {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk unavailable").into());
        }
        self.inner.save(state)
    }

    fn load(&self) -> Result<PersistentState, StorageError> {
        self.inner.load()
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.inner.clear()
    }
}

/// A cluster of `n` servers with ids 1..=n, addressed here by position 0..n
pub struct Cluster {
    pub n: usize,
    pub net: LocalNetwork,
    config: RaftConfig,
    rafts: Vec<Option<Raft>>,
    storages: Vec<InMemoryStorage>,
    applied: Arc<Mutex<Applied>>,
}

fn id_of(i: usize) -> u64 {
    i as u64 + 1
}

impl Cluster {
    pub fn new(n: usize, reliable: bool) -> Self {
        Self::with_config(n, reliable, test_config())
    }

    pub fn with_config(n: usize, reliable: bool, config: RaftConfig) -> Self {
        init_tracing();
        let mut cluster = Self {
            n,
            net: LocalNetwork::new(),
            config,
            rafts: vec![None; n],
            storages: (0..n).map(|_| InMemoryStorage::new()).collect(),
            applied: Arc::new(Mutex::new(Applied::new(n))),
        };
        cluster.net.set_reliable(reliable);
        for i in 0..n {
            cluster.start1(i);
        }
        cluster
    }

    fn ids(&self) -> Vec<u64> {
        (0..self.n).map(id_of).collect()
    }

    /// (Re)start server `i` from whatever it had persisted
    pub fn start1(&mut self, i: usize) {
        self.crash1(i);
        let storage = self.storages[i].clone();
        self.start1_with(i, Box::new(storage));
    }

    /// Start server `i` on a caller-provided store
    pub fn start1_with(&mut self, i: usize, storage: Box<dyn Storage>) {
        if let Some(old) = self.rafts[i].take() {
            old.kill();
        }
        let id = id_of(i);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            id,
            self.ids(),
            self.config.clone(),
            storage,
            self.net.transport(id),
            tx,
        )
        .expect("server failed to start");

        let generation = {
            let mut applied = self.applied.lock();
            applied.generation[i] += 1;
            applied.last[i] = 0;
            applied.generation[i]
        };
        let applied = Arc::clone(&self.applied);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                applied.lock().record(i, generation, msg);
            }
        });

        self.net.register(id, raft.clone());
        self.rafts[i] = Some(raft);
    }

    /// Stop server `i`; only what it persisted survives into the next start
    pub fn crash1(&mut self, i: usize) {
        if let Some(raft) = self.rafts[i].take() {
            raft.kill();
            self.net.unregister(id_of(i));
        }
        self.storages[i] = self.storages[i].duplicate();
    }

    pub fn raft(&self, i: usize) -> &Raft {
        self.rafts[i].as_ref().expect("server is not running")
    }

    pub fn storage(&self, i: usize) -> InMemoryStorage {
        self.storages[i].clone()
    }

    pub fn connect(&self, i: usize) {
        self.net.connect(id_of(i));
    }

    pub fn disconnect(&self, i: usize) {
        self.net.disconnect(id_of(i));
    }

    fn live(&self, i: usize) -> Option<&Raft> {
        self.rafts[i]
            .as_ref()
            .filter(|r| !r.is_stopped() && self.net.is_connected(id_of(i)))
    }

    /// Wait for a leader among connected servers; panics on two leaders in one term
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            let ms = rand::thread_rng().gen_range(450..550);
            sleep(Duration::from_millis(ms)).await;

            let mut leaders: HashMap<u64, Vec<usize>> = HashMap::new();
            for i in 0..self.n {
                if let Some(raft) = self.live(i) {
                    let (term, is_leader) = raft.get_state();
                    if is_leader {
                        leaders.entry(term).or_default().push(i);
                    }
                }
            }

            for (term, servers) in &leaders {
                assert!(
                    servers.len() <= 1,
                    "term {term} has {} leaders: {servers:?}",
                    servers.len()
                );
            }
            if let Some(latest) = leaders.keys().max() {
                return leaders[latest][0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// All connected servers agree on the term
    pub fn check_terms(&self) -> u64 {
        let mut agreed = None;
        for i in 0..self.n {
            if let Some(raft) = self.live(i) {
                let term = raft.get_state().0;
                match agreed {
                    None => agreed = Some(term),
                    Some(t) => assert_eq!(t, term, "servers disagree on term"),
                }
            }
        }
        agreed.unwrap_or(0)
    }

    pub fn check_no_leader(&self) {
        for i in 0..self.n {
            if let Some(raft) = self.live(i) {
                assert!(!raft.get_state().1, "server {} is leader but should not be", i + 1);
            }
        }
    }

    fn assert_no_apply_errors(&self) {
        let applied = self.applied.lock();
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
    }

    /// How many servers delivered `index`, and the command they agree on
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.assert_no_apply_errors();
        let applied = self.applied.lock();
        let mut count = 0;
        let mut command = None;
        for log in &applied.logs {
            if let Some(c) = log.get(&index) {
                count += 1;
                command = Some(c.clone());
            }
        }
        (count, command)
    }

    /// Whether any server ever delivered `command`
    pub fn delivered_anywhere(&self, command: &[u8]) -> bool {
        let applied = self.applied.lock();
        applied
            .logs
            .iter()
            .any(|log| log.values().any(|c| c.as_slice() == command))
    }

    pub fn delivered_by(&self, i: usize, command: &[u8]) -> bool {
        self.applied.lock().logs[i]
            .values()
            .any(|c| c.as_slice() == command)
    }

    /// Submit `command` until it is delivered by at least `expected` servers.
    ///
    /// Without `retry`, the first accepted submission must commit.
    pub async fn one(&self, command: &[u8], expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut next = 0;
        while Instant::now() < deadline {
            let mut accepted = None;
            for _ in 0..self.n {
                next = (next + 1) % self.n;
                if let Some(raft) = self.live(next) {
                    if let Ok((index, _)) = raft.start(command.to_vec()) {
                        accepted = Some(index);
                        break;
                    }
                }
            }

            match accepted {
                Some(index) => {
                    let started = Instant::now();
                    while started.elapsed() < Duration::from_secs(2) {
                        let (count, got) = self.n_committed(index);
                        if count >= expected && got.as_deref() == Some(command) {
                            return index;
                        }
                        sleep(Duration::from_millis(20)).await;
                    }
                    assert!(
                        retry,
                        "one({:?}) failed to reach agreement",
                        String::from_utf8_lossy(command)
                    );
                }
                None => sleep(Duration::from_millis(50)).await,
            }
        }
        panic!(
            "one({:?}) failed to reach agreement",
            String::from_utf8_lossy(command)
        );
    }

    /// Wait for `index` to be delivered by `n` servers; gives up with None once
    /// some server moves past `start_term`
    pub async fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Vec<u8>> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            if self.n_committed(index).0 >= n {
                break;
            }
            sleep(pause).await;
            if pause < Duration::from_secs(1) {
                pause *= 2;
            }
            if let Some(term) = start_term {
                let moved_on = self
                    .rafts
                    .iter()
                    .flatten()
                    .any(|raft| raft.get_state().0 > term);
                if moved_on {
                    return None;
                }
            }
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {count} servers delivered index {index}, wanted {n}");
        command
    }

    /// Final consistency check; stops every server
    pub fn end(&mut self) {
        self.assert_no_apply_errors();
        for i in 0..self.n {
            self.crash1(i);
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for raft in self.rafts.iter().flatten() {
            raft.kill();
        }
    }
}
