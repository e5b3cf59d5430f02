//! Cycle-based deadlock detection
//!
//! A background task periodically snapshots the wait-for graph (edge
//! `t_i -> t_j` iff `t_i` waits on a resource where `t_j` holds a
//! conflicting lock) and breaks cycles by aborting a victim. The search
//! strategy adapts to graph density: plain DFS for small graphs, a
//! trim-then-walk pass for sparse ones, Tarjan SCC for dense ones.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{LockManager, TxnId};
use crate::error::{MantisError, MantisResult};
use crate::runtime::RuntimeHandle;

/// Victim selection policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    Youngest,
    Oldest,
    FewestLocks,
    MostLocks,
    LowestCost,
    Adaptive,
}

impl VictimPolicy {
    pub fn from_name(name: &str) -> MantisResult<Self> {
        match name {
            "youngest" => Ok(Self::Youngest),
            "oldest" => Ok(Self::Oldest),
            "fewest_locks" => Ok(Self::FewestLocks),
            "most_locks" => Ok(Self::MostLocks),
            "lowest_cost" => Ok(Self::LowestCost),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(MantisError::invalid(format!(
                "unknown victim policy: {}",
                other
            ))),
        }
    }
}

/// Snapshot of who waits for whom
#[derive(Default)]
pub(crate) struct WaitGraph {
    pub(crate) edges: HashMap<TxnId, HashSet<TxnId>>,
    /// txn -> (resource it waits on, time spent waiting)
    pub(crate) waiting_at: HashMap<TxnId, (String, Duration)>,
    /// txn -> (locks held, start instant)
    pub(crate) txn_info: HashMap<TxnId, (usize, Instant)>,
}

impl WaitGraph {
    pub(crate) fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    fn nodes(&self) -> HashSet<TxnId> {
        let mut nodes: HashSet<TxnId> = self.edges.keys().copied().collect();
        for targets in self.edges.values() {
            nodes.extend(targets.iter().copied());
        }
        nodes
    }

    fn edge_count(&self) -> usize {
        self.edges.values().map(|t| t.len()).sum()
    }
}

/// Outcome of one detector pass
#[derive(Debug, Default, Clone)]
pub struct DetectionReport {
    pub strategy: &'static str,
    pub nodes: usize,
    pub edges: usize,
    pub cycles_found: usize,
    pub victims: Vec<TxnId>,
}

const DFS_NODE_LIMIT: usize = 32;
const SPARSE_DENSITY: f64 = 2.0;

/// Background deadlock detector
pub struct DeadlockDetector {
    manager: Arc<LockManager>,
    policy: VictimPolicy,
    interval: Duration,
    max_cycle_length: usize,
}

impl DeadlockDetector {
    pub fn new(manager: Arc<LockManager>) -> MantisResult<Self> {
        let config = manager.detector_config();
        let policy = VictimPolicy::from_name(&config.victim_policy)?;
        Ok(Self {
            interval: Duration::from_millis(config.detector_interval_ms),
            max_cycle_length: config.max_cycle_length,
            policy,
            manager,
        })
    }

    /// One detection pass: snapshot, find cycles, abort one victim per
    /// still-unbroken cycle.
    pub fn run_once(&self) -> DetectionReport {
        let graph = self.manager.wait_graph();
        let nodes = graph.nodes();
        let edge_count = graph.edge_count();
        let mut report = DetectionReport {
            nodes: nodes.len(),
            edges: edge_count,
            ..DetectionReport::default()
        };
        if edge_count == 0 {
            report.strategy = "idle";
            return report;
        }

        let density = edge_count as f64 / nodes.len().max(1) as f64;
        let cycles = if nodes.len() <= DFS_NODE_LIMIT {
            report.strategy = "dfs";
            find_cycles_dfs(&graph, self.max_cycle_length)
        } else if density < SPARSE_DENSITY {
            report.strategy = "bfs-trim";
            find_cycles_trim(&graph, self.max_cycle_length)
        } else {
            report.strategy = "tarjan";
            find_cycles_tarjan(&graph, self.max_cycle_length)
        };
        report.cycles_found = cycles.len();

        let mut broken: HashSet<TxnId> = HashSet::new();
        for cycle in cycles {
            if cycle.iter().any(|txn| broken.contains(txn)) {
                continue; // already severed by an earlier victim
            }
            let victim = select_victim(&cycle, &graph, self.policy);
            info!(
                "💀 Deadlock cycle {:?} detected ({}), victim txn {}",
                cycle, report.strategy, victim
            );
            self.manager.victimize(victim);
            self.manager.note_deadlock_broken();
            broken.insert(victim);
            report.victims.push(victim);
        }
        report
    }

    /// Spawn the periodic detection loop; stops when the runtime token
    /// cancels.
    pub fn spawn(self, runtime: RuntimeHandle) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Deadlock detector running every {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                let report = self.run_once();
                if !report.victims.is_empty() {
                    debug!(
                        "Detector pass ({}): {} cycle(s), victims {:?}",
                        report.strategy, report.cycles_found, report.victims
                    );
                }
            }
            debug!("Deadlock detector stopped");
        })
    }
}

/// Pick a victim from a cycle. Every policy reduces to "maximize a
/// preference score"; ties go to the highest (youngest) txn id for
/// determinism.
fn select_victim(cycle: &[TxnId], graph: &WaitGraph, policy: VictimPolicy) -> TxnId {
    let preference = |txn: TxnId| -> f64 {
        let (held, started) = graph
            .txn_info
            .get(&txn)
            .map(|(h, s)| (*h, *s))
            .unwrap_or((0, Instant::now()));
        let age_secs = started.elapsed().as_secs_f64();
        let waited_secs = graph
            .waiting_at
            .get(&txn)
            .map(|(_, waited)| waited.as_secs_f64())
            .unwrap_or(0.0);
        match policy {
            VictimPolicy::Youngest => txn as f64,
            VictimPolicy::Oldest => -(txn as f64),
            VictimPolicy::FewestLocks => -(held as f64),
            VictimPolicy::MostLocks => held as f64,
            VictimPolicy::LowestCost => -(held as f64 * 2.0 + age_secs),
            // Abort the transaction with the least invested work: young,
            // few locks, short wait.
            VictimPolicy::Adaptive => -(0.5 * age_secs + 0.3 * held as f64 + 0.2 * waited_secs),
        }
    };

    let mut best = cycle[0];
    let mut best_score = preference(best);
    for &candidate in &cycle[1..] {
        let score = preference(candidate);
        if score > best_score || (score == best_score && candidate > best) {
            best = candidate;
            best_score = score;
        }
    }
    best
}

/// Depth-first cycle enumeration for small graphs
fn find_cycles_dfs(graph: &WaitGraph, max_len: usize) -> Vec<Vec<TxnId>> {
    const WHITE: u8 = 0;
    const GREY: u8 = 1;
    const BLACK: u8 = 2;

    fn visit(
        node: TxnId,
        graph: &WaitGraph,
        color: &mut HashMap<TxnId, u8>,
        stack: &mut Vec<TxnId>,
        cycles: &mut Vec<Vec<TxnId>>,
        max_len: usize,
    ) {
        color.insert(node, GREY);
        stack.push(node);
        if let Some(targets) = graph.edges.get(&node) {
            for &next in targets {
                match color.get(&next).copied().unwrap_or(WHITE) {
                    GREY => {
                        if let Some(pos) = stack.iter().position(|&n| n == next) {
                            let cycle = stack[pos..].to_vec();
                            if cycle.len() >= 2 && cycle.len() <= max_len {
                                cycles.push(cycle);
                            }
                        }
                    }
                    WHITE => visit(next, graph, color, stack, cycles, max_len),
                    _ => {}
                }
            }
        }
        stack.pop();
        color.insert(node, BLACK);
    }

    let mut color = HashMap::new();
    let mut cycles = Vec::new();
    let mut nodes: Vec<TxnId> = graph.nodes().into_iter().collect();
    nodes.sort_unstable();
    for node in nodes {
        if color.get(&node).copied().unwrap_or(WHITE) == WHITE {
            let mut stack = Vec::new();
            visit(node, graph, &mut color, &mut stack, &mut cycles, max_len);
        }
    }
    cycles
}

/// Sparse graphs: iteratively trim nodes that cannot be on a cycle
/// (out-degree zero), then walk the remaining subgraph to extract cycles.
fn find_cycles_trim(graph: &WaitGraph, max_len: usize) -> Vec<Vec<TxnId>> {
    let mut out_degree: HashMap<TxnId, usize> = HashMap::new();
    let mut reverse: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
    let mut alive: HashSet<TxnId> = graph.nodes();

    for (&from, targets) in &graph.edges {
        out_degree.insert(from, targets.len());
        for &to in targets {
            reverse.entry(to).or_default().push(from);
        }
    }

    let mut queue: VecDeque<TxnId> = alive
        .iter()
        .copied()
        .filter(|n| out_degree.get(n).copied().unwrap_or(0) == 0)
        .collect();
    while let Some(node) = queue.pop_front() {
        if !alive.remove(&node) {
            continue;
        }
        if let Some(parents) = reverse.get(&node) {
            for &parent in parents {
                if !alive.contains(&parent) {
                    continue;
                }
                let degree = out_degree.entry(parent).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(parent);
                }
            }
        }
    }

    // Every surviving node sits on at least one cycle; walk edges inside
    // the surviving set until a node repeats.
    let mut cycles = Vec::new();
    let mut visited: HashSet<TxnId> = HashSet::new();
    let mut alive_sorted: Vec<TxnId> = alive.iter().copied().collect();
    alive_sorted.sort_unstable();

    for start in alive_sorted {
        if visited.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        let mut seen_at: HashMap<TxnId, usize> = HashMap::new();
        let mut node = start;
        loop {
            if let Some(&pos) = seen_at.get(&node) {
                let cycle: Vec<TxnId> = path[pos..].to_vec();
                if cycle.len() >= 2 && cycle.len() <= max_len {
                    cycles.push(cycle);
                }
                break;
            }
            if visited.contains(&node) {
                break; // joins a previously explored path
            }
            seen_at.insert(node, path.len());
            path.push(node);
            let next = graph
                .edges
                .get(&node)
                .and_then(|t| t.iter().copied().find(|n| alive.contains(n)));
            match next {
                Some(next) => node = next,
                None => break,
            }
        }
        visited.extend(path);
    }
    cycles
}

/// Dense graphs: Tarjan strongly-connected components; every SCC of size
/// >= 2 is a deadlock.
fn find_cycles_tarjan(graph: &WaitGraph, max_len: usize) -> Vec<Vec<TxnId>> {
    struct Frame {
        node: TxnId,
        neighbor_index: usize,
    }

    let mut nodes: Vec<TxnId> = graph.nodes().into_iter().collect();
    nodes.sort_unstable();
    let neighbors: HashMap<TxnId, Vec<TxnId>> = nodes
        .iter()
        .map(|&n| {
            let mut targets: Vec<TxnId> = graph
                .edges
                .get(&n)
                .map(|t| t.iter().copied().collect())
                .unwrap_or_default();
            targets.sort_unstable();
            (n, targets)
        })
        .collect();

    let mut index_counter = 0usize;
    let mut index: HashMap<TxnId, usize> = HashMap::new();
    let mut lowlink: HashMap<TxnId, usize> = HashMap::new();
    let mut on_stack: HashSet<TxnId> = HashSet::new();
    let mut stack: Vec<TxnId> = Vec::new();
    let mut sccs: Vec<Vec<TxnId>> = Vec::new();

    for &root in &nodes {
        if index.contains_key(&root) {
            continue;
        }
        let mut call_stack = vec![Frame {
            node: root,
            neighbor_index: 0,
        }];
        index.insert(root, index_counter);
        lowlink.insert(root, index_counter);
        index_counter += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some(frame) = call_stack.last_mut() {
            let node = frame.node;
            let targets = &neighbors[&node];
            if frame.neighbor_index < targets.len() {
                let next = targets[frame.neighbor_index];
                frame.neighbor_index += 1;
                if !index.contains_key(&next) {
                    index.insert(next, index_counter);
                    lowlink.insert(next, index_counter);
                    index_counter += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    call_stack.push(Frame {
                        node: next,
                        neighbor_index: 0,
                    });
                } else if on_stack.contains(&next) {
                    let low = lowlink[&node].min(index[&next]);
                    lowlink.insert(node, low);
                }
            } else {
                if lowlink[&node] == index[&node] {
                    let mut scc = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(&member);
                        scc.push(member);
                        if member == node {
                            break;
                        }
                    }
                    if scc.len() >= 2 {
                        sccs.push(scc);
                    }
                }
                call_stack.pop();
                if let Some(parent) = call_stack.last() {
                    let low = lowlink[&parent.node].min(lowlink[&node]);
                    lowlink.insert(parent.node, low);
                }
            }
        }
    }

    sccs.retain(|scc| scc.len() <= max_len);
    sccs
}
