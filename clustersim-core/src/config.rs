//! System and network configuration files
//!
//! Both files are line-based `key: value` text. `#` starts a comment.
//! Unknown keys or unparsable values are fatal.

use crate::error::{SimError, SimResult};
use crate::types::{
    AlgorithmKind, CollectiveKind, CollectiveOptimization, IntraDimPolicy, InterDimPolicy,
    SchedulingPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// LogGP cost parameters. `l` is per-hop latency (ns), `o` the per-message
/// endpoint overhead (ns), `g` the inter-message gap (ns), and `big_g` the
/// inverse bandwidth fallback in bytes per nanosecond (per-dimension
/// bandwidth from the network file overrides it).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogGpParams {
    pub l: u64,
    pub o: u64,
    pub g: u64,
    pub big_g: f64,
}

impl Default for LogGpParams {
    fn default() -> Self {
        Self {
            l: 500,
            o: 100,
            g: 100,
            big_g: 25.0,
        }
    }
}

/// Parsed system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub scheduling_policy: SchedulingPolicy,
    pub all_reduce_impl: Vec<AlgorithmKind>,
    pub all_gather_impl: Vec<AlgorithmKind>,
    pub reduce_scatter_impl: Vec<AlgorithmKind>,
    pub all_to_all_impl: Vec<AlgorithmKind>,
    pub collective_optimization: CollectiveOptimization,
    pub endpoint_delay_ns: u64,
    pub local_reduction_delay_ns: u64,
    /// Max initialized streams per dimension (queue threshold).
    pub active_chunks_per_dimension: usize,
    /// Chunks a collective message is split into.
    pub preferred_dataset_splits: usize,
    pub loggp: LogGpParams,
    pub intra_dimension_scheduling: IntraDimPolicy,
    pub inter_dimension_scheduling: InterDimPolicy,
    pub boost_mode: bool,
    pub model_shared_bus: bool,
    /// Local memory bandwidth in bytes per nanosecond.
    pub local_mem_bw: f64,
    /// Messages of at least this many bytes use the rendezvous handshake.
    pub rendezvous_threshold: u64,
    pub max_running_streams: usize,
    pub ready_list_threshold: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            scheduling_policy: SchedulingPolicy::Lifo,
            all_reduce_impl: vec![AlgorithmKind::Ring],
            all_gather_impl: vec![AlgorithmKind::Ring],
            reduce_scatter_impl: vec![AlgorithmKind::Ring],
            all_to_all_impl: vec![AlgorithmKind::Direct],
            collective_optimization: CollectiveOptimization::Baseline,
            endpoint_delay_ns: 10,
            local_reduction_delay_ns: 10,
            active_chunks_per_dimension: 1,
            preferred_dataset_splits: 4,
            loggp: LogGpParams::default(),
            intra_dimension_scheduling: IntraDimPolicy::Fifo,
            inter_dimension_scheduling: InterDimPolicy::Ascending,
            boost_mode: false,
            model_shared_bus: false,
            local_mem_bw: 100.0,
            rendezvous_threshold: u64::MAX,
            max_running_streams: usize::MAX / 2,
            ready_list_threshold: 8,
        }
    }
}

impl SystemConfig {
    pub fn from_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_str_contents(&text)
    }

    pub fn from_str_contents(text: &str) -> SimResult<Self> {
        let mut cfg = Self::default();
        for (key, value) in parse_kv_lines(text)? {
            cfg.apply(&key, &value)?;
        }
        if cfg.preferred_dataset_splits == 0 {
            return Err(SimError::config("preferred-dataset-splits must be > 0"));
        }
        if cfg.active_chunks_per_dimension == 0 {
            return Err(SimError::config("active-chunks-per-dimension must be > 0"));
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> SimResult<()> {
        match key {
            "scheduling-policy" => {
                self.scheduling_policy = SchedulingPolicy::parse(value)?;
                if matches!(
                    self.scheduling_policy,
                    SchedulingPolicy::Highest | SchedulingPolicy::None
                ) {
                    return Err(SimError::config(format!(
                        "scheduling-policy must be LIFO or FIFO, got '{value}'"
                    )));
                }
            }
            "all-reduce-implementation" => {
                self.all_reduce_impl = AlgorithmKind::parse_per_dim(value)?;
            }
            "all-gather-implementation" => {
                self.all_gather_impl = AlgorithmKind::parse_per_dim(value)?;
            }
            "reduce-scatter-implementation" => {
                self.reduce_scatter_impl = AlgorithmKind::parse_per_dim(value)?;
            }
            "all-to-all-implementation" => {
                self.all_to_all_impl = AlgorithmKind::parse_per_dim(value)?;
            }
            "collective-optimization" => {
                self.collective_optimization = CollectiveOptimization::parse(value)?;
            }
            "endpoint-delay" => self.endpoint_delay_ns = parse_num(key, value)?,
            "local-reduction-delay" => self.local_reduction_delay_ns = parse_num(key, value)?,
            "active-chunks-per-dimension" => {
                self.active_chunks_per_dimension = parse_num(key, value)?
            }
            "preferred-dataset-splits" => self.preferred_dataset_splits = parse_num(key, value)?,
            "L" => self.loggp.l = parse_num(key, value)?,
            "o" => self.loggp.o = parse_num(key, value)?,
            "g" => self.loggp.g = parse_num(key, value)?,
            "G" => self.loggp.big_g = parse_float(key, value)?,
            "intra-dimension-scheduling" => {
                self.intra_dimension_scheduling = IntraDimPolicy::parse(value)?;
            }
            "inter-dimension-scheduling" => {
                self.inter_dimension_scheduling = InterDimPolicy::parse(value)?;
            }
            "boost-mode" => self.boost_mode = parse_num::<u64>(key, value)? != 0,
            "model-shared-bus" => self.model_shared_bus = parse_num::<u64>(key, value)? != 0,
            "local-mem-bw" => self.local_mem_bw = parse_float(key, value)?,
            "rendezvous-threshold" => self.rendezvous_threshold = parse_num(key, value)?,
            "max-running-streams" => self.max_running_streams = parse_num(key, value)?,
            "ready-list-threshold" => self.ready_list_threshold = parse_num(key, value)?,
            _ => {
                return Err(SimError::config(format!("unknown system config key '{key}'")));
            }
        }
        Ok(())
    }

    /// Per-dimension algorithm table for every operation kind.
    pub fn per_op_algorithms(&self) -> HashMap<CollectiveKind, Vec<AlgorithmKind>> {
        let mut m = HashMap::new();
        m.insert(CollectiveKind::AllReduce, self.all_reduce_impl.clone());
        m.insert(CollectiveKind::AllGather, self.all_gather_impl.clone());
        m.insert(CollectiveKind::ReduceScatter, self.reduce_scatter_impl.clone());
        m.insert(CollectiveKind::AllToAll, self.all_to_all_impl.clone());
        m
    }

    /// True when any operation is configured for the NCCL-accurate mode.
    pub fn nccl_mode(&self) -> bool {
        [
            &self.all_reduce_impl,
            &self.all_gather_impl,
            &self.reduce_scatter_impl,
            &self.all_to_all_impl,
        ]
        .iter()
        .any(|v| v.contains(&AlgorithmKind::NcclFlowModel))
    }
}

/// Parsed network description for the analytical backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub dims: Vec<usize>,
    /// Per-dimension bandwidth in GB/s (equivalently bytes per ns).
    pub bandwidth: Vec<f64>,
    /// Per-dimension hop latency in ns.
    pub latency: Vec<u64>,
}

impl NetworkConfig {
    pub fn from_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_str_contents(&text)
    }

    pub fn from_str_contents(text: &str) -> SimResult<Self> {
        let mut dims = Vec::new();
        let mut bandwidth = Vec::new();
        let mut latency = Vec::new();
        for (key, value) in parse_kv_lines(text)? {
            match key.as_str() {
                "dims" => {
                    dims = value
                        .split_whitespace()
                        .map(|t| parse_num("dims", t))
                        .collect::<SimResult<_>>()?;
                }
                "bandwidth" => {
                    bandwidth = value
                        .split_whitespace()
                        .map(|t| parse_float("bandwidth", t))
                        .collect::<SimResult<_>>()?;
                }
                "latency" => {
                    latency = value
                        .split_whitespace()
                        .map(|t| parse_num("latency", t))
                        .collect::<SimResult<_>>()?;
                }
                _ => {
                    return Err(SimError::config(format!(
                        "unknown network config key '{key}'"
                    )));
                }
            }
        }
        let cfg = Self {
            dims,
            bandwidth,
            latency,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.dims.is_empty() {
            return Err(SimError::config("network file must define dims"));
        }
        if self.bandwidth.len() != self.dims.len() || self.latency.len() != self.dims.len() {
            return Err(SimError::config(format!(
                "bandwidth/latency entries must match {} dims",
                self.dims.len()
            )));
        }
        if self.bandwidth.iter().any(|&b| b <= 0.0) {
            return Err(SimError::config("bandwidth entries must be > 0"));
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.dims.iter().product()
    }

    /// Mirror a `break_dimension` split so link parameters follow the
    /// regenerated dimensions. The split halves inherit the broken
    /// dimension's bandwidth and latency.
    pub fn split_dim(&mut self, k: usize, a: usize) -> SimResult<()> {
        if k >= self.dims.len() || self.dims[k] % a != 0 {
            return Err(SimError::config(format!(
                "cannot split network dim {k} by {a}"
            )));
        }
        let b = self.dims[k] / a;
        self.dims.splice(k..=k, [a, b]);
        let bw = self.bandwidth[k];
        self.bandwidth.insert(k, bw);
        let lat = self.latency[k];
        self.latency.insert(k, lat);
        Ok(())
    }
}

fn parse_kv_lines(text: &str) -> SimResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(SimError::config(format!(
                "line {}: expected 'key: value', got '{raw}'",
                lineno + 1
            )));
        };
        let value = value.trim();
        if value.is_empty() {
            warn!(line = lineno + 1, key, "empty config value");
        }
        out.push((key.trim().to_string(), value.to_string()));
    }
    Ok(out)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> SimResult<T> {
    value
        .parse()
        .map_err(|_| SimError::config(format!("invalid value '{value}' for key '{key}'")))
}

fn parse_float(key: &str, value: &str) -> SimResult<f64> {
    value
        .parse()
        .map_err(|_| SimError::config(format!("invalid value '{value}' for key '{key}'")))
}
