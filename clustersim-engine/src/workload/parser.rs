//! Workload file parser
//!
//! Line-based text format:
//!
//! ```text
//! HYBRID_TRANSFORMER model_parallel_NPU_group: 2 ep: 1 pp: 1 ga: 4 checkpoints: 1 0
//! 3
//! mlp0 -1 100 ALLGATHER 4096 120 REDUCESCATTER 4096 140 ALLREDUCE 4096 10
//! ...
//! ```
//!
//! The header names the parallelization policy and optional group sizes;
//! then one line with the layer count and one line per layer.

use clustersim_core::error::{SimError, SimResult};
use clustersim_core::types::{CollectiveKind, GroupKind, ParallelStrategy, WorkloadPhase};
use std::path::Path;

/// One phase of one layer as parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub compute_cycles: u64,
    pub kind: CollectiveKind,
    pub bytes: u64,
    pub group: GroupKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: String,
    pub dep: i64,
    pub phases: [PhaseSpec; 3],
    pub weight_grad_update_cycles: u64,
    pub specific_policy: Option<String>,
}

/// Parsed workload file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub strategy: ParallelStrategy,
    pub tp: Option<usize>,
    pub ep: Option<usize>,
    pub pp: Option<usize>,
    pub vpp: Option<usize>,
    pub ga: Option<usize>,
    pub all_gpus: Option<usize>,
    pub pp_comm_bytes: Option<u64>,
    pub checkpoints: Vec<usize>,
    pub checkpoint_initiates: Vec<usize>,
    pub layers: Vec<LayerSpec>,
}

impl WorkloadSpec {
    pub fn from_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_str_contents(&text)
    }

    pub fn tp_size(&self) -> usize {
        self.tp.unwrap_or(1)
    }

    pub fn ep_size(&self) -> usize {
        self.ep.unwrap_or(1)
    }

    pub fn pp_size(&self) -> usize {
        self.pp.unwrap_or(1)
    }

    pub fn num_microbatches(&self) -> usize {
        self.ga.unwrap_or(1)
    }

    pub fn from_str_contents(text: &str) -> SimResult<Self> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        let header = lines
            .next()
            .ok_or_else(|| SimError::config("empty workload file"))?;
        let mut spec = Self::parse_header(header)?;

        let count_line = lines
            .next()
            .ok_or_else(|| SimError::config("missing layer count"))?;
        let count: usize = count_line
            .parse()
            .map_err(|_| SimError::config(format!("invalid layer count '{count_line}'")))?;

        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| SimError::config("fewer layer lines than declared"))?;
            spec.layers.push(Self::parse_layer(line, spec.strategy)?);
        }

        spec.validate()?;
        Ok(spec)
    }

    fn parse_header(line: &str) -> SimResult<Self> {
        let mut tokens = line.split_whitespace();
        let policy = tokens
            .next()
            .ok_or_else(|| SimError::config("missing workload policy"))?;
        let strategy = ParallelStrategy::parse(policy)?;

        let mut spec = WorkloadSpec {
            strategy,
            tp: None,
            ep: None,
            pp: None,
            vpp: None,
            ga: None,
            all_gpus: None,
            pp_comm_bytes: None,
            checkpoints: Vec::new(),
            checkpoint_initiates: Vec::new(),
            layers: Vec::new(),
        };

        let parse_usize = |token: &str, key: &str| -> SimResult<usize> {
            token
                .parse()
                .map_err(|_| SimError::config(format!("invalid value '{token}' for '{key}'")))
        };

        while let Some(key) = tokens.next() {
            let key = key
                .strip_suffix(':')
                .ok_or_else(|| SimError::config(format!("unexpected header token '{key}'")))?;
            match key {
                "model_parallel_NPU_group" => {
                    let v = tokens
                        .next()
                        .ok_or_else(|| SimError::config("missing value for model_parallel_NPU_group"))?;
                    spec.tp = Some(parse_usize(v, key)?);
                }
                "ep" => {
                    let v = tokens.next().ok_or_else(|| SimError::config("missing value for ep"))?;
                    spec.ep = Some(parse_usize(v, key)?);
                }
                "pp" => {
                    let v = tokens.next().ok_or_else(|| SimError::config("missing value for pp"))?;
                    spec.pp = Some(parse_usize(v, key)?);
                }
                "vpp" => {
                    let v = tokens.next().ok_or_else(|| SimError::config("missing value for vpp"))?;
                    spec.vpp = Some(parse_usize(v, key)?);
                }
                "ga" => {
                    let v = tokens.next().ok_or_else(|| SimError::config("missing value for ga"))?;
                    spec.ga = Some(parse_usize(v, key)?);
                }
                "all_gpus" => {
                    let v = tokens
                        .next()
                        .ok_or_else(|| SimError::config("missing value for all_gpus"))?;
                    spec.all_gpus = Some(parse_usize(v, key)?);
                }
                "pp_comm" => {
                    let v = tokens
                        .next()
                        .ok_or_else(|| SimError::config("missing value for pp_comm"))?;
                    spec.pp_comm_bytes = Some(
                        v.parse()
                            .map_err(|_| SimError::config(format!("invalid pp_comm '{v}'")))?,
                    );
                }
                "checkpoints" => {
                    spec.checkpoints = Self::parse_id_group(&mut tokens, "checkpoints")?;
                }
                "checkpoint_initiates" => {
                    spec.checkpoint_initiates =
                        Self::parse_id_group(&mut tokens, "checkpoint_initiates")?;
                }
                _ => {
                    return Err(SimError::config(format!("unknown header key '{key}'")));
                }
            }
        }
        Ok(spec)
    }

    /// `<count> <id0> <id1> …`
    fn parse_id_group<'a>(
        tokens: &mut impl Iterator<Item = &'a str>,
        key: &str,
    ) -> SimResult<Vec<usize>> {
        let count_tok = tokens
            .next()
            .ok_or_else(|| SimError::config(format!("missing count for '{key}'")))?;
        let count: usize = count_tok
            .parse()
            .map_err(|_| SimError::config(format!("invalid count '{count_tok}' for '{key}'")))?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let tok = tokens
                .next()
                .ok_or_else(|| SimError::config(format!("truncated id list for '{key}'")))?;
            ids.push(
                tok.parse()
                    .map_err(|_| SimError::config(format!("invalid id '{tok}' for '{key}'")))?,
            );
        }
        Ok(ids)
    }

    fn parse_layer(line: &str, strategy: ParallelStrategy) -> SimResult<LayerSpec> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 12 && tokens.len() != 13 {
            return Err(SimError::config(format!(
                "layer line needs 12 or 13 fields, got {}: '{line}'",
                tokens.len()
            )));
        }
        let num = |i: usize| -> SimResult<u64> {
            tokens[i]
                .parse()
                .map_err(|_| SimError::config(format!("invalid number '{}' in '{line}'", tokens[i])))
        };
        let phase = |cyc: usize, kind: usize, bytes: usize, wp: WorkloadPhase| -> SimResult<PhaseSpec> {
            let (k, group_override) = CollectiveKind::parse_token(tokens[kind])?;
            Ok(PhaseSpec {
                compute_cycles: num(cyc)?,
                kind: k,
                bytes: num(bytes)?,
                group: group_override.unwrap_or_else(|| default_group(strategy, wp)),
            })
        };
        Ok(LayerSpec {
            name: tokens[0].to_string(),
            dep: tokens[1]
                .parse()
                .map_err(|_| SimError::config(format!("invalid dep '{}'", tokens[1])))?,
            phases: [
                phase(2, 3, 4, WorkloadPhase::Forward)?,
                phase(5, 6, 7, WorkloadPhase::InputGrad)?,
                phase(8, 9, 10, WorkloadPhase::WeightGrad)?,
            ],
            weight_grad_update_cycles: num(11)?,
            specific_policy: tokens.get(12).map(|s| s.to_string()),
        })
    }

    fn validate(&self) -> SimResult<()> {
        let s = self.layers.len();
        if s == 0 {
            return Err(SimError::config("workload has no layers"));
        }
        for &idx in self.checkpoints.iter().chain(&self.checkpoint_initiates) {
            if idx >= s {
                return Err(SimError::config(format!(
                    "checkpoint index {idx} out of range for {s} layers"
                )));
            }
        }
        if self.pp_size() > 1 && self.num_microbatches() < self.pp_size() {
            return Err(SimError::config(format!(
                "{} microbatches cannot fill {} pipeline stages",
                self.num_microbatches(),
                self.pp_size()
            )));
        }
        Ok(())
    }

    /// Re-emit the header line; parsing it again reproduces the same
    /// parameters.
    pub fn emit_header(&self) -> String {
        let mut out = self.strategy.as_str().to_string();
        if let Some(tp) = self.tp {
            out.push_str(&format!(" model_parallel_NPU_group: {tp}"));
        }
        if let Some(ep) = self.ep {
            out.push_str(&format!(" ep: {ep}"));
        }
        if let Some(pp) = self.pp {
            out.push_str(&format!(" pp: {pp}"));
        }
        if let Some(vpp) = self.vpp {
            out.push_str(&format!(" vpp: {vpp}"));
        }
        if let Some(ga) = self.ga {
            out.push_str(&format!(" ga: {ga}"));
        }
        if let Some(all_gpus) = self.all_gpus {
            out.push_str(&format!(" all_gpus: {all_gpus}"));
        }
        if let Some(pp_comm) = self.pp_comm_bytes {
            out.push_str(&format!(" pp_comm: {pp_comm}"));
        }
        if !self.checkpoints.is_empty() {
            out.push_str(&format!(" checkpoints: {}", self.checkpoints.len()));
            for id in &self.checkpoints {
                out.push_str(&format!(" {id}"));
            }
        }
        if !self.checkpoint_initiates.is_empty() {
            out.push_str(&format!(
                " checkpoint_initiates: {}",
                self.checkpoint_initiates.len()
            ));
            for id in &self.checkpoint_initiates {
                out.push_str(&format!(" {id}"));
            }
        }
        out
    }
}

/// Group a collective runs over when the layer line carries no explicit
/// suffix: data-parallel strategies keep everything on the data group,
/// model parallelism on the tensor group, hybrids split by phase.
pub fn default_group(strategy: ParallelStrategy, phase: WorkloadPhase) -> GroupKind {
    match strategy {
        ParallelStrategy::Data => GroupKind::Dp,
        ParallelStrategy::Model
        | ParallelStrategy::Micro
        | ParallelStrategy::DistributedInference => GroupKind::Tp,
        _ => match phase {
            WorkloadPhase::Forward | WorkloadPhase::InputGrad => GroupKind::Tp,
            WorkloadPhase::WeightGrad => GroupKind::Dp,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKLOAD: &str = "\
HYBRID_TRANSFORMER_FWD_IN_BCKWD model_parallel_NPU_group: 2 ep: 1 pp: 1 ga: 4 checkpoints: 1 0 checkpoint_initiates: 1 1
2
attn0 -1 100 ALLGATHER 4096 120 REDUCESCATTER 4096 140 ALLREDUCE 8192 10
mlp0 -1 200 NONE 0 220 NONE 0 240 ALLREDUCE_DP_EP 8192 10
";

    #[test]
    fn test_parse_workload() {
        let spec = WorkloadSpec::from_str_contents(WORKLOAD).unwrap();
        assert_eq!(spec.strategy, ParallelStrategy::HybridTransformerFwdInBckwd);
        assert_eq!(spec.tp_size(), 2);
        assert_eq!(spec.checkpoints, vec![0]);
        assert_eq!(spec.checkpoint_initiates, vec![1]);
        assert_eq!(spec.layers.len(), 2);

        let attn = &spec.layers[0];
        assert_eq!(attn.phases[0].kind, CollectiveKind::AllGather);
        assert_eq!(attn.phases[0].group, GroupKind::Tp);
        assert_eq!(attn.phases[2].kind, CollectiveKind::AllReduce);
        assert_eq!(attn.phases[2].group, GroupKind::Dp);

        let mlp = &spec.layers[1];
        assert_eq!(mlp.phases[2].group, GroupKind::DpEp);
    }

    #[test]
    fn test_header_round_trip() {
        let spec = WorkloadSpec::from_str_contents(WORKLOAD).unwrap();
        let reparsed = WorkloadSpec::parse_header(&spec.emit_header()).unwrap();
        assert_eq!(reparsed.strategy, spec.strategy);
        assert_eq!(reparsed.tp, spec.tp);
        assert_eq!(reparsed.ep, spec.ep);
        assert_eq!(reparsed.pp, spec.pp);
        assert_eq!(reparsed.ga, spec.ga);
        assert_eq!(reparsed.checkpoints, spec.checkpoints);
        assert_eq!(reparsed.checkpoint_initiates, spec.checkpoint_initiates);
    }

    #[test]
    fn test_checkpoint_index_out_of_range() {
        let bad = "DATA checkpoints: 1 9\n1\nl0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 4096 1\n";
        assert!(WorkloadSpec::from_str_contents(bad).is_err());
    }

    #[test]
    fn test_microbatches_must_fill_pipeline() {
        let bad = "DATA pp: 4 ga: 2\n1\nl0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 4096 1\n";
        let err = WorkloadSpec::from_str_contents(bad).unwrap_err();
        assert!(err.to_string().contains("pipeline"));
    }

    #[test]
    fn test_unknown_policy_is_fatal() {
        assert!(WorkloadSpec::from_str_contents("PIPELINED\n0\n").is_err());
    }
}
