//! End-of-run reports
//!
//! Two CSV files: a per-layer summary (compute, exposed communication by
//! group kind, bubble, totals, all in seconds) and a per-dimension link
//! utilization table over ten equal time buckets.

use crate::scheduler::StreamScheduler;
use crate::workload::Workload;
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::types::{GroupKind, WorkloadPhase};
use std::path::Path;

const NS_PER_SEC: f64 = 1e9;
const UTILIZATION_BUCKETS: usize = 10;

fn secs(ns: u64) -> f64 {
    ns as f64 / NS_PER_SEC
}

fn map_err(e: csv::Error) -> SimError {
    SimError::Backend(format!("report write failed: {e}"))
}

/// Per-layer summary of one node's run.
pub fn write_summary(path: impl AsRef<Path>, workload: &Workload) -> SimResult<()> {
    let mut w = csv::Writer::from_path(path.as_ref()).map_err(map_err)?;
    w.write_record([
        "layer",
        "fwd_compute_s",
        "ig_compute_s",
        "wg_compute_s",
        "tp_comm_s",
        "dp_comm_s",
        "ep_comm_s",
        "dp_ep_comm_s",
        "pp_comm_s",
        "fwd_exposed_s",
        "ig_exposed_s",
        "wg_exposed_s",
        "bubble_s",
        "total_s",
    ])
    .map_err(map_err)?;

    let bubble_fraction = workload.bubble_fraction();
    let mut totals = [0.0f64; 13];
    for layer in &workload.layers {
        let mut group_comm = [0.0f64; 5];
        for phase in WorkloadPhase::ALL {
            let idx = match layer.group(phase) {
                GroupKind::Tp => 0,
                GroupKind::Dp => 1,
                GroupKind::Ep => 2,
                GroupKind::DpEp => 3,
                GroupKind::Pp => 4,
            };
            group_comm[idx] += secs(layer.total_comm_ns[phase.index()]);
        }
        let compute: [f64; 3] = [
            secs(layer.total_compute_ns[0]),
            secs(layer.total_compute_ns[1]),
            secs(layer.total_compute_ns[2]),
        ];
        let exposed: [f64; 3] = [
            secs(layer.exposed_comm_ns[0]),
            secs(layer.exposed_comm_ns[1]),
            secs(layer.exposed_comm_ns[2]),
        ];
        let bubble = compute.iter().sum::<f64>() * bubble_fraction;
        let total = compute.iter().sum::<f64>() + exposed.iter().sum::<f64>() + bubble;

        let row = [
            compute[0], compute[1], compute[2], group_comm[0], group_comm[1], group_comm[2],
            group_comm[3], group_comm[4], exposed[0], exposed[1], exposed[2], bubble, total,
        ];
        for (t, v) in totals.iter_mut().zip(row) {
            *t += v;
        }
        let mut record = vec![layer.name.clone()];
        record.extend(row.iter().map(|v| format!("{v:.9}")));
        w.write_record(&record).map_err(map_err)?;
    }

    let mut record = vec!["total".to_string()];
    record.extend(totals.iter().map(|v| format!("{v:.9}")));
    w.write_record(&record).map_err(map_err)?;
    w.flush()?;
    Ok(())
}

/// Per-dimension busy percentage over ten equal buckets of the run.
pub fn write_utilization(
    path: impl AsRef<Path>,
    scheduler: &StreamScheduler,
    end_ns: u64,
) -> SimResult<()> {
    let mut w = csv::Writer::from_path(path.as_ref()).map_err(map_err)?;
    let mut header = vec!["dimension".to_string()];
    header.extend((0..UTILIZATION_BUCKETS).map(|b| format!("bucket{b}_pct")));
    header.push("mean_latency_ns".to_string());
    w.write_record(&header).map_err(map_err)?;

    let end = end_ns.max(1);
    let bucket_len = (end as f64 / UTILIZATION_BUCKETS as f64).max(1.0);
    for dim in 0..scheduler.num_dims() {
        let segments = scheduler.busy_segments(dim, end_ns);
        let mut busy = [0.0f64; UTILIZATION_BUCKETS];
        for (start, stop) in segments {
            for (b, busy_b) in busy.iter_mut().enumerate() {
                let b_start = b as f64 * bucket_len;
                let b_stop = b_start + bucket_len;
                let overlap = (stop as f64).min(b_stop) - (start as f64).max(b_start);
                if overlap > 0.0 {
                    *busy_b += overlap;
                }
            }
        }
        let mut record = vec![dim.to_string()];
        record.extend(
            busy.iter()
                .map(|b| format!("{:.2}", 100.0 * b / bucket_len)),
        );
        record.push(format!("{:.1}", scheduler.mean_latency_ns(dim)));
        w.write_record(&record).map_err(map_err)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamArena;
    use crate::workload::WorkloadSpec;
    use clustersim_core::types::IntraDimPolicy;

    #[test]
    fn test_summary_writes_one_row_per_layer() {
        let spec = WorkloadSpec::from_str_contents(
            "DATA\n2\nl0 -1 100 NONE 0 100 NONE 0 100 ALLREDUCE 4096 10\n\
             l1 -1 100 NONE 0 100 NONE 0 100 ALLREDUCE 4096 10\n",
        )
        .unwrap();
        let workload = crate::workload::Workload::new(0, &spec, 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        write_summary(&path, &workload).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        // Header, two layers, totals.
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("layer,"));
        assert!(lines[3].starts_with("total,"));
    }

    #[test]
    fn test_utilization_buckets() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(2, IntraDimPolicy::Fifo, 1, usize::MAX);
        // One dimension busy for the first half of a 1000ns run.
        let id = {
            use crate::stream::{Stream, StreamState};
            arena.insert(Stream {
                id: 0,
                tag_base: 0,
                batch: 0,
                chunk_index: 0,
                initial_data_size: 4096,
                priority: 0,
                state: StreamState::Ready,
                phases: Default::default(),
                total_phases: 1,
                steps_finished: 0,
                created_ns: 0,
                phase_started_ns: 0,
                pair_key: (0, 0),
            })
        };
        sched.add_stream(0, id, &arena);
        sched.admit(0, 0, &mut arena);
        sched.remove_stream(0, id, 500, 500, true);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("util.csv");
        write_utilization(&path, &sched, 1000).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<_> = text.lines().collect();
        assert_eq!(rows.len(), 3);
        let dim0: Vec<_> = rows[1].split(',').collect();
        assert_eq!(dim0[1], "100.00");
        assert_eq!(dim0[6], "0.00");
    }
}
