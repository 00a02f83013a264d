//! End-to-end simulation scenarios over the analytical backend.

use clustersim_core::config::{NetworkConfig, SystemConfig};
use clustersim_engine::workload::WorkloadSpec;
use clustersim_engine::Cluster;

fn system(text: &str) -> SystemConfig {
    SystemConfig::from_str_contents(text).unwrap()
}

fn network(text: &str) -> NetworkConfig {
    NetworkConfig::from_str_contents(text).unwrap()
}

fn workload(text: &str) -> WorkloadSpec {
    WorkloadSpec::from_str_contents(text).unwrap()
}

#[test]
fn pure_dp_two_layers_one_pass() {
    let wl = workload(
        "DATA\n2\n\
         l0 -1 100 NONE 0 100 NONE 0 100 ALLREDUCE 4096 0\n\
         l1 -1 100 NONE 0 100 NONE 0 100 ALLREDUCE 4096 0\n",
    );
    let sys = system("scheduling-policy: FIFO\npreferred-dataset-splits: 1\n");
    let net = network("dims: 4\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();

    // Two weight-gradient all-reduces per node, one chunk each.
    assert_eq!(summary.streams_injected, 8);
    assert_eq!(summary.streams_injected, summary.streams_finished);
    assert!(summary.finish_time_ns > 0);
    for node in &cluster.nodes {
        assert_eq!(node.comm.streams_injected, 2);
        assert_eq!(node.workload.pass, 1);
        assert!(node.workload.finished);
        // No forward or input-gradient communication happened.
        for layer in &node.workload.layers {
            assert_eq!(layer.total_comm_ns[0], 0);
            assert_eq!(layer.total_comm_ns[1], 0);
            assert!(layer.total_comm_ns[2] > 0);
        }
    }
}

#[test]
fn transformer_tp2_dp2_two_passes() {
    let wl = workload(
        "HYBRID_TRANSFORMER model_parallel_NPU_group: 2\n3\n\
         attn -1 50 ALLGATHER 4096 50 REDUCESCATTER 4096 50 ALLREDUCE 4096 0\n\
         mlp -1 50 ALLGATHER 4096 50 REDUCESCATTER 4096 50 ALLREDUCE 4096 0\n\
         head -1 50 ALLGATHER 4096 50 REDUCESCATTER 4096 50 ALLREDUCE 4096 0\n",
    );
    let sys = system("preferred-dataset-splits: 1\n");
    let net = network("dims: 2 2\nbandwidth: 100 25\nlatency: 500 1000\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 2, false).unwrap();
    let summary = cluster.run().unwrap();

    // Per pass: 3 forward all-gathers and 3 input-grad reduce-scatters on
    // the tensor dimension, 3 weight-grad all-reduces on the data
    // dimension.
    for node in &cluster.nodes {
        assert_eq!(node.comm.streams_injected, 18);
        assert_eq!(node.workload.pass, 2);
        assert!(node.workload.finished);
    }
    assert_eq!(summary.streams_injected, 72);
    assert_eq!(summary.streams_injected, summary.streams_finished);
}

#[test]
fn activation_recomputation_walk() {
    // 8 layers, checkpoints at 0 and 4, triggers at 3 and 7; no
    // communication so the finish time counts exactly the compute walk:
    // 8 forward + 16 backward + 6 recomputed forward layers, 10 cycles
    // each.
    let wl = workload(
        "HYBRID_TRANSFORMER_FWD_IN_BCKWD checkpoints: 2 0 4 checkpoint_initiates: 2 3 7\n8\n\
         l0 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l1 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l2 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l3 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l4 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l5 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l6 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n\
         l7 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n",
    );
    let sys = system("");
    let net = network("dims: 1\nbandwidth: 100\nlatency: 100\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 1, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.finish_time_ns, 300);
    assert_eq!(summary.streams_injected, 0);
}

#[test]
fn recompute_trigger_without_checkpoint_is_fatal() {
    let wl = workload(
        "HYBRID_TRANSFORMER_FWD_IN_BCKWD checkpoint_initiates: 1 0\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 NONE 0 0\n",
    );
    let sys = system("");
    let net = network("dims: 1\nbandwidth: 100\nlatency: 100\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 1, 1, false).unwrap();
    let err = cluster.run().unwrap_err();
    assert!(err.to_string().contains("checkpoint"));
}

#[test]
fn forward_only_strategy_skips_backward() {
    let wl = workload(
        "DISTRIBUTED_INFERENCE\n2\n\
         l0 -1 20 NONE 0 0 NONE 0 0 NONE 0 0\n\
         l1 -1 20 NONE 0 0 NONE 0 0 NONE 0 0\n",
    );
    let sys = system("");
    let net = network("dims: 1\nbandwidth: 100\nlatency: 100\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 1, 3, false).unwrap();
    let summary = cluster.run().unwrap();
    // Three forward-only passes over two 20-cycle layers.
    assert_eq!(summary.finish_time_ns, 120);
}

#[test]
fn break_dimension_16_on_8x8() {
    let wl = workload(
        "HYBRID_TRANSFORMER model_parallel_NPU_group: 16\n1\n\
         l0 -1 10 ALLGATHER 8192 10 REDUCESCATTER 8192 10 ALLREDUCE 8192 0\n",
    );
    let sys = system("preferred-dataset-splits: 1\n");
    let net = network("dims: 8 8\nbandwidth: 100 25\nlatency: 500 1000\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 64, 1, false).unwrap();
    // The 16-rank tensor group split dimension 1 into (2, 4).
    assert_eq!(cluster.nodes[0].comm.topo.dims(), &[8, 2, 4]);
    assert_eq!(cluster.nodes[0].comm.scheduler.num_dims(), 3);

    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, summary.streams_finished);
    for node in &cluster.nodes {
        assert!(node.workload.finished);
    }
}

#[test]
fn rendezvous_large_weight_gradients() {
    let wl = workload(
        "DATA\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 1048576 0\n",
    );
    let sys = system("rendezvous-threshold: 8192\npreferred-dataset-splits: 2\n");
    let net = network("dims: 2\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 2, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, summary.streams_finished);
    assert_eq!(summary.streams_injected, 4);
}

#[test]
fn scheduler_bounds_hold_with_many_chunks() {
    let wl = workload(
        "DATA\n4\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 262144 0\n\
         l1 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 262144 0\n\
         l2 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 262144 0\n\
         l3 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 262144 0\n",
    );
    let sys = system("preferred-dataset-splits: 8\nactive-chunks-per-dimension: 2\n");
    let net = network("dims: 4\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    // 4 layers x 8 chunks per node.
    assert_eq!(summary.streams_injected, 4 * 8 * 4);
    assert_eq!(summary.streams_injected, summary.streams_finished);
    for node in &cluster.nodes {
        // All queues drained and nothing left running.
        assert_eq!(node.comm.scheduler.total_running_streams, 0);
        for dim in 0..node.comm.scheduler.num_dims() {
            assert_eq!(node.comm.scheduler.total_active_chunks[dim], 0);
        }
    }
}

#[test]
fn local_bw_aware_all_reduce_completes() {
    let wl = workload(
        "HYBRID_TRANSFORMER model_parallel_NPU_group: 2\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 65536 0\n",
    );
    let sys = system("collective-optimization: localBWAware\npreferred-dataset-splits: 1\n");
    let net = network("dims: 2 2\nbandwidth: 100 25\nlatency: 500 1000\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, summary.streams_finished);
    // Each stream carries the reduce-scatter sweep and the mirrored
    // all-gather sweep on the data dimension.
    assert!(summary.finish_time_ns > 0);
}

#[test]
fn double_binary_tree_all_reduce_completes() {
    let wl = workload(
        "DATA\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 32768 0\n",
    );
    let sys = system("all-reduce-implementation: doubleBinaryTree\npreferred-dataset-splits: 2\n");
    let net = network("dims: 4\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, 8);
    assert_eq!(summary.streams_injected, summary.streams_finished);
}

#[test]
fn halving_doubling_all_reduce_completes() {
    let wl = workload(
        "DATA\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 32768 0\n",
    );
    let sys = system("all-reduce-implementation: halvingDoubling\npreferred-dataset-splits: 1\n");
    let net = network("dims: 4\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, 4);
    assert_eq!(summary.streams_injected, summary.streams_finished);
}

#[test]
fn expert_all_to_all_completes() {
    // ALLTOALL_EP runs over the expert group (dim 1 after the tensor dim).
    let wl = workload(
        "HYBRID_TRANSFORMER model_parallel_NPU_group: 2 ep: 2\n1\n\
         moe -1 10 ALLTOALL_EP 16384 10 ALLTOALL_EP 16384 10 NONE 0 0\n",
    );
    let sys = system("preferred-dataset-splits: 1\n");
    let net = network("dims: 2 2 2\nbandwidth: 100 50 25\nlatency: 500 500 1000\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 8, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    // One forward and one input-grad all-to-all per node.
    assert_eq!(summary.streams_injected, 16);
    assert_eq!(summary.streams_injected, summary.streams_finished);
}

#[test]
fn nccl_flow_mode_all_reduce_completes() {
    let wl = workload(
        "DATA\n1\n\
         l0 -1 10 NONE 0 10 NONE 0 10 ALLREDUCE 1048576 0\n",
    );
    let sys = system("all-reduce-implementation: nccl\npreferred-dataset-splits: 1\n");
    let net = network("dims: 4\nbandwidth: 100\nlatency: 500\n");

    let mut cluster = Cluster::new(&wl, &sys, &net, 4, 1, false).unwrap();
    let summary = cluster.run().unwrap();
    assert_eq!(summary.streams_injected, 4);
    assert_eq!(summary.streams_injected, summary.streams_finished);
}
