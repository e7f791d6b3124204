use crate::collective::helpers::{CountingComm, FailingComm, Rig, drive};
use hoststage::{
    CollectiveState, Communicator, HostStageConfig, HostStageError, LocalComm, Phase,
    ProgressEngine, ReduceOp, StreamId, alltoall, reduce_scatter,
};
use hoststage::types::to_native_op;
use std::sync::Arc;
use std::time::Duration;

fn solo() -> Arc<dyn Communicator> {
    Arc::new(LocalComm::group(1).remove(0))
}

#[test]
fn test_phase_trail_is_monotonic() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u32>(4).unwrap();
    let recv = rig.device.alloc_elems::<u32>(4).unwrap();

    let mut state = unsafe { alltoall::<u32>(&rig.ctx, send, recv, 4, solo(), stream) }.unwrap();
    assert_eq!(state.phase(), Phase::StageReady);
    drive(&mut state);

    assert_eq!(state.phase(), Phase::Done);
    assert_eq!(
        state.phase_trail(),
        &[
            Phase::StageReady,
            Phase::NetworkPending,
            Phase::DrainPending,
            Phase::Done
        ]
    );
}

#[test]
fn test_advance_after_done_is_noop() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<i32>(2).unwrap();
    let recv = rig.device.alloc_elems::<i32>(2).unwrap();

    let mut state = unsafe { alltoall::<i32>(&rig.ctx, send, recv, 2, solo(), stream) }.unwrap();
    drive(&mut state);
    let stats = rig.pool.stats();

    for _ in 0..3 {
        assert!(state.advance().unwrap());
    }
    assert_eq!(state.phase_trail().len(), 4);
    assert_eq!(rig.pool.stats(), stats);
}

#[test]
fn test_staging_released_exactly_once() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<f64>(8).unwrap();
    let recv = rig.device.alloc_elems::<f64>(8).unwrap();

    let mut state = unsafe { alltoall::<f64>(&rig.ctx, send, recv, 8, solo(), stream) }.unwrap();
    assert_eq!(rig.pool.stats().outstanding_bytes, 64);
    drive(&mut state);
    state.advance().unwrap();
    drop(state);

    let stats = rig.pool.stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.outstanding_bytes, 0);
}

#[test]
fn test_zero_count_skips_network() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u8>(0).unwrap();
    let recv = rig.device.alloc_elems::<u8>(0).unwrap();

    let comms: Vec<_> = LocalComm::group(2).into_iter().map(CountingComm::new).collect();
    let mut a2a =
        unsafe { alltoall::<u8>(&rig.ctx, send, recv, 0, comms[0].clone(), stream) }.unwrap();
    let mut rs = unsafe {
        reduce_scatter::<u8>(&rig.ctx, send, recv, 0, ReduceOp::Sum, comms[1].clone(), stream)
    }
    .unwrap();
    drive(&mut a2a);
    drive(&mut rs);

    assert_eq!(a2a.phase_trail().len(), 4);
    assert_eq!(rs.phase_trail().len(), 4);
    assert!(comms.iter().all(|c| c.issued() == 0));
    assert_eq!(rig.pool.stats().acquired, 0);
}

#[test]
fn test_pool_exhaustion_surfaces() {
    let rig = Rig::with_config(&HostStageConfig {
        pinned_capacity_bytes: 64,
        ..HostStageConfig::default()
    });
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u64>(16).unwrap();
    let recv = rig.device.alloc_elems::<u64>(16).unwrap();

    let err = unsafe { alltoall::<u64>(&rig.ctx, send, recv, 16, solo(), stream) }.unwrap_err();
    assert!(matches!(
        err,
        HostStageError::PinnedExhausted {
            requested: 128,
            capacity: 64,
            ..
        }
    ));
    assert_eq!(rig.pool.stats().acquired, 0);
}

#[test]
fn test_oversized_count_rejected() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let buf = rig.device.alloc_elems::<u64>(4).unwrap();
    let comm: Arc<dyn Communicator> = Arc::new(LocalComm::group(4).remove(0));

    let err = unsafe { alltoall::<u64>(&rig.ctx, buf, buf, usize::MAX / 2, comm, stream) }
        .unwrap_err();
    assert!(matches!(
        err,
        HostStageError::PayloadTooLarge { world: 4, .. }
    ));

    let comm: Arc<dyn Communicator> = Arc::new(LocalComm::group(1).remove(0));
    let err = unsafe {
        reduce_scatter::<u32>(&rig.ctx, buf, buf, usize::MAX / 2, ReduceOp::Sum, comm, stream)
    }
    .unwrap_err();
    assert!(matches!(err, HostStageError::PayloadTooLarge { .. }));
    assert_eq!(rig.pool.stats().acquired, 0);
}

#[test]
fn test_short_recv_rejected_before_copy_out() {
    let rig = Rig::with_config(&HostStageConfig {
        sim_copy_latency: Duration::from_millis(50),
        ..HostStageConfig::default()
    });
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u8>(16).unwrap();
    let recv = rig.device.alloc_elems::<u8>(1).unwrap();
    rig.device.upload(stream, send, &[0xAAu8; 16]).unwrap();

    let err = unsafe { alltoall::<u8>(&rig.ctx, send, recv, 16, solo(), stream) }.unwrap_err();
    assert!(matches!(err, HostStageError::DeviceError { .. }));
    assert_eq!(rig.pool.stats().acquired, 0);

    // Nothing was queued, so a buffer acquired now is never written behind
    // its owner's back.
    let fresh = rig.pool.acquire(16).unwrap();
    rig.device.synchronize(stream).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(fresh.iter().all(|&b| b == 0));
}

#[test]
fn test_invalid_stream_releases_staging() {
    let rig = Rig::new();
    let send = rig.device.alloc_elems::<u32>(4).unwrap();
    let recv = rig.device.alloc_elems::<u32>(4).unwrap();

    let err =
        unsafe { alltoall::<u32>(&rig.ctx, send, recv, 4, solo(), StreamId(999)) }.unwrap_err();
    assert!(matches!(err, HostStageError::DeviceError { .. }));

    let stats = rig.pool.stats();
    assert_eq!(stats.acquired, stats.released);
    assert_eq!(stats.outstanding_bytes, 0);
}

#[test]
fn test_network_failure_aborts_state() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<i32>(4).unwrap();
    let recv = rig.device.alloc_elems::<i32>(4).unwrap();

    let state =
        unsafe { alltoall::<i32>(&rig.ctx, send, recv, 4, Arc::new(FailingComm), stream) }.unwrap();
    let mut engine = ProgressEngine::new();
    engine.enqueue(state);

    let err = engine.run_to_completion().unwrap_err();
    assert!(matches!(err, HostStageError::NetworkFailed { rank: 0, .. }));
    assert!(engine.is_idle());
    assert_eq!(engine.completed(), 0);
    assert_eq!(rig.pool.stats().outstanding_bytes, 0);
}

#[test]
fn test_state_metadata() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<f32>(3).unwrap();
    let recv = rig.device.alloc_elems::<f32>(3).unwrap();

    let mut a2a = unsafe { alltoall::<f32>(&rig.ctx, send, recv, 3, solo(), stream) }.unwrap();
    assert_eq!(a2a.name(), "HTAlltoall");
    assert_eq!(a2a.bound_stream(), stream);
    assert!(!a2a.needs_final_barrier());
    drive(&mut a2a);

    let mut rs = unsafe {
        reduce_scatter::<f32>(&rig.ctx, send, recv, 3, ReduceOp::Min, solo(), stream)
    }
    .unwrap();
    assert_eq!(rs.name(), "HTReduceScatter");
    assert_eq!(rs.kind().native_op(), to_native_op(ReduceOp::Min));
    assert!(!rs.needs_final_barrier());
    drive(&mut rs);
}

#[test]
fn test_engine_drives_states_on_many_streams() {
    let rig = Rig::new();
    let comm = solo();
    let mut engine = ProgressEngine::new();
    let mut checks = Vec::new();

    for i in 0..4u32 {
        let stream = rig.device.create_stream().unwrap();
        let send = rig.device.alloc_elems::<u32>(2).unwrap();
        let recv = rig.device.alloc_elems::<u32>(2).unwrap();
        rig.device.upload(stream, send, &[i, i * 100]).unwrap();
        let state =
            unsafe { alltoall::<u32>(&rig.ctx, send, recv, 2, Arc::clone(&comm), stream) }.unwrap();
        engine.enqueue(state);
        assert_eq!(engine.pending_on(stream), 1);
        checks.push((stream, recv, vec![i, i * 100]));
    }

    assert_eq!(engine.pending(), 4);
    engine.run_to_completion().unwrap();
    assert!(engine.is_idle());
    assert_eq!(engine.completed(), 4);

    for (stream, recv, expected) in checks {
        assert_eq!(rig.device.download::<u32>(stream, recv, 2).unwrap(), expected);
    }
    assert_eq!(rig.pool.stats().outstanding_bytes, 0);
}

#[test]
fn test_mismatched_peers_abort_and_group_recovers() {
    let rig = Rig::new();
    let comms: Vec<Arc<LocalComm>> = LocalComm::group(2).into_iter().map(Arc::new).collect();
    let (s0, s1) = (
        rig.device.create_stream().unwrap(),
        rig.device.create_stream().unwrap(),
    );
    let bufs: Vec<u64> = (0..4)
        .map(|_| rig.device.alloc_elems::<i32>(4).unwrap())
        .collect();

    let mut engine = ProgressEngine::new();
    let a2a = unsafe {
        alltoall::<i32>(&rig.ctx, bufs[0], bufs[1], 2, comms[0].clone(), s0)
    }
    .unwrap();
    let rs = unsafe {
        reduce_scatter::<i32>(&rig.ctx, bufs[2], bufs[3], 2, ReduceOp::Sum, comms[1].clone(), s1)
    }
    .unwrap();
    engine.enqueue(a2a);
    engine.enqueue(rs);

    for _ in 0..2 {
        let err = engine.run_to_completion().unwrap_err();
        assert!(matches!(err, HostStageError::NetworkFailed { .. }));
    }
    assert!(engine.is_idle());
    assert_eq!(rig.pool.stats().outstanding_bytes, 0);

    // The aborted round left nothing behind: the next collective matches.
    let (t0, t1) = (
        rig.device.create_stream().unwrap(),
        rig.device.create_stream().unwrap(),
    );
    rig.device.upload(t0, bufs[0], &[1i32, 2, 3, 4]).unwrap();
    rig.device.upload(t1, bufs[2], &[5i32, 6, 7, 8]).unwrap();
    let a = unsafe { alltoall::<i32>(&rig.ctx, bufs[0], bufs[1], 2, comms[0].clone(), t0) }.unwrap();
    let b = unsafe { alltoall::<i32>(&rig.ctx, bufs[2], bufs[3], 2, comms[1].clone(), t1) }.unwrap();
    engine.enqueue(a);
    engine.enqueue(b);
    engine.run_to_completion().unwrap();
    assert_eq!(rig.device.download::<i32>(t0, bufs[1], 4).unwrap(), vec![1, 2, 5, 6]);
    assert_eq!(rig.device.download::<i32>(t1, bufs[3], 4).unwrap(), vec![3, 4, 7, 8]);
}
