use crate::collective::helpers::{Rig, drive, drive_pair};
use hoststage::{
    CollectiveState, Communicator, HostStageConfig, LocalComm, Phase, ReduceOp, StagedCollective,
    alltoall, reduce_scatter,
};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn solo() -> Arc<dyn Communicator> {
    Arc::new(LocalComm::group(1).remove(0))
}

/// Enqueue a "kernel" on `stream` that reads `count` u32s at `ptr` and
/// reports them back.
fn spawn_reader(rig: &Rig, stream: hoststage::StreamId, ptr: u64, count: usize) -> mpsc::Receiver<Vec<u32>> {
    let (tx, rx) = mpsc::channel();
    rig.device
        .launch(stream, move || {
            // SAFETY: `ptr` is a live allocation of `count` u32s for the whole test.
            let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, count * 4) };
            let _ = tx.send(hoststage::types::from_bytes::<u32>(bytes));
        })
        .unwrap();
    rx
}

#[test]
fn test_later_work_waits_for_collective() {
    let rig = Rig::new();
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u32>(4).unwrap();
    let recv = rig.device.alloc_elems::<u32>(4).unwrap();
    rig.device.upload(stream, send, &[7, 8, 9, 10]).unwrap();

    let mut state = unsafe { alltoall::<u32>(&rig.ctx, send, recv, 4, solo(), stream) }.unwrap();
    let rx = spawn_reader(&rig, stream, recv, 4);

    // Nothing has advanced the state, so the stream is still parked.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    drive(&mut state);
    let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(seen, vec![7, 8, 9, 10]);
}

#[test]
fn test_other_streams_keep_running() {
    let rig = Rig::new();
    let blocked = rig.device.create_stream().unwrap();
    let free = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u32>(2).unwrap();
    let recv = rig.device.alloc_elems::<u32>(2).unwrap();
    let scratch = rig.device.alloc_elems::<u32>(2).unwrap();
    rig.device.upload(free, scratch, &[1, 2]).unwrap();

    let mut state = unsafe { alltoall::<u32>(&rig.ctx, send, recv, 2, solo(), blocked) }.unwrap();
    let parked = spawn_reader(&rig, blocked, recv, 2);
    let running = spawn_reader(&rig, free, scratch, 2);

    assert_eq!(running.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1, 2]);
    assert!(parked.try_recv().is_err());

    drive(&mut state);
    assert!(parked.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn test_advance_never_blocks_on_slow_copies() {
    let rig = Rig::with_config(&HostStageConfig {
        sim_copy_latency: Duration::from_millis(20),
        ..HostStageConfig::default()
    });
    let stream = rig.device.create_stream().unwrap();
    let send = rig.device.alloc_elems::<u32>(8).unwrap();
    let recv = rig.device.alloc_elems::<u32>(8).unwrap();

    let mut state = unsafe { alltoall::<u32>(&rig.ctx, send, recv, 8, solo(), stream) }.unwrap();
    assert!(!state.advance().unwrap());
    assert_eq!(state.phase(), Phase::StageReady);
    drive(&mut state);
    assert_eq!(state.phase(), Phase::Done);
}

/// Advance `state` until it has issued its network call.
fn advance_to_network<C: hoststage::HostCollective>(state: &mut StagedCollective<C>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while state.phase() < Phase::NetworkPending {
        assert!(!state.advance().unwrap(), "completed without a peer");
        assert!(Instant::now() < deadline, "copy-out never landed");
        std::thread::yield_now();
    }
}

#[test]
fn test_stream_parked_while_peer_has_not_issued() {
    let rig = Rig::new();
    let mut comms = LocalComm::group(2).into_iter();
    let (c0, c1) = (comms.next().unwrap(), comms.next().unwrap());
    let (s0, s1) = (
        rig.device.create_stream().unwrap(),
        rig.device.create_stream().unwrap(),
    );
    let [send0, recv0, send1, recv1] =
        [(); 4].map(|_| rig.device.alloc_elems::<u32>(4).unwrap());
    rig.device.upload(s0, send0, &[0u32, 1, 2, 3]).unwrap();
    rig.device.upload(s1, send1, &[10u32, 11, 12, 13]).unwrap();

    let mut st0 =
        unsafe { alltoall::<u32>(&rig.ctx, send0, recv0, 2, Arc::new(c0), s0) }.unwrap();
    let reader = spawn_reader(&rig, s0, recv0, 4);

    advance_to_network(&mut st0);
    for _ in 0..16 {
        assert!(!st0.advance().unwrap());
    }
    assert_eq!(st0.phase(), Phase::NetworkPending);
    assert!(
        reader.recv_timeout(Duration::from_millis(100)).is_err(),
        "kernel ran while the exchange was still pending"
    );

    let mut st1 =
        unsafe { alltoall::<u32>(&rig.ctx, send1, recv1, 2, Arc::new(c1), s1) }.unwrap();
    drive_pair(&mut st0, &mut st1);

    assert_eq!(
        reader.recv_timeout(Duration::from_secs(5)).unwrap(),
        vec![0, 1, 10, 11]
    );
    assert_eq!(
        rig.device.download::<u32>(s1, recv1, 4).unwrap(),
        vec![2, 3, 12, 13]
    );
}

#[test]
fn test_reduce_scatter_parks_stream_and_copies_back_one_block() {
    const SENTINEL: u32 = 0xDEAD;
    let rig = Rig::new();
    let mut comms = LocalComm::group(2).into_iter();
    let (c0, c1) = (comms.next().unwrap(), comms.next().unwrap());
    let (s0, s1) = (
        rig.device.create_stream().unwrap(),
        rig.device.create_stream().unwrap(),
    );
    let [send0, recv0, send1, recv1] =
        [(); 4].map(|_| rig.device.alloc_elems::<u32>(6).unwrap());
    rig.device.upload(s0, send0, &[1u32, 2, 3, 4, 5, 6]).unwrap();
    rig.device.upload(s1, send1, &[10u32, 20, 30, 40, 50, 60]).unwrap();
    rig.device.upload(s0, recv0, &[SENTINEL; 6]).unwrap();
    rig.device.upload(s1, recv1, &[SENTINEL; 6]).unwrap();

    // Rank 1 goes first this time.
    let mut st1 = unsafe {
        reduce_scatter::<u32>(&rig.ctx, send1, recv1, 3, ReduceOp::Sum, Arc::new(c1), s1)
    }
    .unwrap();
    let reader = spawn_reader(&rig, s1, recv1, 6);

    advance_to_network(&mut st1);
    assert!(!st1.advance().unwrap());
    assert!(reader.recv_timeout(Duration::from_millis(100)).is_err());

    let mut st0 = unsafe {
        reduce_scatter::<u32>(&rig.ctx, send0, recv0, 3, ReduceOp::Sum, Arc::new(c0), s0)
    }
    .unwrap();
    drive_pair(&mut st1, &mut st0);

    assert_eq!(
        reader.recv_timeout(Duration::from_secs(5)).unwrap(),
        vec![44, 55, 66, SENTINEL, SENTINEL, SENTINEL]
    );
    assert_eq!(
        rig.device.download::<u32>(s0, recv0, 6).unwrap(),
        vec![11, 22, 33, SENTINEL, SENTINEL, SENTINEL]
    );
}
