// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pacing scenarios: concurrent transfers flowing through
//! admission, budget distribution and the stream wrappers together.
//!
//! All scenarios run with a shortened allocation tick so a full transfer
//! schedule fits in well under a second of wall clock. Byte accounting is
//! exact and asserted exactly; wall-clock behavior is only ever bounded
//! from below (a hard limit cannot be beaten), never from above.

use blobflow_pacer::{BandwidthRecorder, Pacer, PacerConfig};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(25);
const MIB: u64 = 1 << 20;

fn pacer_with_limit(hard_limit_bps: u64) -> Pacer {
    let recorder = BandwidthRecorder::with_rotation_tick(hard_limit_bps, 8, TICK);
    let config = PacerConfig {
        tick_period: TICK,
        ..PacerConfig::default()
    };
    Pacer::new(recorder, config, CancellationToken::new())
}

/// Admits a request of `size` bytes and reads a body of the same size
/// through the download wrapper, returning the bytes read.
async fn transfer(pacer: Pacer, size: u64) -> u64 {
    let request = pacer
        .initiate_request(size, CancellationToken::new())
        .await
        .expect("admitted");
    let mut wrapped = request.wrap_response_body(Cursor::new(vec![0u8; size as usize]));
    let mut out = Vec::new();
    let n = wrapped.read_to_end(&mut out).await.expect("read") as u64;

    assert!(request.used() <= request.allocated());
    assert!(request.allocated() <= request.requested());
    assert!(request.requested() >= size);
    n
}

/// Ten concurrent transfers with no hard limit: everything is admitted at
/// the synthetic-floor target, nobody ever starves, and the recorder sees
/// exactly the sum of the bodies.
#[tokio::test]
async fn unlimited_transfers_run_unthrottled() {
    let pacer = pacer_with_limit(0);

    let mut transfers = Vec::new();
    for _ in 0..10 {
        transfers.push(tokio::spawn(transfer(pacer.clone(), 4 * MIB)));
    }
    for handle in transfers {
        let n = timeout(Duration::from_secs(30), handle)
            .await
            .expect("transfer finished in time")
            .expect("join");
        assert_eq!(n, 4 * MIB);
    }

    assert_eq!(pacer.recorder().total_traffic(), 40 * MIB);
    assert_eq!(pacer.report().admitted_total, 10);
}

/// Four equal transfers under a hard limit share the budget evenly and the
/// schedule cannot beat the cap: moving 40 ticks of budget takes at least
/// 40 ticks.
#[tokio::test]
async fn hard_limit_is_shared_fairly_and_not_exceeded() {
    // 10 000 bytes of budget per tick, 400 000 bytes of work: >= 40 ticks.
    let budget_per_tick = 10_000u64;
    let hard_limit_bps = (budget_per_tick as f64 / TICK.as_secs_f64()) as u64;
    let pacer = pacer_with_limit(hard_limit_bps);

    let started = Instant::now();
    let mut transfers = Vec::new();
    for _ in 0..4 {
        transfers.push(tokio::spawn(transfer(pacer.clone(), 100_000)));
    }
    for handle in transfers {
        let n = timeout(Duration::from_secs(30), handle)
            .await
            .expect("transfer finished in time")
            .expect("join");
        assert_eq!(n, 100_000);
    }

    assert_eq!(pacer.recorder().total_traffic(), 400_000);
    // 40 ticks of budget cannot be issued in fewer than 40 tick periods;
    // leave scheduling slack on the lower bound only.
    assert!(
        started.elapsed() >= TICK * 32,
        "transfers finished faster than the hard limit allows: {:?}",
        started.elapsed()
    );
}

/// Small requests finish in their first budgeted tick (the mercy pass)
/// instead of trickling alongside large ones.
#[tokio::test]
async fn small_requests_finish_before_large_ones() {
    // 20 000 bytes per tick across {1 KiB, 1 KiB, 200 KiB, 200 KiB}.
    let hard_limit_bps = (20_000f64 / TICK.as_secs_f64()) as u64;
    let pacer = pacer_with_limit(hard_limit_bps);

    let (done_tx, mut done_rx) = mpsc::channel::<u64>(4);
    let sizes = [1_024u64, 1_024, 200 * 1_024, 200 * 1_024];
    for size in sizes {
        let pacer = pacer.clone();
        let done = done_tx.clone();
        let _ = tokio::spawn(async move {
            let n = transfer(pacer, size).await;
            assert_eq!(n, size);
            let _ = done.send(size).await;
        });
    }
    drop(done_tx);

    let mut finish_order = Vec::new();
    while let Some(size) = timeout(Duration::from_secs(30), done_rx.recv())
        .await
        .expect("transfers finished in time")
    {
        finish_order.push(size);
    }
    assert_eq!(finish_order.len(), 4);
    // The two 1 KiB transfers complete before either 200 KiB transfer.
    assert_eq!(&finish_order[..2], &[1_024, 1_024]);
}

/// A retry rewind re-reads the whole body: the second pass produces exactly
/// the body again, and the recorder has seen both passes.
#[tokio::test]
async fn retry_rewind_rereads_and_rebudgets() {
    let pacer = pacer_with_limit(0);
    let body: Vec<u8> = (0..(8 * MIB)).map(|i| (i % 253) as u8).collect();
    let request = pacer
        .initiate_request(8 * MIB, CancellationToken::new())
        .await
        .expect("admitted");
    let mut wrapped = request.wrap_request_body(Cursor::new(body));

    let mut first = vec![0u8; (5 * MIB) as usize];
    let _ = timeout(Duration::from_secs(30), wrapped.read_exact(&mut first))
        .await
        .expect("first pass in time")
        .expect("first pass");

    let pos = wrapped
        .seek(std::io::SeekFrom::Start(0))
        .await
        .expect("rewind");
    assert_eq!(pos, 0);

    let mut second = Vec::new();
    let n = timeout(Duration::from_secs(30), wrapped.read_to_end(&mut second))
        .await
        .expect("second pass in time")
        .expect("second pass");
    assert_eq!(n as u64, 8 * MIB);

    assert_eq!(request.read_head(), 8 * MIB);
    assert_eq!(request.used(), 13 * MIB);
    assert!(request.requested() >= 13 * MIB);
    assert_eq!(pacer.recorder().total_traffic(), 13 * MIB);
}

/// Pausing observation freezes the rolling average through a transfer-free
/// lull instead of letting it decay to zero.
#[tokio::test]
async fn enumeration_lull_does_not_decay_the_average() {
    let recorder = BandwidthRecorder::with_rotation_tick(0, 4, TICK);
    // Produce traffic until the window is full of real samples.
    let feeder = {
        let recorder = recorder.clone();
        tokio::spawn(async move {
            while !recorder.bandwidth().average_ready {
                recorder.record(10_000);
                tokio::time::sleep(TICK / 5).await;
            }
        })
    };
    timeout(Duration::from_secs(10), feeder)
        .await
        .expect("window filled in time")
        .expect("join");

    recorder.pause_observation();
    let outcome = timeout(Duration::from_secs(5), async {
        while !recorder.report().paused {
            tokio::time::sleep(TICK).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "pause did not land");

    let before = recorder.bandwidth();
    assert!(before.average_ready);
    tokio::time::sleep(TICK * 30).await;
    let after = recorder.bandwidth();
    assert_eq!(after, before, "a paused recorder must not rotate");
}

/// Cancelling a starved transfer surfaces promptly as an I/O error, and
/// closing the wrapper frees the live slot.
#[tokio::test]
async fn cancellation_interrupts_a_starved_transfer() {
    // 10 bytes per second rounds to zero budget per tick: permanent
    // starvation for everything admitted.
    let pacer = pacer_with_limit(10);
    let cancel = CancellationToken::new();
    let request = pacer
        .initiate_request(MIB, cancel.clone())
        .await
        .expect("admitted");

    let reader = {
        let request = Arc::clone(&request);
        tokio::spawn(async move {
            let mut wrapped = request.wrap_response_body(Cursor::new(vec![0u8; MIB as usize]));
            let mut buf = vec![0u8; 65_536];
            wrapped.read(&mut buf).await
        })
    };

    // Let the reader park on the budget wait, then cancel the request.
    tokio::time::sleep(TICK * 3).await;
    assert!(!reader.is_finished());
    cancel.cancel();

    let result = timeout(Duration::from_secs(5), reader)
        .await
        .expect("read returned in time")
        .expect("join");
    let err = result.expect_err("starved read must fail once cancelled");
    assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);

    // The wrapper was dropped with the reader task; its discard frees the
    // live slot on a later tick.
    let freed = timeout(Duration::from_secs(5), async {
        while pacer.report().live_requests > 0 {
            tokio::time::sleep(TICK).await;
        }
    })
    .await;
    assert!(freed.is_ok(), "live slot was not freed after cancellation");
}

/// An unpaceable (server-to-server) transfer completes, observes the hard
/// cap only coarsely, and contributes nothing to observed bandwidth.
#[tokio::test]
async fn unpaceable_transfers_complete_without_observation() {
    let hard_limit_bps = (50_000f64 / TICK.as_secs_f64()) as u64;
    let pacer = pacer_with_limit(hard_limit_bps);

    let done = pacer.initiate_unpaceable(120_000, CancellationToken::new());
    let outcome = timeout(Duration::from_secs(30), done)
        .await
        .expect("drained in time")
        .expect("sender kept");
    assert_eq!(outcome, Ok(()));
    assert_eq!(pacer.recorder().total_traffic(), 0);
}
