mod common;

use std::thread;
use std::time::Duration;

use common::{Collector, LOCALHOST, free_port, init_logging, target};
use lynx_ingest_lib::decoder::RAW_BIT_VOLTS;
use lynx_ingest_lib::{
    Acquisition, AcquisitionConfig, AcquisitionEvent, AcquisitionState, BlockSink, Context, IngestError,
    Message, Simulator,
};

fn discover_until_found(acq: &mut Acquisition) -> bool {
    for _ in 0..40 {
        if acq.found_input_source() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

fn collecting(port: u16) -> (Acquisition, Collector, Context) {
    let sink = Collector::default();
    let ctx = Context::new(1024);
    let config = AcquisitionConfig::fixed(LOCALHOST, port);
    (Acquisition::new(config, Box::new(sink.clone()), ctx.clone()), sink, ctx)
}

#[test]
fn streams_one_board_at_30khz() {
    init_logging();
    let port = free_port();
    let _sim = Simulator::new(1, 30_000, target(port)).spawn().unwrap();
    let (mut acq, sink, _ctx) = collecting(port);

    assert!(discover_until_found(&mut acq));
    assert_eq!(acq.params().boards(), 1);
    assert_eq!(acq.params().sample_rate_hz(), 30_000);

    acq.start_acquisition().unwrap();
    assert_eq!(acq.state(), AcquisitionState::Acquiring);
    thread::sleep(Duration::from_millis(800));
    assert!(acq.stop_acquisition());
    assert_eq!(acq.state(), AcquisitionState::Idle);
    assert!(sink.clear_count() >= 1);

    let blocks = sink.take();
    let samples: usize = blocks.iter().map(|b| b.len()).sum();
    assert!(samples > 1_000, "only {samples} samples");

    let first_ttl = blocks[0].ttl_words[0];
    assert_eq!(blocks[0].timestamps[0], 0);

    let mut last = -1i64;
    for block in &blocks {
        assert_eq!(block.channels, 32);
        assert_eq!(block.samples.len(), block.len() * 32);
        for (i, (&ts, &ttl)) in block.timestamps.iter().zip(&block.ttl_words).enumerate() {
            // one output tick per hardware sample, even across any dropped datagram
            assert_eq!(ts, i64::from(ttl - first_ttl));
            assert!(ts > last);
            last = ts;

            let row = &block.samples[i * 32..(i + 1) * 32];
            for (c, &uv) in row.iter().enumerate() {
                let raw = Simulator::raw_sample(u64::from(ttl), c);
                assert_eq!(uv, raw as f32 * RAW_BIT_VOLTS);
            }
        }
    }

    let stats = acq.stats();
    assert_eq!(stats.samples as usize, samples);
    assert_eq!(stats.invalid_packets, 0);
}

#[test]
fn corrupt_packets_are_dropped_without_stopping() {
    init_logging();
    let port = free_port();
    let mut sim = Simulator::new(1, 20_000, target(port));
    sim.corrupt_every = Some(10);
    let _sim = sim.spawn().unwrap();
    let (mut acq, sink, _ctx) = collecting(port);

    assert!(discover_until_found(&mut acq));
    acq.start_acquisition().unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(acq.poll(), AcquisitionState::Acquiring);
    assert!(acq.stop_acquisition());

    let blocks = sink.take();
    assert!(!blocks.is_empty());
    for block in &blocks {
        assert!(block.ttl_words.iter().all(|ttl| ttl % 10 != 9));
    }
    assert!(acq.stats().invalid_packets > 0);
    assert_eq!(acq.stats().faults, 0);
}

#[test]
fn silent_stream_faults_and_rebinds() {
    init_logging();
    let port = free_port();
    let ctx = Context::new(1024);
    let mut rx = ctx.subscribe();
    let mut config = AcquisitionConfig::fixed(LOCALHOST, port);
    config.max_failed_batches = 2;
    let mut acq = Acquisition::new(config, Box::new(Collector::default()), ctx);

    let mut sim = Simulator::new(1, 20_000, target(port)).spawn().unwrap();
    assert!(discover_until_found(&mut acq));
    acq.start_acquisition().unwrap();
    sim.stop();

    let mut state = acq.poll();
    for _ in 0..100 {
        if state == AcquisitionState::Idle {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        state = acq.poll();
    }
    assert_eq!(state, AcquisitionState::Idle);
    assert!(!acq.is_receiving());
    assert_eq!(acq.stats().faults, 1);
    assert_eq!(acq.bound_addr().map(|a| a.port()), Some(port));

    let mut saw_fault = false;
    while let Ok(msg) = rx.try_recv() {
        if let Message::Event {
            event: AcquisitionEvent::Faulted(_),
            ..
        } = msg
        {
            saw_fault = true;
        }
    }
    assert!(saw_fault);

    // the rebuilt session picks the stream back up
    let _sim = Simulator::new(1, 20_000, target(port)).spawn().unwrap();
    assert!(discover_until_found(&mut acq));
}

#[test]
fn configuration_is_locked_while_acquiring() {
    init_logging();
    let port = free_port();
    let _sim = Simulator::new(1, 20_000, target(port)).spawn().unwrap();
    let (mut acq, _sink, _ctx) = collecting(port);

    assert!(discover_until_found(&mut acq));
    assert!(matches!(
        acq.start_acquisition().and_then(|_| acq.start_acquisition()),
        Err(IngestError::IllegalStateTransition(_))
    ));

    assert!(!acq.request_refresh());
    assert!(matches!(
        acq.set_port_text("4000"),
        Err(IngestError::IllegalStateTransition(_))
    ));
    // mid-run checks report the flag without touching the socket
    assert!(acq.found_input_source());
    assert_eq!(acq.state(), AcquisitionState::Acquiring);

    assert!(acq.stop_acquisition());
    assert!(acq.request_refresh());
    assert_eq!(acq.config().port, port);
}

#[test]
fn blocks_are_broadcast_through_the_context() {
    init_logging();
    let port = free_port();
    let _sim = Simulator::new(1, 20_000, target(port)).spawn().unwrap();
    let ctx = Context::new(4096);
    let mut rx = ctx.subscribe();
    let mut acq = Acquisition::with_context(AcquisitionConfig::fixed(LOCALHOST, port), ctx);

    assert!(discover_until_found(&mut acq));
    acq.start_acquisition().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(acq.stop_acquisition());

    let mut blocks = 0;
    let mut events = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Message::Block(block) => {
                assert_eq!(block.channels, 32);
                blocks += 1;
            }
            Message::Event { event, .. } => events.push(event),
        }
    }
    assert!(blocks > 0);
    assert!(events.contains(&AcquisitionEvent::ReceivingChanged(true)));
    assert!(events.contains(&AcquisitionEvent::SampleRateChanged(20_000)));
    assert!(events.contains(&AcquisitionEvent::StateChanged(AcquisitionState::Acquiring)));
    assert_eq!(
        events.last(),
        Some(&AcquisitionEvent::StateChanged(AcquisitionState::Idle))
    );
}

struct PanickingSink;

impl BlockSink for PanickingSink {
    fn add_block(&mut self, _: &[f32], _: &[i64], _: &[u32], _: usize) {
        panic!("sink rejected block");
    }
}

#[test]
fn panicked_receive_loop_is_reaped() {
    init_logging();
    let port = free_port();
    let _sim = Simulator::new(1, 20_000, target(port)).spawn().unwrap();
    let ctx = Context::new(1024);
    let mut rx = ctx.subscribe();
    let config = AcquisitionConfig::fixed(LOCALHOST, port);
    let mut acq = Acquisition::new(config, Box::new(PanickingSink), ctx);

    assert!(discover_until_found(&mut acq));
    acq.start_acquisition().unwrap();

    let mut state = acq.poll();
    for _ in 0..100 {
        if state == AcquisitionState::Idle {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        state = acq.poll();
    }
    assert_eq!(state, AcquisitionState::Idle);
    assert!(!acq.is_receiving());
    assert_eq!(acq.stats().faults, 1);
    assert_eq!(acq.bound_addr().map(|a| a.port()), Some(port));

    let faults: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|msg| match msg {
            Message::Event {
                event: AcquisitionEvent::Faulted(reason),
                ..
            } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].contains("sink rejected block"), "{}", faults[0]);

    // discovery works again on the rebuilt session
    assert!(discover_until_found(&mut acq));
    assert!(acq.stop_acquisition());
}
