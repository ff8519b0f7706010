mod common;

use std::time::Duration;

use common::{feature_change_packet, wait_until, FakeHost};
use pretty_assertions::assert_eq;
use synthvid_gfx::{
    CursorImage, DeviceState, GfxError, SynthVideoConfig, SynthVideoWorker, HYPERV_VRAM_BASE,
};
use synthvid_protocol::{FeatureChange, MessageType, ProtocolVersion};

fn quiet_config() -> SynthVideoConfig {
    // Long enough that the timer never fires during a test unless it waits for it.
    SynthVideoConfig {
        refresh_interval_ms: 60_000,
        ..SynthVideoConfig::default()
    }
}

#[test]
fn calls_are_executed_on_the_worker() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();

    let info = handle.init_graphics().unwrap();
    assert_eq!(info.version, ProtocolVersion::V3_5);
    assert_eq!(info.vram_base, HYPERV_VRAM_BASE);

    handle.set_resolution(1280, 1024, true).unwrap();
    handle
        .set_cursor_shape(Some(CursorImage::new(1, 1, 0, 0, vec![1, 2, 3, 4])), false)
        .unwrap();
    handle.set_cursor_position(5, 6, true, false).unwrap();

    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.state, DeviceState::Ready);
    assert_eq!(snapshot.screen.map(|s| (s.width, s.height)), Some((1280, 1024)));
    assert_eq!((snapshot.cursor_x, snapshot.cursor_y), (5, 6));
    assert!(!snapshot.modes.is_empty());
}

#[test]
fn errors_come_back_to_the_caller() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();

    assert_eq!(
        handle.set_resolution(800, 600, false),
        Err(GfxError::NotReady(DeviceState::Uninitialized))
    );
    handle.init_graphics().unwrap();
    assert!(matches!(
        handle.set_resolution(100, 100, false),
        Err(GfxError::BadArgument(_))
    ));
}

#[test]
fn explicit_refresh_flushes_queued_marks() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();
    handle.init_graphics().unwrap();
    handle.set_resolution(800, 600, false).unwrap();
    host.take_sent();

    handle.mark_dirty(0, 0, 10, 10).unwrap();
    // Commands run in order, so the mark lands before the refresh.
    handle.refresh_image().unwrap();
    assert_eq!(host.sent_types(), vec![MessageType::ImageUpdate]);
    assert!(!handle.snapshot().unwrap().dirty);
}

#[test]
fn timer_refresh_sends_dirty_region() {
    let host = FakeHost::new();
    let config = SynthVideoConfig {
        refresh_interval_ms: 10,
        ..SynthVideoConfig::default()
    };
    let worker = SynthVideoWorker::spawn(host.clone(), config).unwrap();
    let handle = worker.handle();
    handle.init_graphics().unwrap();
    handle.set_resolution(800, 600, false).unwrap();
    handle.mark_full_screen_dirty().unwrap();

    assert!(wait_until(Duration::from_secs(5), || host
        .sent_types()
        .contains(&MessageType::ImageUpdate)));
}

#[test]
fn inbound_feature_change_is_queued_to_the_worker() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();
    handle.init_graphics().unwrap();
    handle.set_resolution(1024, 768, false).unwrap();
    host.take_sent();

    let inbound = handle.clone();
    std::thread::spawn(move || {
        inbound.handle_inbound(&feature_change_packet(FeatureChange {
            needs_cursor_position: true,
            ..FeatureChange::default()
        }));
    })
    .join()
    .unwrap();

    // A snapshot round trip guarantees the queued change was processed.
    handle.snapshot().unwrap();
    assert_eq!(host.sent_types(), vec![MessageType::CursorPosition]);
}

#[test]
fn stop_then_restart() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();
    handle.init_graphics().unwrap();
    handle.set_resolution(800, 600, false).unwrap();

    handle.stop().unwrap();
    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.state, DeviceState::Uninitialized);
    assert_eq!(snapshot.screen, None);

    handle.init_graphics().unwrap();
    assert_eq!(handle.snapshot().unwrap().state, DeviceState::Ready);
}

#[test]
fn handle_outliving_worker_reports_worker_gone() {
    let host = FakeHost::new();
    let worker = SynthVideoWorker::spawn(host.clone(), quiet_config()).unwrap();
    let handle = worker.handle();
    drop(worker);

    assert_eq!(handle.init_graphics(), Err(GfxError::WorkerGone));
    assert_eq!(handle.mark_full_screen_dirty(), Err(GfxError::WorkerGone));
}
