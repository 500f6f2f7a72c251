use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use fieldlink_common::{
    config::{EncoderConfig, LinkConfig, PublishMode},
    constants::events,
};
use fieldlink_node::{
    event_loop::Work, link::ChannelError, EncoderReader, EncoderStatus, Task,
};

use integration_tests::prelude::*;

#[test]
fn test_sync_pulse_publishes_position() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().ready_after_polls = Some(3);
    fx.encoder.set_position(4096);

    fx.link.start();
    assert_eq!(LinkState::WaitForComm, fx.link.state());
    assert_eq!(1, fx.driver.state().init_calls);
    assert_eq!(Some(Duration::from_millis(1500)), fx.driver.state().startup_timeout);

    assert!(fx.event_loop.poll());
    assert!(fx.event_loop.poll());
    assert_eq!(LinkState::WaitForComm, fx.link.state());
    assert!(fx.event_loop.poll());
    assert_eq!(LinkState::Run, fx.link.state());
    assert_eq!(3, fx.driver.state().polls);

    fx.link.on_sync_pulse();
    // The driver step queued ahead of it, then the capture cycle
    assert_eq!(2, fx.poll_n(2));

    assert_eq!(1, fx.driver.state().trigger_calls);
    assert_eq!(4096, fx.adi_value(1));
    assert_eq!(AppStatus::NoError, fx.driver.state().app_status);
    assert_eq!(1, fx.link.sync_count());
    {
        let driver = fx.driver.state();
        assert_eq!(8, driver.write_pd.len());
        assert_eq!(&4096u32.to_le_bytes(), &driver.write_pd[..4]);
        assert_eq!(&[0u8; 4], &driver.write_pd[4..]);
    }

    // The driver keeps running while the link is up
    let runs = fx.driver.state().run_calls;
    fx.poll_n(5);
    assert_eq!(runs + 5, fx.driver.state().run_calls);

    assert_eq!(
        vec![LinkState::Init, LinkState::WaitForComm, LinkState::Run],
        fx.states()
    );
    assert!(fx.stops().is_empty());
    assert_eq!(Status::Success, fx.link.status());
}

#[test]
fn test_module_not_detected() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().module_present = false;

    fx.link.start();

    assert_eq!(LinkState::Error, fx.link.state());
    assert_eq!(Status::ModuleNotDetected, fx.link.status());
    {
        let driver = fx.driver.state();
        assert_eq!(1, driver.setup_calls);
        assert_eq!(1, driver.detect_calls);
        assert_eq!(0, driver.init_calls);
        assert_eq!(0, driver.start_calls);
    }
    assert_eq!(vec![Status::ModuleNotDetected], fx.stops());
    assert!(fx.event_loop.is_empty());
}

#[test]
fn test_startup_timeout() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().ready_after_polls = None;

    fx.link.start();
    fx.poll_n(10);
    assert_eq!(LinkState::WaitForComm, fx.link.state());

    fx.clock.advance(Duration::from_millis(1499));
    fx.poll_n(10);
    assert_eq!(LinkState::WaitForComm, fx.link.state());

    fx.clock.advance(Duration::from_millis(1));
    assert!(fx.event_loop.poll());
    assert_eq!(LinkState::Error, fx.link.state());
    assert_eq!(Status::ModuleNotAnswering, fx.link.status());
    assert_eq!(vec![Status::ModuleNotAnswering], fx.stops());

    // The busy wait completed, nothing is left running
    assert!(fx.event_loop.is_empty());
    assert_eq!(0, fx.driver.state().run_calls);
}

#[test]
fn test_configured_startup_timeout() {
    let config = LinkConfig {
        startup_timeout: Duration::from_millis(200),
        ..LinkConfig::new()
    };
    let fx = LinkFixture::new(config);
    fx.driver.state().ready_after_polls = None;

    fx.link.start();
    assert_eq!(Some(Duration::from_millis(200)), fx.driver.state().startup_timeout);
    fx.clock.advance(Duration::from_millis(200));
    fx.poll_n(1);
    assert_eq!(Status::ModuleNotAnswering, fx.link.status());
}

#[test]
fn test_comm_error_while_waiting() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().ready_after_polls = None;

    fx.link.start();
    fx.poll_n(3);
    fx.driver.state().comm_error = true;
    fx.poll_n(3);

    assert_eq!(LinkState::Error, fx.link.state());
    assert_eq!(Status::ModuleNotAnswering, fx.link.status());
    assert_eq!(vec![Status::ModuleNotAnswering], fx.stops());
}

#[test]
fn test_data_object_init_failure() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().init_error = true;

    fx.link.start();

    assert_eq!(Status::ModuleNotAnswering, fx.link.status());
    assert_eq!(0, fx.driver.state().start_calls);
    assert_eq!(vec![Status::ModuleNotAnswering], fx.stops());
    assert_eq!(
        vec![LinkState::Init, LinkState::Error],
        fx.states()
    );
}

#[test]
fn test_driver_start_failure() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().start_error = true;

    fx.link.start();

    assert_eq!(Status::UnexpectedError, fx.link.status());
    assert_eq!(vec![Status::UnexpectedError], fx.stops());
    assert!(fx.event_loop.is_empty());
}

#[test]
fn test_data_objects_registered() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();

    let driver = fx.driver.state();
    assert_eq!(2, driver.adi_count);
    assert_eq!(2, driver.map.len());
    assert_eq!(1, driver.map[0].index);
}

#[test]
fn test_first_sync_bootstraps_app_status() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.driver.state().ready_after_polls = None;
    fx.encoder.set_position(12);
    fx.link.start();
    assert_eq!(AppStatus::NotSynced, fx.driver.state().app_status);

    // A pulse during the handshake already publishes
    fx.link.on_sync_pulse();
    assert_eq!(AppStatus::NoError, fx.link.app_status());
    fx.poll_n(2);
    assert_eq!(AppStatus::NoError, fx.driver.state().app_status);
    assert_eq!(1, fx.driver.state().trigger_calls);
    assert_eq!(12, fx.adi_value(1));
}

#[test]
fn test_capture_runs_from_event_loop() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.encoder.set_position(2048);
    let transfers = fx.encoder.transfers();
    let queued = fx.event_loop.len();

    fx.link.on_sync_pulse();

    // Interrupt context only posts the cycle
    assert_eq!(queued + 1, fx.event_loop.len());
    assert_eq!(transfers, fx.encoder.transfers());
    assert_eq!(0, fx.driver.state().trigger_calls);
    assert_eq!(0, fx.adi_value(1));
    assert_eq!(0, fx.link.sync_count());

    fx.poll_n(queued + 1);
    assert_eq!(transfers + 1, fx.encoder.transfers());
    assert_eq!(1, fx.driver.state().trigger_calls);
    assert_eq!(2048, fx.adi_value(1));
    assert_eq!(1, fx.link.sync_count());
}

#[test]
fn test_sync_overrun_ignored() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    let queued = fx.event_loop.len();

    fx.link.on_sync_pulse();
    fx.link.on_sync_pulse();
    assert_eq!(queued + 1, fx.event_loop.len());
    assert_eq!(1, fx.link.ignored_sync_count());

    fx.poll_n(queued + 1);
    assert_eq!(1, fx.driver.state().trigger_calls);
    assert_eq!(1, fx.link.sync_count());

    // The next pulse is serviced again
    fx.link.on_sync_pulse();
    fx.poll_n(2);
    assert_eq!(2, fx.link.sync_count());
}

#[test]
fn test_interrupts_serviced_during_driver_step() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();

    // The stack waits on its own transfer interrupt, raised from another thread
    let event_loop = fx.event_loop;
    let noop: &'static dyn Work<'static> = leak(|| {});
    let delivered: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let log = delivered.clone();
    fx.driver.set_run_hook(move || {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let posted = event_loop.post_interrupt_ctx(Task::Call(noop)).is_ok();
            let _ = tx.send(posted);
        });
        let posted = rx.recv_timeout(Duration::from_millis(300)).unwrap_or(false);
        log.lock().unwrap().push(posted);
    });

    assert!(fx.event_loop.poll());
    assert_eq!(vec![true], *delivered.lock().unwrap());
    assert_eq!(LinkState::Run, fx.link.state());
}

#[test]
fn test_sync_ignored_on_app_error() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.encoder.set_position(77);
    fx.link.set_app_status(AppStatus::SyncLoss);

    fx.link.on_sync_pulse();
    fx.poll_n(3);

    assert_eq!(0, fx.driver.state().trigger_calls);
    assert_eq!(0, fx.adi_value(1));
    assert_eq!(AppStatus::SyncLoss, fx.driver.state().app_status);
    assert_eq!(0, fx.link.sync_count());
    assert_eq!(1, fx.link.ignored_sync_count());
    assert_eq!(LinkState::Run, fx.link.state());
}

#[test]
fn test_sync_ignored_before_start() {
    let fx = LinkFixture::new(LinkConfig::new());
    let transfers = fx.encoder.transfers();

    fx.link.on_sync_pulse();

    assert_eq!(1, fx.link.ignored_sync_count());
    assert_eq!(transfers, fx.encoder.transfers());
    assert_eq!(0, fx.driver.state().trigger_calls);
    assert_eq!(LinkState::Idle, fx.link.state());
}

#[test]
fn test_transient_encoder_faults_masked() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.encoder.set_position(300);
    fx.link.on_sync_pulse();
    fx.poll_n(2);
    assert_eq!(300, fx.adi_value(1));

    fx.encoder.set_position(301);
    fx.encoder.inject_glitches(15);
    for _ in 0..15 {
        fx.link.on_sync_pulse();
        fx.poll_n(2);
        assert_eq!(300, fx.adi_value(1));
    }
    fx.link.on_sync_pulse();
    fx.poll_n(2);
    assert_eq!(301, fx.adi_value(1));

    fx.poll_n(3);
    assert_eq!(LinkState::Run, fx.link.state());
    assert_eq!(17, fx.driver.state().trigger_calls);
}

#[test]
fn test_sustained_encoder_failure_stops_link() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.encoder.inject_glitches(100);

    for _ in 0..15 {
        fx.link.on_sync_pulse();
        fx.poll_n(2);
    }
    assert_eq!(15, fx.driver.state().trigger_calls);
    assert_eq!(LinkState::Run, fx.link.state());

    fx.link.on_sync_pulse();
    fx.poll_n(2);
    assert_eq!(LinkState::Error, fx.link.state());
    assert_eq!(Status::UnexpectedError, fx.link.status());
    assert_eq!(vec![Status::UnexpectedError], fx.stops());
    assert_eq!(15, fx.driver.state().trigger_calls);

    fx.link.on_sync_pulse();
    assert_eq!(1, fx.link.ignored_sync_count());

    fx.poll_n(4);
    assert!(fx.event_loop.is_empty());
    assert_eq!(vec![Status::UnexpectedError], fx.stops());
}

#[test]
fn test_disconnected_encoder_not_captured() {
    let encoder = SimSsiBus::new(0);
    encoder.set_disconnected(true);
    let mut reader = EncoderReader::new(encoder.clone(), EncoderConfig::new());
    assert!(!reader.detect());

    let fx = LinkFixture::new(LinkConfig::new());
    fx.link.add_channel(reader, 2).unwrap();
    fx.start_and_run();
    let transfers = encoder.transfers();

    fx.encoder.set_position(5);
    fx.link.on_sync_pulse();
    fx.poll_n(2);

    // The failed channel is skipped, the active one still publishes
    assert_eq!(transfers, encoder.transfers());
    assert_eq!(5, fx.adi_value(1));
    assert_eq!(0, fx.adi_value(2));
    assert_eq!(1, fx.driver.state().trigger_calls);
}

#[test]
fn test_undetected_encoder_detected_when_added() {
    let encoder = SimSsiBus::new(42);
    let reader = EncoderReader::new(encoder.clone(), EncoderConfig::new());
    assert_eq!(EncoderStatus::Init, reader.status());
    let transfers = encoder.transfers();

    let fx = LinkFixture::new(LinkConfig::new());
    fx.link.add_channel(reader, 2).unwrap();
    assert_eq!(transfers + 1, encoder.transfers());

    fx.start_and_run();
    fx.link.on_sync_pulse();
    fx.poll_n(2);
    assert_eq!(42, fx.adi_value(2));
    assert_eq!(transfers + 2, encoder.transfers());
}

#[test]
fn test_free_run_publishes_every_iteration() {
    let config = LinkConfig {
        publish_mode: PublishMode::FreeRun,
        ..LinkConfig::new()
    };
    let fx = LinkFixture::new(config);
    fx.start_and_run();

    fx.encoder.set_position(1000);
    fx.poll_n(1);
    assert_eq!(1000, fx.adi_value(1));
    fx.encoder.set_position(1001);
    fx.poll_n(1);
    assert_eq!(1001, fx.adi_value(1));
    assert_eq!(2, fx.driver.state().trigger_calls);
    assert_eq!(0, fx.link.sync_count());
}

#[test]
fn test_async_events_coalesced() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    let queued = fx.event_loop.len();

    fx.link.on_async_event(events::RDPD);
    fx.link.on_async_event(events::STATUS);
    assert_eq!(queued + 1, fx.event_loop.len());

    fx.poll_n(2);
    assert_eq!(vec![events::RDPD | events::STATUS], fx.driver.state().events);

    fx.link.on_async_event(events::SYNC);
    fx.poll_n(2);
    assert_eq!(
        vec![events::RDPD | events::STATUS, events::SYNC],
        fx.driver.state().events
    );
    assert_eq!(LinkState::Run, fx.link.state());
}

#[test]
fn test_event_handling_error_stops_link() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.driver.state().events_error = true;

    fx.link.on_async_event(events::RDMSG);
    fx.poll_n(4);

    assert_eq!(Status::UnexpectedError, fx.link.status());
    assert_eq!(vec![Status::UnexpectedError], fx.stops());
    assert!(fx.event_loop.is_empty());
}

#[test]
fn test_run_driver_error() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.start_and_run();
    fx.driver.state().run_error = true;

    assert!(fx.event_loop.poll());

    assert_eq!(LinkState::Error, fx.link.state());
    assert_eq!(Status::UnexpectedError, fx.link.status());
    assert_eq!(vec![Status::UnexpectedError], fx.stops());

    // No further publishing once stopped
    fx.link.on_sync_pulse();
    assert_eq!(0, fx.driver.state().trigger_calls);
}

#[test]
fn test_add_channel_errors() {
    let fx = LinkFixture::new(LinkConfig::new());
    let reader = || EncoderReader::new(SimSsiBus::new(0), EncoderConfig::new());

    assert_eq!(
        Err(ChannelError::UnknownAdi { index: 9 }),
        fx.link.add_channel(reader(), 9)
    );
    for _ in 1..4 {
        fx.link.add_channel(reader(), 2).unwrap();
    }
    assert_eq!(4, fx.link.channel_count());
    assert_eq!(
        Err(ChannelError::TooManyChannels { capacity: 4 }),
        fx.link.add_channel(reader(), 2)
    );

    fx.start_and_run();
    assert_eq!(
        Err(ChannelError::AlreadyStarted),
        fx.link.add_channel(reader(), 1)
    );
}

#[test]
#[should_panic]
fn test_double_start_is_fatal() {
    let fx = LinkFixture::new(LinkConfig::new());
    fx.link.start();
    fx.link.start();
}

#[test]
#[should_panic]
fn test_hardware_setup_failure_is_fatal() {
    let driver = SimDriver::default();
    driver.state().setup_error = true;
    let fx = LinkFixture::with_driver(driver, LinkConfig::new());
    fx.link.start();
}
