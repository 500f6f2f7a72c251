#![allow(dead_code)]
use std::sync::{Arc, Mutex};

use fieldlink_common::{
    adi::{Access, AdiEntry, AdiType, AdiValue, DefaultMap, Direction},
    config::{EncoderConfig, LinkConfig},
    ErrorCode, LinkState, Status,
};
use fieldlink_node::{
    link::{StateChangedFn, StoppedFn},
    event_loop::Completion,
    Callbacks, EncoderReader, EventLoop, FieldbusLink,
};

use crate::sim::{SimClock, SimDriver, SimSsiBus};

/// Give a value the static lifetime required by objects posted to an event loop
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Route log output through the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A completion handler which records every code it receives
pub fn completion_log() -> (&'static dyn Completion<'static>, Arc<Mutex<Vec<ErrorCode>>>) {
    let codes: Arc<Mutex<Vec<ErrorCode>>> = Arc::new(Mutex::new(Vec::new()));
    let log = codes.clone();
    let handler: &'static dyn Completion<'static> =
        leak(move |code: ErrorCode| log.lock().unwrap().push(code));
    (handler, codes)
}

pub const QUEUE_DEPTH: usize = 16;
pub const CHANNELS: usize = 4;

pub type TestLink = FieldbusLink<'static, SimDriver, EncoderReader<SimSsiBus>, QUEUE_DEPTH, CHANNELS>;

/// A link wired to a simulated module, with one detected encoder publishing into ADI 1
///
/// ADI 1 (`encoder0Position`) and ADI 2 (`encoder1Position`) are both UInt32 inputs, and both
/// are in the default map, so the write process data image is 8 bytes.
pub struct LinkFixture {
    pub event_loop: &'static EventLoop<'static, QUEUE_DEPTH>,
    pub clock: &'static SimClock,
    pub driver: SimDriver,
    pub encoder: SimSsiBus,
    pub adis: &'static [AdiEntry<'static>],
    pub link: &'static TestLink,
    states: Arc<Mutex<Vec<LinkState>>>,
    stops: Arc<Mutex<Vec<Status>>>,
}

impl LinkFixture {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_driver(SimDriver::default(), config)
    }

    pub fn with_driver(driver: SimDriver, config: LinkConfig) -> Self {
        init_logging();
        let event_loop = leak(EventLoop::new());
        let clock = leak(SimClock::default());

        let values: &'static [AdiValue] = leak([AdiValue::new(0), AdiValue::new(0)]);
        let adis: &'static [AdiEntry<'static>] = leak([
            AdiEntry {
                index: 1,
                name: "encoder0Position",
                data_type: AdiType::UInt32,
                num_elements: 1,
                access: Access::INPUT,
                values: &values[0..1],
            },
            AdiEntry {
                index: 2,
                name: "encoder1Position",
                data_type: AdiType::UInt32,
                num_elements: 1,
                access: Access::INPUT,
                values: &values[1..2],
            },
        ]);
        let default_map: &'static [DefaultMap] = leak([
            DefaultMap {
                index: 1,
                direction: Direction::Write,
            },
            DefaultMap {
                index: 2,
                direction: Direction::Write,
            },
        ]);

        let states: Arc<Mutex<Vec<LinkState>>> = Arc::new(Mutex::new(Vec::new()));
        let stops: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));
        let states_cb = states.clone();
        let stops_cb = stops.clone();
        let state_changed: &'static StateChangedFn =
            leak(move |state: LinkState| states_cb.lock().unwrap().push(state));
        let stopped: &'static StoppedFn =
            leak(move |status: Status| stops_cb.lock().unwrap().push(status));

        let link = leak(FieldbusLink::new(
            event_loop,
            clock,
            driver.clone(),
            adis,
            default_map,
            config,
            Callbacks {
                state_changed: Some(state_changed),
                stopped: Some(stopped),
            },
        ));

        let encoder = SimSsiBus::new(0);
        let mut reader = EncoderReader::new(encoder.clone(), EncoderConfig::new());
        assert!(reader.detect());
        link.add_channel(reader, 1).unwrap();

        Self {
            event_loop,
            clock,
            driver,
            encoder,
            adis,
            link,
            states,
            stops,
        }
    }

    /// Start the link and poll until it reaches `Run`
    pub fn start_and_run(&self) {
        self.link.start();
        for _ in 0..100 {
            if self.link.state() != LinkState::WaitForComm {
                break;
            }
            self.event_loop.poll();
        }
        assert_eq!(LinkState::Run, self.link.state());
    }

    /// Poll the event loop until it is empty, or `limit` tasks have run
    pub fn poll_n(&self, limit: usize) -> usize {
        let mut count = 0;
        while count < limit && self.event_loop.poll() {
            count += 1;
        }
        count
    }

    /// Value of the first element of ADI `index`
    pub fn adi_value(&self, index: u16) -> u32 {
        self.adis
            .iter()
            .find(|adi| adi.index == index)
            .map(|adi| adi.values[0].get())
            .unwrap()
    }

    /// The states entered, in order
    pub fn states(&self) -> Vec<LinkState> {
        self.states.lock().unwrap().clone()
    }

    /// Every status reported through the stopped callback
    pub fn stops(&self) -> Vec<Status> {
        self.stops.lock().unwrap().clone()
    }
}
