//! Event-driven core linking SSI absolute encoders to a fieldbus module
//!
//! Fieldlink-node is the real-time part of a firmware which reads absolute rotary encoders over
//! SSI and exposes their positions as cyclic process data to an EtherCAT or CANopen master,
//! through an Anybus CompactCom class fieldbus module. It is no_std, performs no heap allocation,
//! and runs on a single core with no preemptive scheduler. It provides:
//!
//! * An [`EventLoop`]: one bounded FIFO of tasks, fed from main-loop and interrupt context.
//! * An [`IrqTable`] routing interrupt vectors to the objects which own them.
//! * A [`DeadlineTimer`] over a hardware countdown, delivering its completions through the loop.
//! * SSI transactions with guard bit validation and Gray decoding ([`SsiTransactor`],
//!   [`AsyncSsiTransactor`]), and an [`EncoderReader`] which masks transient read faults.
//! * The [`FieldbusLink`] state machine which brings up the module and publishes the encoder
//!   positions on every SYNC pulse.
//! * A [`Blinker`] for an activity LED.
//!
//! Hardware is reached only through the traits in [`common::traits`], so the same code runs on a
//! microcontroller and against simulated peripherals on a host.
//!
//! # Getting Started
//!
//! ## Static allocation
//!
//! Components hold references to the event loop, and the event loop holds references to queued
//! components, so everything lives in statics (or is leaked once at startup on a host).
//!
//! ```ignore
//! static EVENT_LOOP: EventLoop<'static, 64> = EventLoop::new();
//! static IRQS: IrqTable<'static, 4> = IrqTable::new();
//! static ENCODER0_POSITION: [AdiValue; 1] = [AdiValue::new(0)];
//! static ADIS: [AdiEntry<'static>; 1] = [AdiEntry {
//!     index: 1,
//!     name: "encoder0Position",
//!     data_type: AdiType::UInt32,
//!     num_elements: 1,
//!     access: Access::INPUT,
//!     values: &ENCODER0_POSITION,
//! }];
//! static DEFAULT_MAP: [DefaultMap; 1] = [DefaultMap { index: 1, direction: Direction::Write }];
//! ```
//!
//! ## Link creation
//!
//! The link owns its driver and input sources, so it is created at run time, e.g. in a
//! `StaticCell`:
//!
//! ```ignore
//! type Link = FieldbusLink<'static, AbccDriver, EncoderReader<Ssi0>, 64, 4>;
//! static LINK: StaticCell<Link> = StaticCell::new();
//!
//! let link: &'static Link = LINK.init(FieldbusLink::new(
//!     &EVENT_LOOP,
//!     &CLOCK,
//!     AbccDriver::new(),
//!     &ADIS,
//!     &DEFAULT_MAP,
//!     LinkConfig::new(),
//!     Callbacks { stopped: Some(&on_link_stopped), ..Callbacks::new() },
//! ));
//! let mut encoder = EncoderReader::new(Ssi0::new(), EncoderConfig::new());
//! encoder.detect();
//! link.add_channel(encoder, 1).unwrap();
//! IRQS.register(lines::SYNC, link).unwrap();
//! ```
//!
//! ## Running
//!
//! ```ignore
//! link.start();
//! EVENT_LOOP.run_with_idle(cortex_m::asm::wfi);
//! ```
//!
//! Interrupt vectors forward to the table:
//!
//! ```ignore
//! #[interrupt]
//! fn GPIOA() {
//!     IRQS.dispatch(lines::SYNC);
//! }
//! ```
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod blinker;
mod deadline_timer;
mod encoder;
pub mod event_loop;
pub mod irq;
pub mod link;
pub mod ssi;

// Re-export types used in static definitions
pub use critical_section;
pub use fieldlink_common as common;
pub use heapless;

pub use blinker::{Blinker, BlinkerState};
pub use deadline_timer::{DeadlineTimer, TimerState};
pub use encoder::{EncoderReader, EncoderStatus, InputSource};
pub use event_loop::{fatal, EventLoop, Task};
pub use irq::{InterruptHandler, IrqTable};
pub use link::{Callbacks, FieldbusDriver, FieldbusLink};
pub use ssi::{AsyncSsiTransactor, EncoderSample, SsiTransactor};
