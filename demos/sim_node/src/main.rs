use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use fieldlink_node::common::{
    adi::{Access, AdiEntry, AdiValue, DefaultMap},
    constants::{defaults, events},
    device_config::DeviceConfig,
    LinkState, Status,
};
use fieldlink_node::{
    link::{StateChangedFn, StoppedFn},
    Blinker, BlinkerState, Callbacks, EncoderReader, EventLoop, FieldbusLink, IrqTable,
};

mod hw;
use hw::{ConsoleLed, RotatingEncoder, SimModule, SimTimer, StdClock};

#[derive(Parser, Debug)]
struct Args {
    /// Device config file
    config: PathBuf,
    /// SYNC period in microseconds
    #[clap(long, default_value = "1000")]
    sync_period_us: u64,
    /// Run time in seconds
    #[clap(long, short, default_value = "5")]
    duration: u64,
    /// Time the module takes to become ready after driver start, in milliseconds
    #[clap(long, default_value = "200")]
    ready_delay_ms: u64,
    /// Run without a fieldbus module
    #[clap(long)]
    no_module: bool,
    /// Corrupt every n-th encoder frame
    #[clap(long)]
    glitch_every: Option<u32>,
}

const QUEUE_DEPTH: usize = defaults::EVENT_LOOP_CAPACITY;
const CHANNELS: usize = defaults::MAX_CHANNELS;

mod lines {
    pub const SYNC: usize = 0;
    pub const LED_TIMER: usize = 1;
}

type Link = FieldbusLink<'static, SimModule, EncoderReader<RotatingEncoder>, QUEUE_DEPTH, CHANNELS>;
type ActivityLed = Blinker<'static, SimTimer, ConsoleLed, QUEUE_DEPTH>;

static EVENT_LOOP: EventLoop<'static, QUEUE_DEPTH> = EventLoop::new();
static IRQS: IrqTable<'static, 2> = IrqTable::new();

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Build the static ADI table and its default map from the device config
fn build_adi_table(cfg: &DeviceConfig) -> (&'static [AdiEntry<'static>], &'static [DefaultMap]) {
    let adis: Vec<AdiEntry<'static>> = cfg
        .adis
        .iter()
        .map(|def| {
            let values: Vec<AdiValue> = (0..def.num_elements).map(|_| AdiValue::new(0)).collect();
            AdiEntry {
                index: def.index,
                name: def.name.clone().leak(),
                data_type: def.data_type,
                num_elements: def.num_elements,
                access: if def.map_write {
                    Access::INPUT
                } else {
                    Access::GET
                },
                values: values.leak(),
            }
        })
        .collect();
    let map: Vec<DefaultMap> = cfg
        .default_map()
        .map(|(index, direction)| DefaultMap { index, direction })
        .collect();
    (adis.leak(), map.leak())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let cfg = match DeviceConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("Error loading {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Starting {}...", cfg.device_name);

    let (adis, default_map) = build_adi_table(&cfg);

    let led_timer = SimTimer::default();
    let led: &'static ActivityLed = leak(Blinker::new(
        &EVENT_LOOP,
        led_timer.clone(),
        ConsoleLed::default(),
        defaults::BLINK_PERIOD,
    ));
    IRQS.register(lines::LED_TIMER, led.timer()).unwrap();

    // Blink while process data is exchanged
    let state_changed: &'static StateChangedFn = leak(move |state: LinkState| match state {
        LinkState::Run => led.start(),
        LinkState::Error if led.state() == BlinkerState::Active => led.stop(),
        _ => {}
    });
    let stopped: &'static StoppedFn = leak(|status: Status| {
        log::error!("Fieldbus link stopped: {:?}", status);
        EVENT_LOOP.stop();
    });

    let link: &'static Link = leak(FieldbusLink::new(
        &EVENT_LOOP,
        leak(StdClock::new()),
        SimModule::new(!args.no_module, Duration::from_millis(args.ready_delay_ms)),
        adis,
        default_map,
        cfg.link_config(),
        Callbacks {
            state_changed: Some(state_changed),
            stopped: Some(stopped),
        },
    ));

    let mut encoders = Vec::new();
    for (i, def) in cfg.encoders.iter().enumerate() {
        let bus = RotatingEncoder::new(1000 * i as u32, 3 + i as u32, args.glitch_every);
        let mut reader = EncoderReader::new(bus.clone(), def.encoder_config());
        reader.detect();
        if let Err(e) = link.add_channel(reader, def.adi) {
            log::error!("Encoder {}: {}", i, e);
            return ExitCode::FAILURE;
        }
        encoders.push(bus);
    }
    IRQS.register(lines::SYNC, link).unwrap();

    // The SYNC line, with the module raising a read process data event every cycle
    let sync_period = Duration::from_micros(args.sync_period_us);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sync_period);
        loop {
            interval.tick().await;
            IRQS.dispatch(lines::SYNC);
            link.on_async_event(events::RDPD);
        }
    });

    // The LED timer peripheral
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if led_timer.expired() {
                IRQS.dispatch(lines::LED_TIMER);
            }
        }
    });

    let run_time = Duration::from_secs(args.duration);
    tokio::spawn(async move {
        tokio::time::sleep(run_time).await;
        EVENT_LOOP.stop();
    });

    link.start();
    tokio::task::spawn_blocking(|| {
        EVENT_LOOP.run_with_idle(|| std::thread::sleep(Duration::from_micros(50)))
    })
    .await
    .unwrap();

    let (updates, module_events, image) =
        link.with_driver(|m| (m.updates(), m.events(), m.image().to_vec()));
    log::info!(
        "Link {:?}, status {:?}: {} SYNC pulses handled, {} ignored",
        link.state(),
        link.status(),
        link.sync_count(),
        link.ignored_sync_count()
    );
    log::info!(
        "{} process data updates, {} module event batches, last image {:02x?}",
        updates,
        module_events,
        image
    );
    for (i, bus) in encoders.iter().enumerate() {
        log::info!("Encoder {}: {} frames read", i, bus.reads());
    }
    for adi in adis {
        if let Some(value) = adi.values.first() {
            log::info!("ADI {} '{}' = {}", adi.index, adi.name, value.get());
        }
    }

    if link.status() == Status::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
