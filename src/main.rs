use std::{sync::Arc, time::Duration};

use anyhow::Error;
use log::info;
use rand::Rng;
use tokio::time::{interval, MissedTickBehavior};

use morse_link::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    // Load the config file
    info!("Starting config...");
    let config = Config::load_or_default(DEFAULT_CONFIG_PATH)?;

    let clock = MonotonicClock::new();
    let edges = Arc::new(KeyEdgeQueue::new());

    // Key source feeding the edge queue
    info!("Starting key...");
    #[cfg(feature = "pi")]
    let key = morse_link::key::gpio::GpioKey::init(&config.key, edges.clone(), clock)?;
    #[cfg(not(feature = "pi"))]
    let key = morse_link::key::keyboard::spawn(
        edges.clone(),
        clock,
        config.key.clone(),
        config.timing.letter_gap_ms,
    );

    // Two units powered on together shouldn't scan in lockstep
    let jitter = rand::thread_rng().gen_range(0..=config.startup_jitter_ms);
    info!("Starting radio in {}ms...", jitter);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let radio = HostRadio::new(&config.network, &config.host);
    let mut transceiver = Transceiver::new(&config, edges.clone(), radio, clock.now_ms());
    info!("Node id {}", transceiver.local_id());

    transceiver
        .arbitrator()
        .on_state_change(|state| info!("link: {}", state));
    transceiver.arbitrator().on_symbol(|side, symbol, duration| {
        info!("link: {:?} {} ({}ms)", side, symbol, duration)
    });
    let mut events = transceiver.subscribe();

    let mut ticker = interval(Duration::from_millis(config.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                transceiver.tick(clock.now_ms());

                while let Ok(event) = events.try_recv() {
                    match event {
                        TelegraphEvent::Finalize { pattern } if !pattern.is_empty() => {
                            info!("letter: {}", pattern)
                        }
                        TelegraphEvent::LongPress => info!("long press"),
                        _ => {}
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    #[cfg(feature = "pi")]
    info!("key: {} repeated edges suppressed", key.suppressed());
    #[cfg(not(feature = "pi"))]
    key.abort();
    info!("key: {} edges dropped on overflow", edges.dropped());

    Ok(())
}
