use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Error;
use log::info;
use rppal::gpio::{Event, Gpio, InputPin, Trigger};

use super::{KeyEdge, KeyEdgeQueue};
use crate::{clock::MonotonicClock, config::KeyConfig};

/// Straight key wired to a GPIO line. Edges are captured on rppal's
/// interrupt thread and handed to the main loop through the edge queue.
pub struct GpioKey {
    // Dropping the pin cancels the interrupt
    _pin: InputPin,
    suppressed: Arc<AtomicU32>,
}

impl GpioKey {
    pub fn init(
        config: &KeyConfig,
        queue: Arc<KeyEdgeQueue>,
        clock: MonotonicClock,
    ) -> Result<Self, Error> {
        let gpio = config.pin.gpio();
        info!("key: initializing on pin {}", gpio.0);

        let pin = Gpio::new()?.get(gpio.0)?;
        let mut pin = if config.pullup {
            pin.into_input_pullup()
        } else {
            pin.into_input_pulldown()
        };

        let active_low = config.pullup;
        let suppressed = Arc::new(AtomicU32::new(0));
        let counter = suppressed.clone();
        let mut last_down = None;

        pin.set_async_interrupt(
            Trigger::Both,
            Some(Duration::from_micros(config.debounce_us)),
            move |event: Event| {
                let high = event.trigger == Trigger::RisingEdge;
                let down = high != active_low;

                // The line can report the same level twice after a bounce
                if last_down == Some(down) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                last_down = Some(down);

                queue.push(KeyEdge {
                    down,
                    timestamp_us: clock.now_us(),
                });
            },
        )?;

        Ok(Self {
            _pin: pin,
            suppressed,
        })
    }

    /// Edges dropped for repeating the previous level
    pub fn suppressed(&self) -> u32 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
