//! Shared LED/button pin task.
//!
//! One pin serves both as the status LED (output, while a pattern plays)
//! and as the button input (pulled-up, active-low, edge-wake). The edge
//! wait is only armed while the pin is an input, so switching modes can not
//! produce a phantom press.

use defmt::{debug, info};
use embassy_executor::task;
use embassy_futures::select::{Either, select};
use embassy_rp::gpio::{Flex, Pull};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel;
use embassy_time::{Instant, Timer};
use portable_atomic::Ordering;

use controller_core::state::ShutdownCause;

use crate::led_patterns::BlinkPattern;
use crate::tasks::config_store::{STORE_EVENT_CHANNEL, StoreEvents};
use crate::{LAST_CONTACT_S, with_registers};

const DEBOUNCE_MS: u64 = 30;

pub enum LedEvents {
    Blink(BlinkPattern),
}

pub type LedChannelType = channel::Channel<CriticalSectionRawMutex, LedEvents, 8>;
pub static LED_EVENT_CHANNEL: LedChannelType = channel::Channel::new();

async fn blink(pin: &mut Flex<'static>, pattern: BlinkPattern) {
    pin.set_as_output();
    for _ in 0..pattern.count {
        pin.set_high();
        Timer::after_millis(pattern.on_ms).await;
        pin.set_low();
        Timer::after_millis(pattern.off_ms).await;
    }
    pin.set_as_input();
    pin.set_pull(Pull::Up);
}

/// A press primes an unprimed device whose liveness window has already
/// elapsed (arming automatic power actions after a manual recovery);
/// otherwise it records a button shutdown cause, unless the host already
/// initiated a shutdown itself.
fn handle_press() {
    let elapsed = (Instant::now().as_secs() as u32)
        .saturating_sub(LAST_CONTACT_S.load(Ordering::Relaxed));
    let primed_now = with_registers(|regs| {
        let expired = regs.timeout > 0 && elapsed > u32::from(regs.timeout);
        if expired && regs.primed == 0 {
            regs.primed = 1;
            regs.shutdown_cause = ShutdownCause::empty();
            regs.dirty = true;
            true
        } else {
            if !regs.shutdown_cause.contains(ShutdownCause::HOST_INITIATED) {
                regs.shutdown_cause |= ShutdownCause::BUTTON;
            }
            false
        }
    });
    if primed_now {
        info!("button press primed the device");
        let _ = STORE_EVENT_CHANNEL.try_send(StoreEvents::Persist);
    } else {
        debug!("button press recorded as shutdown cause");
    }
}

#[task]
pub async fn led_button_task(mut pin: Flex<'static>) {
    info!("Starting LED/button task");

    pin.set_as_input();
    pin.set_pull(Pull::Up);

    let receiver = LED_EVENT_CHANNEL.receiver();

    info!("LED/button task initialized");

    loop {
        let event = select(receiver.receive(), pin.wait_for_falling_edge()).await;
        match event {
            Either::First(LedEvents::Blink(pattern)) => {
                debug!("playing pattern {}", pattern);
                blink(&mut pin, pattern).await;
            }
            Either::Second(()) => {
                Timer::after_millis(DEBOUNCE_MS).await;
                if pin.is_high() {
                    continue;
                }
                handle_press();
                // One press, one event.
                pin.wait_for_rising_edge().await;
            }
        }
    }
}
