//! The foreground control cycle.
//!
//! One loop owns the whole decision path, strictly ordered within a cycle:
//! acquisition → telemetry update → state evaluation → power/LED actions →
//! store flush → state-dependent sleep. The bus and button tasks interact
//! with it only through the guarded register file and the event channels.

use defmt::{Debug2Format, debug, error, info};
use embassy_executor::task;
use embassy_time::{Instant, Timer};
use portable_atomic::Ordering;

use controller_core::state::{CycleActions, CycleInputs, PowerState, ShutdownCause, evaluate_cycle};
use controller_core::store;

use crate::analog::{Analog, Calibration};
use crate::config::{
    CONFIG_STORE_OFFSET, CYCLE_PERIOD_NOMINAL_MS, CYCLE_PERIOD_SHUTDOWN_MS, CYCLE_PERIOD_WARN_MS,
    NUM_MEASUREMENTS,
};
use crate::config_resources::{AnalogResources, PowerSwitchResources};
use crate::led_patterns::{RESTART_SIGNAL, WARN_SIGNAL};
use crate::power_switch::{PowerSwitch, SwitchConfig};
use crate::tasks::led_button::{LED_EVENT_CHANNEL, LedEvents};
use crate::{LAST_CONTACT_S, STORE, with_registers};

fn cycle_period_ms(state: PowerState) -> u64 {
    match state {
        PowerState::Shutdown => CYCLE_PERIOD_SHUTDOWN_MS,
        PowerState::Warn | PowerState::WarnToShutdown => CYCLE_PERIOD_WARN_MS,
        _ => CYCLE_PERIOD_NOMINAL_MS,
    }
}

#[task]
pub async fn control_cycle_task(ar: AnalogResources, pr: PowerSwitchResources) {
    info!("Starting control cycle task");

    let mut analog = Analog::new(ar);
    let mut switch = PowerSwitch::new(pr);

    // The switch pin level must match the assumed host power state before
    // the first evaluation.
    let cfg = with_registers(|regs| SwitchConfig::snapshot(regs));
    switch.initialize(&cfg);

    info!("Control cycle task initialized");

    loop {
        // Acquisition. Calibration pairs are copied in one critical section
        // so a concurrent bus write cannot tear them.
        let (cal, sample_count, reset_filter) = with_registers(|regs| {
            let count = if regs.state >= PowerState::Warn {
                1
            } else {
                NUM_MEASUREMENTS
            };
            let reset = regs.filter_reset_pending;
            regs.filter_reset_pending = false;
            (Calibration::snapshot(regs), count, reset)
        });
        if reset_filter {
            debug!("battery calibration changed, resetting filter");
            analog.bat_filter.reset();
        }
        let measurements = analog.acquire(&cal, sample_count).await;

        // Telemetry refresh and state evaluation.
        let now_s = Instant::now().as_secs() as u32;
        let elapsed = now_s.saturating_sub(LAST_CONTACT_S.load(Ordering::Relaxed));
        let (previous, actions, cfg, led_off_mode) = with_registers(|regs| {
            regs.bat_voltage = measurements.battery_mv;
            regs.ext_voltage = measurements.external_mv;
            regs.temperature = measurements.temperature_d;
            regs.uptime = now_s;
            regs.seconds_since_contact = elapsed.min(u32::from(u16::MAX)) as u16;
            let inputs = CycleInputs {
                battery_mv: measurements.battery_mv,
                external_mv: measurements.external_mv,
                liveness_expired: regs.timeout > 0 && elapsed > u32::from(regs.timeout),
            };
            let previous = regs.state;
            let actions = evaluate_cycle(regs, &inputs);
            (previous, actions, SwitchConfig::snapshot(regs), regs.led_off_mode)
        });
        let state = with_registers(|regs| regs.state);
        if state != previous {
            info!(
                "state {} -> {} at {} mV",
                previous, state, measurements.battery_mv
            );
        }

        // Power and LED actions, in fixed order.
        execute(
            &actions, &cfg, &cal, &mut switch, &mut analog, led_off_mode, now_s,
        )
        .await;

        // Deferred store flush. The dirty flag is cleared while taking the
        // snapshot; a write landing mid-flush re-marks it for the next
        // cycle. The flash lock is never held inside the register lock.
        let snapshot = with_registers(|regs| {
            if regs.dirty {
                regs.dirty = false;
                Some(regs.clone())
            } else {
                None
            }
        });
        if let Some(snapshot) = snapshot {
            let mut storage = STORE.get().await.lock().await;
            match store::flush(&mut *storage, CONFIG_STORE_OFFSET, &snapshot) {
                Ok(cells) => debug!("flushed {} store cells", cells),
                Err(e) => {
                    error!("store flush failed: {}", Debug2Format(&e));
                    with_registers(|regs| regs.dirty = true);
                }
            }
        }

        // Energy saving: deeper severity sleeps longer.
        Timer::after_millis(cycle_period_ms(state)).await;
    }
}

async fn execute(
    actions: &CycleActions,
    cfg: &SwitchConfig,
    cal: &Calibration,
    switch: &mut PowerSwitch,
    analog: &mut Analog,
    led_off_mode: u8,
    now_s: u32,
) {
    if actions.power_off {
        switch.power_off(cfg, analog, cal).await;
    }
    if actions.power_on {
        switch.power_on(cfg, analog, cal).await;
    }
    if led_off_mode == 0 {
        if actions.blink_warn {
            LED_EVENT_CHANNEL.send(LedEvents::Blink(WARN_SIGNAL)).await;
        }
        if actions.blink_restart {
            LED_EVENT_CHANNEL
                .send(LedEvents::Blink(RESTART_SIGNAL))
                .await;
        }
    }
    if actions.restart {
        switch.restart(cfg, analog, cal).await;
        with_registers(|regs| regs.shutdown_cause = ShutdownCause::empty());
    }
    if actions.reset_liveness {
        LAST_CONTACT_S.store(now_s, Ordering::Relaxed);
        with_registers(|regs| regs.seconds_since_contact = 0);
    }
}
