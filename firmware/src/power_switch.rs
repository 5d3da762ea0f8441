//! Host power-switch actuation.
//!
//! Two policies, selected by the `ups_configuration` register: a
//! voltage-controlled level (the pin directly represents host power) or a
//! transient pulse toggling an external latch. The pulsed policy supports
//! per-direction pulse lengths, repeated pulses and an optional
//! external-voltage confirmation that skips redundant pulses so a latch is
//! never toggled back out of the state just reached.
//!
//! All delays are foreground waits; a sequence runs to completion.

use defmt::{debug, info};
use embassy_rp::gpio::{Level, Output};
use embassy_time::Timer;

use controller_core::registers::{RegisterFile, UpsConfiguration, effective_pulse_length};
use controller_core::state::MIN_POWER_LEVEL;

use crate::analog::{Analog, Calibration};
use crate::config_resources::PowerSwitchResources;

/// Divisor from the recovery delay to the spacing between repeated pulses.
const PULSE_SPACING_DIV: u32 = 4;

/// Switch-policy snapshot, copied out of the register file in one critical
/// section before a sequence starts.
#[derive(Clone, Copy)]
pub struct SwitchConfig {
    pub ups_configuration: UpsConfiguration,
    pub pulse_length: u16,
    pub pulse_length_on: u16,
    pub pulse_length_off: u16,
    pub switch_recovery_delay: u16,
}

impl SwitchConfig {
    pub fn snapshot(file: &RegisterFile) -> Self {
        Self {
            ups_configuration: file.ups_configuration,
            pulse_length: file.pulse_length,
            pulse_length_on: file.pulse_length_on,
            pulse_length_off: file.pulse_length_off,
            switch_recovery_delay: file.switch_recovery_delay,
        }
    }
}

pub struct PowerSwitch {
    pin: Output<'static>,
}

impl PowerSwitch {
    pub fn new(r: PowerSwitchResources) -> Self {
        Self {
            pin: Output::new(r.pin, Level::Low),
        }
    }

    /// Brings the pin to the level the policy expects before the first
    /// evaluation: in voltage-controlled mode the level is the power state
    /// and the host starts powered; in pulsed mode the pin idles low.
    pub fn initialize(&mut self, cfg: &SwitchConfig) {
        if !cfg.ups_configuration.pulsed() {
            self.pin.set_high();
        }
    }

    pub async fn power_on(&mut self, cfg: &SwitchConfig, analog: &mut Analog, cal: &Calibration) {
        info!("Switching host power on");
        if !cfg.ups_configuration.pulsed() {
            self.pin.set_high();
            return;
        }
        self.pulse_sequence(cfg, analog, cal, true).await;
    }

    pub async fn power_off(&mut self, cfg: &SwitchConfig, analog: &mut Analog, cal: &Calibration) {
        info!("Switching host power off");
        if !cfg.ups_configuration.pulsed() {
            self.pin.set_low();
            return;
        }
        self.pulse_sequence(cfg, analog, cal, false).await;
    }

    /// Full power cycle. The caller clears the shutdown causes afterwards.
    pub async fn restart(&mut self, cfg: &SwitchConfig, analog: &mut Analog, cal: &Calibration) {
        info!("Restarting host");
        self.power_off(cfg, analog, cal).await;
        Timer::after_millis(u64::from(cfg.switch_recovery_delay)).await;
        self.power_on(cfg, analog, cal).await;
    }

    async fn pulse_sequence(
        &mut self,
        cfg: &SwitchConfig,
        analog: &mut Analog,
        cal: &Calibration,
        on: bool,
    ) {
        let length = if on {
            effective_pulse_length(cfg.pulse_length_on, cfg.pulse_length)
        } else {
            effective_pulse_length(cfg.pulse_length_off, cfg.pulse_length)
        };
        self.pulse(length).await;

        let spacing = u64::from(u32::from(cfg.switch_recovery_delay) / PULSE_SPACING_DIV);
        for _ in 0..cfg.ups_configuration.extra_pulses() {
            Timer::after_millis(spacing).await;
            if cfg.ups_configuration.check_external_voltage() {
                let external_mv = analog.read_external_mv(cal).await;
                let settled = if on {
                    external_mv >= MIN_POWER_LEVEL
                } else {
                    external_mv < MIN_POWER_LEVEL
                };
                if settled {
                    // The rail already shows the desired state; another
                    // pulse would toggle the latch right back.
                    debug!("rail settled at {} mV, skipping extra pulse", external_mv);
                    break;
                }
            }
            self.pulse(length).await;
        }
    }

    async fn pulse(&mut self, length_ms: u16) {
        self.pin.set_high();
        Timer::after_millis(u64::from(length_ms)).await;
        self.pin.set_low();
    }
}
