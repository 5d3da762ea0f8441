//! Power-state machine.
//!
//! One state instance exists per device. The control cycle evaluates it
//! against the freshly smoothed battery voltage every wake; the bus task only
//! performs the `Uncertain` → `Running` liveness transition (see
//! [`crate::registers::RegisterFile::note_bus_contact`]).

use bitflags::bitflags;

use crate::registers::RegisterFile;

/// External voltage level above which the host rail counts as powered, in
/// millivolts. Used both by the watchdog restart trigger and by the pulsed
/// switch policy when confirming a pulse took effect.
pub const MIN_POWER_LEVEL: u16 = 4700;

/// Power conditions ordered by severity, so a single comparison answers
/// "is this at least as bad as `Warn`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// The host is running normally.
    Running,
    /// Post-boot: host liveness unknown until a voltage reading or a bus
    /// transaction disambiguates.
    Uncertain,
    /// Voltage recovered above the restart threshold from `Warn`.
    WarnRecovering,
    /// Voltage recovered above the restart threshold from `Shutdown`.
    ShutdownRecovering,
    /// Battery at or below the warn threshold; the host should shut down.
    Warn,
    /// Battery at or below the shutdown threshold; power cut is imminent.
    WarnToShutdown,
    /// Host power is (or may be) cut; all host-facing signaling suppressed.
    Shutdown,
}

impl PowerState {
    /// Legacy encoding served in the `internal_state` register. The host
    /// daemon predates the ordered enum and expects one bit per state.
    pub fn wire_value(self) -> u8 {
        match self {
            PowerState::Running => 0,
            PowerState::Uncertain => 1 << 0,
            PowerState::WarnRecovering => 1 << 1,
            PowerState::ShutdownRecovering => 1 << 2,
            PowerState::Warn => 1 << 3,
            PowerState::WarnToShutdown => 1 << 4,
            PowerState::Shutdown => 1 << 5,
        }
    }
}

bitflags! {
    /// Accumulating reasons a shutdown was requested. Bit positions are fixed
    /// by the wire protocol; unknown bits written by the host are retained.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownCause: u8 {
        const HOST_INITIATED = 1 << 1;
        const EXT_VOLTAGE = 1 << 2;
        const BUTTON = 1 << 3;
        const BAT_VOLTAGE = 1 << 7;
    }
}

/// Fresh measurements and timer state fed into one evaluation cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleInputs {
    /// Smoothed battery voltage, millivolts.
    pub battery_mv: u16,
    /// External rail voltage, millivolts.
    pub external_mv: u16,
    /// The liveness window has elapsed without a bus transaction.
    pub liveness_expired: bool,
}

/// Side effects requested by one evaluation cycle, executed by the control
/// cycle in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleActions {
    pub power_off: bool,
    pub power_on: bool,
    pub restart: bool,
    pub blink_warn: bool,
    pub blink_restart: bool,
    pub reset_liveness: bool,
}

/// Runs one state-machine cycle against fresh measurements.
///
/// Three phases, strictly in order: transitional states entered on the
/// previous cycle are completed first (their power action has already run),
/// then the voltage thresholds escalate or de-escalate the state, then the
/// signaling and host-watchdog behavior of the resulting state is applied.
pub fn evaluate_cycle(file: &mut RegisterFile, inputs: &CycleInputs) -> CycleActions {
    let mut actions = CycleActions::default();

    match file.state {
        PowerState::WarnToShutdown => {
            if file.primed != 0 {
                actions.power_off = true;
            }
            file.state = PowerState::Shutdown;
        }
        PowerState::WarnRecovering => {
            file.state = PowerState::Running;
            file.shutdown_cause = ShutdownCause::empty();
            actions.reset_liveness = true;
        }
        PowerState::ShutdownRecovering => {
            file.state = PowerState::Running;
            actions.reset_liveness = true;
        }
        _ => {}
    }

    if inputs.battery_mv <= file.shutdown_voltage {
        if file.state < PowerState::WarnToShutdown {
            file.state = PowerState::WarnToShutdown;
            file.shutdown_cause |= ShutdownCause::BAT_VOLTAGE;
            if file.force_shutdown != 0 && file.primed != 0 {
                // Skip the graceful wait entirely.
                actions.power_off = true;
            }
        }
    } else if inputs.battery_mv <= file.warn_voltage {
        if file.state < PowerState::Warn {
            file.state = PowerState::Warn;
            file.shutdown_cause |= ShutdownCause::BAT_VOLTAGE;
        }
    } else if inputs.battery_mv <= file.restart_voltage {
        if file.state == PowerState::Uncertain && inputs.liveness_expired {
            // The host presumably shut itself down during the outage.
            file.state = PowerState::Warn;
        }
    } else {
        match file.state {
            PowerState::Shutdown | PowerState::WarnToShutdown => {
                file.state = PowerState::ShutdownRecovering;
                file.shutdown_cause = ShutdownCause::empty();
                actions.power_on = true;
            }
            PowerState::Warn => file.state = PowerState::WarnRecovering,
            PowerState::Uncertain => {
                file.state = PowerState::Running;
                file.shutdown_cause = ShutdownCause::empty();
                actions.reset_liveness = true;
            }
            _ => {}
        }
    }

    match file.state {
        PowerState::Running => {
            let external_lost =
                file.vext_off_is_shutdown != 0 && inputs.external_mv < MIN_POWER_LEVEL;
            if file.primed != 0 && (inputs.liveness_expired || external_lost) {
                if external_lost {
                    file.shutdown_cause |= ShutdownCause::EXT_VOLTAGE;
                }
                actions.blink_restart = true;
                actions.restart = true;
                actions.reset_liveness = true;
            }
        }
        PowerState::Warn => {
            let pending = file.shutdown_cause.difference(ShutdownCause::HOST_INITIATED);
            if !pending.is_empty() && !inputs.liveness_expired {
                actions.blink_warn = true;
            }
        }
        _ => {}
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> RegisterFile {
        let mut file = RegisterFile::new();
        file.shutdown_voltage = 3200;
        file.warn_voltage = 3400;
        file.restart_voltage = 3900;
        file.primed = 1;
        file
    }

    fn inputs(battery_mv: u16) -> CycleInputs {
        CycleInputs {
            battery_mv,
            external_mv: 5000,
            liveness_expired: false,
        }
    }

    #[test]
    fn severity_is_totally_ordered() {
        assert!(PowerState::Running < PowerState::Uncertain);
        assert!(PowerState::Uncertain < PowerState::WarnRecovering);
        assert!(PowerState::WarnRecovering < PowerState::ShutdownRecovering);
        assert!(PowerState::ShutdownRecovering < PowerState::Warn);
        assert!(PowerState::Warn < PowerState::WarnToShutdown);
        assert!(PowerState::WarnToShutdown < PowerState::Shutdown);
    }

    #[test]
    fn wire_values_keep_legacy_encoding() {
        assert_eq!(PowerState::Running.wire_value(), 0);
        assert_eq!(PowerState::Uncertain.wire_value(), 1);
        assert_eq!(PowerState::WarnRecovering.wire_value(), 2);
        assert_eq!(PowerState::ShutdownRecovering.wire_value(), 4);
        assert_eq!(PowerState::Warn.wire_value(), 8);
        assert_eq!(PowerState::WarnToShutdown.wire_value(), 16);
        assert_eq!(PowerState::Shutdown.wire_value(), 32);
    }

    #[test]
    fn hard_low_voltage_escalates_past_warn() {
        let mut file = file();
        file.state = PowerState::Running;
        evaluate_cycle(&mut file, &inputs(3100));
        assert_eq!(file.state, PowerState::WarnToShutdown);
        assert!(file.shutdown_cause.contains(ShutdownCause::BAT_VOLTAGE));

        // Next cycle completes the transition and cuts power.
        let actions = evaluate_cycle(&mut file, &inputs(3100));
        assert_eq!(file.state, PowerState::Shutdown);
        assert!(actions.power_off);
    }

    #[test]
    fn warn_band_escalates_to_warn_and_records_cause() {
        let mut file = file();
        file.state = PowerState::Running;
        evaluate_cycle(&mut file, &inputs(3300));
        assert_eq!(file.state, PowerState::Warn);
        assert!(file.shutdown_cause.contains(ShutdownCause::BAT_VOLTAGE));
    }

    #[test]
    fn warn_never_deescalates_without_recovery_state() {
        let mut file = file();
        file.state = PowerState::Warn;
        file.shutdown_cause = ShutdownCause::BAT_VOLTAGE;

        // Mid band: stays in Warn.
        evaluate_cycle(&mut file, &inputs(3600));
        assert_eq!(file.state, PowerState::Warn);

        // Above restart: one-step move through WarnRecovering...
        evaluate_cycle(&mut file, &inputs(3950));
        assert_eq!(file.state, PowerState::WarnRecovering);

        // ...completed on the following cycle, clearing causes.
        let actions = evaluate_cycle(&mut file, &inputs(3950));
        assert_eq!(file.state, PowerState::Running);
        assert!(file.shutdown_cause.is_empty());
        assert!(actions.reset_liveness);
    }

    #[test]
    fn shutdown_recovery_restores_power_then_runs() {
        let mut file = file();
        file.state = PowerState::Shutdown;
        file.shutdown_cause = ShutdownCause::BAT_VOLTAGE;

        let actions = evaluate_cycle(&mut file, &inputs(3950));
        assert_eq!(file.state, PowerState::ShutdownRecovering);
        assert!(actions.power_on);
        assert!(file.shutdown_cause.is_empty());

        let actions = evaluate_cycle(&mut file, &inputs(3950));
        assert_eq!(file.state, PowerState::Running);
        assert!(actions.reset_liveness);
    }

    #[test]
    fn force_shutdown_cuts_power_on_entry() {
        let mut file = file();
        file.state = PowerState::Running;
        file.force_shutdown = 1;
        let actions = evaluate_cycle(&mut file, &inputs(3100));
        assert_eq!(file.state, PowerState::WarnToShutdown);
        assert!(actions.power_off);
    }

    #[test]
    fn unprimed_device_never_cuts_power() {
        let mut file = file();
        file.state = PowerState::WarnToShutdown;
        file.primed = 0;
        let actions = evaluate_cycle(&mut file, &inputs(3100));
        assert_eq!(file.state, PowerState::Shutdown);
        assert!(!actions.power_off);
    }

    #[test]
    fn uncertain_resolves_by_voltage() {
        let mut file = file();
        file.state = PowerState::Uncertain;
        let actions = evaluate_cycle(&mut file, &inputs(3950));
        assert_eq!(file.state, PowerState::Running);
        assert!(actions.reset_liveness);
    }

    #[test]
    fn uncertain_degrades_to_warn_after_timeout() {
        let mut file = file();
        file.state = PowerState::Uncertain;
        let mut i = inputs(3600);
        evaluate_cycle(&mut file, &i);
        assert_eq!(file.state, PowerState::Uncertain);

        i.liveness_expired = true;
        evaluate_cycle(&mut file, &i);
        assert_eq!(file.state, PowerState::Warn);
    }

    #[test]
    fn liveness_expiry_restarts_exactly_once() {
        let mut file = file();
        file.state = PowerState::Running;
        let mut i = inputs(4000);
        i.liveness_expired = true;

        let actions = evaluate_cycle(&mut file, &i);
        assert!(actions.restart);
        assert!(actions.blink_restart);
        assert!(actions.reset_liveness);

        // The restart reset the timer; the next cycle sees it unexpired.
        i.liveness_expired = false;
        let actions = evaluate_cycle(&mut file, &i);
        assert!(!actions.restart);
    }

    #[test]
    fn external_voltage_loss_triggers_restart_when_configured() {
        let mut file = file();
        file.state = PowerState::Running;
        file.vext_off_is_shutdown = 1;
        let mut i = inputs(4000);
        i.external_mv = 100;

        let actions = evaluate_cycle(&mut file, &i);
        assert!(actions.restart);
        assert!(file.shutdown_cause.contains(ShutdownCause::EXT_VOLTAGE));
    }

    #[test]
    fn warn_signal_requires_pending_cause_and_unexpired_timer() {
        let mut file = file();
        file.state = PowerState::Warn;
        file.shutdown_cause = ShutdownCause::BAT_VOLTAGE;

        let actions = evaluate_cycle(&mut file, &inputs(3300));
        assert!(actions.blink_warn);

        // A host-initiated cause alone is not signaled back at the host.
        file.shutdown_cause = ShutdownCause::HOST_INITIATED;
        let actions = evaluate_cycle(&mut file, &inputs(3300));
        assert!(!actions.blink_warn);

        // Once the window has elapsed the host had its chance.
        file.shutdown_cause = ShutdownCause::BAT_VOLTAGE;
        let mut i = inputs(3300);
        i.liveness_expired = true;
        let actions = evaluate_cycle(&mut file, &i);
        assert!(!actions.blink_warn);
    }

    #[test]
    fn shutdown_state_is_silent() {
        let mut file = file();
        file.state = PowerState::Shutdown;
        file.shutdown_cause = ShutdownCause::BAT_VOLTAGE;
        let actions = evaluate_cycle(&mut file, &inputs(3100));
        assert_eq!(file.state, PowerState::Shutdown);
        assert!(!actions.blink_warn && !actions.blink_restart);
    }

    #[test]
    fn causes_accumulate_without_losing_bits() {
        let mut cause = ShutdownCause::empty();
        cause |= ShutdownCause::BUTTON;
        cause |= ShutdownCause::BAT_VOLTAGE;
        assert_eq!(
            cause,
            ShutdownCause::BUTTON | ShutdownCause::BAT_VOLTAGE
        );
    }
}
