//! ADC plumbing for the acquisition pipeline.
//!
//! Raw sampling happens here; the arithmetic (trimmed averaging, linear
//! calibration, smoothing) lives in `controller_core::acquisition`. The
//! external rail is sampled against supply, so its reading is scaled by the
//! freshly measured battery voltage before calibration.

use defmt::trace;
use embassy_rp::adc::{Adc, Async, Channel, Config, InterruptHandler};
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::Pull;
use embassy_time::Timer;
use heapless::Vec;

use controller_core::acquisition::{self, SmoothingFilter};
use controller_core::registers::RegisterFile;

use crate::config::{NUM_MEASUREMENTS, SAMPLE_SPACING_US};
use crate::config_resources::AnalogResources;

bind_interrupts!(struct Irqs {
    ADC_IRQ_FIFO => InterruptHandler;
});

/// Calibration snapshot, copied out of the register file in one critical
/// section so a concurrent bus write cannot tear a coefficient/constant pair.
#[derive(Clone, Copy)]
pub struct Calibration {
    pub bat_coefficient: u16,
    pub bat_constant: i16,
    pub ext_coefficient: u16,
    pub ext_constant: i16,
    pub temp_coefficient: i16,
    pub temp_constant: i16,
}

impl Calibration {
    pub fn snapshot(file: &RegisterFile) -> Self {
        Self {
            bat_coefficient: file.bat_voltage_coefficient,
            bat_constant: file.bat_voltage_constant,
            ext_coefficient: file.ext_voltage_coefficient,
            ext_constant: file.ext_voltage_constant,
            temp_coefficient: file.temperature_coefficient,
            temp_constant: file.temperature_constant,
        }
    }
}

/// One cycle's corrected measurements.
#[derive(Clone, Copy, defmt::Format)]
pub struct Measurements {
    /// Smoothed battery voltage, mV.
    pub battery_mv: u16,
    /// External rail voltage, mV.
    pub external_mv: u16,
    /// Die temperature, tenths of a degree Celsius.
    pub temperature_d: i16,
}

pub struct Analog {
    adc: Adc<'static, Async>,
    bat: Channel<'static>,
    ext: Channel<'static>,
    temp: Channel<'static>,
    pub bat_filter: SmoothingFilter,
}

impl Analog {
    pub fn new(r: AnalogResources) -> Self {
        let adc = Adc::new(r.adc, Irqs, Config::default());
        let bat = Channel::new_pin(r.bat_sense, Pull::None);
        let ext = Channel::new_pin(r.ext_sense, Pull::None);
        let temp = Channel::new_temp_sensor(r.temp_sensor);
        Self {
            adc,
            bat,
            ext,
            temp,
            bat_filter: SmoothingFilter::new(),
        }
    }

    /// Acquires all three quantities with `count` samples each and applies
    /// the calibration. The battery result goes through the smoothing
    /// filter; the raw (unsmoothed) battery value references the external
    /// channel scaling.
    pub async fn acquire(&mut self, cal: &Calibration, count: usize) -> Measurements {
        let temp_raw = sample(&mut self.adc, &mut self.temp, count).await;
        let bat_raw = sample(&mut self.adc, &mut self.bat, count).await;
        let ext_raw = sample(&mut self.adc, &mut self.ext, count).await;

        let bat_fresh = acquisition::calibrate_voltage(bat_raw, cal.bat_coefficient, cal.bat_constant);
        let battery_mv = self.bat_filter.update(bat_fresh);

        let external_mv = external_from_raw(ext_raw, bat_fresh, cal);

        let temperature_d = acquisition::calibrate(
            temp_raw,
            i32::from(cal.temp_coefficient),
            i32::from(cal.temp_constant),
        )
        .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;

        trace!(
            "raw bat: {} ext: {} temp: {}",
            bat_raw, ext_raw, temp_raw
        );

        Measurements {
            battery_mv,
            external_mv,
            temperature_d,
        }
    }

    /// Cheap single-sample external reading, used to confirm the rail state
    /// between switch pulses.
    pub async fn read_external_mv(&mut self, cal: &Calibration) -> u16 {
        let bat_raw = sample(&mut self.adc, &mut self.bat, 1).await;
        let ext_raw = sample(&mut self.adc, &mut self.ext, 1).await;
        let bat_fresh = acquisition::calibrate_voltage(bat_raw, cal.bat_coefficient, cal.bat_constant);
        external_from_raw(ext_raw, bat_fresh, cal)
    }
}

/// The external channel reads in fractions of the supply, i.e. of the
/// battery voltage; convert to millivolts against the fresh battery value,
/// then calibrate and clamp.
fn external_from_raw(ext_raw: u16, bat_fresh_mv: u16, cal: &Calibration) -> u16 {
    let supply_relative = ((u32::from(ext_raw) * u32::from(bat_fresh_mv)) / 4096) as u16;
    let corrected = acquisition::calibrate(
        supply_relative,
        i32::from(cal.ext_coefficient),
        i32::from(cal.ext_constant),
    );
    acquisition::clamp_external(corrected, cal.ext_constant)
}

/// Raw trimmed-average reading: `count` + 1 conversions, the first discarded
/// while the input settles.
async fn sample(adc: &mut Adc<'static, Async>, channel: &mut Channel<'static>, count: usize) -> u16 {
    let _ = adc.read(channel).await;
    let mut samples: Vec<u16, NUM_MEASUREMENTS> = Vec::new();
    for _ in 0..count.min(NUM_MEASUREMENTS) {
        let raw = adc.read(channel).await.unwrap_or(0);
        let _ = samples.push(raw);
        Timer::after_micros(SAMPLE_SPACING_US).await;
    }
    acquisition::trimmed_average(&samples)
}
