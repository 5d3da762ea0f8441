// Blink patterns for the shared LED/button pin.

use embassy_rp::gpio::Flex;
use embassy_time::Timer;

use crate::config::BLINK_TIME_MS;

/// A counted on/off sequence on the status LED.
#[derive(Clone, Copy, defmt::Format)]
pub struct BlinkPattern {
    pub count: u8,
    pub on_ms: u64,
    pub off_ms: u64,
}

/// Five steady blinks: a shutdown cause is pending, the host should act.
pub const WARN_SIGNAL: BlinkPattern = BlinkPattern {
    count: 5,
    on_ms: BLINK_TIME_MS,
    off_ms: BLINK_TIME_MS,
};

/// Ten fast blinks immediately before an involuntary restart.
pub const RESTART_SIGNAL: BlinkPattern = BlinkPattern {
    count: 10,
    on_ms: BLINK_TIME_MS / 2,
    off_ms: BLINK_TIME_MS / 2,
};

const SOS_SHORT_MS: u64 = BLINK_TIME_MS;
const SOS_LONG_MS: u64 = 3 * BLINK_TIME_MS;
const SOS_PAUSE_MS: u64 = 6 * BLINK_TIME_MS;

async fn blink_once(led: &mut Flex<'static>, on_ms: u64) {
    led.set_high();
    Timer::after_millis(on_ms).await;
    led.set_low();
    Timer::after_millis(SOS_SHORT_MS).await;
}

/// Fatal boot diagnostics failure: nothing to do but signal until reflashed.
pub async fn sos_forever(led: &mut Flex<'static>) -> ! {
    led.set_as_output();
    loop {
        for _ in 0..3 {
            blink_once(led, SOS_SHORT_MS).await;
        }
        for _ in 0..3 {
            blink_once(led, SOS_LONG_MS).await;
        }
        for _ in 0..3 {
            blink_once(led, SOS_SHORT_MS).await;
        }
        Timer::after_millis(SOS_PAUSE_MS).await;
    }
}
