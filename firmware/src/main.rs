#![no_std]
#![no_main]

use core::cell::RefCell;

use defmt::{Debug2Format, debug, error, info};
use embassy_executor::Spawner;
use embassy_rp::flash::{Blocking, ERASE_SIZE, Flash};
use embassy_rp::gpio::Flex;
use embassy_rp::pac;
use embassy_rp::watchdog::Watchdog;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
use embassy_sync::mutex::Mutex;
use embassy_sync::once_lock::OnceLock;
use embassy_time::{Duration, Timer};
use embedded_storage::nor_flash::RmwNorFlashStorage;
use portable_atomic::AtomicU32;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use controller_core::registers::RegisterFile;
use controller_core::store::{self, InitOutcome};

mod analog;
mod config;
mod config_resources;
mod led_patterns;
mod power_switch;
mod tasks;

use crate::config::{
    CONFIG_STORE_OFFSET, FLASH_SIZE, FW_VERSION_U32, HARDWARE_WATCHDOG_TIMEOUT_S, STORE_MARKER,
};
use crate::config_resources::{
    AnalogResources, AssignedResources, I2CSecondaryResources, LedButtonResources,
    PowerSwitchResources,
};

/// The one register file, shared between the control cycle and the bus and
/// button handlers. Guarded get/set only; locks are held for the duration of
/// a copy, never across an await.
pub static REGISTERS: BlockingMutex<CriticalSectionRawMutex, RefCell<RegisterFile>> =
    BlockingMutex::new(RefCell::new(RegisterFile::new()));

pub fn with_registers<R>(f: impl FnOnce(&mut RegisterFile) -> R) -> R {
    REGISTERS.lock(|cell| f(&mut cell.borrow_mut()))
}

/// Uptime second of the last completed bus transaction.
pub static LAST_CONTACT_S: AtomicU32 = AtomicU32::new(0);

pub type FlashType = Flash<'static, embassy_rp::peripherals::FLASH, Blocking, FLASH_SIZE>;
pub type ConfigStorage = RmwNorFlashStorage<'static, FlashType>;
pub static STORE: OnceLock<Mutex<NoopRawMutex, ConfigStorage>> = OnceLock::new();

static RMW_BUFFER: StaticCell<[u8; ERASE_SIZE]> = StaticCell::new();

/// Chip identification bytes served in the diagnostic registers, the reset
/// reason, and whether the clock tree is usable at all.
fn boot_diagnostics() -> ([u8; 3], u8, bool) {
    let chip_id = pac::SYSINFO.chip_id().read().0;
    let fuse_snapshot = [
        (chip_id >> 28) as u8,
        (chip_id >> 20) as u8,
        (chip_id >> 12) as u8,
    ];
    let reset_reason = pac::WATCHDOG.reason().read().0 as u8;
    // Bit 31 of the XOSC status register: oscillator stable. Without it the
    // timing base is untrustworthy and nothing below can run safely.
    let clocks_ok = pac::XOSC.status().read().0 & (1 << 31) != 0;
    (fuse_snapshot, reset_reason, clocks_ok)
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    let r = split_resources!(p);

    info!("Starting up...");

    let (fuse_snapshot, reset_reason, clocks_ok) = boot_diagnostics();

    // Bring up the configuration store before anything runs.
    let flash = Flash::<_, Blocking, FLASH_SIZE>::new_blocking(p.FLASH);
    let mut storage = RmwNorFlashStorage::new(flash, RMW_BUFFER.init([0; ERASE_SIZE]));

    let mut file = RegisterFile::new();
    file.version = FW_VERSION_U32;
    file.fuse_snapshot = fuse_snapshot;
    file.mcu_status = reset_reason;
    match store::read_or_initialize(&mut storage, CONFIG_STORE_OFFSET, STORE_MARKER, &mut file) {
        Ok(InitOutcome::Loaded) => info!("configuration loaded from store"),
        Ok(InitOutcome::Initialized) => info!("configuration store initialized with defaults"),
        // Keep running on compiled-in defaults.
        Err(e) => error!("configuration store unreadable: {}", Debug2Format(&e)),
    }
    with_registers(|regs| *regs = file);

    if STORE.init(Mutex::new(storage)).is_err() {
        error!("Failed to initialize config store");
        return;
    }

    let mut led = Flex::new(r.led_button.pin);

    if !clocks_ok {
        // Nothing can be trusted without a stable oscillator, and there is
        // no recovery short of reflashing.
        error!("clock diagnostics failed, signaling SOS");
        led_patterns::sos_forever(&mut led).await;
    }

    let mut watchdog = Watchdog::new(p.WATCHDOG);
    watchdog.start(Duration::from_secs(HARDWARE_WATCHDOG_TIMEOUT_S));

    spawner
        .spawn(tasks::i2c_secondary::i2c_secondary_task(r.i2cs))
        .unwrap();

    spawner
        .spawn(tasks::led_button::led_button_task(led))
        .unwrap();

    spawner
        .spawn(tasks::config_store::config_store_task())
        .unwrap();

    spawner
        .spawn(tasks::state_machine::control_cycle_task(
            r.analog,
            r.power_switch,
        ))
        .unwrap();

    loop {
        Timer::after(Duration::from_secs(1)).await;

        watchdog.feed();

        let (state, bat, ext, temp, since_contact) = with_registers(|regs| {
            (
                regs.state,
                regs.bat_voltage,
                regs.ext_voltage,
                regs.temperature,
                regs.seconds_since_contact,
            )
        });
        debug!(
            "state: {:?} | bat: {} mV | ext: {} mV | temp: {} d°C | contact: {} s ago",
            state, bat, ext, temp, since_contact
        );
    }
}
