//! Store event task.
//!
//! The bus and button paths never touch flash; they queue events here
//! instead. This task owns the immediate write-through of the legacy
//! registers and the host-triggered re-initialization. The regular deferred
//! flush runs at the end of the control cycle, not here.

use defmt::{Debug2Format, debug, error, info};
use embassy_executor::task;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel;

use controller_core::store;

use crate::config::{CONFIG_STORE_OFFSET, STORE_MARKER};
use crate::{STORE, with_registers};

pub enum StoreEvents {
    /// Write-through of an immediate-persist register.
    Persist,
    /// Host-triggered reset of the whole table to compiled-in defaults.
    Reinitialize,
}

pub type StoreChannelType = channel::Channel<CriticalSectionRawMutex, StoreEvents, 8>;
pub static STORE_EVENT_CHANNEL: StoreChannelType = channel::Channel::new();

#[task]
pub async fn config_store_task() {
    info!("Starting config store task");

    let receiver = STORE_EVENT_CHANNEL.receiver();

    info!("Config store task initialized");

    loop {
        let event = receiver.receive().await;
        let mut storage = STORE.get().await.lock().await;
        match event {
            StoreEvents::Persist => {
                // Clear the dirty flag while snapshotting; a write landing
                // during the flash operation re-marks it and is flushed on
                // the next cycle.
                let snapshot = with_registers(|regs| {
                    regs.dirty = false;
                    regs.clone()
                });
                match store::flush(&mut *storage, CONFIG_STORE_OFFSET, &snapshot) {
                    Ok(cells) => debug!("wrote {} store cells through", cells),
                    Err(e) => {
                        error!("store write-through failed: {}", Debug2Format(&e));
                        with_registers(|regs| regs.dirty = true);
                    }
                }
            }
            StoreEvents::Reinitialize => {
                let snapshot = with_registers(|regs| {
                    regs.reset_config_defaults();
                    regs.dirty = false;
                    regs.reinit_requested = false;
                    regs.filter_reset_pending = true;
                    regs.clone()
                });
                match store::write_all(&mut *storage, CONFIG_STORE_OFFSET, STORE_MARKER, &snapshot)
                {
                    Ok(()) => info!("configuration store reinitialized"),
                    Err(e) => error!("store reinitialization failed: {}", Debug2Format(&e)),
                }
            }
        }
    }
}
