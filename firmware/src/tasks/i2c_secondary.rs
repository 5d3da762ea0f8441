//! Register bus protocol task.
//!
//! The device is a secondary on a fixed address. Write transactions carry
//! `[selector][data...][crc]` and are applied through the register file's
//! descriptor table; a CRC or framing mismatch is a silent no-op and the
//! host retries. Reads return the selected register's raw bytes followed by
//! a CRC over selector + payload. Any completed transaction resets the
//! liveness timer and, while the power state is still `Uncertain`, proves
//! the host alive.
//!
//! This task never sleeps on flash or long delays; store work is queued to
//! the config store task.

use defmt::{debug, error, info, warn};
use embassy_executor::task;
use embassy_rp::peripherals::I2C1;
use embassy_rp::{bind_interrupts, i2c, i2c_slave};
use embassy_time::Instant;
use portable_atomic::Ordering;

use controller_core::registers::{Persist, Register, WriteOutcome};

use crate::config::I2C_ADDR;
use crate::config_resources::I2CSecondaryResources;
use crate::tasks::config_store::{STORE_EVENT_CHANNEL, StoreEvents};
use crate::{LAST_CONTACT_S, with_registers};

bind_interrupts!(struct Irqs {
    I2C1_IRQ => i2c::InterruptHandler<I2C1>;
});

// The longest defined frame is selector + two data bytes + CRC; anything
// beyond the buffer is drained by the driver and discarded here.
const RX_BUFFER_SIZE: usize = 16;
const MAX_FRAME_LEN: usize = 4;

async fn respond(device: &mut i2c_slave::I2cSlave<'_, I2C1>, data: &[u8]) {
    if let Err(e) = device.respond_and_fill(data, 0x00).await {
        error!("error while responding {}", e)
    }
}

/// Marks a completed transaction: liveness timer reset plus the
/// `Uncertain` → `Running` transition, both inside one short critical
/// section.
fn note_contact() {
    LAST_CONTACT_S.store(Instant::now().as_secs() as u32, Ordering::Relaxed);
    with_registers(|regs| regs.note_bus_contact());
}

/// Serves a read of `selector` and reports whether it succeeded.
async fn serve_read(device: &mut i2c_slave::I2cSlave<'_, I2C1>, selector: u8) -> bool {
    let mut out = [0u8; 8];
    match with_registers(|regs| regs.read_register(selector, &mut out)) {
        Some(len) => {
            respond(device, &out[..len]).await;
            true
        }
        None => {
            error!("Invalid read selector: 0x{:02x}", selector);
            respond(device, &[]).await;
            false
        }
    }
}

#[task]
pub async fn i2c_secondary_task(r: I2CSecondaryResources) {
    info!("Starting register bus task");
    let mut config = i2c_slave::Config::default();
    config.addr = I2C_ADDR as u16;
    let mut device = i2c_slave::I2cSlave::new(r.i2c, r.scl, r.sda, Irqs, config);

    // Selector remembered for bare reads.
    let mut selected: u8 = 0;

    info!("Register bus task initialized");

    loop {
        let mut buf = [0u8; RX_BUFFER_SIZE];
        match device.listen(&mut buf).await {
            Ok(i2c_slave::Command::GeneralCall(len)) => {
                warn!("General call write received: {}", buf[..len]);
            }
            Ok(i2c_slave::Command::Read) => {
                if serve_read(&mut device, selected).await {
                    note_contact();
                }
            }
            Ok(i2c_slave::Command::Write(len)) => {
                if len == 1 {
                    // Bare selector for a following read transaction.
                    selected = buf[0];
                    note_contact();
                    continue;
                }
                if len > MAX_FRAME_LEN {
                    warn!("oversized write ({} bytes) discarded", len);
                    continue;
                }
                selected = buf[0];
                let outcome = with_registers(|regs| regs.apply_write(&buf[..len]));
                match outcome {
                    WriteOutcome::Applied { register, persist } => {
                        debug!("register 0x{:02x} written", buf[0]);
                        if persist == Persist::Immediate
                            && STORE_EVENT_CHANNEL.try_send(StoreEvents::Persist).is_err()
                        {
                            warn!("store event queue full, deferring to cycle flush");
                        }
                        if register == Register::InitStore
                            && STORE_EVENT_CHANNEL
                                .try_send(StoreEvents::Reinitialize)
                                .is_err()
                        {
                            warn!("store event queue full, reinit dropped");
                        }
                        note_contact();
                    }
                    WriteOutcome::Unchanged { .. } => note_contact(),
                    WriteOutcome::Rejected => {
                        debug!("write to 0x{:02x} discarded", buf[0]);
                    }
                }
            }
            Ok(i2c_slave::Command::WriteRead(len)) => {
                if len != 1 {
                    debug!("write-read with {} selector bytes", len);
                }
                selected = buf[0];
                if serve_read(&mut device, selected).await {
                    note_contact();
                }
            }
            Err(e) => error!("{}", e),
        }
    }
}
