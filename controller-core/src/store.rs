//! Persistent configuration store.
//!
//! A fixed-offset byte table behind `embedded_storage::Storage`: one version
//! marker byte at the base address, then each persisted register at the slot
//! recorded in its descriptor. Offsets are part of the external contract and
//! must stay stable; a layout change must bump the firmware minor version so
//! the derived marker forces re-initialization instead of misreading stale
//! bytes.

use embedded_storage::Storage;

use crate::registers::{PERSISTED, Register, RegisterFile};

/// Offset of the one-byte version marker, relative to the store base.
pub const MARKER_OFFSET: u32 = 0;

/// Marker byte derived from the firmware version: three low major bits above
/// five low minor bits. Any major/minor bump invalidates the stored layout.
pub const fn marker_for_version(major: u8, minor: u8) -> u8 {
    ((major & 0x07) << 5) | (minor & 0x1f)
}

/// What `read_or_initialize` found at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitOutcome {
    /// Marker matched; every field was loaded from its slot.
    Loaded,
    /// Marker absent or from an incompatible version; the store now holds
    /// the in-memory values and the current marker.
    Initialized,
}

fn read_slot<S: Storage>(
    storage: &mut S,
    base: u32,
    register: Register,
) -> Result<Option<u32>, S::Error> {
    let spec = register.spec();
    let Some(slot) = spec.slot else {
        return Ok(None);
    };
    let width = usize::from(spec.width);
    let mut buf = [0u8; 2];
    storage.read(base + slot, &mut buf[..width])?;
    let raw = match width {
        1 => u32::from(buf[0]),
        _ => u32::from(u16::from_le_bytes(buf)),
    };
    Ok(Some(raw))
}

/// Writes one field, skipping the write when the stored bytes already match.
/// Returns whether a write happened.
fn write_slot_if_changed<S: Storage>(
    storage: &mut S,
    base: u32,
    register: Register,
    raw: u32,
) -> Result<bool, S::Error> {
    let spec = register.spec();
    let Some(slot) = spec.slot else {
        return Ok(false);
    };
    let width = usize::from(spec.width);
    let bytes = raw.to_le_bytes();
    let mut current = [0u8; 2];
    storage.read(base + slot, &mut current[..width])?;
    if current[..width] == bytes[..width] {
        return Ok(false);
    }
    storage.write(base + slot, &bytes[..width])?;
    Ok(true)
}

/// Boot-time load: a matching marker loads every field into `file`; anything
/// else writes the current in-memory values (the compiled-in defaults on
/// first boot) and the marker.
pub fn read_or_initialize<S: Storage>(
    storage: &mut S,
    base: u32,
    marker: u8,
    file: &mut RegisterFile,
) -> Result<InitOutcome, S::Error> {
    let mut found = [0u8; 1];
    storage.read(base + MARKER_OFFSET, &mut found)?;
    if found[0] == marker {
        for &register in PERSISTED {
            if let Some(raw) = read_slot(storage, base, register)? {
                file.set_raw(register, raw);
            }
        }
        Ok(InitOutcome::Loaded)
    } else {
        write_all(storage, base, marker, file)?;
        Ok(InitOutcome::Initialized)
    }
}

/// Writes every persisted field back, skipping unchanged cells to bound
/// write wear. Returns the number of cells actually rewritten.
pub fn flush<S: Storage>(
    storage: &mut S,
    base: u32,
    file: &RegisterFile,
) -> Result<usize, S::Error> {
    let mut written = 0;
    for &register in PERSISTED {
        if write_slot_if_changed(storage, base, register, file.get(register))? {
            written += 1;
        }
    }
    Ok(written)
}

/// Unconditional rewrite of the whole table plus the marker. Used on first
/// boot and for the host-triggered re-initialization.
pub fn write_all<S: Storage>(
    storage: &mut S,
    base: u32,
    marker: u8,
    file: &RegisterFile,
) -> Result<(), S::Error> {
    for &register in PERSISTED {
        write_slot_if_changed(storage, base, register, file.get(register))?;
    }
    storage.write(base + MARKER_OFFSET, &[marker])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{DEFAULT_TIMEOUT, DEFAULT_WARN_VOLTAGE};
    use embedded_storage::ReadStorage;

    const BASE: u32 = 0x100;
    const MARKER: u8 = marker_for_version(1, 2);

    /// RAM-backed storage that counts write calls.
    struct MemStorage {
        data: [u8; 0x200],
        writes: usize,
    }

    impl MemStorage {
        fn new() -> Self {
            Self {
                data: [0xff; 0x200],
                writes: 0,
            }
        }
    }

    impl ReadStorage for MemStorage {
        type Error = core::convert::Infallible;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl Storage for MemStorage {
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn first_boot_initializes_with_defaults() {
        let mut storage = MemStorage::new();
        let mut file = RegisterFile::new();
        let outcome = read_or_initialize(&mut storage, BASE, MARKER, &mut file).unwrap();
        assert_eq!(outcome, InitOutcome::Initialized);
        assert_eq!(storage.data[BASE as usize], MARKER);

        // The second boot loads instead.
        let mut file = RegisterFile::new();
        let outcome = read_or_initialize(&mut storage, BASE, MARKER, &mut file).unwrap();
        assert_eq!(outcome, InitOutcome::Loaded);
        assert_eq!(file.timeout, DEFAULT_TIMEOUT);
        assert_eq!(file.warn_voltage, DEFAULT_WARN_VOLTAGE);
    }

    #[test]
    fn flush_then_load_round_trips_every_field() {
        let mut storage = MemStorage::new();
        let mut file = RegisterFile::new();
        read_or_initialize(&mut storage, BASE, MARKER, &mut file).unwrap();

        file.timeout = 45;
        file.primed = 1;
        file.restart_voltage = 4005;
        file.warn_voltage = 3555;
        file.shutdown_voltage = 3101;
        file.bat_voltage_constant = -77;
        file.temperature_coefficient = -4000;
        file.pulse_length_off = 350;
        file.vext_off_is_shutdown = 1;
        flush(&mut storage, BASE, &file).unwrap();

        let mut reloaded = RegisterFile::new();
        let outcome = read_or_initialize(&mut storage, BASE, MARKER, &mut reloaded).unwrap();
        assert_eq!(outcome, InitOutcome::Loaded);
        for &register in PERSISTED {
            assert_eq!(
                reloaded.get(register),
                file.get(register),
                "mismatch in {register:?}"
            );
        }
    }

    #[test]
    fn flush_skips_unchanged_cells() {
        let mut storage = MemStorage::new();
        let mut file = RegisterFile::new();
        read_or_initialize(&mut storage, BASE, MARKER, &mut file).unwrap();

        storage.writes = 0;
        assert_eq!(flush(&mut storage, BASE, &file).unwrap(), 0);
        assert_eq!(storage.writes, 0);

        file.timeout = 30;
        assert_eq!(flush(&mut storage, BASE, &file).unwrap(), 1);
        assert_eq!(storage.writes, 1);
    }

    #[test]
    fn version_bump_forces_reinitialization() {
        let mut storage = MemStorage::new();
        let mut file = RegisterFile::new();
        read_or_initialize(&mut storage, BASE, MARKER, &mut file).unwrap();
        file.warn_voltage = 3777;
        flush(&mut storage, BASE, &file).unwrap();

        let newer = marker_for_version(1, 3);
        let mut file = RegisterFile::new();
        let outcome = read_or_initialize(&mut storage, BASE, newer, &mut file).unwrap();
        assert_eq!(outcome, InitOutcome::Initialized);
        assert_eq!(file.warn_voltage, DEFAULT_WARN_VOLTAGE);
        assert_eq!(storage.data[BASE as usize], newer);
    }

    #[test]
    fn marker_derivation_is_stable() {
        assert_eq!(marker_for_version(1, 2), 0b0010_0010);
        assert_eq!(marker_for_version(2, 13), 0b0100_1101);
        // Only the low bits participate; a wrap still changes the marker of
        // any adjacent release.
        assert_ne!(marker_for_version(1, 2), marker_for_version(1, 3));
    }
}
