//! Checksum-guarded record that survives deep sleep in RTC scratch memory.
//!
//! Layout (little-endian, 8 bytes at a fixed offset):
//!
//! ```text
//!  0        4                       6                      8
//!  | crc32  | last_reported_percent | cycles_since_report  |
//! ```
//!
//! The CRC covers bytes 4..8 only. It is CRC-32/MPEG-2 (poly 0x04C11DB7,
//! init 0xFFFFFFFF, MSB-first, no final XOR), which differs from the common
//! reflected CRC-32; records written by earlier firmware only validate with
//! this exact variant.

use crc::{CRC_32_MPEG_2, Crc};

use crate::config::ReportPolicy;

/// Size of the persisted record in bytes.
pub const RECORD_LEN: usize = 8;

const PAYLOAD_OFFSET: usize = 4;

static RECORD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Outcome of [`PersistentCycleState::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decision {
    Report,
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PersistentCycleState {
    /// Percentage of the most recent sample (reported or not)
    pub last_reported_percent: u8,
    /// Wakes since the last report
    pub cycles_since_report: u16,
}

impl PersistentCycleState {
    /// State used when scratch memory holds no valid record. The counter starts
    /// at the ceiling so the first wake always reports.
    pub const fn first_boot(policy: &ReportPolicy) -> Self {
        Self {
            last_reported_percent: 0,
            cycles_since_report: policy.max_cycles_without_report,
        }
    }

    /// Fold one wake's reading into the record and decide whether it is
    /// reported.
    ///
    /// The counter is bumped before the ceiling check, so with a ceiling of N a
    /// static reading reports on every Nth wake. `last_reported_percent`
    /// always tracks the newest sample so drift is measured wake-to-wake.
    pub fn advance(&mut self, percent: u8, policy: &ReportPolicy) -> Decision {
        self.cycles_since_report = self.cycles_since_report.saturating_add(1);

        let drift = percent.abs_diff(self.last_reported_percent);
        let drifted = drift > policy.max_drift_points;
        let overdue = self.cycles_since_report >= policy.max_cycles_without_report;

        self.last_reported_percent = percent;

        if drifted || overdue {
            debug!(
                "cycle: report (drift={}, drifted={}, overdue={})",
                drift, drifted, overdue
            );
            self.cycles_since_report = 0;
            Decision::Report
        } else {
            Decision::Skip
        }
    }

    fn payload(&self) -> [u8; RECORD_LEN - PAYLOAD_OFFSET] {
        let last = (self.last_reported_percent as u16).to_le_bytes();
        let cycles = self.cycles_since_report.to_le_bytes();
        [last[0], last[1], cycles[0], cycles[1]]
    }

    pub fn checksum(&self) -> u32 {
        RECORD_CRC.checksum(&self.payload())
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..PAYLOAD_OFFSET].copy_from_slice(&self.checksum().to_le_bytes());
        record[PAYLOAD_OFFSET..].copy_from_slice(&self.payload());
        record
    }

    /// `None` when the stored checksum does not match the payload, or the
    /// payload holds a percentage no valid writer could have produced.
    pub fn decode(record: &[u8; RECORD_LEN]) -> Option<Self> {
        let stored = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let payload = &record[PAYLOAD_OFFSET..];
        if RECORD_CRC.checksum(payload) != stored {
            return None;
        }

        let last = u16::from_le_bytes([payload[0], payload[1]]);
        let cycles = u16::from_le_bytes([payload[2], payload[3]]);
        if last > 100 {
            return None;
        }

        Some(Self {
            last_reported_percent: last as u8,
            cycles_since_report: cycles,
        })
    }
}

/// Storage that keeps its contents across deep sleep.
pub trait ScratchMemory {
    fn read(&self, record: &mut [u8; RECORD_LEN]);
    /// Must write the whole record in one operation.
    fn write(&mut self, record: &[u8; RECORD_LEN]);
}

impl ScratchMemory for [u8; RECORD_LEN] {
    fn read(&self, record: &mut [u8; RECORD_LEN]) {
        record.copy_from_slice(self);
    }

    fn write(&mut self, record: &[u8; RECORD_LEN]) {
        self.copy_from_slice(record);
    }
}

impl<T: ScratchMemory + ?Sized> ScratchMemory for &mut T {
    fn read(&self, record: &mut [u8; RECORD_LEN]) {
        (**self).read(record)
    }

    fn write(&mut self, record: &[u8; RECORD_LEN]) {
        (**self).write(record)
    }
}

/// Owner of the persisted record.
pub struct CycleStore<S> {
    scratch: S,
}

impl<S: ScratchMemory> CycleStore<S> {
    pub fn new(scratch: S) -> Self {
        Self { scratch }
    }

    /// Read and validate the record. Corruption and "never written" look the
    /// same and both return `None`.
    pub fn load(&self) -> Option<PersistentCycleState> {
        let mut record = [0u8; RECORD_LEN];
        self.scratch.read(&mut record);
        let state = PersistentCycleState::decode(&record);
        if state.is_none() {
            debug!("cycle: no valid record in scratch memory");
        }
        state
    }

    pub fn save(&mut self, state: &PersistentCycleState) {
        self.scratch.write(&state.encode());
    }
}
