use crate::Error;
use serde::Serialize;
use std::fmt;

/// Each module owns a block of 0x1000 identifiers: `identifier = module_id * 0x1000 + offset`.
pub const MODULE_ID_STRIDE: u32 = 0x1000;
/// Offsets `[0, 0x100)` carry one cell each.
pub const CELL_OFFSET_END: u16 = 0x100;
pub const ADC_OFFSET: u16 = 0x100;
pub const ADC_CHANNELS: u16 = 16;
pub const MODULE_STATE_OFFSET: u16 = 0x200;

/// Classic CAN carries at most 8 data bytes.
pub const MAX_PAYLOAD_LENGTH: usize = 8;

/// A received CAN data frame.
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    len: u8,
    data: [u8; MAX_PAYLOAD_LENGTH],
}

impl CanFrame {
    /// Returns `None` when `data` is longer than [`MAX_PAYLOAD_LENGTH`].
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_PAYLOAD_LENGTH {
            return None;
        }
        let mut buf = [0u8; MAX_PAYLOAD_LENGTH];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn decode(&self) -> std::result::Result<DecodedUpdate, Error> {
        decode(self.id, self.payload())
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} {:02X?}", self.id, self.payload())
    }
}

/// Splits an arbitration identifier into `(module_id, offset)`.
pub fn split_identifier(identifier: u32) -> (u32, u16) {
    (
        identifier / MODULE_ID_STRIDE,
        (identifier % MODULE_ID_STRIDE) as u16,
    )
}

fn validate_len(
    payload: &[u8],
    required: usize,
    module_id: u32,
    offset: u16,
) -> std::result::Result<(), Error> {
    if payload.len() < required {
        log::debug!(
            "Invalid payload size - module={} offset=0x{:03X} required={} received={}",
            module_id,
            offset,
            required,
            payload.len()
        );
        return Err(Error::ShortFrame {
            module_id,
            offset,
            expected: required,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Voltage and balancing flag of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellUpdate {
    pub module_id: u32,
    pub cell_index: u8,
    /// Tenths of a millivolt.
    pub voltage: u16,
    /// Non-zero while the cell is being balanced.
    pub balancing: u8,
}

impl CellUpdate {
    pub fn payload_size() -> usize {
        3
    }

    pub fn decode(
        module_id: u32,
        cell_index: u8,
        payload: &[u8],
    ) -> std::result::Result<Self, Error> {
        validate_len(
            payload,
            Self::payload_size(),
            module_id,
            u16::from(cell_index),
        )?;
        Ok(Self {
            module_id,
            cell_index,
            voltage: u16::from_le_bytes([payload[0], payload[1]]),
            balancing: payload[2],
        })
    }
}

/// Raw reading of one ADC channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdcUpdate {
    pub module_id: u32,
    pub channel_index: u8,
    pub raw_value: u16,
}

impl AdcUpdate {
    pub fn payload_size() -> usize {
        2
    }

    pub fn decode(
        module_id: u32,
        channel_index: u8,
        payload: &[u8],
    ) -> std::result::Result<Self, Error> {
        validate_len(
            payload,
            Self::payload_size(),
            module_id,
            ADC_OFFSET + u16::from(channel_index),
        )?;
        Ok(Self {
            module_id,
            channel_index,
            raw_value: u16::from_le_bytes([payload[0], payload[1]]),
        })
    }
}

/// Module level summary, all values unscaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleUpdate {
    pub module_id: u32,
    /// Hundredths of a volt, first half of the cells.
    pub m1_voltage: u16,
    /// Hundredths of a volt, second half of the cells.
    pub m2_voltage: u16,
    /// Tenths of a millivolt between the highest and lowest cell.
    pub cell_diff: u16,
    pub reserved: u16,
}

impl ModuleUpdate {
    pub fn payload_size() -> usize {
        8
    }

    pub fn decode(module_id: u32, payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(
            payload,
            Self::payload_size(),
            module_id,
            MODULE_STATE_OFFSET,
        )?;
        Ok(Self {
            module_id,
            m1_voltage: u16::from_le_bytes([payload[0], payload[1]]),
            m2_voltage: u16::from_le_bytes([payload[2], payload[3]]),
            cell_diff: u16::from_le_bytes([payload[4], payload[5]]),
            reserved: u16::from_le_bytes([payload[6], payload[7]]),
        })
    }
}

/// A single field update carried by one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedUpdate {
    Cell(CellUpdate),
    Adc(AdcUpdate),
    Module(ModuleUpdate),
}

impl DecodedUpdate {
    pub fn module_id(&self) -> u32 {
        match self {
            DecodedUpdate::Cell(u) => u.module_id,
            DecodedUpdate::Adc(u) => u.module_id,
            DecodedUpdate::Module(u) => u.module_id,
        }
    }
}

/// Decodes one frame. Every frame is a complete update on its own.
pub fn decode(identifier: u32, payload: &[u8]) -> std::result::Result<DecodedUpdate, Error> {
    let (module_id, offset) = split_identifier(identifier);
    if offset < CELL_OFFSET_END {
        CellUpdate::decode(module_id, offset as u8, payload).map(DecodedUpdate::Cell)
    } else if (ADC_OFFSET..ADC_OFFSET + ADC_CHANNELS).contains(&offset) {
        AdcUpdate::decode(module_id, (offset - ADC_OFFSET) as u8, payload).map(DecodedUpdate::Adc)
    } else if offset == MODULE_STATE_OFFSET {
        ModuleUpdate::decode(module_id, payload).map(DecodedUpdate::Module)
    } else {
        Err(Error::UnknownOffset { module_id, offset })
    }
}
