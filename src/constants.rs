/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 250;
/// Delimiter, message id, COBS overhead, length and checksum bytes.
pub const FRAME_OVERHEAD: usize = 5;
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + FRAME_OVERHEAD;
pub const FRAME_DELIMITER: u8 = 0x00;

/// Receive buffer size of the ground uplink.
pub const MAX_PACKET_SIZE_TELEMETRY: usize = 64;
pub const MAX_MESSAGES_QUEUED: usize = 4;

pub const MAX_IO_OPERATIONS_QUEUED: usize = 4;
pub const SD_MAX_READ_WRITE_SIZE: usize = 512;
pub const FLASH_MAX_READ_WRITE_SIZE: usize = 256;

/// Bytes reserved for one serialized `RocketState` on flash.
pub const STATE_RECORD_LEN: usize = 256;

pub mod message_ids {
    pub const STATE_VECTOR: u8 = 0x01;
    pub const SERVO_DEFLECTION: u8 = 0x02;
    pub const FLIGHT_STATE: u8 = 0x03;
    pub const GROUND_EKF: u8 = 0x04;
    pub const SENSOR_DATA: u8 = 0x05;
    pub const ANALOG_FEEDBACK: u8 = 0x06;
    pub const COMMAND: u8 = 0x10;
    pub const COMMAND_ACK: u8 = 0x11;
}

pub mod channel_ids {
    pub const FLASH_WRITE: u8 = 0;
    pub const FLASH_READ: u8 = 1;
    pub const SD_WRITE: u8 = 2;
    pub const SD_READ: u8 = 3;
}

pub mod notification_bits {
    pub const BEGIN_STATE_FLASH: u32 = 0x01;
    pub const FLASH_SD_CARD: u32 = 0x02;
    pub const SD_WRITE_COMPLETE: u32 = 0x04;
    pub const FLASH_WRITE_COMPLETE: u32 = 0x08;
    pub const FLASH_READ_COMPLETE: u32 = 0x10;
    pub const SD_READ_COMPLETE: u32 = 0x20;
    pub const FLASH_RESET_COMPLETE: u32 = 0x40;
    pub const SD_RESET_COMPLETE: u32 = 0x80;
}

pub mod flash {
    pub const SECTOR_SIZE: usize = 4096;
    pub const PAGE_SIZE: usize = 256;
    /// Sectors erased on bring-up and on a flash reset.
    pub const N_SECTORS: usize = 256;
    pub const ERASED_BYTE: u8 = 0xff;
}
