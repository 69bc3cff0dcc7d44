use std::fmt;

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Conversions between full 128-bit UUIDs and the 16/32-bit aliases assigned
/// by the Bluetooth SIG
pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;

    /// A `Display`able wrapper that prints SIG assigned UUIDs in their short
    /// `0x180D` form, which keeps log lines readable
    fn short(&self) -> ShortUuid;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn short(&self) -> ShortUuid {
        ShortUuid(*self)
    }
}

pub struct ShortUuid(Uuid);
impl fmt::Display for ShortUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.0.as_u16(), self.0.as_u32()) {
            (Some(v), _) => write!(f, "0x{:04X}", v),
            (None, Some(v)) => write!(f, "0x{:08X}", v),
            (None, None) => write!(f, "{}", self.0),
        }
    }
}

// Const functions so apps can declare const Uuids (trait functions can't be
// const)

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_aliases() {
        let heart_rate = uuid_from_u16(0x180D);
        assert_eq!(heart_rate.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(heart_rate.as_u16(), Some(0x180D));
        assert_eq!(heart_rate.as_u32(), Some(0x180D));
        assert_eq!(heart_rate.short().to_string(), "0x180D");

        let wide = uuid_from_u32(0x1234_5678);
        assert_eq!(wide.as_u16(), None);
        assert_eq!(wide.short().to_string(), "0x12345678");

        let custom = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
        assert_eq!(custom.as_u32(), None);
        assert_eq!(custom.short().to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
    }
}
