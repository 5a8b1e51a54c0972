//! Changed-field flags of an update

use serde::{Deserialize, Serialize};

/// Updated field groups (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdatedFields(pub u8);

impl UpdatedFields {
    pub const NONE: UpdatedFields = UpdatedFields(0);

    // Flag bits
    pub const METADATA: u8 = 0b0000_0001;
    pub const STATE: u8 = 0b0000_0010;
    pub const MOVEMENT: u8 = 0b0000_0100;
    pub const DELETE: u8 = 0b0000_1000;

    /// Bits that carry data
    pub const DATA: u8 = Self::METADATA | Self::STATE | Self::MOVEMENT;

    #[inline]
    pub fn new(bits: u8) -> Self {
        UpdatedFields(bits)
    }

    #[inline]
    pub fn delete() -> Self {
        UpdatedFields(Self::DELETE)
    }

    #[inline]
    pub fn has_metadata(self) -> bool {
        self.0 & Self::METADATA != 0
    }

    #[inline]
    pub fn has_state(self) -> bool {
        self.0 & Self::STATE != 0
    }

    #[inline]
    pub fn has_movement(self) -> bool {
        self.0 & Self::MOVEMENT != 0
    }

    #[inline]
    pub fn is_delete(self) -> bool {
        self.0 & Self::DELETE != 0
    }

    #[inline]
    pub fn has_data(self) -> bool {
        self.0 & Self::DATA != 0
    }

    /// Bits outside the known groups
    #[inline]
    pub fn unknown_bits(self) -> u8 {
        self.0 & !(Self::DATA | Self::DELETE)
    }

    #[inline]
    pub fn set_metadata(&mut self, value: bool) {
        self.set(Self::METADATA, value);
    }

    #[inline]
    pub fn set_state(&mut self, value: bool) {
        self.set(Self::STATE, value);
    }

    #[inline]
    pub fn set_movement(&mut self, value: bool) {
        self.set(Self::MOVEMENT, value);
    }

    #[inline]
    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl From<u8> for UpdatedFields {
    fn from(bits: u8) -> Self {
        UpdatedFields(bits)
    }
}

impl From<UpdatedFields> for u8 {
    fn from(fields: UpdatedFields) -> Self {
        fields.0
    }
}
