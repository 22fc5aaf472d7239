//! Data Fragment support

use deku::prelude::*;

use crate::data::DataSize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fragment {
    pub start: u64,
    pub size: DataSize,
    pub unused: u32,
}

impl Fragment {
    pub const SIZE: usize =
        std::mem::size_of::<u64>() + std::mem::size_of::<u32>() + std::mem::size_of::<u32>();

    pub fn new(start: u64, size: DataSize) -> Self {
        Self { start, size, unused: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let fragment = Fragment::new(0x1122_3344, DataSize::new_uncompressed(100));
        let bytes = fragment.to_bytes().unwrap();
        assert_eq!(bytes.len(), Fragment::SIZE);
        let (_, parsed) = Fragment::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, fragment);
    }
}
