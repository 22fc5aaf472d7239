//! 32 bit user and group ID table

use std::io::{Seek, Write};

use deku::prelude::*;
use rustc_hash::FxHashMap;

use crate::compressor::ImageCompressor;
use crate::error::SqfsError;
use crate::superblock::SuperBlock;
use crate::table::write_table;

/// 32 bit user and group IDs
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl Id {
    pub const SIZE: usize = (u32::BITS / 8) as usize;

    pub fn new(num: u32) -> Id {
        Id { num }
    }
}

/// Deduplicating uid/gid table. Inodes store 16-bit indices into this table
/// instead of the ids themselves.
pub(crate) struct IdTable {
    ids: Vec<Id>,
    lookup: FxHashMap<u32, u16>,
}

impl IdTable {
    pub fn new() -> Self {
        Self {
            ids: vec![],
            lookup: FxHashMap::default(),
        }
    }

    /// Return index of id, adding if required
    pub fn index_of(&mut self, id: u32) -> Result<u16, SqfsError> {
        if let Some(index) = self.lookup.get(&id) {
            return Ok(*index);
        }

        let index = u16::try_from(self.ids.len()).map_err(|_| SqfsError::IdTableFull)?;
        self.ids.push(Id::new(id));
        self.lookup.insert(id, index);
        Ok(index)
    }

    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// Persist through the table helper and record location and count in the
    /// superblock
    pub fn write<W: Write + Seek>(
        &self,
        w: &mut W,
        compressor: ImageCompressor,
        block_size: u32,
        superblock: &mut SuperBlock,
    ) -> Result<(), SqfsError> {
        let mut bytes = Vec::with_capacity(self.ids.len() * Id::SIZE);
        for id in &self.ids {
            bytes.extend_from_slice(&id.to_bytes()?);
        }

        superblock.id_table = write_table(w, &bytes, compressor, block_size)?;
        superblock.id_count = self.ids.len() as u16;
        Ok(())
    }
}
