//! On-media format.
//!
//! Every block starts with a 32-byte header:
//!
//! ```text
//! 0   u32  marker word 1      0x4E205346 ("FS N")
//! 4   u32  marker word 2      0x2020524F ("OR  ")
//! 8   u32  erase count        0xFFFFFFFF when unknown
//! 12  u16  format version     0x0401
//! 14  u16  sector size
//! 16  u16  block count
//! 18  ..   zero
//! ```
//!
//! followed by `sectors_per_block` slots of an 8-byte sector header and the
//! sector payload:
//!
//! ```text
//! 0   u32  logical sector number
//! 4   u32  status
//! ```
//!
//! Status values only ever lose bits on the way from erased to invalid, so each
//! transition is a plain NOR program. All fields are little-endian.

use crate::config::{EraseCount, SectorNbr, BLK_HDR_LEN, INVALID_SEC_NBR, SEC_HDR_LEN};

pub const BLK_HDR_MARK_WORD_1: u32 = 0x4E20_5346;
pub const BLK_HDR_MARK_WORD_2: u32 = 0x2020_524F;
pub const BLK_HDR_VER: u16 = 0x0401;
pub const ERASE_CNT_INVALID: EraseCount = EraseCount::MAX;

const BLK_HDR_OFFSET_MARK1: usize = 0;
const BLK_HDR_OFFSET_MARK2: usize = 4;
pub const BLK_HDR_OFFSET_ERASE_CNT: usize = 8;
const BLK_HDR_OFFSET_VER: usize = 12;
const BLK_HDR_OFFSET_SEC_SIZE: usize = 14;
const BLK_HDR_OFFSET_BLK_CNT: usize = 16;

const SEC_HDR_OFFSET_SEC_NBR: usize = 0;
pub const SEC_HDR_OFFSET_STATUS: usize = 4;

pub const STATUS_ERASED: u32 = 0xFFFF_FFFF;
pub const STATUS_WRITING: u32 = 0xFFFF_FF00;
pub const STATUS_VALID: u32 = 0xFFFF_0000;
pub const STATUS_INVALID: u32 = 0x0000_0000;

pub type BlockHeaderBytes = [u8; BLK_HDR_LEN as usize];
pub type SectorHeaderBytes = [u8; SEC_HDR_LEN as usize];

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub mark1: u32,
    pub mark2: u32,
    pub erase_count: EraseCount,
    pub version: u16,
    pub sector_size: u16,
    pub block_count: u16,
}

impl BlockHeader {
    pub fn new(erase_count: EraseCount, sector_size: u16, block_count: u16) -> Self {
        BlockHeader {
            mark1: BLK_HDR_MARK_WORD_1,
            mark2: BLK_HDR_MARK_WORD_2,
            erase_count,
            version: BLK_HDR_VER,
            sector_size,
            block_count,
        }
    }

    pub fn decode(buf: &BlockHeaderBytes) -> Self {
        BlockHeader {
            mark1: get_u32(buf, BLK_HDR_OFFSET_MARK1),
            mark2: get_u32(buf, BLK_HDR_OFFSET_MARK2),
            erase_count: get_u32(buf, BLK_HDR_OFFSET_ERASE_CNT),
            version: get_u16(buf, BLK_HDR_OFFSET_VER),
            sector_size: get_u16(buf, BLK_HDR_OFFSET_SEC_SIZE),
            block_count: get_u16(buf, BLK_HDR_OFFSET_BLK_CNT),
        }
    }

    pub fn encode(&self) -> BlockHeaderBytes {
        let mut buf = [0u8; BLK_HDR_LEN as usize];
        put_u32(&mut buf, BLK_HDR_OFFSET_MARK1, self.mark1);
        put_u32(&mut buf, BLK_HDR_OFFSET_MARK2, self.mark2);
        put_u32(&mut buf, BLK_HDR_OFFSET_ERASE_CNT, self.erase_count);
        put_u16(&mut buf, BLK_HDR_OFFSET_VER, self.version);
        put_u16(&mut buf, BLK_HDR_OFFSET_SEC_SIZE, self.sector_size);
        put_u16(&mut buf, BLK_HDR_OFFSET_BLK_CNT, self.block_count);
        buf
    }

    /// Marker words and version match, whatever geometry the header records.
    pub fn is_formatted(&self) -> bool {
        self.mark1 == BLK_HDR_MARK_WORD_1
            && self.mark2 == BLK_HDR_MARK_WORD_2
            && self.version == BLK_HDR_VER
    }

    /// Whether this header was written by a format with the given geometry.
    /// The erase count is not part of the check.
    pub fn is_valid_for(&self, sector_size: u16, block_count: u16) -> bool {
        self.is_formatted() && self.sector_size == sector_size && self.block_count == block_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectorStatus {
    Erased,
    Writing,
    Valid,
    Invalid,
    /// Anything else: a torn status program. Treated like invalid.
    Unknown(u32),
}

impl SectorStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            STATUS_ERASED => SectorStatus::Erased,
            STATUS_WRITING => SectorStatus::Writing,
            STATUS_VALID => SectorStatus::Valid,
            STATUS_INVALID => SectorStatus::Invalid,
            other => SectorStatus::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            SectorStatus::Erased => STATUS_ERASED,
            SectorStatus::Writing => STATUS_WRITING,
            SectorStatus::Valid => STATUS_VALID,
            SectorStatus::Invalid => STATUS_INVALID,
            SectorStatus::Unknown(raw) => raw,
        }
    }

    /// Status bytes as programmed at [`SEC_HDR_OFFSET_STATUS`].
    pub fn encode(self) -> [u8; 4] {
        self.raw().to_le_bytes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorHeader {
    pub sector_nbr: SectorNbr,
    pub status: SectorStatus,
}

impl SectorHeader {
    pub fn valid(sector_nbr: SectorNbr) -> Self {
        SectorHeader {
            sector_nbr,
            status: SectorStatus::Valid,
        }
    }

    pub fn erased() -> Self {
        SectorHeader {
            sector_nbr: INVALID_SEC_NBR,
            status: SectorStatus::Erased,
        }
    }

    pub fn decode(buf: &SectorHeaderBytes) -> Self {
        SectorHeader {
            sector_nbr: get_u32(buf, SEC_HDR_OFFSET_SEC_NBR),
            status: SectorStatus::from_raw(get_u32(buf, SEC_HDR_OFFSET_STATUS)),
        }
    }

    pub fn encode(&self) -> SectorHeaderBytes {
        let mut buf = [0u8; SEC_HDR_LEN as usize];
        put_u32(&mut buf, SEC_HDR_OFFSET_SEC_NBR, self.sector_nbr);
        put_u32(&mut buf, SEC_HDR_OFFSET_STATUS, self.status.raw());
        buf
    }
}
