use std::collections::HashMap;

use simplelog::{Config, LevelFilter, TestLogger};

use crate::config::*;
use crate::flash::RamFlash;
use crate::ftl::Ftl;
use crate::geometry::Geometry;
use crate::layout::{BlockHeader, BlockHeaderBytes, SectorHeader, SectorHeaderBytes, SectorStatus};

/// Block of 16 sectors of 512 bytes: 32 + 16 * (8 + 512).
pub const SMALL_BLK_SIZE: u32 = 8352;

pub fn init_logger() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

pub fn small_cfg() -> FtlConfig {
    FtlConfig::default().with_sector_size(512)
}

/// Formatted and mounted: 8 blocks, 96 logical sectors.
pub fn small_ftl() -> Ftl<RamFlash> {
    init_logger();
    let mut ftl = Ftl::new(RamFlash::new(8, SMALL_BLK_SIZE), small_cfg()).unwrap();
    ftl.low_level_format().unwrap();
    ftl.mount().unwrap();
    ftl
}

/// Payload unique to one logical sector and generation.
pub fn pattern(lsn: SectorNbr, gen: u32, len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = (0..len)
        .map(|i| (i + lsn as usize * 31 + gen as usize * 7) as u8)
        .collect();
    out[..4].copy_from_slice(&lsn.to_le_bytes());
    out[4..8].copy_from_slice(&gen.to_le_bytes());
    out
}

/// Valid physical copies per logical sector, read straight off the image.
pub fn valid_copies(flash: &RamFlash, geo: &Geometry) -> HashMap<SectorNbr, usize> {
    let img = flash.as_bytes();
    let mut out = HashMap::new();

    for blk_ix in 0..geo.block_count {
        let at = geo.block_addr(blk_ix) as usize;
        let mut hdr: BlockHeaderBytes = [0; BLK_HDR_LEN as usize];
        hdr.copy_from_slice(&img[at..at + BLK_HDR_LEN as usize]);
        if !BlockHeader::decode(&hdr).is_valid_for(geo.sector_size as u16, geo.block_count as u16) {
            continue;
        }

        for sec_ix in 0..geo.sectors_per_block {
            let at = geo.sector_addr(geo.block_first_sector(blk_ix) + sec_ix) as usize;
            let mut buf: SectorHeaderBytes = [0; SEC_HDR_LEN as usize];
            buf.copy_from_slice(&img[at..at + SEC_HDR_LEN as usize]);
            let sec = SectorHeader::decode(&buf);
            if sec.status == SectorStatus::Valid && sec.sector_nbr < geo.disk_sectors {
                *out.entry(sec.sector_nbr).or_insert(0) += 1;
            }
        }
    }
    out
}
