//! In-memory metadata rebuilt on every mount.

use num_integer::Integer;

use crate::config::*;
use crate::geometry::bit_len;

/// Fixed-length array of `bits`-wide unsigned entries packed back to back,
/// least significant bit first.
#[derive(Clone, Debug)]
pub struct PackedArray {
    bits: u8,
    len: usize,
    data: Vec<u8>,
}

impl PackedArray {
    /// All entries start as zero.
    pub fn new(len: usize, bits: u8) -> Self {
        debug_assert!(bits > 0 && bits <= 32, "entry width {} out of range", bits);
        let bytes = Integer::div_ceil(&(len * bits as usize), &8);
        PackedArray {
            bits,
            len,
            data: vec![0; bytes],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Largest value an entry can hold.
    pub fn max_value(&self) -> u32 {
        u32::MAX >> (32 - self.bits as u32)
    }

    pub fn get(&self, ix: usize) -> u32 {
        debug_assert!(ix < self.len, "index {} out of {}", ix, self.len);
        let (mut byte, mut bit_off) = (ix * self.bits as usize).div_rem(&8);
        let mut bits_rem = self.bits as u32;
        let mut val = 0u32;

        while bits_rem > 0 {
            let bits_rd = (8 - bit_off as u32).min(bits_rem);
            let chunk = (self.data[byte] >> bit_off) as u32 & ((1u32 << bits_rd) - 1);
            val |= chunk << (self.bits as u32 - bits_rem);

            bits_rem -= bits_rd;
            byte += 1;
            bit_off = 0;
        }

        val
    }

    pub fn set(&mut self, ix: usize, val: u32) {
        debug_assert!(ix < self.len, "index {} out of {}", ix, self.len);
        debug_assert!(val <= self.max_value(), "{} wider than {} bits", val, self.bits);
        let (mut byte, mut bit_off) = (ix * self.bits as usize).div_rem(&8);
        let mut bits_rem = self.bits as u32;
        let mut val = val;

        while bits_rem > 0 {
            let bits_wr = (8 - bit_off as u32).min(bits_rem);
            let mask = (((1u32 << bits_wr) - 1) << bit_off) as u8;
            let wr = ((val << bit_off) as u8) & mask;
            self.data[byte] = (self.data[byte] & !mask) | wr;

            bits_rem -= bits_wr;
            val >>= bits_wr;
            byte += 1;
            bit_off = 0;
        }
    }

    pub fn fill(&mut self, val: u32) {
        for ix in 0..self.len {
            self.set(ix, val);
        }
    }
}

/// Logical-to-physical sector map.
///
/// The all-ones entry of the packed width stands for "never written"; the
/// width is chosen so that no physical sector number reaches it.
#[derive(Clone, Debug)]
pub struct L2pMap {
    tbl: PackedArray,
}

impl L2pMap {
    pub fn new(disk_sectors: SectorNbr, entry_bits: u8) -> Self {
        let mut tbl = PackedArray::new(disk_sectors as usize, entry_bits);
        tbl.fill(tbl.max_value());
        L2pMap { tbl }
    }

    /// Physical sector backing `sec_nbr_logical`, or [`INVALID_SEC_NBR`].
    pub fn get(&self, sec_nbr_logical: SectorNbr) -> SectorNbr {
        let phy = self.tbl.get(sec_nbr_logical as usize);
        if phy == self.tbl.max_value() {
            INVALID_SEC_NBR
        } else {
            phy
        }
    }

    pub fn set(&mut self, sec_nbr_logical: SectorNbr, sec_nbr_phy: SectorNbr) {
        let raw = if sec_nbr_phy == INVALID_SEC_NBR {
            self.tbl.max_value()
        } else {
            sec_nbr_phy
        };
        self.tbl.set(sec_nbr_logical as usize, raw);
    }

    pub fn clear(&mut self) {
        let sentinel = self.tbl.max_value();
        self.tbl.fill(sentinel);
    }

    pub fn len(&self) -> SectorNbr {
        self.tbl.len() as SectorNbr
    }

    /// Logical sectors currently backed by a physical sector.
    pub fn mapped(&self) -> impl Iterator<Item = (SectorNbr, SectorNbr)> + '_ {
        (0..self.len()).filter_map(move |lsn| match self.get(lsn) {
            INVALID_SEC_NBR => None,
            phy => Some((lsn, phy)),
        })
    }
}

/// Per-block erase flag and valid sector count.
#[derive(Clone, Debug)]
pub struct BlockTable {
    erased: PackedArray,
    valid: PackedArray,
}

impl BlockTable {
    pub fn new(block_count: BlockIx, sectors_per_block: SectorNbr) -> Self {
        BlockTable {
            erased: PackedArray::new(block_count as usize, 1),
            valid: PackedArray::new(block_count as usize, bit_len(sectors_per_block)),
        }
    }

    pub fn is_erased(&self, blk_ix: BlockIx) -> bool {
        self.erased.get(blk_ix as usize) == 1
    }

    pub fn set_erased(&mut self, blk_ix: BlockIx, erased: bool) {
        self.erased.set(blk_ix as usize, erased as u32);
    }

    /// Valid sectors in `blk_ix`; an erased block has none.
    pub fn valid_count(&self, blk_ix: BlockIx) -> Counter {
        if self.is_erased(blk_ix) {
            0
        } else {
            self.valid.get(blk_ix as usize)
        }
    }

    pub fn set_valid_count(&mut self, blk_ix: BlockIx, cnt: Counter) {
        self.valid.set(blk_ix as usize, cnt);
    }

    pub fn inc_valid(&mut self, blk_ix: BlockIx) {
        let cnt = self.valid.get(blk_ix as usize);
        self.valid.set(blk_ix as usize, cnt + 1);
    }

    pub fn dec_valid(&mut self, blk_ix: BlockIx) {
        let cnt = self.valid.get(blk_ix as usize);
        if cnt == 0 {
            error!("Sec cnt for blk {} already 0", blk_ix);
            return;
        }
        self.valid.set(blk_ix as usize, cnt - 1);
    }

    pub fn clear(&mut self) {
        self.erased.fill(0);
        self.valid.fill(0);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveBlock {
    pub blk_ix: BlockIx,
    /// Next erased sector inside the block.
    pub sec_ix_next: SectorNbr,
}

/// Blocks currently receiving sector writes.
#[derive(Clone, Debug)]
pub struct ActiveBlocks {
    slots: Vec<Option<ActiveBlock>>,
}

impl ActiveBlocks {
    pub fn new(cnt: usize) -> Self {
        ActiveBlocks {
            slots: vec![None; cnt],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, ix: usize) -> Option<ActiveBlock> {
        self.slots[ix]
    }

    pub fn slot_mut(&mut self, ix: usize) -> &mut Option<ActiveBlock> {
        &mut self.slots[ix]
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_active(&self, blk_ix: BlockIx) -> bool {
        self.position(blk_ix).is_some()
    }

    pub fn position(&self, blk_ix: BlockIx) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(ab) if ab.blk_ix == blk_ix))
    }

    /// Puts `blk_ix` in the first free slot. Returns false when all are taken.
    pub fn add(&mut self, blk_ix: BlockIx, sec_ix_next: SectorNbr) -> bool {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(ActiveBlock { blk_ix, sec_ix_next });
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, blk_ix: BlockIx) -> Option<ActiveBlock> {
        self.position(blk_ix).and_then(|ix| self.slots[ix].take())
    }

    pub fn iter(&self) -> impl Iterator<Item = ActiveBlock> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Erased sectors left in `blk_ix`, zero if it is not active.
    pub fn erased_in(&self, blk_ix: BlockIx, sectors_per_block: SectorNbr) -> SectorNbr {
        self.iter()
            .find(|ab| ab.blk_ix == blk_ix)
            .map_or(0, |ab| sectors_per_block - ab.sec_ix_next)
    }

    /// Erased sectors left over every active block.
    pub fn erased_total(&self, sectors_per_block: SectorNbr) -> SectorNbr {
        self.iter().map(|ab| sectors_per_block - ab.sec_ix_next).sum()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
