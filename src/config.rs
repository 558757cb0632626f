pub type BaseType = u32;

pub type Addr = u64;
pub type BlockIx = BaseType;
pub type SectorNbr = BaseType;
pub type EraseCount = BaseType;
pub type Counter = BaseType;

pub const BLK_HDR_LEN: BaseType = 32;
pub const SEC_HDR_LEN: BaseType = 8;

/// Used when the sector size is left on auto and the block is large enough.
pub const SEC_SIZE_DFLT: BaseType = 4096;
pub const SEC_SIZES: [BaseType; 4] = [512, 1024, 2048, 4096];

pub const PCT_RSVD_DFLT: u8 = 10;
pub const PCT_RSVD_MIN: u8 = 5;
pub const PCT_RSVD_MAX: u8 = 35;

pub const ERASE_CNT_DIFF_TH_DFLT: u16 = 20;
pub const ERASE_CNT_DIFF_TH_MIN: u16 = 5;
pub const ERASE_CNT_DIFF_TH_MAX: u16 = 100;

pub const ACTIVE_BLK_CNT_DFLT: usize = 1;
pub const ACTIVE_BLK_CNT_MAX: usize = 8;

pub const INVALID_SEC_NBR: SectorNbr = SectorNbr::MAX;

/// User-facing knobs of an FTL instance.
///
/// Values outside their documented range are clamped by [`FtlConfig::clamped`]
/// when the instance is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtlConfig {
    /// Share of the physical sectors kept back as overhead, in percent.
    pub pct_reserved: u8,
    /// Spread between the most and least erased block that triggers active wear leveling.
    pub erase_count_diff_threshold: u16,
    /// Logical sector size in bytes; `None` picks the smaller of 4 KiB and the block size.
    pub sector_size: Option<BaseType>,
    /// Bytes of the medium handed to the FTL; `None` uses everything after `start_offset`.
    pub device_size: Option<Addr>,
    /// Leading bytes of the medium left alone for other uses.
    pub start_offset: Addr,
    /// Number of blocks that may receive writes at the same time.
    pub active_block_count: usize,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig {
            pct_reserved: PCT_RSVD_DFLT,
            erase_count_diff_threshold: ERASE_CNT_DIFF_TH_DFLT,
            sector_size: None,
            device_size: None,
            start_offset: 0,
            active_block_count: ACTIVE_BLK_CNT_DFLT,
        }
    }
}

impl FtlConfig {
    pub fn with_pct_reserved(mut self, pct: u8) -> Self {
        self.pct_reserved = pct;
        self
    }

    pub fn with_erase_count_diff_threshold(mut self, th: u16) -> Self {
        self.erase_count_diff_threshold = th;
        self
    }

    pub fn with_sector_size(mut self, size: BaseType) -> Self {
        self.sector_size = Some(size);
        self
    }

    pub fn with_device_size(mut self, size: Addr) -> Self {
        self.device_size = Some(size);
        self
    }

    pub fn with_start_offset(mut self, offset: Addr) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_active_block_count(mut self, cnt: usize) -> Self {
        self.active_block_count = cnt;
        self
    }

    /// Copy of `self` with every ranged knob pulled into its allowed range.
    pub fn clamped(&self) -> Self {
        let mut out = self.clone();

        let pct = self.pct_reserved.clamp(PCT_RSVD_MIN, PCT_RSVD_MAX);
        if pct != self.pct_reserved {
            warn!("Reserved pct {} out of range, using {}", self.pct_reserved, pct);
            out.pct_reserved = pct;
        }

        let th = self
            .erase_count_diff_threshold
            .clamp(ERASE_CNT_DIFF_TH_MIN, ERASE_CNT_DIFF_TH_MAX);
        if th != self.erase_count_diff_threshold {
            warn!(
                "Erase count diff threshold {} out of range, using {}",
                self.erase_count_diff_threshold, th
            );
            out.erase_count_diff_threshold = th;
        }

        let ab_cnt = self.active_block_count.clamp(1, ACTIVE_BLK_CNT_MAX);
        if ab_cnt != self.active_block_count {
            warn!("Active block count {} out of range, using {}", self.active_block_count, ab_cnt);
            out.active_block_count = ab_cnt;
        }

        out
    }
}
