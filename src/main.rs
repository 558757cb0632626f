#[macro_use]
extern crate log;
extern crate simplelog;

use nor_ftl::config::SectorNbr;
use nor_ftl::{Ftl, FtlConfig, NorFlash, RamFlash, Result};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

const BLOCK_COUNT: u32 = 32;
const BLOCK_SIZE: u32 = 64 * 1024;

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    if SimpleLogger::init(LevelFilter::Debug, log_cfg).is_err() {
        eprintln!("logger already installed");
    }

    match run() {
        Ok(0) => info!("All sectors verified"),
        Ok(bad) => {
            error!("{} sectors read back wrong", bad);
            std::process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Returns the number of sectors that did not read back as written.
fn run() -> Result<usize> {
    let cfg = FtlConfig::default().with_pct_reserved(20);
    let mut fw = Ftl::new(RamFlash::new(BLOCK_COUNT, BLOCK_SIZE), cfg.clone())?;
    fw.low_level_format()?;
    fw.mount()?;

    let max_lba = fw.sector_count();
    let sec_size = fw.geometry().sector_size as usize;
    let mut rng: SmallRng = SmallRng::seed_from_u64(7);
    let mut shadow = vec![vec![0u8; sec_size]; max_lba as usize];

    for (lba, data) in shadow.iter_mut().enumerate() {
        rng.fill(&mut data[..]);
        fw.write_sector(lba as SectorNbr, data)?;
    }
    info!("Drive preconditioned");

    for c in 0..4 {
        for _ in 0..max_lba {
            let lba = rng.gen_range(0..max_lba);
            let data = &mut shadow[lba as usize];
            rng.fill(&mut data[..]);
            fw.write_sector(lba, data)?;
        }
        info!("Capacity {} randomly written", c);
    }

    let stats = fw.stats();
    let flash = fw.into_inner();
    let mut fw = Ftl::new(flash, cfg)?;
    fw.mount()?;
    info!("Remounted");

    let mut buf = vec![0u8; sec_size];
    let mut bad = 0;
    for (lba, data) in shadow.iter().enumerate() {
        fw.read_sector(lba as SectorNbr, &mut buf)?;
        if buf != *data {
            warn!("Lba {} differs", lba);
            bad += 1;
        }
    }

    let erase_counts: Vec<u32> = (0..fw.flash().geometry().block_count)
        .map(|blk| fw.flash().erase_count(blk))
        .collect();
    info!("{:?}", stats);
    info!("{:?}", fw.usage());
    info!(
        "Erase counts: min {}, max {}",
        erase_counts.iter().min().copied().unwrap_or(0),
        erase_counts.iter().max().copied().unwrap_or(0)
    );

    Ok(bad)
}
