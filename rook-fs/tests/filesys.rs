//! Storage-stack scenarios spanning the cache, the free map, and the
//! inode layer together.

use rook::dev::{BlockDevice, MemDisk, SECTOR_SIZE, Sector};
use rook_fs::cache::BufferCache;
use rook_fs::disk_layout::{DIRECT_SLOTS, DOUBLY_BASE};
use rook_fs::file::File;
use rook_fs::free_map::FreeMap;
use rook_fs::inode::InodeTable;
use std::sync::Arc;
use std::time::Duration;

fn stack_over(disk: Arc<MemDisk>, reserved: usize) -> Arc<InodeTable> {
    let _ = env_logger::builder().is_test(true).try_init();
    let sectors = disk.sector_count();
    let cache = Arc::new(BufferCache::with_flush_interval(
        disk,
        Duration::from_secs(3600),
    ));
    let free_map = Arc::new(FreeMap::new(sectors, reserved));
    Arc::new(InodeTable::new(cache, free_map))
}

#[test]
fn file_contents_survive_cache_close() {
    let disk = Arc::new(MemDisk::new(4096));
    let payload: Vec<u8> = (0..SECTOR_SIZE * 3).map(|i| (i % 239) as u8).collect();

    let sector = {
        let table = stack_over(disk.clone(), 1);
        let sector = table.create(0).unwrap();
        let file = File::open(&table, sector).unwrap();
        file.write_at(&payload, 100).unwrap();
        drop(file);
        table.cache().close().unwrap();
        sector
    };

    // A cold cache over the same device sees everything the first
    // instance wrote, inode metadata included.
    let table = stack_over(disk, 1);
    let file = File::open(&table, sector).unwrap();
    assert_eq!(file.len(), 100 + payload.len());
    let mut out = vec![0u8; payload.len()];
    assert_eq!(file.read_at(&mut out, 100).unwrap(), payload.len());
    assert_eq!(out, payload);
}

#[test]
fn spanning_write_crosses_all_three_tiers() {
    let disk = Arc::new(MemDisk::new(1 << 15));
    let table = stack_over(disk, 1);
    let sector = table.create(0).unwrap();
    let file = File::open(&table, sector).unwrap();

    // One write running from inside the direct region, across the whole
    // indirect region, into the doubly-indirect region.
    let start = (DIRECT_SLOTS - 2) * SECTOR_SIZE + 31;
    let end = (DOUBLY_BASE + 5) * SECTOR_SIZE + 77;
    let payload: Vec<u8> = (0..end - start).map(|i| (i % 253) as u8).collect();
    assert_eq!(file.write_at(&payload, start).unwrap(), payload.len());
    assert_eq!(file.len(), end);

    let mut out = vec![0u8; payload.len()];
    assert_eq!(file.read_at(&mut out, start).unwrap(), payload.len());
    assert_eq!(out, payload);

    // The hole before the write reads as zeroes.
    let mut hole = [0xA5u8; 64];
    assert_eq!(file.read_at(&mut hole, 0).unwrap(), 64);
    assert!(hole.iter().all(|&b| b == 0));
}

#[test]
fn concurrent_writers_to_disjoint_ranges() {
    let disk = Arc::new(MemDisk::new(1 << 14));
    let table = stack_over(disk, 1);
    let sector = table.create(16 * SECTOR_SIZE).unwrap();

    let mut threads = Vec::new();
    for t in 0..8usize {
        let table = table.clone();
        threads.push(std::thread::spawn(move || {
            let file = File::open(&table, sector).unwrap();
            let pattern = vec![0x40 | t as u8; 2 * SECTOR_SIZE];
            file.write_at(&pattern, t * 2 * SECTOR_SIZE).unwrap();
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    let file = File::open(&table, sector).unwrap();
    for t in 0..8usize {
        let mut out = vec![0u8; 2 * SECTOR_SIZE];
        file.read_at(&mut out, t * 2 * SECTOR_SIZE).unwrap();
        assert!(
            out.iter().all(|&b| b == 0x40 | t as u8),
            "writer {} lost its range",
            t
        );
    }
}

#[test]
fn many_small_files_share_the_device() {
    let disk = Arc::new(MemDisk::new(1 << 14));
    let table = stack_over(disk, 1);

    let sectors: Vec<Sector> = (0..32)
        .map(|i| {
            let sector = table.create(0).unwrap();
            let file = File::open(&table, sector).unwrap();
            file.write_at(format!("file number {}", i).as_bytes(), 0)
                .unwrap();
            sector
        })
        .collect();

    for (i, sector) in sectors.iter().enumerate() {
        let file = File::open(&table, *sector).unwrap();
        let mut out = vec![0u8; file.len()];
        file.read_at(&mut out, 0).unwrap();
        assert_eq!(out, format!("file number {}", i).as_bytes());
    }

    // Deleting every file returns the device to its starting state.
    let free_before_delete = table.free_map().free_sectors();
    for sector in &sectors {
        let file = File::open(&table, *sector).unwrap();
        file.remove();
    }
    assert!(table.free_map().free_sectors() > free_before_delete);
    assert_eq!(table.open_count(), 0);
}
