use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use flatfs::layout::Liveness;
use flatfs::{
    check, format_device, FlatFs, FormatOptions, FsConfig, FsError, MemBlockDevice, MAX_OBJECTS,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

async fn fresh_volume() -> (Arc<MemBlockDevice>, FlatFs) {
    env_logger::builder().is_test(true).try_init().ok();
    let device = Arc::new(MemBlockDevice::new(MAX_OBJECTS));
    format_device(device.as_ref(), &FormatOptions::default())
        .await
        .expect("Failed to format device");
    let fs = FlatFs::mount(device.clone(), FsConfig::default())
        .await
        .expect("Failed to mount");
    (device, fs)
}

async fn assert_clean(fs: &FlatFs) {
    let report = check(fs).await.expect("check failed");
    assert!(report.is_clean(), "check found errors: {:?}", report.errors);
}

#[tokio::test]
async fn test_fresh_root_lists_welcome_file() {
    let (_device, fs) = fresh_volume().await;

    let entries = fs.read_dir(fs.root()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "README.txt");

    let welcome = fs.getattr(entries[0].inode_no).await.unwrap();
    assert!(welcome.is_alive());
    assert!(welcome.is_file());
    assert_eq!(
        welcome.file_size(),
        FormatOptions::default().welcome_body.len() as u64
    );
}

#[tokio::test]
async fn test_create_consumes_a_block() {
    let (_device, fs) = fresh_volume().await;
    let before = fs.superblock().await.unwrap();
    let root_before = fs.getattr(fs.root()).await.unwrap();
    let expected_block = before.free_blocks.first_free().unwrap();

    let file = fs.create(fs.root(), "a.txt").await.unwrap();
    assert!(file.is_alive());
    assert_eq!(file.file_size(), 0);
    assert_eq!(file.data_block_number, expected_block);

    let after = fs.superblock().await.unwrap();
    assert!(before.free_blocks.is_free(expected_block));
    assert!(!after.free_blocks.is_free(expected_block));
    assert_eq!(after.free_blocks.free_count(), before.free_blocks.free_count() - 1);

    let root_after = fs.getattr(fs.root()).await.unwrap();
    assert_eq!(root_after.children_count(), root_before.children_count() + 1);
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_unlink_leaves_tombstone_and_frees_block() {
    let (_device, fs) = fresh_volume().await;
    let file = fs.create(fs.root(), "a.txt").await.unwrap();
    let root_before = fs.getattr(fs.root()).await.unwrap();

    fs.unlink(fs.root(), "a.txt").await.unwrap();

    let records = fs.inode_records().await.unwrap();
    let (_, slot) = records
        .iter()
        .find(|(_, r)| r.inode_no == file.inode_no)
        .expect("inode slot should remain as a tombstone");
    assert_eq!(slot.state, Liveness::Removed);

    let sb = fs.superblock().await.unwrap();
    assert!(sb.free_blocks.is_free(file.data_block_number));

    let root_after = fs.getattr(fs.root()).await.unwrap();
    assert_eq!(root_after.children_count(), root_before.children_count() - 1);
    assert!(fs.lookup(fs.root(), "a.txt").await.unwrap().is_none());
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_unlink_twice_changes_nothing() {
    let (device, fs) = fresh_volume().await;
    fs.create(fs.root(), "a.txt").await.unwrap();
    fs.unlink(fs.root(), "a.txt").await.unwrap();

    let image = device.snapshot();
    let sb = fs.superblock().await.unwrap();
    let root = fs.getattr(fs.root()).await.unwrap();

    assert!(matches!(
        fs.unlink(fs.root(), "a.txt").await,
        Err(FsError::NotFound)
    ));

    assert_eq!(device.snapshot(), image);
    assert_eq!(fs.superblock().await.unwrap(), sb);
    assert_eq!(fs.getattr(fs.root()).await.unwrap(), root);
}

#[tokio::test]
async fn test_full_volume_rejects_next_object() {
    let (device, fs) = fresh_volume().await;

    // Root takes 14 more records, each subdirectory 15
    let mut dirs = Vec::new();
    for d in 0..4 {
        dirs.push(fs.mkdir(fs.root(), &format!("dir{}", d)).await.unwrap());
    }
    for dir in &dirs {
        for f in 0..14 {
            fs.create(dir.inode_no, &format!("file{}", f)).await.unwrap();
        }
    }

    let stats = fs.stats().await.unwrap();
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(stats.live_inodes, MAX_OBJECTS - 2);

    let image = device.snapshot();
    let writes = device.write_count();
    let sb = fs.superblock().await.unwrap();

    let err = fs.create(fs.root(), "one-too-many").await.unwrap_err();
    assert!(err.is_capacity(), "unexpected error {:?}", err);
    assert!(matches!(err, FsError::OutOfSpace));
    let err = fs.mkdir(dirs[0].inode_no, "nested").await.unwrap_err();
    assert!(err.is_capacity(), "unexpected error {:?}", err);

    assert_eq!(device.snapshot(), image);
    assert_eq!(device.write_count(), writes);
    assert_eq!(fs.superblock().await.unwrap(), sb);
    assert!(fs.lookup(fs.root(), "one-too-many").await.unwrap().is_none());
    assert_clean(&fs).await;

    // Freeing one object makes room again
    fs.unlink(dirs[1].inode_no, "file3").await.unwrap();
    fs.create(fs.root(), "one-too-many").await.unwrap();
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_full_directory_rejects_next_entry() {
    let (_device, fs) = fresh_volume().await;
    let dir = fs.mkdir(fs.root(), "crowded").await.unwrap();
    for i in 0..15 {
        fs.create(dir.inode_no, &format!("f{}", i)).await.unwrap();
    }
    let free_before = fs.stats().await.unwrap().free_blocks;

    assert!(matches!(
        fs.create(dir.inode_no, "f15").await,
        Err(FsError::DirectoryFull(ino)) if ino == dir.inode_no
    ));
    assert_eq!(fs.stats().await.unwrap().free_blocks, free_before);

    // A tombstoned record is reused once the directory is full
    fs.unlink(dir.inode_no, "f0").await.unwrap();
    fs.create(dir.inode_no, "f15").await.unwrap();
    let names: BTreeSet<_> = fs
        .read_dir(dir.inode_no)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names.len(), 15);
    assert!(names.contains("f15"));
    assert!(!names.contains("f0"));
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_read_at_or_past_end_returns_nothing() {
    let (_device, fs) = fresh_volume().await;
    let file = fs.create(fs.root(), "short.txt").await.unwrap();
    fs.write_at(file.inode_no, 0, b"abc").await.unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fs.read_at(file.inode_no, 3, &mut buf).await.unwrap(), 0);
    assert_eq!(fs.read_at(file.inode_no, 100, &mut buf).await.unwrap(), 0);
    assert_eq!(fs.read_at(file.inode_no, 1, &mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (_device, fs) = fresh_volume().await;
    let file = fs.create(fs.root(), "data.bin").await.unwrap();
    let payload: Vec<u8> = (0..flatfs::BLOCK_SIZE).map(|i| (i % 251) as u8).collect();

    let mut handle = fs.open(file.inode_no).await.unwrap();
    assert_eq!(fs.write(&mut handle, &payload).await.unwrap(), payload.len());

    let mut handle = fs.open(file.inode_no).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(fs.read(&mut handle, &mut buf).await.unwrap(), payload.len());
    assert_eq!(buf, payload);
    assert_eq!(fs.getattr(file.inode_no).await.unwrap().file_size(), payload.len() as u64);
}

#[tokio::test]
async fn test_random_churn_keeps_invariants() {
    let (_device, fs) = fresh_volume().await;
    let mut rng = StdRng::seed_from_u64(0x2020_0406);
    let mut names: BTreeSet<String> = BTreeSet::new();
    let mut next = 0u32;

    for _ in 0..200 {
        let create = names.is_empty() || (names.len() < 14 && rng.gen_bool(0.6));
        if create {
            let name = format!("n{}", next);
            next += 1;
            let file = fs.create(fs.root(), &name).await.unwrap();
            let len = rng.gen_range(0..64);
            fs.write_at(file.inode_no, 0, &vec![7u8; len]).await.unwrap();
            names.insert(name);
        } else {
            let index = rng.gen_range(0..names.len());
            let name = names.iter().nth(index).cloned().unwrap();
            fs.unlink(fs.root(), &name).await.unwrap();
            names.remove(&name);
        }

        let records = fs.inode_records().await.unwrap();
        let live: Vec<_> = records.iter().filter(|(_, r)| r.is_alive()).collect();
        let numbers: HashSet<_> = live.iter().map(|(_, r)| r.inode_no).collect();
        let blocks: HashSet<_> = live.iter().map(|(_, r)| r.data_block_number).collect();
        assert_eq!(numbers.len(), live.len(), "duplicate live inode numbers");
        assert_eq!(blocks.len(), live.len(), "live inodes share a block");

        let sb = fs.superblock().await.unwrap();
        for (_, record) in &live {
            assert!(!sb.free_blocks.is_free(record.data_block_number));
        }
        assert_eq!(sb.real_inodes_count, live.len() as u64);
    }

    let listed: BTreeSet<_> = fs
        .read_dir(fs.root())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .filter(|n| n != "README.txt")
        .collect();
    assert_eq!(listed, names);
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_concurrent_creates_in_separate_directories() {
    let (_device, fs) = fresh_volume().await;
    let fs = Arc::new(fs);

    let mut handles = Vec::new();
    for t in 0..6u8 {
        let fs = fs.clone();
        handles.push(tokio::spawn(async move {
            let dir = fs.mkdir(fs.root(), &format!("worker{}", t)).await?;
            for i in 0..5u8 {
                let file = fs.create(dir.inode_no, &format!("f{}", i)).await?;
                fs.write_at(file.inode_no, 0, &[t, i]).await?;
            }
            Ok::<_, FsError>(dir.inode_no)
        }));
    }

    let mut dirs = Vec::new();
    for handle in handles {
        dirs.push(handle.await.unwrap().unwrap());
    }

    for (t, dir) in dirs.iter().enumerate() {
        let entries = fs.read_dir(*dir).await.unwrap();
        assert_eq!(entries.len(), 5);
        for entry in entries {
            let mut buf = [0u8; 2];
            assert_eq!(fs.read_at(entry.inode_no, 0, &mut buf).await.unwrap(), 2);
            assert_eq!(buf[0], t as u8);
        }
    }
    assert_eq!(fs.stats().await.unwrap().live_inodes, 2 + 6 + 6 * 5);
    assert_clean(&fs).await;
}

#[tokio::test]
async fn test_mount_rejects_unformatted_device() {
    let device = Arc::new(MemBlockDevice::new(16));
    assert!(matches!(
        FlatFs::mount(device, FsConfig::default()).await,
        Err(FsError::BadMagic(0))
    ));
}
