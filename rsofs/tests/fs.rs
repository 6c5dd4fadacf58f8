//! End-to-end tests over freshly formatted volume images.

use std::fs::File;

use rsofs::{
	data::*,
	mkfs::{self, Geometry, Options},
	InodeState, LinkOp, MapOp, Sofs, UnlinkOp,
};
use rstest::rstest;
use tempfile::NamedTempFile;

const BLOCKS: u64 = 4096;

fn new_volume(blocks: u64, inodes: Option<u32>) -> (NamedTempFile, Geometry) {
	let f = NamedTempFile::new().unwrap();
	f.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
	let opts = Options {
		name: "VOL".to_owned(),
		inodes,
		..Options::default()
	};
	let geo = mkfs::mkfs(f.path(), &opts).unwrap();
	(f, geo)
}

fn mount(f: &NamedTempFile) -> Sofs<File> {
	Sofs::open(f.path(), true).unwrap()
}

#[test]
fn mkfs_and_mount_root_dir() {
	// S1: format, mount, inspect the root directory
	let (f, geo) = new_volume(BLOCKS, Some(512));
	let mut fs = mount(&f);

	let sb = fs.superblock();
	assert_eq!(sb.n_total, 4096);
	assert_eq!(sb.i_total, geo.i_total);
	assert_eq!(sb.i_free, geo.i_total - 1);
	assert_eq!(sb.dzone_free, geo.dzone_total - 1);
	assert_eq!(sb.volume_name(), "VOL");
	assert_eq!(
		sb.n_total,
		1 + sb.itable_size + sb.dzone_total * BLOCKS_PER_CLUSTER as u32
	);

	let root = fs.read_inode(ROOT_INODE, InodeState::InUse).unwrap();
	assert!(root.is_dir());
	assert_eq!(root.ref_count, 2);
	assert_eq!(root.clu_count, 1);
	assert_eq!(root.size, (DPC * DIRENT_SIZE) as u64);

	assert_eq!(fs.dir_lookup(ROOT_INODE, b".").unwrap(), ROOT_INODE);
	assert_eq!(fs.dir_lookup(ROOT_INODE, b"..").unwrap(), ROOT_INODE);
	assert_eq!(fs.resolve("/").unwrap(), (ROOT_INODE, ROOT_INODE));
}

#[test]
fn create_write_read_delete() {
	// S2
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let (i_free, d_free) = {
		let sb = fs.superblock();
		(sb.i_free, sb.dzone_free)
	};

	let inr = fs.mknod("/a", 0o644).unwrap();
	assert_eq!(fs.write("/a", 0, b"hello\n").unwrap(), 6);

	let mut buf = [0u8; 6];
	assert_eq!(fs.read("/a", 0, &mut buf).unwrap(), 6);
	assert_eq!(&buf, b"hello\n");

	let ino = fs.read_inode(inr, InodeState::InUse).unwrap();
	assert_eq!(ino.size, 6);
	assert_eq!(ino.clu_count, 1);
	assert_eq!(ino.ref_count, 1);

	fs.unlink("/a").unwrap();
	assert_eq!(
		fs.lookup("/a").unwrap_err().raw_os_error(),
		Some(libc::ENOENT)
	);

	let sb = fs.superblock();
	assert_eq!(sb.i_free, i_free);
	assert_eq!(sb.dzone_free, d_free);
}

#[test]
fn indirection_boundaries() {
	// S3: one write past the direct zone, one past the single-indirect zone
	let (f, _) = new_volume(16 * 4096, None);
	let mut fs = mount(&f);

	let inr = fs.mknod("/big", 0o644).unwrap();

	fs.file_write(inr, N_DIRECT as u64 * BSLPC as u64, b"x").unwrap();
	let ino = fs.read_inode(inr, InodeState::InUse).unwrap();
	assert_ne!(ino.i1, NULL_CLUSTER);
	assert_eq!(ino.clu_count, 2); // i1 plus one leaf

	fs.file_write(inr, (N_DIRECT + RPC) as u64 * BSLPC as u64, b"y")
		.unwrap();
	let ino = fs.read_inode(inr, InodeState::InUse).unwrap();
	assert_ne!(ino.i2, NULL_CLUSTER);
	assert_eq!(ino.clu_count, 5); // plus i2, one single-indirect, one leaf

	// both bytes resolve through the right number of indirections
	let mut b = [0u8; 1];
	fs.file_read(inr, N_DIRECT as u64 * BSLPC as u64, &mut b).unwrap();
	assert_eq!(&b, b"x");
	fs.file_read(inr, (N_DIRECT + RPC) as u64 * BSLPC as u64, &mut b)
		.unwrap();
	assert_eq!(&b, b"y");
}

#[test]
fn rename_across_directories() {
	// S4
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.mkdir("/a", 0o755).unwrap();
	fs.mkdir("/b", 0o755).unwrap();
	let x = fs.mknod("/a/x", 0o644).unwrap();
	fs.write("/a/x", 0, b"payload").unwrap();

	fs.rename("/a/x", "/b/y").unwrap();

	assert_eq!(
		fs.lookup("/a/x").unwrap_err().raw_os_error(),
		Some(libc::ENOENT)
	);
	assert_eq!(fs.lookup("/b/y").unwrap(), x);
	assert_eq!(fs.read_inode(x, InodeState::InUse).unwrap().ref_count, 1);

	let mut buf = [0u8; 7];
	fs.read("/b/y", 0, &mut buf).unwrap();
	assert_eq!(&buf, b"payload");

	// pure rename within one directory
	fs.rename("/b/y", "/b/z").unwrap();
	assert_eq!(fs.lookup("/b/z").unwrap(), x);
	assert_eq!(fs.read_inode(x, InodeState::InUse).unwrap().ref_count, 1);

	// moving over an existing regular file removes the target first
	let (i_free_before, _) = {
		let sb = fs.superblock();
		(sb.i_free, ())
	};
	fs.mknod("/b/w", 0o644).unwrap();
	fs.rename("/b/z", "/b/w").unwrap();
	assert_eq!(fs.lookup("/b/w").unwrap(), x);
	assert_eq!(fs.superblock().i_free, i_free_before);
}

#[test]
fn attach_rewires_dotdot() {
	// S5: detach a directory and attach it under a new parent
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let d1 = fs.mkdir("/d1", 0o755).unwrap();
	let d2 = fs.mkdir("/d2", 0o755).unwrap();
	assert_eq!(fs.dir_lookup(d1, b"..").unwrap(), ROOT_INODE);

	let root_rc = fs
		.read_inode(ROOT_INODE, InodeState::InUse)
		.unwrap()
		.ref_count;

	fs.remove_entry(ROOT_INODE, b"d1", UnlinkOp::Detach).unwrap();
	fs.add_entry(d2, b"d1", d1, LinkOp::Attach).unwrap();

	assert_eq!(fs.dir_lookup(d1, b"..").unwrap(), d2);
	assert_eq!(fs.lookup("/d2/d1").unwrap(), d1);
	assert_eq!(fs.read_inode(d1, InodeState::InUse).unwrap().ref_count, 2);
	assert_eq!(fs.read_inode(d2, InodeState::InUse).unwrap().ref_count, 3);
	assert_eq!(
		fs.read_inode(ROOT_INODE, InodeState::InUse)
			.unwrap()
			.ref_count,
		root_rc - 1
	);
}

#[test]
fn symlink_loop_fails_with_eloop() {
	// S6
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.symlink("/l2", "/l1").unwrap();
	fs.symlink("/l1", "/l2").unwrap();

	assert_eq!(
		fs.resolve("/l1").unwrap_err().raw_os_error(),
		Some(libc::ELOOP)
	);
}

#[test]
fn symlinks_follow_relative_and_absolute() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.mkdir("/d", 0o755).unwrap();
	fs.mkdir("/d/sub", 0o755).unwrap();
	let t = fs.mknod("/d/sub/f", 0o644).unwrap();

	fs.symlink("sub/f", "/d/rel").unwrap();
	assert_eq!(fs.lookup("/d/rel").unwrap(), t);

	fs.symlink("/d/sub", "/abs").unwrap();
	assert_eq!(fs.lookup("/abs").unwrap(), fs.lookup("/d/sub").unwrap());

	assert_eq!(fs.readlink("/d/rel").unwrap(), b"sub/f".to_vec());
}

#[test]
fn cluster_reuse_is_fifo() {
	let (f, _) = new_volume(600, None);
	let mut fs = mount(&f);

	// drain the pool completely so reuse order is observable
	let inr = fs.mknod("/f", 0o644).unwrap();
	let mut ci = 0u32;
	loop {
		match fs.file_cluster(inr, ci, MapOp::Alloc) {
			Ok(_) => ci += 1,
			Err(e) => {
				assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
				break;
			}
		}
	}

	// free a known run of single-indirect leaves, one more than the
	// insertion cache holds, so a deplete happens mid-way
	let range = 100..(100 + DZONE_CACHE_SIZE as u32 + 2);
	let freed: Vec<ClusterNum> = range
		.clone()
		.map(|ci| fs.file_cluster(inr, ci, MapOp::FreeClean).unwrap())
		.collect();

	// reallocating the same slots drains list and caches in FIFO order,
	// with the replenish falling back to a deplete for the tail
	let got: Vec<ClusterNum> = range
		.map(|ci| fs.file_cluster(inr, ci, MapOp::Alloc).unwrap())
		.collect();
	assert_eq!(got, freed);
}

#[test]
fn exhaust_and_recover_clusters() {
	let (f, geo) = new_volume(600, None);
	let mut fs = mount(&f);

	let inr = fs.mknod("/fill", 0o644).unwrap();
	let before = fs.superblock().dzone_free;

	let mut got = 0u32;
	loop {
		match fs.file_cluster(inr, got, MapOp::Alloc) {
			Ok(_) => got += 1,
			Err(e) => {
				assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
				break;
			}
		}
	}
	assert!(got >= geo.dzone_total - 1 - 2); // indirection tables eat a couple
	assert_eq!(fs.superblock().dzone_free, 0);

	fs.file_clusters(inr, 0, MapOp::FreeClean).unwrap();
	assert_eq!(fs.superblock().dzone_free, before);

	// the pool is fully usable again
	fs.write("/fill", 0, b"still alive").unwrap();
	let mut buf = [0u8; 11];
	fs.read("/fill", 0, &mut buf).unwrap();
	assert_eq!(&buf, b"still alive");
}

#[test]
fn inode_exhaustion_and_reuse() {
	let (f, geo) = new_volume(600, None);
	let mut fs = mount(&f);

	let free = fs.superblock().i_free;
	assert_eq!(free, geo.i_total - 1);

	for k in 0..free {
		fs.mknod(&format!("/f{k}"), 0o644).unwrap();
	}
	assert_eq!(fs.superblock().i_free, 0);
	assert_eq!(
		fs.mknod("/one-too-many", 0o644).unwrap_err().raw_os_error(),
		Some(libc::ENOSPC)
	);

	for k in 0..free {
		fs.unlink(&format!("/f{k}")).unwrap();
	}
	assert_eq!(fs.superblock().i_free, free);
}

#[test]
fn dirty_inode_cleaning_on_reuse() {
	// a small pool forces deleted (dirty) inodes and clusters back around
	// the free lists within a few rounds
	let (f, geo) = new_volume(140, Some(8));
	let mut fs = mount(&f);
	assert!(geo.i_total < 8 * 6);

	let baseline = {
		let sb = fs.superblock();
		(sb.i_free, sb.dzone_free)
	};

	for round in 0..8 {
		for k in 0..6 {
			let path = format!("/r{round}k{k}");
			fs.mknod(&path, 0o644).unwrap();
			fs.write(&path, 0, &vec![round as u8 + 1; 3 * BSLPC]).unwrap();
		}

		// the data written this round reads back despite the reuse churn
		let mut buf = vec![0u8; 3 * BSLPC];
		fs.read(&format!("/r{round}k0"), 0, &mut buf).unwrap();
		assert!(buf.iter().all(|b| *b == round as u8 + 1));

		for k in 0..6 {
			fs.unlink(&format!("/r{round}k{k}")).unwrap();
		}
		let sb = fs.superblock();
		assert_eq!((sb.i_free, sb.dzone_free), baseline, "round {round}");
	}
}

#[test]
fn sparse_files_read_zeros() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let inr = fs.mknod("/sparse", 0o644).unwrap();
	fs.file_write(inr, 3 * BSLPC as u64, b"end").unwrap();

	let ino = fs.read_inode(inr, InodeState::InUse).unwrap();
	assert_eq!(ino.size, 3 * BSLPC as u64 + 3);
	assert_eq!(ino.clu_count, 1);

	let mut buf = vec![0xFFu8; BSLPC];
	assert_eq!(fs.file_read(inr, 0, &mut buf).unwrap(), BSLPC);
	assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn file_too_big() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let inr = fs.mknod("/f", 0o644).unwrap();
	assert_eq!(
		fs.file_write(inr, MAX_FILE_SIZE, b"x")
			.unwrap_err()
			.raw_os_error(),
		Some(libc::EFBIG)
	);
}

#[test]
fn tombstones_are_not_reused() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.mknod("/a", 0o644).unwrap();
	fs.mknod("/b", 0o644).unwrap();
	fs.unlink("/a").unwrap();

	// slot 2 is a's tombstone; the new entry must land after b
	let c = fs.mknod("/c", 0o644).unwrap();
	let idx = fs
		.dir_iter(ROOT_INODE, |e, idx| (e.inode == c).then_some(idx))
		.unwrap()
		.unwrap();
	assert_eq!(idx, 4);

	assert_eq!(fs.lookup("/b").unwrap(), fs.dir_lookup(ROOT_INODE, b"b").unwrap());
}

#[test]
fn directory_growth_past_one_cluster() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let count = 2 * DPC as u32; // well past the 29 free slots of cluster 0
	for k in 0..count {
		fs.mknod(&format!("/file{k:03}"), 0o644).unwrap();
	}
	for k in 0..count {
		assert!(fs.lookup(&format!("/file{k:03}")).is_ok(), "file{k:03}");
	}

	let root = fs.read_inode(ROOT_INODE, InodeState::InUse).unwrap();
	assert_eq!(root.size, 3 * (DPC * DIRENT_SIZE) as u64);
	assert_eq!(root.clu_count, 3);
}

#[test]
fn rmdir_requires_empty() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.mkdir("/d", 0o755).unwrap();
	fs.mknod("/d/f", 0o644).unwrap();

	assert_eq!(
		fs.rmdir("/d").unwrap_err().raw_os_error(),
		Some(libc::ENOTEMPTY)
	);
	fs.unlink("/d/f").unwrap();
	fs.rmdir("/d").unwrap();
	assert_eq!(
		fs.lookup("/d").unwrap_err().raw_os_error(),
		Some(libc::ENOENT)
	);
}

#[test]
fn access_checks() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.set_credentials(0, 0);
	let inr = fs.mknod("/secret", 0o600).unwrap();
	fs.file_write(inr, 0, b"root only").unwrap();

	fs.set_credentials(1000, 1000);
	assert_eq!(
		fs.file_read(inr, 0, &mut [0u8; 4])
			.unwrap_err()
			.raw_os_error(),
		Some(libc::EACCES)
	);

	fs.set_credentials(0, 0);
	assert_eq!(fs.file_read(inr, 0, &mut [0u8; 4]).unwrap(), 4);

	// root may not execute a file nobody can execute
	assert_eq!(
		fs.access_granted(inr, PERM_EXEC).unwrap_err().raw_os_error(),
		Some(libc::EACCES)
	);
}

#[test]
fn readonly_mount_rejects_mutation() {
	let (f, _) = new_volume(BLOCKS, None);
	{
		let fs = mount(&f);
		fs.unmount().unwrap();
	}

	let mut fs = Sofs::open(f.path(), false).unwrap();
	assert_eq!(
		fs.mknod("/x", 0o644).unwrap_err().raw_os_error(),
		Some(libc::EROFS)
	);
	assert_eq!(fs.superblock().mstat, PRU);
}

#[test]
fn unmount_flips_mount_state() {
	let (f, _) = new_volume(BLOCKS, None);

	let fs = mount(&f);
	assert_eq!(fs.superblock().mstat, UDU);
	fs.unmount().unwrap();

	let fs = Sofs::open(f.path(), false).unwrap();
	assert_eq!(fs.superblock().mstat, PRU);
}

#[test]
fn data_survives_remount() {
	let (f, _) = new_volume(BLOCKS, None);

	{
		let mut fs = mount(&f);
		fs.mkdir("/keep", 0o755).unwrap();
		fs.mknod("/keep/data", 0o644).unwrap();
		fs.write("/keep/data", 0, b"persistent bytes").unwrap();
		fs.unmount().unwrap();
	}

	let mut fs = mount(&f);
	let mut buf = [0u8; 16];
	fs.read("/keep/data", 0, &mut buf).unwrap();
	assert_eq!(&buf, b"persistent bytes");
}

#[test]
fn rename_same_name_is_noop() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	let inr = fs.mknod("/same", 0o644).unwrap();
	fs.rename("/same", "/same").unwrap();
	assert_eq!(fs.lookup("/same").unwrap(), inr);
}

#[test]
fn rename_rejects_moving_dir_into_itself() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	fs.mkdir("/top", 0o755).unwrap();
	fs.mkdir("/top/mid", 0o755).unwrap();

	assert_eq!(
		fs.rename("/top", "/top/mid/deep").unwrap_err().raw_os_error(),
		Some(libc::EINVAL)
	);
}

#[rstest]
#[case(517, None)]
#[case(1024, Some(64))]
#[case(4096, Some(512))]
fn formatted_volumes_pass_the_mount_checks(#[case] blocks: u64, #[case] inodes: Option<u32>) {
	let (f, geo) = new_volume(blocks, inodes);
	let fs = Sofs::open(f.path(), false).unwrap();

	let sb = fs.superblock();
	assert_eq!(sb.i_total, geo.i_total);
	assert_eq!(sb.dzone_total, geo.dzone_total);
	assert_eq!(sb.i_total, sb.itable_size * IPB as u32);
}

#[test]
fn path_errors() {
	let (f, _) = new_volume(BLOCKS, None);
	let mut fs = mount(&f);

	assert_eq!(
		fs.resolve("relative/path").unwrap_err().raw_os_error(),
		Some(libc::EINVAL)
	);

	let long = format!("/{}", "x".repeat(MAX_PATH));
	assert_eq!(
		fs.resolve(&long).unwrap_err().raw_os_error(),
		Some(libc::ENAMETOOLONG)
	);

	let long_name = format!("/{}", "y".repeat(MAX_NAME + 1));
	assert_eq!(
		fs.resolve(&long_name).unwrap_err().raw_os_error(),
		Some(libc::ENAMETOOLONG)
	);

	fs.mknod("/plain", 0o644).unwrap();
	assert_eq!(
		fs.lookup("/plain/below").unwrap_err().raw_os_error(),
		Some(libc::ENOTDIR)
	);
}
