//! Capturing a live volume into a bootable image file.
//!
//! This is the `bundle-vol` front half of the pipeline: allocate a
//! sparse image, put a filesystem on it, loop-mount it, rsync the
//! volume's contents across (minus pseudo-filesystems and anything the
//! caller excludes), lay down the essential directories, device nodes
//! and fstab a machine image needs, and unmount.  The resulting image
//! file then goes through the ordinary bundle pipeline.
//!
//! Everything that touches the host system runs through the
//! [`CommandRunner`] collaborator.  Most of these commands require
//! root.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    error::BundleError,
    exec::{check_prerequisite, CommandRunner},
};

/// Filesystem types that are safe to carry into an image.  Mounts under
/// the volume with any other type (proc, sysfs, tmpfs, nfs, ...) are
/// excluded from the copy.
pub const ALLOWED_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs", "jfs", "reiserfs"];

/// Mount points that never belong in an image.
pub const BANNED_MOUNTS: &[&str] = &["/dev", "/media", "/mnt", "/proc", "/sys", "/cdrom", "/tmp"];

/// Directories every image must contain, even when excluded from the
/// copy.
const ESSENTIAL_DIRS: &[&str] = &["proc", "tmp", "dev", "mnt", "sys"];

/// Device nodes every image must contain: (path, kind, major, minor).
const ESSENTIAL_DEVS: &[(&str, &str, &str, &str)] = &[
    ("dev/console", "c", "5", "1"),
    ("dev/full", "c", "1", "7"),
    ("dev/null", "c", "1", "3"),
    ("dev/zero", "c", "1", "5"),
    ("dev/tty", "c", "5", "0"),
    ("dev/tty0", "c", "4", "0"),
    ("dev/tty1", "c", "4", "1"),
    ("dev/tty2", "c", "4", "2"),
    ("dev/tty3", "c", "4", "3"),
    ("dev/tty4", "c", "4", "4"),
    ("dev/tty5", "c", "4", "5"),
    ("dev/xvc0", "c", "204", "191"),
];

/// fstab for images booting with the Xen-era device naming.
const LEGACY_FSTAB: &str = "/dev/sda1\t/\text3\tdefaults,errors=remount-ro 0 0\n\
                            /dev/sda2\t/mnt\text3\tdefaults\t0 0\n\
                            /dev/sda3\tswap\tswap\tdefaults\t0 0\n\
                            proc\t/proc\tproc\tdefaults\t0 0\n\
                            devpts\t/dev/pts\tdevpts\tgid=5,mode=620  0 0\n";

/// fstab for images booting with modern device naming.
const MODERN_FSTAB: &str = "/dev/sda1\t/\text3\tdefaults 1 1\n\
                            /dev/sdb\t/mnt\text3\tdefaults 0 0\n\
                            none\t/dev/pts\tdevpts\tgid=5,mode=620 0 0\n\
                            none\t/proc\tproc\tdefaults 0 0\n\
                            none\t/sys\tsysfs\tdefaults 0 0\n";

/// Where the image's `/etc/fstab` comes from.
#[derive(Debug, Clone)]
pub enum FstabSource {
    /// Generate the legacy template.
    Legacy,
    /// Generate the modern template.
    Modern,
    /// Copy an existing fstab file verbatim.
    File(PathBuf),
}

/// Configuration for one volume capture.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// The volume (directory tree) to capture, e.g. `/`.
    pub volume: PathBuf,
    /// Size of the image to create, in MiB.
    pub size_mb: u64,
    /// Additional paths to exclude from the copy.
    pub excludes: Vec<String>,
    /// Skip the automatic mtab-based exclusions.
    pub include_all: bool,
    /// Filesystem to create on the image (default ext3).
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    /// fstab policy; `None` leaves /etc/fstab alone.
    pub fstab: Option<FstabSource>,
}

/// Compute the exclusion list for copying `volume`: caller-supplied
/// excludes, then every mount under the volume whose filesystem type is
/// not allowlisted, then the banned mount points.
pub fn compute_excludes(
    volume: &Path,
    mtab: &Path,
    extra: &[String],
) -> Result<Vec<String>, BundleError> {
    let mut excludes: Vec<String> = extra.to_vec();

    let file = BufReader::new(File::open(mtab)?);
    for line in file.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount_point), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if Path::new(mount_point).starts_with(volume) && !ALLOWED_FS_TYPES.contains(&fs_type) {
            debug!("excluding {mount_point} ({fs_type})");
            excludes.push(mount_point.to_string());
        }
    }

    excludes.extend(BANNED_MOUNTS.iter().map(|s| s.to_string()));
    Ok(excludes)
}

/// Allocate a sparse image file of `size_mb` MiB.
pub fn create_sparse_image(path: &Path, size_mb: u64) -> Result<(), BundleError> {
    info!("creating disk image {} ({size_mb} MiB)", path.display());
    let file = File::create(path)?;
    file.set_len(size_mb * 1024 * 1024)?;
    Ok(())
}

/// Create a filesystem on the image.
pub fn make_filesystem(
    runner: &dyn CommandRunner,
    image: &Path,
    config: &VolumeConfig,
) -> Result<(), BundleError> {
    let fs_type = config.fs_type.as_deref().unwrap_or("ext3");
    let mkfs = format!("mkfs.{fs_type}");
    check_prerequisite(runner, &mkfs)?;

    let image_str = image.to_string_lossy().into_owned();
    let mut args: Vec<&str> = vec![];
    let mut tune: Vec<&str> = vec![];

    match fs_type {
        t if t.starts_with("ext") => {
            args.extend(["-F", &image_str]);
            if let Some(ref label) = config.label {
                args.extend(["-L", label]);
            }
            if let Some(ref uuid) = config.uuid {
                tune = vec!["tune2fs", "-U", uuid, &image_str];
            }
        }
        "xfs" => {
            args.push(&image_str);
            if let Some(ref label) = config.label {
                args.extend(["-L", label]);
            }
            if let Some(ref uuid) = config.uuid {
                tune = vec!["xfs_admin", "-U", uuid, &image_str];
            }
        }
        other => {
            return Err(BundleError::precondition(format!(
                "unsupported filesystem type: {other}"
            )));
        }
    }

    info!("creating {fs_type} filesystem");
    runner.run(&mkfs, &args)?;
    if !tune.is_empty() {
        check_prerequisite(runner, tune[0])?;
        runner.run(tune[0], &tune[1..])?;
    }
    Ok(())
}

/// Attach the image to a free loop device and return the device path.
pub fn attach_loop(runner: &dyn CommandRunner, image: &Path) -> Result<String, BundleError> {
    check_prerequisite(runner, "losetup")?;

    let output = runner.run("losetup", &["-f"])?;
    let loop_dev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if loop_dev.is_empty() {
        return Err(BundleError::precondition(
            "no free loopback device available",
        ));
    }
    let image_str = image.to_string_lossy();
    runner.run("losetup", &[loop_dev.as_str(), image_str.as_ref()])?;
    Ok(loop_dev)
}

fn detach_loop(runner: &dyn CommandRunner, loop_dev: &str) {
    if let Err(err) = runner.run("losetup", &["-d", loop_dev]) {
        warn!("unable to detach {loop_dev}: {err}");
    }
}

/// Copy the volume into the mounted image with rsync, preserving
/// xattrs and sparseness.  rsync's partial-transfer statuses (23, 24)
/// are reported but tolerated; anything else non-zero fails the copy.
pub fn copy_volume_contents(
    runner: &dyn CommandRunner,
    mount_point: &Path,
    volume: &Path,
    excludes: &[String],
) -> Result<(), BundleError> {
    check_prerequisite(runner, "rsync")?;

    let volume_str = volume.to_string_lossy().into_owned();
    let mount_str = mount_point.to_string_lossy().into_owned();
    let mut args: Vec<&str> = vec!["-aXS"];
    for exclude in excludes {
        args.extend(["--exclude", exclude]);
    }
    args.extend([volume_str.as_str(), mount_str.as_str()]);

    info!("copying files from {}", volume.display());
    let output = runner.run_unchecked("rsync", &args)?;
    match output.status.code() {
        Some(0) => {}
        Some(23) | Some(24) => {
            warn!("rsync reports files partially copied");
        }
        _ => {
            return Err(BundleError::Command {
                program: "rsync".to_string(),
                status: output.status,
            });
        }
    }
    Ok(())
}

/// Create the directories and device nodes every image needs, whether
/// or not the copy brought them along.
pub fn make_essential_entries(
    runner: &dyn CommandRunner,
    mount_point: &Path,
) -> Result<(), BundleError> {
    for dir in ESSENTIAL_DIRS {
        let path = mount_point.join(dir);
        if !path.exists() {
            std::fs::create_dir(&path)?;
        }
    }

    for &(path, kind, major, minor) in ESSENTIAL_DEVS {
        let dev = mount_point.join(path);
        if !dev.exists() {
            let dev_str = dev.to_string_lossy();
            runner.run("mknod", &[dev_str.as_ref(), kind, major, minor])?;
        }
    }
    Ok(())
}

/// Install `/etc/fstab` in the image per the configured policy, keeping
/// a `.old` copy of anything already there.
pub fn write_fstab(mount_point: &Path, source: &FstabSource) -> Result<(), BundleError> {
    let etc = mount_point.join("etc");
    let fstab_path = etc.join("fstab");
    std::fs::create_dir_all(&etc)?;
    if fstab_path.exists() {
        std::fs::copy(&fstab_path, etc.join("fstab.old"))?;
    }

    info!("writing fstab");
    match source {
        FstabSource::Legacy => std::fs::write(&fstab_path, LEGACY_FSTAB)?,
        FstabSource::Modern => std::fs::write(&fstab_path, MODERN_FSTAB)?,
        FstabSource::File(path) => {
            std::fs::copy(path, &fstab_path)?;
        }
    }
    Ok(())
}

/// Capture `config.volume` into a fresh image file at `image`.
///
/// On any failure the loop device is detached and the image unmounted
/// (best effort) before the error propagates; the partially-written
/// image file itself is removed by the caller's cleanup.
pub fn make_volume_image(
    runner: &dyn CommandRunner,
    config: &VolumeConfig,
    image: &Path,
) -> Result<(), BundleError> {
    if !config.volume.is_dir() {
        return Err(BundleError::precondition(format!(
            "volume {} is not a directory",
            config.volume.display()
        )));
    }

    let excludes = if config.include_all {
        config.excludes.clone()
    } else {
        compute_excludes(&config.volume, Path::new("/etc/mtab"), &config.excludes)?
    };

    create_sparse_image(image, config.size_mb)?;
    make_filesystem(runner, image, config)?;

    check_prerequisite(runner, "mount")?;
    check_prerequisite(runner, "umount")?;

    let loop_dev = attach_loop(runner, image)?;
    let mount_point = tempfile::tempdir()?;
    let mount_str = mount_point.path().to_string_lossy().into_owned();

    if let Err(err) = runner.run("mount", &[&loop_dev, &mount_str]) {
        detach_loop(runner, &loop_dev);
        return Err(err);
    }

    let result = (|| -> Result<(), BundleError> {
        copy_volume_contents(runner, mount_point.path(), &config.volume, &excludes)?;
        make_essential_entries(runner, mount_point.path())?;
        if let Some(ref fstab) = config.fstab {
            write_fstab(mount_point.path(), fstab)?;
        }
        Ok(())
    })();

    // -d releases the loop device along with the mount
    if let Err(err) = runner.run("umount", &["-d", &mount_str]) {
        warn!("unable to unmount {mount_str}: {err}");
        detach_loop(runner, &loop_dev);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockRunner;

    fn config(volume: &Path) -> VolumeConfig {
        VolumeConfig {
            volume: volume.to_path_buf(),
            size_mb: 1,
            excludes: vec![],
            include_all: true,
            fs_type: None,
            uuid: None,
            label: None,
            fstab: Some(FstabSource::Modern),
        }
    }

    #[test]
    fn test_compute_excludes_from_mtab() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let mtab = dir.path().join("mtab");
        std::fs::write(
            &mtab,
            "/dev/sda1 / ext4 rw 0 0\n\
             proc /proc proc rw 0 0\n\
             tmpfs /run tmpfs rw 0 0\n\
             /dev/sdb1 /home ext4 rw 0 0\n",
        )?;

        let excludes = compute_excludes(Path::new("/"), &mtab, &["/scratch".to_string()])?;

        assert!(excludes.contains(&"/scratch".to_string()));
        assert!(excludes.contains(&"/run".to_string()));
        // /proc is excluded by type and banned outright
        assert!(excludes.contains(&"/proc".to_string()));
        // allowlisted filesystems are not excluded
        assert!(!excludes.contains(&"/home".to_string()));
        for banned in BANNED_MOUNTS {
            assert!(excludes.contains(&banned.to_string()));
        }
        Ok(())
    }

    #[test]
    fn test_make_filesystem_ext_with_label_and_uuid() -> Result<(), BundleError> {
        let runner = MockRunner::new();
        let dir = tempfile::tempdir()?;
        let mut cfg = config(dir.path());
        cfg.label = Some("root".to_string());
        cfg.uuid = Some("1234-5678".to_string());

        make_filesystem(&runner, Path::new("/tmp/x.img"), &cfg)?;

        let calls = runner.calls.borrow();
        let mkfs = calls
            .iter()
            .find(|call| call[0] == "mkfs.ext3")
            .expect("mkfs.ext3 was not invoked");
        assert_eq!(mkfs[1..], ["-F", "/tmp/x.img", "-L", "root"]);
        let tune = calls
            .iter()
            .find(|call| call[0] == "tune2fs")
            .expect("tune2fs was not invoked");
        assert_eq!(tune[1..], ["-U", "1234-5678", "/tmp/x.img"]);
        Ok(())
    }

    #[test]
    fn test_make_filesystem_rejects_unknown_type() {
        let runner = MockRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.fs_type = Some("vfat".to_string());

        assert!(matches!(
            make_filesystem(&runner, Path::new("/tmp/x.img"), &cfg),
            Err(BundleError::Precondition(_))
        ));
    }

    #[test]
    fn test_rsync_partial_transfer_is_tolerated() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let runner = MockRunner::new().script("rsync", 24, b"");
        copy_volume_contents(&runner, dir.path(), Path::new("/data"), &[])?;

        let runner = MockRunner::new().script("rsync", 1, b"");
        assert!(matches!(
            copy_volume_contents(&runner, dir.path(), Path::new("/data"), &[]),
            Err(BundleError::Command { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_rsync_gets_exclude_arguments() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let runner = MockRunner::new();
        let excludes = vec!["/proc".to_string(), "/sys".to_string()];
        copy_volume_contents(&runner, dir.path(), Path::new("/data"), &excludes)?;

        let calls = runner.calls.borrow();
        let rsync = calls.iter().find(|call| call[0] == "rsync").unwrap();
        assert!(rsync.windows(2).any(|w| w == ["--exclude", "/proc"]));
        assert!(rsync.windows(2).any(|w| w == ["--exclude", "/sys"]));
        assert_eq!(rsync[1], "-aXS");
        Ok(())
    }

    #[test]
    fn test_write_fstab_keeps_a_copy() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("etc");
        std::fs::create_dir(&etc)?;
        std::fs::write(etc.join("fstab"), "existing\n")?;

        write_fstab(dir.path(), &FstabSource::Modern)?;

        assert_eq!(std::fs::read_to_string(etc.join("fstab.old"))?, "existing\n");
        let written = std::fs::read_to_string(etc.join("fstab"))?;
        assert!(written.contains("/dev/sda1\t/\text3"));
        Ok(())
    }

    #[test]
    fn test_failed_mount_detaches_loop_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x.img");
        let runner = MockRunner::new()
            .script("losetup", 0, b"/dev/loop7\n")
            .script("mount", 32, b"");

        let cfg = config(dir.path());
        assert!(make_volume_image(&runner, &cfg, &image).is_err());

        let calls = runner.calls.borrow();
        assert!(
            calls.iter().any(|call| call[0] == "losetup" && call[1] == "-d"),
            "loop device was not detached: {calls:?}"
        );
    }
}
