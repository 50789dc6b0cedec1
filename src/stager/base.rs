//! Populating a fresh root with the base system.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::config::{BaseConfig, Variant};
use crate::process::{CommandRunner, CommandSpec};

use super::StageError;

/// How the base root gets its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource<'a> {
    Tarball(&'a Path),
    Bootstrap,
}

pub fn base_source(config: &BaseConfig) -> BaseSource<'_> {
    match &config.tarball {
        Some(path) => BaseSource::Tarball(path),
        None => BaseSource::Bootstrap,
    }
}

/// Unpack a `.tar`, `.tar.zst` or `.tzst` base image into `root`, keeping
/// ownership and permissions.
pub fn unpack_tarball(tarball: &Path, root: &Path) -> Result<(), StageError> {
    let io_err = |source| StageError::Io {
        path: tarball.to_path_buf(),
        source,
    };
    let file = File::open(tarball).map_err(io_err)?;
    let reader: Box<dyn Read> = if is_zstd(tarball) {
        Box::new(zstd::stream::read::Decoder::new(file).map_err(io_err)?)
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);
    archive.unpack(root).map_err(|e| StageError::Base {
        reason: format!("unpacking '{}': {e}", tarball.display()),
    })
}

fn is_zstd(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".zst") || name.ends_with(".tzst")
}

/// The debootstrap invocation for a variant.
pub fn debootstrap_command(
    config: &BaseConfig,
    arch: &str,
    variant: Variant,
    root: &Path,
) -> CommandSpec {
    let mut cmd = CommandSpec::new("debootstrap")
        .label("debootstrap")
        .arg(format!("--arch={arch}"));
    if variant == Variant::Minimal {
        cmd = cmd.arg("--variant=minbase");
    }
    if !config.include.is_empty() {
        cmd = cmd.arg(format!("--include={}", config.include.join(",")));
    }
    cmd.arg(config.suite.clone())
        .arg_path(root)
        .arg(config.mirror.clone())
}

pub fn bootstrap(
    runner: &dyn CommandRunner,
    config: &BaseConfig,
    arch: &str,
    variant: Variant,
    root: &Path,
) -> Result<(), StageError> {
    let cmd = debootstrap_command(config, arch, variant, root);
    tracing::info!(
        event = "bootstrap_started",
        suite = %config.suite,
        variant = %variant,
        "bootstrapping base root"
    );
    let output = runner.run(&cmd)?;
    if !output.success() {
        return Err(StageError::Base {
            reason: format!(
                "debootstrap exited with {:?}: {}",
                output.code,
                output.combined()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base() -> BaseConfig {
        BaseConfig {
            suite: "bookworm".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
            tarball: None,
            include: vec!["ca-certificates".to_string(), "gnupg".to_string()],
        }
    }

    #[test]
    fn test_debootstrap_command_per_variant() {
        let minimal = debootstrap_command(&base(), "amd64", Variant::Minimal, Path::new("/r"));
        assert_eq!(
            minimal.display_line(),
            "debootstrap --arch=amd64 --variant=minbase --include=ca-certificates,gnupg bookworm /r http://deb.debian.org/debian"
        );
        let full = debootstrap_command(&base(), "amd64", Variant::Full, Path::new("/r"));
        assert!(!full.args.iter().any(|a| a.starts_with("--variant")));
    }

    fn build_tar(dir: &Path) -> Vec<u8> {
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("etc/os-release"), "ID=debian\n").unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", dir).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_plain_and_zstd_tarballs() {
        let temp = TempDir::new().unwrap();
        let tar_bytes = build_tar(&temp.path().join("src"));

        let plain = temp.path().join("base.tar");
        fs::write(&plain, &tar_bytes).unwrap();
        let zst = temp.path().join("base.tar.zst");
        fs::write(&zst, zstd::encode_all(tar_bytes.as_slice(), 3).unwrap()).unwrap();

        for (name, tarball) in [("plain", &plain), ("zst", &zst)] {
            let root = temp.path().join(name);
            fs::create_dir_all(&root).unwrap();
            unpack_tarball(tarball, &root).unwrap();
            assert_eq!(
                fs::read_to_string(root.join("etc/os-release")).unwrap(),
                "ID=debian\n"
            );
        }
    }

    #[test]
    fn test_source_selection() {
        let mut config = base();
        assert_eq!(base_source(&config), BaseSource::Bootstrap);
        config.tarball = Some("/b.tar".into());
        assert_eq!(base_source(&config), BaseSource::Tarball(Path::new("/b.tar")));
    }
}
