//! Image checksums, computed in one pass over the file.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::Md5;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDigests {
    pub md5: String,
    pub sha256: String,
}

pub fn digest_file(path: &Path) -> io::Result<ImageDigests> {
    let mut file = File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
    }
    Ok(ImageDigests {
        md5: format!("{:x}", md5.finalize()),
        sha256: format!("{:x}", sha256.finalize()),
    })
}

/// Write `<image>.<suffix>` as "<hash>  <filename>", so `md5sum -c` and
/// `sha256sum -c` work from the output directory.
pub fn write_checksum_file(image: &Path, suffix: &str, hash: &str) -> io::Result<PathBuf> {
    let filename = image
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "image path has no file name"))?
        .to_string_lossy();
    let path = PathBuf::from(format!("{}.{suffix}", image.display()));
    fs::write(&path, format!("{hash}  {filename}\n"))?;
    Ok(path)
}
