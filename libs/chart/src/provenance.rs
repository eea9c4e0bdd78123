//! Provenance file digests.
//!
//! A provenance file is a clearsigned message whose body lists the sha256
//! of each signed archive:
//!
//! ```text
//! files:
//!   rafter-0.2.0.tgz: sha256:9f2c...
//! ```
//!
//! Signature checking is done by the caller; this module only extracts and
//! compares digests.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Extension appended to an archive name for its provenance file.
pub const PROVENANCE_EXTENSION: &str = "prov";

/// Find the digest recorded for `file_name` in the `files:` section.
pub fn recorded_digest(provenance: &str, file_name: &str) -> Option<String> {
    let mut in_files = false;

    for line in provenance.lines() {
        if line.starts_with("-----BEGIN PGP SIGNATURE") {
            break;
        }

        if line.trim_end() == "files:" {
            in_files = true;
            continue;
        }

        if !in_files {
            continue;
        }

        // Any unindented line ends the files section.
        if !line.starts_with(' ') && !line.trim().is_empty() {
            in_files = false;
            continue;
        }

        if let Some((name, digest)) = line.trim().split_once(':') {
            if name.trim() == file_name {
                return Some(digest.trim().to_string());
            }
        }
    }

    None
}

/// Compute `sha256:<hex>` for a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVENANCE: &str = "-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA512

apiVersion: v1
name: rafter
version: 0.2.0

...
files:
  rafter-0.2.0.tgz: sha256:abc123
  other-1.0.0.tgz: sha256:def456
-----BEGIN PGP SIGNATURE-----

wsBcBAEBCgAQBQJd
-----END PGP SIGNATURE-----
";

    #[test]
    fn test_recorded_digest() {
        assert_eq!(
            recorded_digest(PROVENANCE, "rafter-0.2.0.tgz").as_deref(),
            Some("sha256:abc123")
        );
        assert_eq!(
            recorded_digest(PROVENANCE, "other-1.0.0.tgz").as_deref(),
            Some("sha256:def456")
        );
        assert_eq!(recorded_digest(PROVENANCE, "missing.tgz"), None);
    }

    #[test]
    fn test_chart_fields_are_not_digests() {
        // "name: rafter" appears before the files section and must not match.
        assert_eq!(recorded_digest(PROVENANCE, "name"), None);
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
