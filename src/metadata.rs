// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! File metadata extraction.
//!
//! Every non-directory file committed to the configuration repository starts
//! with a framed JSON header describing ownership, permissions, and the
//! command lists attached to the file. The frame is a pair of delimiter
//! lines; the opening one must be the very first line of the file and the
//! body is everything after the closing one, so arbitrary configuration text
//! in the body can never collide with the frame:
//!
//! ```text
//! #|^^^|#
//! { "TargetFileOwnerGroup": "root:root", "TargetFilePermissions": 644 }
//! #|^^^|#
//! actual file content...
//! ```
//!
//! Large binaries stay out of the repository through __artifact pointers__: a
//! file whose header carries `ExternalContentLocation` holds the SHA-256 of
//! the real content as its body, and the real bytes are read from the pointed
//! local path at plan time.

use crate::{utils::expand_path, Error, Result};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use tracing::trace;

/// Line framing the JSON metadata header.
pub const METADATA_DELIMITER: &str = "#|^^^|#";

/// URI scheme accepted in `ExternalContentLocation`.
pub const FILE_URI_SCHEME: &str = "file://";

/// Reserved basename marking a directory-metadata file.
pub const DIR_METADATA_NAME: &str = ".dirmetadata";

/// Parsed JSON metadata header of a repository file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetadataHeader {
    /// Remote owner and group in `user:group` form.
    #[serde(rename = "TargetFileOwnerGroup")]
    pub target_file_owner_group: String,

    /// Remote permission digits, e.g. `644` meaning octal 0644.
    #[serde(rename = "TargetFilePermissions")]
    pub target_file_permissions: u32,

    /// Commands run after the file (and its reload group) deployed.
    #[serde(rename = "ReloadCommands", default)]
    pub reload_commands: Vec<String>,

    /// Commands run before the file deploys; failure skips the file.
    #[serde(rename = "CheckCommands", default)]
    pub check_commands: Vec<String>,

    /// Commands run before the file deploys when the run opts in.
    #[serde(rename = "InstallCommands", default)]
    pub install_commands: Vec<String>,

    /// `file://` URI holding the real content for artifact pointers.
    #[serde(rename = "ExternalContentLocation", default)]
    pub external_content_location: Option<String>,
}

/// Split a repository file into its metadata header and body.
///
/// The opening delimiter must be the first line of the file; the header runs
/// until the next delimiter line; the body is everything after that line's
/// newline, byte for byte.
///
/// # Errors
///
/// - Return [`Error::BadMetadata`] if a delimiter is missing, or the header
///   is not the expected JSON document.
pub fn extract_metadata(path: impl AsRef<str>, bytes: &[u8]) -> Result<(MetadataHeader, Vec<u8>)> {
    let path = path.as_ref();
    let (first, mut cursor) = next_line(bytes);
    if trim_cr(first) != METADATA_DELIMITER.as_bytes() {
        return Err(Error::BadMetadata {
            path: path.into(),
            reason: format!("first line is not the {METADATA_DELIMITER} delimiter"),
        });
    }

    let mut header = Vec::new();
    let body = loop {
        if cursor.is_empty() {
            return Err(Error::BadMetadata {
                path: path.into(),
                reason: "metadata header is never closed".into(),
            });
        }

        let (line, rest) = next_line(cursor);
        if trim_cr(line) == METADATA_DELIMITER.as_bytes() {
            break rest;
        }

        header.extend_from_slice(line);
        header.push(b'\n');
        cursor = rest;
    };

    let header: MetadataHeader =
        serde_json::from_slice(&header).map_err(|error| Error::BadMetadata {
            path: path.into(),
            reason: error.to_string(),
        })?;
    trace!("Extracted metadata of {path}: {header:?}");

    Ok((header, body.to_vec()))
}

fn next_line(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b'\n') {
        Some(nl) => (&bytes[..nl], &bytes[nl + 1..]),
        None => (bytes, &[]),
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl MetadataHeader {
    /// Owner and group halves of `TargetFileOwnerGroup`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadMetadata`] if the value is not `user:group`.
    pub fn owner_group(&self, path: impl AsRef<str>) -> Result<(String, String)> {
        let (owner, group) =
            self.target_file_owner_group.split_once(':').ok_or_else(|| Error::BadMetadata {
                path: path.as_ref().into(),
                reason: format!(
                    "TargetFileOwnerGroup {:?} is not in user:group form",
                    self.target_file_owner_group
                ),
            })?;

        if owner.is_empty() || group.is_empty() {
            return Err(Error::BadMetadata {
                path: path.as_ref().into(),
                reason: "TargetFileOwnerGroup has an empty user or group".into(),
            });
        }

        Ok((owner.into(), group.into()))
    }

    /// POSIX permission bits of `TargetFilePermissions`.
    ///
    /// The JSON integer spells the octal digits in decimal, so `644` means
    /// `0o644` and `7777` is the largest accepted value.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadMetadata`] if a digit is 8 or 9, or the value
    ///   exceeds 7777.
    pub fn permission_bits(&self, path: impl AsRef<str>) -> Result<u32> {
        let value = self.target_file_permissions;
        if value > 7777 {
            return Err(Error::BadMetadata {
                path: path.as_ref().into(),
                reason: format!("TargetFilePermissions {value} exceeds 7777"),
            });
        }

        let mut bits = 0;
        for digit in [value / 1000, value / 100 % 10, value / 10 % 10, value % 10] {
            if digit > 7 {
                return Err(Error::BadMetadata {
                    path: path.as_ref().into(),
                    reason: format!("TargetFilePermissions {value} has a non-octal digit"),
                });
            }
            bits = bits * 8 + digit;
        }

        Ok(bits)
    }

    /// Determine if this header marks an artifact pointer.
    pub fn is_artifact_pointer(&self) -> bool {
        self.external_content_location.is_some()
    }
}

/// SHA-256 of a file body as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Resolve an artifact pointer to its declared hash and real content.
///
/// The pointer body must start with the 64-hex SHA-256 of the artifact; the
/// `ExternalContentLocation` header must be a `file://` URI whose path (after
/// `~/` expansion) holds the real bytes.
///
/// # Errors
///
/// - Return [`Error::BadArtifactPointer`] if the scheme is not `file://`, the
///   body does not begin with 64 hex characters, or the artifact file cannot
///   be read.
pub fn resolve_artifact(
    path: impl AsRef<str>,
    location: &str,
    body: &[u8],
) -> Result<(String, Vec<u8>)> {
    let path = path.as_ref();
    let local = location.strip_prefix(FILE_URI_SCHEME).ok_or_else(|| {
        Error::BadArtifactPointer {
            path: path.into(),
            reason: format!("ExternalContentLocation {location:?} is not a file:// URI"),
        }
    })?;

    let hash = pointer_hash(path, body)?;
    let local = expand_path(local)?;
    let bytes = fs::read(&local).map_err(|error| Error::BadArtifactPointer {
        path: path.into(),
        reason: format!("cannot read artifact {local:?}: {error}"),
    })?;

    Ok((hash, bytes))
}

fn pointer_hash(path: &str, body: &[u8]) -> Result<String> {
    if body.len() < 64 || !body[..64].iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::BadArtifactPointer {
            path: path.into(),
            reason: "pointer body does not begin with a 64-hex SHA-256".into(),
        });
    }

    // INVARIANT: Body head was just verified to be ASCII hex.
    let hash = std::str::from_utf8(&body[..64]).expect("hex is ASCII").to_lowercase();

    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    fn framed(header: &str, body: &str) -> Vec<u8> {
        format!("{METADATA_DELIMITER}\n{header}\n{METADATA_DELIMITER}\n{body}").into_bytes()
    }

    #[test]
    fn smoke_extract_metadata_full_header() -> Result<()> {
        let file = framed(
            indoc! {r#"
                { "TargetFileOwnerGroup": "www-data:www-data",
                  "TargetFilePermissions": 640,
                  "ReloadCommands": ["systemctl reload nginx"],
                  "CheckCommands": ["nginx -t"] }
            "#}
            .trim_end(),
            "server {}\n",
        );
        let (header, body) = extract_metadata("web01/etc/nginx/nginx.conf", &file)?;

       pretty_assertions::assert_eq!(header.target_file_owner_group, "www-data:www-data");
       pretty_assertions::assert_eq!(header.permission_bits("web01/etc/nginx/nginx.conf")?, 0o640);
       pretty_assertions::assert_eq!(header.reload_commands, vec!["systemctl reload nginx"]);
       pretty_assertions::assert_eq!(header.check_commands, vec!["nginx -t"]);
        assert!(header.install_commands.is_empty());
        assert!(!header.is_artifact_pointer());
       pretty_assertions::assert_eq!(body, b"server {}\n");

        Ok(())
    }

    #[test]
    fn smoke_extract_metadata_body_can_hold_delimiter() -> Result<()> {
        let body = format!("text\n{METADATA_DELIMITER}\nmore text\n");
        let file = framed(
            r#"{ "TargetFileOwnerGroup": "root:root", "TargetFilePermissions": 644 }"#,
            &body,
        );
        let (_, extracted) = extract_metadata("host1/etc/motd", &file)?;
       pretty_assertions::assert_eq!(extracted, body.as_bytes());

        Ok(())
    }

    #[test_case(b"no delimiter at all".to_vec(); "missing opening")]
    #[test_case(format!("{METADATA_DELIMITER}\n{{}}").into_bytes(); "never closed")]
    #[test_case(framed("{ not json", "body"); "malformed json")]
    #[test_case(framed("{}", "body"); "missing required fields")]
    #[test]
    fn smoke_extract_metadata_rejects(file: Vec<u8>) {
        assert!(extract_metadata("host1/etc/motd", &file).is_err());
    }

    #[test_case(644, 0o644; "typical file")]
    #[test_case(755, 0o755; "executable")]
    #[test_case(7777, 0o7777; "maximum")]
    #[test_case(0, 0; "zero")]
    #[test]
    fn smoke_permission_bits(value: u32, expect: u32) -> Result<()> {
        let header = MetadataHeader {
            target_file_owner_group: "root:root".into(),
            target_file_permissions: value,
            reload_commands: Vec::new(),
            check_commands: Vec::new(),
            install_commands: Vec::new(),
            external_content_location: None,
        };
       pretty_assertions::assert_eq!(header.permission_bits("host1/etc/motd")?, expect);

        Ok(())
    }

    #[test_case(648; "non-octal digit")]
    #[test_case(8000; "too large")]
    #[test]
    fn smoke_permission_bits_rejects(value: u32) {
        let header = MetadataHeader {
            target_file_owner_group: "root:root".into(),
            target_file_permissions: value,
            reload_commands: Vec::new(),
            check_commands: Vec::new(),
            install_commands: Vec::new(),
            external_content_location: None,
        };
        assert!(header.permission_bits("host1/etc/motd").is_err());
    }

    #[test]
    fn smoke_owner_group_split() {
        let mut header = MetadataHeader {
            target_file_owner_group: "deploy:wheel".into(),
            target_file_permissions: 644,
            reload_commands: Vec::new(),
            check_commands: Vec::new(),
            install_commands: Vec::new(),
            external_content_location: None,
        };
       pretty_assertions::assert_eq!(
            header.owner_group("host1/etc/motd").unwrap(),
            ("deploy".into(), "wheel".into())
        );

        header.target_file_owner_group = "no-colon".into();
        assert!(header.owner_group("host1/etc/motd").is_err());

        header.target_file_owner_group = ":group".into();
        assert!(header.owner_group("host1/etc/motd").is_err());
    }

    #[test]
    fn smoke_hash_bytes_is_lowercase_hex() {
        let hash = hash_bytes(b"hello\n");
       pretty_assertions::assert_eq!(hash.len(), 64);
       pretty_assertions::assert_eq!(hash, hash.to_lowercase());
       pretty_assertions::assert_eq!(
            hash,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[sealed_test]
    fn smoke_resolve_artifact() -> Result<()> {
        let content = b"artifact bytes";
        std::fs::write("blob.bin", content)?;
        let hash = hash_bytes(content);

        let pointer = format!("{} some trailing notes", hash.to_uppercase());
        let location = format!("file://{}/blob.bin", std::env::current_dir()?.display());
        let (declared, bytes) = resolve_artifact("host1/opt/blob.bin", &location, pointer.as_bytes())?;

       pretty_assertions::assert_eq!(declared, hash);
       pretty_assertions::assert_eq!(bytes, content);

        Ok(())
    }

    #[test]
    fn smoke_resolve_artifact_rejects() {
        let hash = hash_bytes(b"x");

        let result = resolve_artifact("p", "https://example.org/blob", hash.as_bytes());
        assert!(result.is_err());

        let result = resolve_artifact("p", "file:///nonexistent/blob", b"not a hash");
        assert!(result.is_err());

        let result = resolve_artifact("p", "file:///nonexistent/blob", hash.as_bytes());
        assert!(result.is_err());
    }
}
