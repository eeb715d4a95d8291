// Copyright 2024-2025 Mediaflow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ARCHIVE_FORMAT: &str = "zip";
pub const ARCHIVE_SUFFIX: &str = "_compressed.zip";

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("io error while compressing: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Archive summary attached to directory outputs as `F_compression_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub files_count: u64,
    pub original_size: u64,
    pub compressed_size: u64,
    /// `compressed_size / original_size`; 0.0 for an empty directory.
    pub compression_ratio: f64,
    pub format: String,
}

/// The archive name for a directory output, e.g. `keyframes` →
/// `keyframes_compressed.zip`.
pub fn archive_name(dir_name: &str) -> String {
    format!("{dir_name}{ARCHIVE_SUFFIX}")
}

/// Compress a directory into a single deterministic zip archive: entries
/// sorted by relative path, forward-slash names, no absolute paths, symlinks
/// skipped. Blocking; call from a blocking task.
pub fn compress_directory(
    source_dir: &Path,
    archive_path: &Path,
) -> Result<CompressionInfo, CompressionError> {
    if !source_dir.is_dir() {
        return Err(CompressionError::NotADirectory(source_dir.to_path_buf()));
    }

    let mut files: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry.map_err(|err| {
            CompressionError::Io(std::io::Error::other(err.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walkdir yields paths under the root");
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), name));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));

    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = ZipWriter::new(File::create(archive_path)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut files_count = 0u64;
    let mut original_size = 0u64;
    let mut buffer = [0u8; 64 * 1024];
    for (path, name) in &files {
        writer.start_file(name.as_str(), options)?;
        let mut file = File::open(path)?;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            original_size += read as u64;
        }
        files_count += 1;
    }
    writer.finish()?;

    let compressed_size = std::fs::metadata(archive_path)?.len();
    let compression_ratio = if original_size > 0 {
        compressed_size as f64 / original_size as f64
    } else {
        0.0
    };

    Ok(CompressionInfo {
        files_count,
        original_size,
        compressed_size,
        compression_ratio,
        format: ARCHIVE_FORMAT.to_string(),
    })
}

/// Unpack an archive produced by [`compress_directory`]. Blocking.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<(), CompressionError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    std::fs::create_dir_all(target_dir)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = target_dir.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::collections::BTreeMap;

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("frames")).unwrap();
        std::fs::write(root.join("frames/0001.jpg"), b"first frame").unwrap();
        std::fs::write(root.join("frames/0002.jpg"), b"second frame").unwrap();
        std::fs::write(root.join("manifest.json"), b"{\"frames\":2}").unwrap();
    }

    fn tree_contents(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut contents = BTreeMap::new();
        for entry in WalkDir::new(root) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let name = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                contents.insert(name, std::fs::read(entry.path()).unwrap());
            }
        }
        contents
    }

    #[test]
    fn compress_then_extract_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("keyframes");
        write_tree(&source);

        let archive = dir.path().join(archive_name("keyframes"));
        let info = compress_directory(&source, &archive).unwrap();

        assert_eq!(info.files_count, 3);
        assert_eq!(info.format, "zip");
        assert!(info.original_size > 0);
        assert!(info.compressed_size > 0);

        let restored = dir.path().join("restored");
        extract_archive(&archive, &restored).unwrap();
        assert_eq!(tree_contents(&source), tree_contents(&restored));
    }

    #[test]
    fn archives_are_deterministic_for_identical_trees() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        write_tree(&first);
        write_tree(&second);

        let first_archive = dir.path().join("a.zip");
        let second_archive = dir.path().join("b.zip");
        compress_directory(&first, &first_archive).unwrap();
        compress_directory(&second, &second_archive).unwrap();

        assert_eq!(
            std::fs::read(&first_archive).unwrap(),
            std::fs::read(&second_archive).unwrap()
        );
    }

    #[test]
    fn rejects_non_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir.txt");
        std::fs::write(&file, b"x").unwrap();
        let archive = dir.path().join("out.zip");
        assert!(matches!(
            compress_directory(&file, &archive),
            Err(CompressionError::NotADirectory(_))
        ));
    }
}
