//! Archive assembly (compression phase): stage files in a working
//! directory, then package into one zip, with a content hash over the
//! finished archive for client-side integrity checks.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use seg_core::{AppError, AppResult};

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> AppResult<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| AppError::Internal(format!("failed to read export working directory: {e}")))?
        .filter_map(Result::ok)
        .collect();
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Zips every file under `working_dir` into `archive_path`, storing
/// files uncompressed (§4.3: "no compression, files stored") and
/// ordering entries deterministically by relative path so the archive
/// layout is stable by image id (§4.3 "Parallelism inside a job").
pub fn build_archive(working_dir: &Path, archive_path: &Path) -> AppResult<()> {
    let file = File::create(archive_path)
        .map_err(|e| AppError::Internal(format!("failed to create export archive: {e}")))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    let mut files = Vec::new();
    collect_files(working_dir, &mut files)?;

    for path in files {
        let relative = path
            .strip_prefix(working_dir)
            .map_err(|e| AppError::Internal(format!("archive path outside working dir: {e}")))?;
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        writer
            .start_file(relative_str, options)
            .map_err(|e| AppError::Internal(format!("failed to start archive entry: {e}")))?;
        let mut source = File::open(&path)
            .map_err(|e| AppError::Internal(format!("failed to open export file for archiving: {e}")))?;
        std::io::copy(&mut source, &mut writer)
            .map_err(|e| AppError::Internal(format!("failed to copy export file into archive: {e}")))?;
    }

    writer.finish().map_err(|e| AppError::Internal(format!("failed to finalize export archive: {e}")))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> AppResult<String> {
    let file = File::open(path).map_err(|e| AppError::Internal(format!("failed to open archive for checksum: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(|e| AppError::Internal(format!("failed to read archive: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_contains_every_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/a.png"), b"fake-a").unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();

        let archive_path = dir.path().join("out.zip");
        build_archive(dir.path(), &archive_path).unwrap();

        let file = File::open(&archive_path).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = (0..zip.len()).map(|i| zip.by_index(i).unwrap().name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["images/a.png".to_string(), "manifest.json".to_string()]);
    }

    #[test]
    fn checksum_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let a = sha256_file(&path).unwrap();
        let b = sha256_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
