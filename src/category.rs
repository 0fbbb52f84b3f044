// src/category.rs

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coarse file type used to group downloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Videos,
    Images,
    Audio,
    Documents,
    Archives,
    Programs,
    #[default]
    Other,
}

const VIDEOS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp"];
const IMAGES: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "ico", "tiff", "psd", "raw"];
const AUDIO: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "wma", "m4a", "opus", "aiff"];
const DOCUMENTS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "rtf", "odt", "ods", "odp"];
const ARCHIVES: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz", "tgz"];
const PROGRAMS: &[&str] = &["exe", "msi", "app", "dmg", "deb", "rpm", "apk", "appimage", "flatpak"];

impl Category {
    /// Picks a category from the file extension of `path`.
    pub fn detect(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Category::Other;
        };
        let ext = ext.to_ascii_lowercase();
        let table: [(&[&str], Category); 6] = [
            (VIDEOS, Category::Videos),
            (IMAGES, Category::Images),
            (AUDIO, Category::Audio),
            (DOCUMENTS, Category::Documents),
            (ARCHIVES, Category::Archives),
            (PROGRAMS, Category::Programs),
        ];
        table
            .iter()
            .find(|(exts, _)| exts.contains(&ext.as_str()))
            .map(|(_, category)| *category)
            .unwrap_or(Category::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_extension_case_insensitively() {
        assert_eq!(Category::detect(Path::new("a/b/movie.MKV")), Category::Videos);
        assert_eq!(Category::detect(Path::new("song.flac")), Category::Audio);
        assert_eq!(Category::detect(Path::new("backup.tar.gz")), Category::Archives);
        assert_eq!(Category::detect(Path::new("setup.exe")), Category::Programs);
    }

    #[test]
    fn unknown_or_missing_extension_is_other() {
        assert_eq!(Category::detect(Path::new("README")), Category::Other);
        assert_eq!(Category::detect(Path::new("data.bin")), Category::Other);
    }
}
