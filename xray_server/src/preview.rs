use crate::config::PreviewConfig;
use std::{
    io,
    path::PathBuf,
    time::{Duration, SystemTime},
};

const DEFAULT_STEM: &str = "upload";

/// Uploaded images kept for the HTML report, served under `url_prefix`.
/// Retention is bounded by age and by file count.
#[derive(Debug, Clone)]
pub struct PreviewStore {
    dir: PathBuf,
    url_prefix: String,
    max_files: usize,
    max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct SavedPreview {
    pub path: PathBuf,
    pub url: String,
}

impl PreviewStore {
    pub fn new(dir: PathBuf, url_prefix: &str, config: &PreviewConfig) -> Self {
        Self {
            dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
            max_files: config.max_files,
            max_age: Duration::from_secs(config.max_age_secs),
        }
    }

    /// Writes the image under a random identifier plus the sanitised original
    /// name, then applies the retention policy. The extension comes from the
    /// detected image format, never from the client, so the file is always
    /// served with an image content type.
    pub fn save(&self, original_name: Option<&str>, image_data: &[u8]) -> io::Result<SavedPreview> {
        let extension = image_extension(image_data)?;
        std::fs::create_dir_all(&self.dir)?;

        let file_name = format!(
            "{:016x}_{}.{}",
            rand::random::<u64>(),
            sanitize_file_stem(original_name.unwrap_or(DEFAULT_STEM)),
            extension
        );
        let path = self.dir.join(&file_name);
        std::fs::write(&path, image_data)?;

        let removed = self.sweep(SystemTime::now())?;
        if removed > 0 {
            tracing::info!("Evicted {} preview images from {:?}", removed, self.dir);
        }

        Ok(SavedPreview {
            url: format!("{}/{}", self.url_prefix, file_name),
            path,
        })
    }

    /// Removes previews older than the maximum age, then the oldest ones
    /// beyond the file cap. Returns how many files were removed.
    pub fn sweep(&self, now: SystemTime) -> io::Result<usize> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, entry.path()));
        }

        // newest first
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut removed = 0;
        for (index, (modified, path)) in entries.iter().enumerate() {
            let age = now.duration_since(*modified).unwrap_or_default();
            if age > self.max_age || index >= self.max_files {
                match std::fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(removed)
    }
}

fn image_extension(image_data: &[u8]) -> io::Result<&'static str> {
    let format = image::guess_format(image_data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    format.extensions_str().first().copied().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no file extension for {:?}", format),
        )
    })
}

/// File name without its extension, reduced to ASCII alphanumerics, dashes
/// and underscores.
pub fn sanitize_file_stem(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');

    if cleaned.is_empty() {
        DEFAULT_STEM.to_string()
    } else {
        cleaned.chars().take(100).collect()
    }
}
