use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::TempPath;

const STAGING_PREFIX: &str = "xray-upload-";

/// Filesystem copy of one upload. The file is removed when this value is
/// dropped, whichever way the request ends.
#[derive(Debug)]
pub struct StagedUpload {
    path: TempPath,
}

impl StagedUpload {
    pub fn stage(dir: &Path, image_data: &[u8], extension: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let suffix = format!(".{}", extension);
        let mut file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&suffix)
            .tempfile_in(dir)?;
        file.write_all(image_data)?;
        file.flush()?;

        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

/// Extension for the staged copy, taken from the uploaded filename when it is
/// a known image type.
pub fn staging_extension(filename: Option<&str>) -> &'static str {
    let extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "jpg",
        Some("bmp") => "bmp",
        Some("tif") | Some("tiff") => "tiff",
        _ => "png",
    }
}
