//! REST endpoint handlers

pub mod apps;
pub mod files;
pub mod media;
pub mod recording;
pub mod sessions;
pub mod system;

use crate::error::{Error, Result};
use axum::extract::Multipart;
use std::path::PathBuf;

/// One file pulled out of a multipart request, staged on disk.
pub(crate) struct UploadedFile {
    pub path: PathBuf,
    pub file_name: String,
    // Owns the staging directory; dropping it removes the file.
    _dir: tempfile::TempDir,
}

/// Collected multipart request: staged files plus text fields.
pub(crate) struct UploadForm {
    pub files: Vec<UploadedFile>,
    pub fields: std::collections::HashMap<String, String>,
}

/// Drain a multipart body, staging every file part under a scratch
/// directory that lives as long as the returned form.
pub(crate) async fn read_multipart(mut multipart: Multipart) -> Result<UploadForm> {
    let mut files = Vec::new();
    let mut fields = std::collections::HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Protocol(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(sanitize_file_name);
        match file_name {
            Some(file_name) => {
                let dir = tempfile::Builder::new().prefix("simbridge-upload-").tempdir()?;
                let path = dir.path().join(&file_name);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Protocol(format!("upload read failed: {}", e)))?;
                if data.is_empty() {
                    return Err(Error::Protocol(format!("empty upload: {}", file_name)));
                }
                std::fs::write(&path, &data)?;
                files.push(UploadedFile {
                    path,
                    file_name,
                    _dir: dir,
                });
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::Protocol(format!("bad form field {}: {}", name, e)))?;
                fields.insert(name, value);
            }
        }
    }
    Ok(UploadForm { files, fields })
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '\0')
        .collect();
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_stripped_of_paths() {
        assert_eq!(sanitize_file_name("/etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("dir\\app.ipa"), "app.ipa");
        assert_eq!(sanitize_file_name("app.ipa"), "app.ipa");
        assert_eq!(sanitize_file_name(""), "upload.bin");
    }
}
