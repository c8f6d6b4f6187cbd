//! Downloads the EPPO full-codes export: pick the "XML Full" dataset out
//! of the upstream dataset list, download its ZIP, and extract the XML
//! payload into the data directory.

use crate::{EppoConfig, Error};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Transient download target; deleted once the payload is extracted.
pub const ZIP_NAME: &str = "fullcodes.zip";

const API_KEY_HEADER: &str = "apikey";

pub async fn fetch(
    client: &reqwest::Client,
    config: &EppoConfig,
    dir: &Path,
) -> Result<PathBuf, Error> {
    let datasets: serde_json::Value = client
        .get(config.api_url.clone())
        .header(API_KEY_HEADER, &config.api_key)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let datasets = datasets
        .as_array()
        .ok_or_else(|| Error::Upstream("dataset list is not a JSON array".to_string()))?;

    let descriptor = select_dataset(datasets)
        .ok_or_else(|| Error::Upstream("no XML Full dataset in upstream list".to_string()))?;
    let url = descriptor
        .get("url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| Error::Upstream("dataset descriptor has no url".to_string()))?;

    let zip_path = dir.join(ZIP_NAME);
    tracing::debug!(url, zip = %zip_path.display(), "downloading dataset archive");
    if let Err(err) = download(client, config, url, &zip_path).await {
        let _ = tokio::fs::remove_file(&zip_path).await;
        return Err(err);
    }

    let extracted = {
        let (zip_path, dir) = (zip_path.clone(), dir.to_owned());
        tokio::task::spawn_blocking(move || extract_xml(&zip_path, &dir))
            .await
            .map_err(|err| Error::Internal(format!("extract task panicked: {err}")))?
    };
    let _ = tokio::fs::remove_file(&zip_path).await;
    extracted
}

/// Prefer the descriptor labelled exactly "XML Full"; fall back to the
/// first descriptor whose stringified values contain "xmlfull". When
/// several match, the first returned by the upstream wins.
fn select_dataset(datasets: &[serde_json::Value]) -> Option<&serde_json::Value> {
    datasets
        .iter()
        .find(|d| {
            d.as_object()
                .map_or(false, |m| m.values().any(|v| v.as_str() == Some("XML Full")))
        })
        .or_else(|| {
            datasets.iter().find(|d| {
                d.as_object().map_or(false, |m| {
                    m.values()
                        .any(|v| v.to_string().to_lowercase().contains("xmlfull"))
                })
            })
        })
}

async fn download(
    client: &reqwest::Client,
    config: &EppoConfig,
    url: &str,
    dest: &Path,
) -> Result<(), Error> {
    let mut response = client
        .get(url)
        .header(API_KEY_HEADER, &config.api_key)
        .send()
        .await?
        .error_for_status()?;

    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Extract the first `*.xml` entry (case-insensitive) to the data
/// directory under the entry's own base name.
fn extract_xml(zip_path: &Path, dir: &Path) -> Result<PathBuf, Error> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut found = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.name().to_ascii_lowercase().ends_with(".xml") {
            found = Some(i);
            break;
        }
    }
    let index =
        found.ok_or_else(|| Error::Upstream("archive contains no .xml entry".to_string()))?;

    let mut entry = archive.by_index(index)?;
    let basename = Path::new(entry.name())
        .file_name()
        .map(std::ffi::OsStr::to_owned)
        .ok_or_else(|| Error::Upstream("archive entry has no file name".to_string()))?;
    let out_path = dir.join(basename);

    let mut out = std::fs::File::create(&out_path)?;
    if let Err(err) = std::io::copy(&mut entry, &mut out) {
        drop(out);
        let _ = std::fs::remove_file(&out_path);
        return Err(err.into());
    }
    tracing::debug!(entry = entry.name(), out = %out_path.display(), "extracted XML payload");
    Ok(out_path)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn the_labelled_dataset_wins_over_the_fallback() {
        let datasets = vec![
            json!({"label": "Datacodes", "url": "https://x/codes"}),
            json!({"label": "xmlfull legacy", "url": "https://x/legacy"}),
            json!({"label": "XML Full", "url": "https://x/full"}),
        ];
        let picked = select_dataset(&datasets).unwrap();
        assert_eq!(picked["url"], "https://x/full");
    }

    #[test]
    fn fallback_matches_stringified_values_case_insensitively() {
        let datasets = vec![
            json!({"label": "Datacodes", "url": "https://x/codes"}),
            json!({"label": "Full export", "format": "XmlFull", "url": "https://x/full"}),
        ];
        let picked = select_dataset(&datasets).unwrap();
        assert_eq!(picked["url"], "https://x/full");

        let datasets = vec![json!({"datasetId": "xmlfull_v2", "url": "https://x/v2"})];
        let picked = select_dataset(&datasets).unwrap();
        assert_eq!(picked["url"], "https://x/v2");

        assert!(select_dataset(&[json!({"label": "Datacodes"})]).is_none());
    }

    #[test]
    fn fallback_ignores_field_names() {
        // Only values are stringified; a key containing the marker does
        // not make its descriptor a match.
        let datasets = vec![json!({"xmlFullFlag": false, "url": "https://x/flagged"})];
        assert!(select_dataset(&datasets).is_none());
    }

    #[test]
    fn extraction_takes_the_first_xml_entry_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join(ZIP_NAME);

        let mut writer = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
        let options = zip::write::FileOptions::default();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"ignore me").unwrap();
        writer.start_file("export/codes.XML", options).unwrap();
        writer.write_all(b"<codes/>").unwrap();
        writer.finish().unwrap();

        let out = extract_xml(&zip_path, dir.path()).unwrap();
        assert_eq!(out, dir.path().join("codes.XML"));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "<codes/>");
    }

    #[test]
    fn archives_without_xml_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join(ZIP_NAME);

        let mut writer = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
        writer
            .start_file("readme.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"no xml here").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            extract_xml(&zip_path, dir.path()),
            Err(Error::Upstream(_))
        ));
    }
}
