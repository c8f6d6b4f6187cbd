use crate::{Error, EuConfig};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Fixed name of the raw artifact within the data directory.
pub const RAW_NAME: &str = "data.json";

/// Download the substance export verbatim to `<dir>/data.json`,
/// overwriting any previous copy.
pub async fn fetch(
    client: &reqwest::Client,
    config: &EuConfig,
    dir: &Path,
) -> Result<PathBuf, Error> {
    let path = dir.join(RAW_NAME);
    if let Err(err) = download(client, config, &path).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(err);
    }
    Ok(path)
}

async fn download(client: &reqwest::Client, config: &EuConfig, dest: &Path) -> Result<(), Error> {
    let mut response = client
        .get(config.url.clone())
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
