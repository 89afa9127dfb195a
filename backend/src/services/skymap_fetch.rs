//! Turns a [`SkymapSource`] into a [`Skymap`].
//!
//! Remote FITS files are downloaded with reqwest; inline FITS data is base64
//! decoded. Cones and polygons are rasterized locally.

use std::time::Duration;

use base64::Engine;

use crate::api::{Skymap, SkymapSource};
use crate::config::SkymapSettings;
use crate::models::fits;
use crate::models::skymap::{SkymapError, SkymapResult};

fn fetch_err(msg: impl Into<String>) -> SkymapError {
    SkymapError::Fetch(msg.into())
}

#[derive(Clone)]
pub struct SkymapLoader {
    client: reqwest::Client,
    max_bytes: usize,
    allow_local_files: bool,
}

impl SkymapLoader {
    pub fn new(settings: &SkymapSettings) -> SkymapResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| fetch_err(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_bytes: settings.max_bytes,
            allow_local_files: settings.allow_local_files,
        })
    }

    /// Build the skymap described by `source`.
    ///
    /// Every map is validated and rescaled to unit total probability, so a
    /// malformed map fails here rather than in the tiling job.
    pub async fn load(&self, source: &SkymapSource) -> SkymapResult<Skymap> {
        let max_bytes = self.max_bytes;
        match source {
            SkymapSource::Moc {
                localization_name,
                uniq,
                probdensity,
            } => {
                let skymap = Skymap::new(localization_name.clone(), uniq.clone(), probdensity.clone())?;
                blocking(move || checked(skymap)).await
            }
            SkymapSource::Cone { ra, dec, error } => {
                let (ra, dec, error) = (*ra, *dec, *error);
                blocking(move || Skymap::from_cone(ra, dec, error).and_then(checked)).await
            }
            SkymapSource::Polygon {
                localization_name,
                polygon,
            } => {
                let (name, polygon) = (localization_name.clone(), polygon.clone());
                blocking(move || Skymap::from_polygon(name, &polygon).and_then(checked)).await
            }
            SkymapSource::Fits {
                localization_name,
                data,
            } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| SkymapError::Fits(format!("invalid base64: {e}")))?;
                self.check_size(bytes.len())?;
                let name = localization_name.clone();
                blocking(move || fits::parse_skymap(&name, &bytes, max_bytes).and_then(checked)).await
            }
            SkymapSource::Url { url, .. } => {
                let name = source.localization_name();
                let bytes = self.fetch(url).await?;
                blocking(move || fits::parse_skymap(&name, &bytes, max_bytes).and_then(checked)).await
            }
        }
    }

    fn check_size(&self, len: usize) -> SkymapResult<()> {
        if len > self.max_bytes {
            return Err(fetch_err(format!(
                "skymap is {len} bytes, limit is {}",
                self.max_bytes
            )));
        }
        Ok(())
    }

    async fn fetch(&self, url: &str) -> SkymapResult<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            if !self.allow_local_files {
                return Err(fetch_err("file:// skymaps are disabled"));
            }
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| fetch_err(format!("{path}: {e}")))?;
            self.check_size(bytes.len())?;
            return Ok(bytes);
        }

        log::info!("Downloading skymap {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("{url}: HTTP {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            self.check_size(len as usize)?;
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(format!("{url}: {e}")))?;
        self.check_size(bytes.len())?;
        log::debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

fn checked(skymap: Skymap) -> SkymapResult<Skymap> {
    skymap.validate()?;
    skymap.normalize()
}

async fn blocking<F>(f: F) -> SkymapResult<Skymap>
where
    F: FnOnce() -> SkymapResult<Skymap> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fetch_err(format!("skymap task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::healpix;

    fn loader(allow_local_files: bool, max_bytes: usize) -> SkymapLoader {
        SkymapLoader::new(&SkymapSettings {
            timeout_secs: 5,
            max_bytes,
            allow_local_files,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_moc_source_is_normalized() {
        let uniq: Vec<i64> = (0..12).map(|p| healpix::pixel_to_uniq(0, p).unwrap()).collect();
        let source = SkymapSource::Moc {
            localization_name: "moc".into(),
            uniq: uniq.clone(),
            probdensity: vec![0.1; 12],
        };
        let skymap = loader(false, 1024).load(&source).await.unwrap();
        assert_eq!(skymap.localization_name, "moc");
        assert_eq!(skymap.uniq, uniq);
        assert!((skymap.total_probability().unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_invalid_moc_is_rejected() {
        let overlapping = SkymapSource::Moc {
            localization_name: "overlap".into(),
            uniq: vec![4, 16],
            probdensity: vec![0.1, 0.1],
        };
        assert!(matches!(
            loader(false, 1024).load(&overlapping).await,
            Err(SkymapError::Overlap { .. })
        ));

        let negative = SkymapSource::Moc {
            localization_name: "negative".into(),
            uniq: vec![4, 5],
            probdensity: vec![0.1, -0.1],
        };
        assert!(matches!(
            loader(false, 1024).load(&negative).await,
            Err(SkymapError::InvalidDensity { .. })
        ));

        let bad_uniq = SkymapSource::Moc {
            localization_name: "bad".into(),
            uniq: vec![3],
            probdensity: vec![0.1],
        };
        assert!(loader(false, 1024).load(&bad_uniq).await.is_err());

        let zero = SkymapSource::Moc {
            localization_name: "zero".into(),
            uniq: vec![4],
            probdensity: vec![0.0],
        };
        assert!(matches!(
            loader(false, 1024).load(&zero).await,
            Err(SkymapError::ZeroProbability)
        ));
    }

    #[tokio::test]
    async fn test_cone_source_is_named_after_position() {
        let source = SkymapSource::Cone { ra: 10.0, dec: -5.0, error: 2.0 };
        let skymap = loader(false, 1024).load(&source).await.unwrap();
        assert_eq!(skymap.localization_name, "10.00000_-5.00000_2.00000");
        assert!((skymap.total_probability().unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_local_files_are_opt_in() {
        let source = SkymapSource::Url {
            url: "file:///nonexistent/map.fits".into(),
            localization_name: None,
        };
        let err = loader(false, 1024).load(&source).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));

        let err = loader(true, 1024).load(&source).await.unwrap_err();
        assert!(matches!(err, SkymapError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_inline_fits_size_limit_and_base64() {
        let source = SkymapSource::Fits {
            localization_name: "inline".into(),
            data: "!!!".into(),
        };
        assert!(matches!(
            loader(false, 1024).load(&source).await,
            Err(SkymapError::Fits(_))
        ));

        let source = SkymapSource::Fits {
            localization_name: "inline".into(),
            data: base64::engine::general_purpose::STANDARD.encode(vec![0u8; 64]),
        };
        assert!(matches!(
            loader(false, 16).load(&source).await,
            Err(SkymapError::Fetch(_))
        ));
    }
}
