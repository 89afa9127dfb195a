//! Multi-order probability skymaps.
//!
//! A [`Skymap`] is a list of NUNIQ pixels with a probability density (per
//! steradian) for each. Maps may mix orders freely; the pixels must not
//! overlap. Besides FITS files (see [`super::fits`]) maps can be built from a
//! Gaussian error circle or from a uniform convex polygon. Both generated
//! kinds cover the full sphere, refining only where the density is non-zero.

use serde::{Deserialize, Serialize};

use super::healpix::{self, HealpixError, SphericalPolygon};

/// Finest order used when rasterizing error circles and polygons.
pub const MAX_GENERATED_ORDER: u8 = 10;
/// Coarsest order used when rasterizing error circles and polygons.
pub const MIN_GENERATED_ORDER: u8 = 4;

/// Gaussian tail beyond which error-circle pixels are left unrefined.
const CONE_SIGMA_CUTOFF: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum SkymapError {
    #[error(transparent)]
    Healpix(#[from] HealpixError),
    #[error("uniq and probdensity lengths differ ({uniq} vs {probdensity})")]
    LengthMismatch { uniq: usize, probdensity: usize },
    #[error("skymap has no pixels")]
    Empty,
    #[error("invalid probability density {value} at uniq {uniq}")]
    InvalidDensity { uniq: i64, value: f64 },
    #[error("pixels {first} and {second} overlap")]
    Overlap { first: i64, second: i64 },
    #[error("skymap has zero total probability")]
    ZeroProbability,
    #[error("invalid error radius {0}")]
    InvalidRadius(f64),
    #[error("invalid FITS data: {0}")]
    Fits(String),
    #[error("failed to fetch skymap: {0}")]
    Fetch(String),
}

pub type SkymapResult<T> = Result<T, SkymapError>;

/// Named multi-order skymap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skymap {
    pub localization_name: String,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
}

/// Where a skymap comes from, as submitted by a client or read off a notice.
///
/// Deserialized untagged, so the field set selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkymapSource {
    /// Explicit multi-order pixels.
    Moc {
        localization_name: String,
        uniq: Vec<i64>,
        probdensity: Vec<f64>,
    },
    /// Uniform probability inside a convex polygon of `[ra, dec]` vertices.
    Polygon {
        localization_name: String,
        polygon: Vec<(f64, f64)>,
    },
    /// Gaussian error circle; `error` is the 1-sigma radius in degrees.
    Cone { ra: f64, dec: f64, error: f64 },
    /// Base64-encoded (optionally gzipped) FITS file.
    Fits {
        localization_name: String,
        data: String,
    },
    /// FITS file to download.
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        localization_name: Option<String>,
    },
}

impl SkymapSource {
    /// Name the resulting localization will be stored under.
    pub fn localization_name(&self) -> String {
        match self {
            SkymapSource::Moc { localization_name, .. }
            | SkymapSource::Polygon { localization_name, .. }
            | SkymapSource::Fits { localization_name, .. } => localization_name.clone(),
            SkymapSource::Cone { ra, dec, error } => cone_name(*ra, *dec, *error),
            SkymapSource::Url { url, localization_name } => localization_name
                .clone()
                .unwrap_or_else(|| url_basename(url)),
        }
    }
}

fn cone_name(ra: f64, dec: f64, error: f64) -> String {
    format!("{ra:.5}_{dec:.5}_{error:.5}")
}

/// Last path segment of a URL, without query string or fragment.
pub fn url_basename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    // GraceDB appends a file version: `bayestar.fits.gz,0`.
    match name.rsplit_once(',') {
        Some((stem, version)) if !version.is_empty() && version.chars().all(|c| c.is_ascii_digit()) => {
            stem.to_string()
        }
        _ => name.to_string(),
    }
}

impl Skymap {
    pub fn new(
        localization_name: impl Into<String>,
        uniq: Vec<i64>,
        probdensity: Vec<f64>,
    ) -> SkymapResult<Self> {
        if uniq.len() != probdensity.len() {
            return Err(SkymapError::LengthMismatch {
                uniq: uniq.len(),
                probdensity: probdensity.len(),
            });
        }
        if uniq.is_empty() {
            return Err(SkymapError::Empty);
        }
        Ok(Self {
            localization_name: localization_name.into(),
            uniq,
            probdensity,
        })
    }

    pub fn len(&self) -> usize {
        self.uniq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uniq.is_empty()
    }

    /// Check densities and pixel layout, returning the depth-29 range of
    /// every pixel in input order.
    pub fn validate(&self) -> SkymapResult<Vec<(i64, i64)>> {
        let mut ranges = Vec::with_capacity(self.uniq.len());
        for (&uniq, &value) in self.uniq.iter().zip(&self.probdensity) {
            if !value.is_finite() || value < 0.0 {
                return Err(SkymapError::InvalidDensity { uniq, value });
            }
            ranges.push(healpix::uniq_to_range(uniq)?);
        }

        let mut order: Vec<usize> = (0..ranges.len()).collect();
        order.sort_unstable_by_key(|&i| ranges[i].0);
        for pair in order.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if ranges[next].0 <= ranges[prev].1 {
                return Err(SkymapError::Overlap {
                    first: self.uniq[prev],
                    second: self.uniq[next],
                });
            }
        }
        Ok(ranges)
    }

    /// Integrated probability over all pixels.
    pub fn total_probability(&self) -> SkymapResult<f64> {
        let mut total = 0.0;
        for (&uniq, &density) in self.uniq.iter().zip(&self.probdensity) {
            let (lo, hi) = healpix::uniq_to_range(uniq)?;
            total += density * healpix::range_area(lo, hi);
        }
        Ok(total)
    }

    /// Rescale densities so the map integrates to one.
    pub fn normalize(mut self) -> SkymapResult<Self> {
        let total = self.total_probability()?;
        if !(total.is_finite() && total > 0.0) {
            return Err(SkymapError::ZeroProbability);
        }
        for density in &mut self.probdensity {
            *density /= total;
        }
        Ok(self)
    }

    /// Build a multi-order map from a single-resolution NESTED probability
    /// array (probability per pixel, not density).
    pub fn from_nested(localization_name: impl Into<String>, prob: &[f64]) -> SkymapResult<Self> {
        let order = (0..=healpix::MAX_ORDER)
            .find(|&o| healpix::npix(o) == prob.len() as u64)
            .ok_or_else(|| SkymapError::Fits(format!("{} is not a valid HEALPix pixel count", prob.len())))?;
        let area = healpix::pixel_area(order);
        let uniq = (0..prob.len() as u64)
            .map(|ipix| healpix::pixel_to_uniq(order, ipix))
            .collect::<Result<Vec<_>, _>>()?;
        let probdensity = prob.iter().map(|p| p / area).collect();
        Self::new(localization_name, uniq, probdensity)
    }

    /// Gaussian error circle centered on `(ra, dec)` with 1-sigma radius
    /// `error`, all in degrees.
    pub fn from_cone(ra: f64, dec: f64, error: f64) -> SkymapResult<Self> {
        if !(error.is_finite() && error > 0.0) {
            return Err(SkymapError::InvalidRadius(error));
        }
        let center_pixel = healpix::ang_to_pixel(healpix::MAX_ORDER, ra, dec)? as i64;
        let order = order_for_resolution(error / 4.0);
        let reach = CONE_SIGMA_CUTOFF * error;

        let (uniq, probdensity) = refine_sky(
            order,
            |level, ipix| {
                let (cra, cdec) = healpix::pixel_center(level, ipix)?;
                let radius = healpix::pixel_radius(level, ipix)?;
                Ok(healpix::angular_distance(ra, dec, cra, cdec) - 1.1 * radius < reach)
            },
            |pra, pdec| {
                let d = healpix::angular_distance(ra, dec, pra, pdec) / error;
                (-0.5 * d * d).exp()
            },
        )?;

        let mut skymap = Self::new(cone_name(ra, dec, error), uniq, probdensity)?;
        skymap.ensure_mass_at(center_pixel)?;
        skymap.normalize()
    }

    /// Uniform probability over the pixels whose centers fall inside a convex
    /// polygon of `(ra, dec)` vertices.
    pub fn from_polygon(
        localization_name: impl Into<String>,
        vertices: &[(f64, f64)],
    ) -> SkymapResult<Self> {
        let polygon = SphericalPolygon::new(vertices)?;
        let (cra, cdec) = polygon.cap_center();
        let center_pixel = healpix::ang_to_pixel(healpix::MAX_ORDER, cra, cdec)? as i64;
        let order = order_for_resolution(polygon.cap_radius() / 8.0);

        let (uniq, probdensity) = refine_sky(
            order,
            |level, ipix| {
                let (pra, pdec) = healpix::pixel_center(level, ipix)?;
                let radius = healpix::pixel_radius(level, ipix)?;
                Ok(polygon.distance_to_cap_center(pra, pdec) - 1.1 * radius <= polygon.cap_radius())
            },
            |pra, pdec| if polygon.contains(pra, pdec) { 1.0 } else { 0.0 },
        )?;

        let mut skymap = Self::new(localization_name, uniq, probdensity)?;
        skymap.ensure_mass_at(center_pixel)?;
        skymap.normalize()
    }

    /// Give all the probability to the pixel containing `index` (a depth-29
    /// nested index) if the map is otherwise empty.
    fn ensure_mass_at(&mut self, index: i64) -> SkymapResult<()> {
        if self.probdensity.iter().any(|&d| d > 0.0) {
            return Ok(());
        }
        for (i, &uniq) in self.uniq.iter().enumerate() {
            let (lo, hi) = healpix::uniq_to_range(uniq)?;
            if lo <= index && index <= hi {
                self.probdensity[i] = 1.0;
                return Ok(());
            }
        }
        Err(SkymapError::ZeroProbability)
    }

    /// Probability per pixel on a single-resolution NESTED grid at `order`.
    pub fn flatten(&self, order: u8) -> SkymapResult<Vec<f64>> {
        let mut out = vec![0.0; healpix::npix(order) as usize];
        for (&uniq, &density) in self.uniq.iter().zip(&self.probdensity) {
            let (pixel_order, ipix) = healpix::uniq_to_pixel(uniq)?;
            if pixel_order >= order {
                let target = healpix::ancestor(pixel_order, ipix, order) as usize;
                out[target] += density * healpix::pixel_area(pixel_order);
            } else {
                let shift = 2 * (order - pixel_order) as u32;
                let first = (ipix << shift) as usize;
                let prob = density * healpix::pixel_area(order);
                for slot in &mut out[first..first + (1usize << shift)] {
                    *slot += prob;
                }
            }
        }
        Ok(out)
    }
}

/// Smallest order whose pixels are no wider than `target_deg`, clamped to
/// the generated-map range.
fn order_for_resolution(target_deg: f64) -> u8 {
    let base = healpix::pixel_area(0).sqrt().to_degrees();
    let order = (base / target_deg).log2().ceil();
    if !order.is_finite() {
        return MAX_GENERATED_ORDER;
    }
    order.clamp(MIN_GENERATED_ORDER as f64, MAX_GENERATED_ORDER as f64) as u8
}

/// Cover the sphere with pixels, splitting every pixel for which `refine`
/// holds down to `max_order`, and evaluate `density` at each leaf center.
fn refine_sky<R, D>(max_order: u8, mut refine: R, density: D) -> SkymapResult<(Vec<i64>, Vec<f64>)>
where
    R: FnMut(u8, u64) -> SkymapResult<bool>,
    D: Fn(f64, f64) -> f64,
{
    let mut uniq = Vec::new();
    let mut probdensity = Vec::new();
    let mut stack: Vec<(u8, u64)> = (0..12u64).rev().map(|p| (0u8, p)).collect();

    while let Some((level, ipix)) = stack.pop() {
        if level < max_order && refine(level, ipix)? {
            for child in healpix::children(ipix).into_iter().rev() {
                stack.push((level + 1, child));
            }
            continue;
        }
        let (ra, dec) = healpix::pixel_center(level, ipix)?;
        uniq.push(healpix::pixel_to_uniq(level, ipix)?);
        probdensity.push(density(ra, dec));
    }
    Ok((uniq, probdensity))
}
