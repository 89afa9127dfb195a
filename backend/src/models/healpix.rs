//! HEALPix pixel arithmetic in the NESTED scheme.
//!
//! Localization tiles are stored as inclusive ranges of nested indices at
//! [`MAX_ORDER`]. A pixel at a coarser order covers `4^(MAX_ORDER - order)`
//! consecutive indices at that depth, so tiles of any resolution can be
//! compared with one another by plain integer range overlap.
//!
//! NUNIQ packs `(order, ipix)` into a single integer as `4 * 4^order + ipix`.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

/// Deepest order used for the range encoding of tiles.
pub const MAX_ORDER: u8 = 29;

/// Solid angle of one pixel at [`MAX_ORDER`], in steradians.
pub const PIXEL_AREA: f64 = 4.0 * PI / (12u64 << 58) as f64;

/// Square degrees per steradian.
pub const SR_TO_DEG2: f64 = (180.0 / PI) * (180.0 / PI);

const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Errors raised by pixel arithmetic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HealpixError {
    #[error("invalid NUNIQ index {0}")]
    InvalidUniq(i64),
    #[error("order {0} exceeds the maximum depth of 29")]
    OrderOutOfRange(u8),
    #[error("pixel {ipix} out of range at order {order}")]
    PixelOutOfRange { order: u8, ipix: u64 },
    #[error("coordinate out of range: ra={ra}, dec={dec}")]
    InvalidCoordinate { ra: f64, dec: f64 },
    #[error("polygon needs at least 3 distinct vertices, got {0}")]
    DegeneratePolygon(usize),
}

pub type HealpixResult<T> = Result<T, HealpixError>;

pub fn nside(order: u8) -> u64 {
    1u64 << order
}

pub fn npix(order: u8) -> u64 {
    12u64 << (2 * order as u32)
}

/// Solid angle of one pixel at `order`, in steradians.
pub fn pixel_area(order: u8) -> f64 {
    4.0 * PI / npix(order) as f64
}

fn check_order(order: u8) -> HealpixResult<()> {
    if order > MAX_ORDER {
        return Err(HealpixError::OrderOutOfRange(order));
    }
    Ok(())
}

fn check_pixel(order: u8, ipix: u64) -> HealpixResult<()> {
    check_order(order)?;
    if ipix >= npix(order) {
        return Err(HealpixError::PixelOutOfRange { order, ipix });
    }
    Ok(())
}

/// Decode a NUNIQ index into `(order, ipix)`.
pub fn uniq_to_pixel(uniq: i64) -> HealpixResult<(u8, u64)> {
    if uniq < 4 {
        return Err(HealpixError::InvalidUniq(uniq));
    }
    let value = uniq as u64;
    let log2 = 63 - value.leading_zeros();
    let order = (log2 / 2 - 1) as u8;
    if order > MAX_ORDER {
        return Err(HealpixError::InvalidUniq(uniq));
    }
    let ipix = value - (4u64 << (2 * order as u32));
    Ok((order, ipix))
}

/// Encode `(order, ipix)` as a NUNIQ index.
pub fn pixel_to_uniq(order: u8, ipix: u64) -> HealpixResult<i64> {
    check_pixel(order, ipix)?;
    Ok(((4u64 << (2 * order as u32)) + ipix) as i64)
}

/// Inclusive range of depth-29 nested indices covered by a pixel.
pub fn nested_range(order: u8, ipix: u64) -> HealpixResult<(i64, i64)> {
    check_pixel(order, ipix)?;
    let shift = 2 * (MAX_ORDER - order) as u32;
    let lo = ipix << shift;
    let hi = ((ipix + 1) << shift) - 1;
    Ok((lo as i64, hi as i64))
}

/// Inclusive depth-29 range covered by a NUNIQ pixel.
pub fn uniq_to_range(uniq: i64) -> HealpixResult<(i64, i64)> {
    let (order, ipix) = uniq_to_pixel(uniq)?;
    nested_range(order, ipix)
}

/// Solid angle (steradians) of an inclusive depth-29 range.
pub fn range_area(lo: i64, hi: i64) -> f64 {
    (hi - lo + 1) as f64 * PIXEL_AREA
}

/// The four children of a pixel at `order + 1`.
pub fn children(ipix: u64) -> [u64; 4] {
    let base = ipix << 2;
    [base, base + 1, base + 2, base + 3]
}

/// Index of the ancestor of `ipix` (at `order`) at the coarser `target` order.
pub fn ancestor(order: u8, ipix: u64, target: u8) -> u64 {
    debug_assert!(target <= order);
    ipix >> (2 * (order - target) as u32)
}

fn spread_bits(value: u64) -> u64 {
    let mut out = 0u64;
    for bit in 0..32 {
        out |= ((value >> bit) & 1) << (2 * bit);
    }
    out
}

fn compact_bits(value: u64) -> u64 {
    let mut out = 0u64;
    for bit in 0..32 {
        out |= ((value >> (2 * bit)) & 1) << bit;
    }
    out
}

/// Nested pixel index containing the sky position `(ra, dec)` in degrees.
pub fn ang_to_pixel(order: u8, ra: f64, dec: f64) -> HealpixResult<u64> {
    check_order(order)?;
    if !ra.is_finite() || !dec.is_finite() || dec.abs() > 90.0 {
        return Err(HealpixError::InvalidCoordinate { ra, dec });
    }
    let phi = ra.to_radians().rem_euclid(TAU);
    let z = dec.to_radians().sin();
    Ok(zphi_to_nested(order, z, phi))
}

fn zphi_to_nested(order: u8, z: f64, phi: f64) -> u64 {
    let nside = nside(order) as i64;
    let nside_f = nside as f64;
    let za = z.abs();
    let tt = (phi / FRAC_PI_2).rem_euclid(4.0);

    let (face, ix, iy) = if za <= 2.0 / 3.0 {
        // Equatorial region: index of the ascending and descending edge lines.
        let temp1 = nside_f * (0.5 + tt);
        let temp2 = nside_f * (z * 0.75);
        let jp = (temp1 - temp2) as i64;
        let jm = (temp1 + temp2) as i64;
        let ifp = jp >> order;
        let ifm = jm >> order;
        let face = if ifp == ifm {
            ifp | 4
        } else if ifp < ifm {
            ifp
        } else {
            ifm + 8
        };
        let ix = jm & (nside - 1);
        let iy = nside - (jp & (nside - 1)) - 1;
        (face, ix, iy)
    } else {
        let ntt = (tt as i64).min(3);
        let tp = tt - ntt as f64;
        let tmp = nside_f * (3.0 * (1.0 - za)).sqrt();
        let jp = ((tp * tmp) as i64).min(nside - 1);
        let jm = (((1.0 - tp) * tmp) as i64).min(nside - 1);
        if z >= 0.0 {
            (ntt, nside - jm - 1, nside - jp - 1)
        } else {
            (ntt + 8, jp, jm)
        }
    };

    ((face as u64) << (2 * order as u32)) + spread_bits(ix as u64) + (spread_bits(iy as u64) << 1)
}

fn nested_to_fxy(order: u8, ipix: u64) -> (usize, u64, u64) {
    let bits = 2 * order as u32;
    let face = (ipix >> bits) as usize;
    let rem = ipix & ((1u64 << bits) - 1);
    (face, compact_bits(rem), compact_bits(rem >> 1))
}

/// Continuous face coordinates (`x`, `y` in `[0, 1]`) to `(z, phi)`.
fn fxy_to_zphi(face: usize, x: f64, y: f64) -> (f64, f64) {
    let jr = JRLL[face] as f64 - x - y;
    let (nr, z) = if jr < 1.0 {
        (jr, 1.0 - jr * jr / 3.0)
    } else if jr > 3.0 {
        let nr = 4.0 - jr;
        (nr, nr * nr / 3.0 - 1.0)
    } else {
        (1.0, (2.0 - jr) * 2.0 / 3.0)
    };

    let mut tmp = JPLL[face] as f64 * nr + x - y;
    if tmp < 0.0 {
        tmp += 8.0;
    }
    if tmp >= 8.0 {
        tmp -= 8.0;
    }
    let phi = if nr < 1e-15 { 0.0 } else { FRAC_PI_4 * tmp / nr };
    (z, phi)
}

fn zphi_to_radec(z: f64, phi: f64) -> (f64, f64) {
    let dec = z.clamp(-1.0, 1.0).asin().to_degrees();
    let ra = phi.to_degrees().rem_euclid(360.0);
    (ra, dec)
}

/// Sky position `(ra, dec)` in degrees of a pixel center.
pub fn pixel_center(order: u8, ipix: u64) -> HealpixResult<(f64, f64)> {
    check_pixel(order, ipix)?;
    let (face, ix, iy) = nested_to_fxy(order, ipix);
    let n = nside(order) as f64;
    let (z, phi) = fxy_to_zphi(face, (ix as f64 + 0.5) / n, (iy as f64 + 0.5) / n);
    Ok(zphi_to_radec(z, phi))
}

/// The four vertices of a pixel, walked in a consistent cyclic order.
pub fn pixel_corners(order: u8, ipix: u64) -> HealpixResult<[(f64, f64); 4]> {
    check_pixel(order, ipix)?;
    let (face, ix, iy) = nested_to_fxy(order, ipix);
    let n = nside(order) as f64;
    let (x0, y0) = (ix as f64 / n, iy as f64 / n);
    let (x1, y1) = ((ix + 1) as f64 / n, (iy + 1) as f64 / n);
    let corner = |x: f64, y: f64| {
        let (z, phi) = fxy_to_zphi(face, x, y);
        zphi_to_radec(z, phi)
    };
    Ok([corner(x1, y1), corner(x0, y1), corner(x0, y0), corner(x1, y0)])
}

/// Largest angular distance (degrees) from a pixel center to its vertices.
pub fn pixel_radius(order: u8, ipix: u64) -> HealpixResult<f64> {
    let (ra, dec) = pixel_center(order, ipix)?;
    let corners = pixel_corners(order, ipix)?;
    Ok(corners
        .iter()
        .map(|&(cra, cdec)| angular_distance(ra, dec, cra, cdec))
        .fold(0.0, f64::max))
}

/// Unit vector of a sky position given in degrees.
pub fn to_vector(ra: f64, dec: f64) -> [f64; 3] {
    let (ra, dec) = (ra.to_radians(), dec.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn vector_angle(a: [f64; 3], b: [f64; 3]) -> f64 {
    cross_norm(a, b).atan2(dot(a, b)).to_degrees()
}

fn cross_norm(a: [f64; 3], b: [f64; 3]) -> f64 {
    let c = cross(a, b);
    dot(c, c).sqrt()
}

/// Great-circle distance in degrees between two sky positions.
pub fn angular_distance(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    vector_angle(to_vector(ra1, dec1), to_vector(ra2, dec2))
}

/// Convex polygon on the sphere, smaller than a hemisphere.
#[derive(Debug, Clone)]
pub struct SphericalPolygon {
    vertices: Vec<[f64; 3]>,
    orientation: f64,
    cap_center: [f64; 3],
    cap_radius: f64,
}

impl SphericalPolygon {
    /// Build a polygon from `(ra, dec)` vertices in degrees, in either winding.
    pub fn new(vertices: &[(f64, f64)]) -> HealpixResult<Self> {
        for &(ra, dec) in vertices {
            if !ra.is_finite() || !dec.is_finite() || dec.abs() > 90.0 {
                return Err(HealpixError::InvalidCoordinate { ra, dec });
            }
        }

        let mut points: Vec<[f64; 3]> = vertices.iter().map(|&(ra, dec)| to_vector(ra, dec)).collect();
        // Drop a closing vertex that repeats the first one.
        if points.len() > 1 && vector_angle(points[0], points[points.len() - 1]) < 1e-12 {
            points.pop();
        }
        if points.len() < 3 {
            return Err(HealpixError::DegeneratePolygon(points.len()));
        }

        let mut sum = [0.0; 3];
        for p in &points {
            sum = [sum[0] + p[0], sum[1] + p[1], sum[2] + p[2]];
        }
        let norm = dot(sum, sum).sqrt();
        if norm < 1e-12 {
            return Err(HealpixError::DegeneratePolygon(points.len()));
        }
        let cap_center = [sum[0] / norm, sum[1] / norm, sum[2] / norm];
        let cap_radius = points
            .iter()
            .map(|&p| vector_angle(cap_center, p))
            .fold(0.0, f64::max);
        let orientation = dot(cross(points[0], points[1]), cap_center).signum();

        Ok(Self {
            vertices: points,
            orientation,
            cap_center,
            cap_radius,
        })
    }

    pub fn contains(&self, ra: f64, dec: f64) -> bool {
        let p = to_vector(ra, dec);
        let n = self.vertices.len();
        (0..n).all(|i| {
            let edge = cross(self.vertices[i], self.vertices[(i + 1) % n]);
            dot(edge, p) * self.orientation >= -1e-15
        })
    }

    /// Angular distance in degrees from the bounding-cap center to a position.
    pub fn distance_to_cap_center(&self, ra: f64, dec: f64) -> f64 {
        vector_angle(self.cap_center, to_vector(ra, dec))
    }

    pub fn cap_radius(&self) -> f64 {
        self.cap_radius
    }

    /// `(ra, dec)` of the bounding-cap center.
    pub fn cap_center(&self) -> (f64, f64) {
        let [x, y, z] = self.cap_center;
        zphi_to_radec(z, y.atan2(x))
    }
}

/// Pixels at `order` whose centers fall inside `polygon`.
///
/// Walks the hierarchy from the base pixels and prunes every subtree whose
/// bounding circle misses the polygon's bounding cap. A polygon too small to
/// contain any pixel center yields the single pixel under its cap center.
pub fn polygon_pixels(polygon: &SphericalPolygon, order: u8) -> HealpixResult<Vec<u64>> {
    check_order(order)?;
    let mut out = Vec::new();
    let mut stack: Vec<(u8, u64)> = (0..12u64).rev().map(|p| (0u8, p)).collect();

    while let Some((level, ipix)) = stack.pop() {
        let (ra, dec) = pixel_center(level, ipix)?;
        let reach = polygon.cap_radius() + 1.1 * pixel_radius(level, ipix)?;
        if polygon.distance_to_cap_center(ra, dec) > reach {
            continue;
        }
        if level == order {
            if polygon.contains(ra, dec) {
                out.push(ipix);
            }
            continue;
        }
        for child in children(ipix).into_iter().rev() {
            stack.push((level + 1, child));
        }
    }

    if out.is_empty() {
        let (ra, dec) = polygon.cap_center();
        out.push(ang_to_pixel(order, ra, dec)?);
    }
    out.sort_unstable();
    Ok(out)
}

/// Convert pixels at `order` into merged, sorted depth-29 ranges.
pub fn pixels_to_ranges(order: u8, pixels: &[u64]) -> HealpixResult<Vec<(i64, i64)>> {
    let mut ranges = pixels
        .iter()
        .map(|&p| nested_range(order, p))
        .collect::<HealpixResult<Vec<_>>>()?;
    Ok(merge_ranges(&mut ranges))
}

/// Sort inclusive ranges and merge the ones that overlap or touch.
pub fn merge_ranges(ranges: &mut [(i64, i64)]) -> Vec<(i64, i64)> {
    ranges.sort_unstable();
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(ranges.len());
    for &(lo, hi) in ranges.iter() {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

#[cfg(test)]
#[path = "healpix_tests.rs"]
mod healpix_tests;
