//! Minimal reader for HEALPix skymaps stored as FITS binary tables.
//!
//! Supports the two layouts produced by gravitational-wave and gamma-ray
//! pipelines: multi-order maps (`ORDERING = NUNIQ`, columns `UNIQ` and
//! `PROBDENSITY`) and single-resolution maps (`ORDERING = NESTED`, column
//! `PROB`). Input may be gzip-compressed.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;

use super::skymap::{Skymap, SkymapError, SkymapResult};

const BLOCK: usize = 2880;
const CARD: usize = 80;

fn fits_err(msg: impl Into<String>) -> SkymapError {
    SkymapError::Fits(msg.into())
}

/// Parse a (possibly gzipped) FITS file into a skymap named `name`.
///
/// `max_bytes` caps the decompressed size of gzipped input.
pub fn parse_skymap(name: &str, bytes: &[u8], max_bytes: usize) -> SkymapResult<Skymap> {
    let data = maybe_gunzip(bytes, max_bytes)?;
    let table = find_healpix_table(&data)?;

    let ordering = table
        .header
        .string("ORDERING")
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_else(|| "NUNIQ".to_string());

    match ordering.as_str() {
        "NUNIQ" => {
            let uniq = table.column_i64("UNIQ")?;
            let mut probdensity = table.column_f64("PROBDENSITY")?;
            if let Some(unit) = table.unit("PROBDENSITY") {
                if unit.eq_ignore_ascii_case("deg-2") {
                    for value in &mut probdensity {
                        *value *= super::healpix::SR_TO_DEG2;
                    }
                }
            }
            Skymap::new(name, uniq, probdensity)
        }
        "NESTED" => {
            let prob = table.column_f64("PROB")?;
            Skymap::from_nested(name, &prob)
        }
        other => Err(fits_err(format!("unsupported ORDERING {other}"))),
    }
}

fn maybe_gunzip(bytes: &[u8], max_bytes: usize) -> SkymapResult<Vec<u8>> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .take(max_bytes as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| fits_err(format!("gzip: {e}")))?;
        if out.len() > max_bytes {
            return Err(SkymapError::Fetch(format!(
                "decompressed skymap exceeds {max_bytes} bytes"
            )));
        }
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Logical(bool),
}

#[derive(Debug, Default)]
struct Header {
    cards: HashMap<String, Value>,
}

impl Header {
    fn int(&self, key: &str) -> Option<i64> {
        match self.cards.get(key)? {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        match self.cards.get(key)? {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn require_int(&self, key: &str) -> SkymapResult<i64> {
        self.int(key)
            .ok_or_else(|| fits_err(format!("missing integer keyword {key}")))
    }

    /// A non-negative integer keyword as a size.
    fn require_size(&self, key: &str) -> SkymapResult<usize> {
        let value = self.require_int(key)?;
        usize::try_from(value).map_err(|_| fits_err(format!("{key} = {value} is out of range")))
    }

    fn size_or(&self, key: &str, default: usize) -> SkymapResult<usize> {
        if self.cards.contains_key(key) {
            self.require_size(key)
        } else {
            Ok(default)
        }
    }
}

fn parse_value(raw: &str) -> Option<Value> {
    let raw = raw.trim_start();
    if let Some(rest) = raw.strip_prefix('\'') {
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    out.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                out.push(c);
            }
        }
        return Some(Value::Str(out.trim_end().to_string()));
    }

    let token = raw.split('/').next().unwrap_or("").trim();
    match token {
        "" => None,
        "T" => Some(Value::Logical(true)),
        "F" => Some(Value::Logical(false)),
        _ => token
            .parse::<i64>()
            .map(Value::Int)
            .ok()
            .or_else(|| token.replace('D', "E").parse::<f64>().map(Value::Float).ok()),
    }
}

/// Read one header starting at `offset`; returns it and the offset of the
/// first data block.
fn read_header(data: &[u8], mut offset: usize) -> SkymapResult<(Header, usize)> {
    let mut header = Header::default();
    loop {
        if offset + BLOCK > data.len() {
            return Err(fits_err("truncated header"));
        }
        let block = &data[offset..offset + BLOCK];
        offset += BLOCK;

        for card in block.chunks(CARD) {
            if !card.is_ascii() {
                return Err(fits_err("non-ASCII header card"));
            }
            let card = std::str::from_utf8(card).map_err(|_| fits_err("non-ASCII header card"))?;
            let key = card[..8].trim_end();
            if key == "END" {
                return Ok((header, offset));
            }
            if &card[8..10] == "= " {
                if let Some(value) = parse_value(&card[10..]) {
                    header.cards.insert(key.to_string(), value);
                }
            }
        }
    }
}

fn overflow() -> SkymapError {
    fits_err("header sizes overflow")
}

fn data_size(header: &Header) -> SkymapResult<usize> {
    let naxis = header.size_or("NAXIS", 0)?;
    if naxis == 0 {
        return Ok(0);
    }
    let bitpix = header.require_int("BITPIX")?.unsigned_abs() as usize / 8;
    let mut elements = 1usize;
    for axis in 1..=naxis {
        let length = header.require_size(&format!("NAXIS{axis}"))?;
        elements = elements.checked_mul(length).ok_or_else(overflow)?;
    }
    let pcount = header.size_or("PCOUNT", 0)?;
    let gcount = header.size_or("GCOUNT", 1)?;
    let raw = pcount
        .checked_add(elements)
        .and_then(|n| n.checked_mul(gcount))
        .and_then(|n| n.checked_mul(bitpix))
        .ok_or_else(overflow)?;
    raw.div_ceil(BLOCK).checked_mul(BLOCK).ok_or_else(overflow)
}

#[derive(Debug, Clone, Copy)]
enum ColumnType {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl ColumnType {
    fn width(self) -> usize {
        match self {
            ColumnType::Byte => 1,
            ColumnType::Short => 2,
            ColumnType::Int | ColumnType::Float => 4,
            ColumnType::Long | ColumnType::Double => 8,
        }
    }
}

#[derive(Debug)]
struct Column {
    name: String,
    unit: Option<String>,
    kind: Option<ColumnType>,
    repeat: usize,
    offset: usize,
}

/// Parse a TFORM value such as `K`, `1D` or `1024E` into (repeat, type,
/// width in bytes).
fn parse_tform(tform: &str) -> SkymapResult<(usize, Option<ColumnType>, usize)> {
    let tform = tform.trim();
    let split = tform
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| fits_err(format!("bad TFORM {tform}")))?;
    let repeat = if split == 0 {
        1
    } else {
        tform[..split]
            .parse::<usize>()
            .map_err(|_| fits_err(format!("bad TFORM {tform}")))?
    };
    let code = tform[split..].chars().next().unwrap_or(' ');
    let (kind, width) = match code {
        'B' => (Some(ColumnType::Byte), 1),
        'I' => (Some(ColumnType::Short), 2),
        'J' => (Some(ColumnType::Int), 4),
        'K' => (Some(ColumnType::Long), 8),
        'E' => (Some(ColumnType::Float), 4),
        'D' => (Some(ColumnType::Double), 8),
        'L' | 'A' | 'X' => (None, if code == 'X' { repeat.div_ceil(8) } else { repeat }),
        _ => return Err(fits_err(format!("unsupported TFORM {tform}"))),
    };
    let total = match kind {
        Some(k) => k.width().checked_mul(repeat).ok_or_else(overflow)?,
        None => width,
    };
    Ok((repeat, kind, total))
}

struct Table<'a> {
    header: Header,
    columns: Vec<Column>,
    row_bytes: usize,
    rows: usize,
    data: &'a [u8],
}

fn find_healpix_table(data: &[u8]) -> SkymapResult<Table<'_>> {
    let mut offset = 0;
    while offset < data.len() {
        let (header, data_start) = read_header(data, offset)?;
        let size = data_size(&header)?;
        let is_bintable = header
            .string("XTENSION")
            .map(|x| x.eq_ignore_ascii_case("BINTABLE"))
            .unwrap_or(false);

        if is_bintable {
            let row_bytes = header.require_size("NAXIS1")?;
            let rows = header.require_size("NAXIS2")?;
            let fields = header.require_size("TFIELDS")?;
            if row_bytes == 0 && rows > 0 {
                return Err(fits_err("table rows have zero width"));
            }
            let mut columns = Vec::new();
            let mut column_offset: usize = 0;
            for index in 1..=fields {
                let tform = header
                    .string(&format!("TFORM{index}"))
                    .ok_or_else(|| fits_err(format!("missing TFORM{index}")))?;
                let (repeat, kind, width) = parse_tform(&tform)?;
                let column_end = column_offset.checked_add(width).ok_or_else(overflow)?;
                if column_end > row_bytes {
                    return Err(fits_err(format!(
                        "TFORM{index} = {tform} ends at byte {column_end} of a {row_bytes}-byte row"
                    )));
                }
                columns.push(Column {
                    name: header.string(&format!("TTYPE{index}")).unwrap_or_default(),
                    unit: header.string(&format!("TUNIT{index}")),
                    kind,
                    repeat,
                    offset: column_offset,
                });
                column_offset = column_end;
            }
            let end = row_bytes
                .checked_mul(rows)
                .and_then(|n| n.checked_add(data_start))
                .ok_or_else(overflow)?;
            if end > data.len() {
                return Err(fits_err("truncated table data"));
            }
            return Ok(Table {
                header,
                columns,
                row_bytes,
                rows,
                data: &data[data_start..end],
            });
        }
        offset = data_start.checked_add(size).ok_or_else(overflow)?;
    }
    Err(fits_err("no binary table extension found"))
}

impl Table<'_> {
    fn column(&self, name: &str) -> SkymapResult<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| fits_err(format!("missing column {name}")))
    }

    fn unit(&self, name: &str) -> Option<&str> {
        self.column(name).ok()?.unit.as_deref()
    }

    fn values<T>(&self, name: &str, convert: impl Fn(ColumnType, &[u8]) -> T) -> SkymapResult<Vec<T>> {
        let column = self.column(name)?;
        let kind = column
            .kind
            .ok_or_else(|| fits_err(format!("column {name} is not numeric")))?;
        let width = kind.width();
        let mut out = Vec::with_capacity(self.rows * column.repeat);
        for row in 0..self.rows {
            let start = row * self.row_bytes + column.offset;
            for item in 0..column.repeat {
                let at = start + item * width;
                out.push(convert(kind, &self.data[at..at + width]));
            }
        }
        Ok(out)
    }

    fn column_i64(&self, name: &str) -> SkymapResult<Vec<i64>> {
        self.values(name, |kind, b| match kind {
            ColumnType::Byte => b[0] as i64,
            ColumnType::Short => i16::from_be_bytes([b[0], b[1]]) as i64,
            ColumnType::Int => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64,
            ColumnType::Long => i64::from_be_bytes(be8(b)),
            ColumnType::Float => f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64,
            ColumnType::Double => f64::from_be_bytes(be8(b)) as i64,
        })
    }

    fn column_f64(&self, name: &str) -> SkymapResult<Vec<f64>> {
        self.values(name, |kind, b| match kind {
            ColumnType::Byte => b[0] as f64,
            ColumnType::Short => i16::from_be_bytes([b[0], b[1]]) as f64,
            ColumnType::Int => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ColumnType::Long => i64::from_be_bytes(be8(b)) as f64,
            ColumnType::Float => f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ColumnType::Double => f64::from_be_bytes(be8(b)),
        })
    }
}

fn be8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}
