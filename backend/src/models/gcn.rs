//! GCN events, notices, tags, properties and localizations.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{LocalizationId, NoticeId, UserId};

use super::healpix;

/// Parse an event timestamp and truncate it to whole seconds.
///
/// Accepts RFC 3339 as well as the zone-less ISO forms used by VOEvent
/// `ISOTime` elements and URL paths (`2019-04-25T08:18:05.017553`,
/// `2019-04-25 08:18:05`). Zone-less values are taken as UTC.
pub fn parse_dateobs(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| naive.and_utc())
        })?;
    Some(parsed.trunc_subsecs(0))
}

/// Canonical textual form of an event time, as used in URLs and JSON.
pub fn format_dateobs(dateobs: &DateTime<Utc>) -> String {
    dateobs.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub mod dateobs_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_dateobs(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        super::parse_dateobs(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid dateobs {text:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnEvent {
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub sent_by_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnNotice {
    pub id: NoticeId,
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub ivorn: String,
    pub notice_type: Option<i32>,
    pub stream: String,
    pub date: Option<DateTime<Utc>>,
    /// Raw VOEvent XML as received.
    pub content: String,
    /// SHA-256 of `content`; identical re-submissions are not stored twice.
    pub checksum: String,
    pub sent_by_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGcnNotice {
    pub dateobs: DateTime<Utc>,
    pub ivorn: String,
    pub notice_type: Option<i32>,
    pub stream: String,
    pub date: Option<DateTime<Utc>>,
    pub content: String,
    pub checksum: String,
    pub sent_by_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnTag {
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub text: String,
    pub sent_by_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnProperty {
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub data: BTreeMap<String, f64>,
    pub sent_by_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Localization {
    pub id: LocalizationId,
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub localization_name: String,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
    /// Probability per pixel on a single-resolution NESTED grid.
    pub flat_2d: Option<Vec<f64>>,
    pub contour: Option<serde_json::Value>,
    pub sent_by_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLocalization {
    pub dateobs: DateTime<Utc>,
    pub localization_name: String,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
    pub sent_by_id: UserId,
}

/// Localization without its pixel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationSummary {
    pub id: LocalizationId,
    #[serde(with = "dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub localization_name: String,
    pub sent_by_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl From<&Localization> for LocalizationSummary {
    fn from(loc: &Localization) -> Self {
        Self {
            id: loc.id,
            dateobs: loc.dateobs,
            localization_name: loc.localization_name.clone(),
            sent_by_id: loc.sent_by_id,
            created_at: loc.created_at,
        }
    }
}

/// One sky tile of a localization: an inclusive range of depth-29 nested
/// indices with its density and the cumulative probability of all tiles at
/// least as probable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizationTile {
    pub localization_id: LocalizationId,
    pub nested_lo: i64,
    pub nested_hi: i64,
    pub probdensity: f64,
    pub cumprob: f64,
}

impl LocalizationTile {
    /// Solid angle in steradians.
    pub fn area(&self) -> f64 {
        healpix::range_area(self.nested_lo, self.nested_hi)
    }

    pub fn probability(&self) -> f64 {
        self.probdensity * self.area()
    }

    pub fn contains(&self, index: i64) -> bool {
        self.nested_lo <= index && index <= self.nested_hi
    }

    /// Intersection with the inclusive range `[lo, hi]`.
    pub fn overlap(&self, lo: i64, hi: i64) -> Option<(i64, i64)> {
        let start = self.nested_lo.max(lo);
        let end = self.nested_hi.min(hi);
        (start <= end).then_some((start, end))
    }
}

/// An event with everything attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnEventDetail {
    #[serde(flatten)]
    pub event: GcnEvent,
    pub tags: Vec<String>,
    pub notices: Vec<GcnNotice>,
    pub localizations: Vec<LocalizationSummary>,
    pub properties: Vec<GcnProperty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl Comparison {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Gt => lhs > rhs,
        }
    }
}

/// `name: value: op` condition on the latest properties of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub name: String,
    pub value: f64,
    pub comparison: Comparison,
}

impl PropertyFilter {
    /// Parse a comma separated list such as `BNS: 0.5: gt, NSBH: 0.5: lt`.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, String> {
        text.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| {
                let parts: Vec<&str> = item.split(':').map(str::trim).collect();
                let [name, value, op] = parts.as_slice() else {
                    return Err(format!("expected 'name: value: op', got {item:?}"));
                };
                let value = value
                    .parse::<f64>()
                    .map_err(|_| format!("invalid value in {item:?}"))?;
                let comparison = match *op {
                    "lt" => Comparison::Lt,
                    "le" => Comparison::Le,
                    "eq" => Comparison::Eq,
                    "ne" => Comparison::Ne,
                    "ge" => Comparison::Ge,
                    "gt" => Comparison::Gt,
                    other => return Err(format!("unknown comparison {other:?}")),
                };
                Ok(Self {
                    name: name.to_string(),
                    value,
                    comparison,
                })
            })
            .collect()
    }
}

/// Filters for event listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub tag_keep: Vec<String>,
    pub tag_remove: Vec<String>,
    pub properties: Vec<PropertyFilter>,
}

impl EventFilter {
    pub fn in_date_range(&self, dateobs: &DateTime<Utc>) -> bool {
        self.start_date.map_or(true, |s| *dateobs >= s) && self.end_date.map_or(true, |e| *dateobs <= e)
    }

    /// Whether an event passes every filter. Property filters apply to the
    /// most recently stored property set.
    pub fn matches(&self, detail: &GcnEventDetail) -> bool {
        if !self.in_date_range(&detail.event.dateobs) {
            return false;
        }
        if !self.tag_keep.iter().all(|t| detail.tags.contains(t)) {
            return false;
        }
        if self.tag_remove.iter().any(|t| detail.tags.contains(t)) {
            return false;
        }
        if self.properties.is_empty() {
            return true;
        }
        let Some(latest) = detail.properties.iter().max_by_key(|p| p.created_at) else {
            return false;
        };
        self.properties.iter().all(|f| {
            latest
                .data
                .get(&f.name)
                .is_some_and(|&v| f.comparison.apply(v, f.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_dateobs_forms() {
        let expected = Utc.with_ymd_and_hms(2019, 4, 25, 8, 18, 5).unwrap();
        for text in [
            "2019-04-25T08:18:05.017553",
            "2019-04-25T08:18:05",
            "2019-04-25 08:18:05",
            "2019-04-25T08:18:05.9Z",
            "2019-04-25T10:18:05+02:00",
        ] {
            assert_eq!(parse_dateobs(text), Some(expected), "{text}");
        }
        assert_eq!(parse_dateobs("yesterday"), None);
        assert_eq!(format_dateobs(&expected), "2019-04-25T08:18:05");
    }

    #[test]
    fn test_tile_overlap() {
        let tile = LocalizationTile {
            localization_id: LocalizationId(1),
            nested_lo: 100,
            nested_hi: 199,
            probdensity: 1.0,
            cumprob: 0.5,
        };
        assert_eq!(tile.overlap(0, 99), None);
        assert_eq!(tile.overlap(0, 100), Some((100, 100)));
        assert_eq!(tile.overlap(150, 1000), Some((150, 199)));
        assert_eq!(tile.overlap(120, 130), Some((120, 130)));
        assert!(tile.contains(199));
        assert!(!tile.contains(200));
    }

    #[test]
    fn test_property_filter_parse() {
        let filters = PropertyFilter::parse_list("BNS: 0.5: gt, NSBH: 0.5: lt").unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].name, "BNS");
        assert_eq!(filters[0].comparison, Comparison::Gt);
        assert_eq!(filters[1].value, 0.5);

        assert!(PropertyFilter::parse_list("BNS: 0.5").is_err());
        assert!(PropertyFilter::parse_list("BNS: x: gt").is_err());
        assert!(PropertyFilter::parse_list("BNS: 0.5: about").is_err());
        assert!(PropertyFilter::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_event_filter_matches() {
        let dateobs = Utc.with_ymd_and_hms(2022, 6, 18, 18, 31, 12).unwrap();
        let detail = GcnEventDetail {
            event: GcnEvent {
                dateobs,
                sent_by_id: UserId(1),
                created_at: dateobs,
            },
            tags: vec!["IPN".into(), "GRB".into()],
            notices: vec![],
            localizations: vec![],
            properties: vec![GcnProperty {
                dateobs,
                data: BTreeMap::from([("BNS".to_string(), 0.9), ("NSBH".to_string(), 0.1)]),
                sent_by_id: UserId(1),
                created_at: dateobs,
            }],
        };

        let mut filter = EventFilter {
            properties: PropertyFilter::parse_list("BNS: 0.5: gt, NSBH: 0.5: lt").unwrap(),
            ..EventFilter::default()
        };
        assert!(filter.matches(&detail));

        filter.properties = PropertyFilter::parse_list("BNS: 0.5: lt").unwrap();
        assert!(!filter.matches(&detail));

        let filter = EventFilter {
            tag_keep: vec!["GRB".into()],
            tag_remove: vec!["GW".into()],
            start_date: Some(dateobs),
            ..EventFilter::default()
        };
        assert!(filter.matches(&detail));

        let filter = EventFilter {
            tag_keep: vec!["Fermi".into()],
            ..EventFilter::default()
        };
        assert!(!filter.matches(&detail));
    }
}
