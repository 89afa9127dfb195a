//! VOEvent notice parsing.
//!
//! Notices are read into a small element tree with `quick-xml`, checked for
//! the structure every VOEvent 2.0 packet carries, and then queried for the
//! values the ingest pipeline needs: event time, stream, notice type, tags,
//! numeric properties and where to find the localization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::gcn::parse_dateobs;
use super::skymap::{url_basename, SkymapSource};

/// GCN notice types referenced during ingest.
pub mod notice_types {
    pub const FERMI_GBM_FIN_POS: i32 = 115;
    pub const FERMI_GBM_SUBTHRESH: i32 = 131;
    pub const LVC_PRELIMINARY: i32 = 150;
    pub const LVC_INITIAL: i32 = 151;
    pub const LVC_UPDATE: i32 = 152;
    pub const LVC_RETRACTION: i32 = 164;
}

/// AMON reports a 90% error radius; dividing by the 95% quantile of a
/// 2-dof chi distribution turns it into a 1-sigma radius.
const AMON_RADIUS_SCALE: f64 = 2.447_746_830_680_816;

/// Params copied into event properties wherever they appear.
const PROPERTY_PARAMS: &[&str] = &[
    "Signif",
    "CntsSig",
    "Fluence",
    "Value",
    "Prob",
    "FAR",
    "BNS",
    "NSBH",
    "BBH",
    "MassGap",
    "HasNS",
    "HasRemnant",
    "Terrestrial",
];

const ROLES: &[&str] = &["observation", "prediction", "utility", "test"];

#[derive(Debug, thiserror::Error)]
pub enum VoEventError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("xml file is not valid VOEvent: {0}")]
    Invalid(String),
    #[error("invalid ISOTime {0:?}")]
    InvalidTime(String),
}

/// One XML element with its local name, attributes, text and children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a chain of direct children.
    pub fn path(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    /// All descendants named `name`, depth first.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.collect(name, &mut out);
        out
    }

    fn collect<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.collect(name, out);
        }
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|c| {
            if c.name == name {
                Some(c)
            } else {
                c.find(name)
            }
        })
    }
}

fn xml_err(e: impl std::fmt::Display) -> VoEventError {
    VoEventError::Xml(e.to_string())
}

fn start_element(e: &BytesStart) -> Result<Element, VoEventError> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Element::default()
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<(), VoEventError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => return Err(VoEventError::Xml("multiple root elements".into())),
        None => *root = Some(element),
    }
    Ok(())
}

/// Parse a well-formed XML document into its root element.
pub fn parse_document(xml: &str) -> Result<Element, VoEventError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(start_element(&e)?),
            Ok(Event::Empty(e)) => {
                let element = start_element(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| VoEventError::Xml("unexpected closing tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_err)?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&text),
                    None => return Err(VoEventError::Xml("text outside the root element".into())),
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(VoEventError::Xml(format!(
                    "at position {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(VoEventError::Xml(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| VoEventError::Xml("empty document".into()))
}

/// A validated VOEvent packet.
#[derive(Debug, Clone)]
pub struct VoEvent {
    pub ivorn: String,
    pub role: String,
    pub version: String,
    root: Element,
}

impl VoEvent {
    /// Parse and structurally validate a VOEvent document.
    pub fn parse(xml: &str) -> Result<Self, VoEventError> {
        let root = parse_document(xml)?;
        if root.name != "VOEvent" {
            return Err(VoEventError::Invalid(format!("root element is <{}>", root.name)));
        }

        let required = |key: &str| {
            root.attr(key)
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| VoEventError::Invalid(format!("missing {key} attribute")))
        };
        let ivorn = required("ivorn")?;
        let role = required("role")?;
        let version = required("version")?;

        if !ivorn.starts_with("ivo://") {
            return Err(VoEventError::Invalid(format!("ivorn {ivorn:?} is not an ivo:// URI")));
        }
        if !ROLES.contains(&role.as_str()) {
            return Err(VoEventError::Invalid(format!("unknown role {role:?}")));
        }
        if root.path(&["Who", "Date"]).is_none() {
            return Err(VoEventError::Invalid("missing Who/Date".into()));
        }
        let isotime = root
            .child("WhereWhen")
            .and_then(|w| w.find("ISOTime"))
            .ok_or_else(|| VoEventError::Invalid("missing WhereWhen ISOTime".into()))?;
        parse_dateobs(&isotime.text).ok_or_else(|| VoEventError::InvalidTime(isotime.text.clone()))?;

        Ok(Self {
            ivorn,
            role,
            version,
            root,
        })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Event time from `WhereWhen`, truncated to whole seconds.
    pub fn dateobs(&self) -> Result<DateTime<Utc>, VoEventError> {
        let text = self
            .root
            .child("WhereWhen")
            .and_then(|w| w.find("ISOTime"))
            .map(|t| t.text.as_str())
            .unwrap_or_default();
        parse_dateobs(text).ok_or_else(|| VoEventError::InvalidTime(text.to_string()))
    }

    /// IVORN path without the leading slash, e.g. `LVC` or `Fermi`.
    pub fn stream(&self) -> String {
        ivorn_path(&self.ivorn)
    }

    pub fn notice_type(&self) -> Option<i32> {
        self.what_param("Packet_Type")?.trim().parse().ok()
    }

    /// Author timestamp from `Who/Date`.
    pub fn notice_date(&self) -> Option<DateTime<Utc>> {
        let date = self.root.path(&["Who", "Date"])?;
        parse_dateobs(&date.text)
    }

    /// Value of the first `Param` named `name` anywhere in the packet.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.root
            .find_all("Param")
            .into_iter()
            .find(|p| p.attr("name") == Some(name))
            .and_then(|p| p.attr("value"))
    }

    /// Value of a `Param` directly under `What`.
    fn what_param(&self, name: &str) -> Option<&str> {
        self.root
            .child("What")?
            .children_named("Param")
            .find(|p| p.attr("name") == Some(name))
            .and_then(|p| p.attr("value"))
    }

    fn what_group(&self, group_type: &str) -> Option<&Element> {
        self.root
            .child("What")?
            .children_named("Group")
            .find(|g| g.attr("type") == Some(group_type))
    }

    /// Classification tags, in discovery order and without duplicates.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        let mut push = |tag: String| {
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        };

        push(self.stream());

        if let Some(concept) = self.root.path(&["Why", "Inference", "Concept"]) {
            match concept.text.trim() {
                "process.variation.burst;em.gamma" => {
                    if self.param("GRB_Identified") == Some("false") {
                        push("Not GRB".into());
                    } else {
                        push("GRB".into());
                    }
                }
                "process.variation.trans;em.gamma" => push("transient".into()),
                _ => {}
            }
        }

        let notice_type = self.notice_type();
        if matches!(
            notice_type,
            Some(
                notice_types::LVC_PRELIMINARY
                    | notice_types::LVC_INITIAL
                    | notice_types::LVC_UPDATE
                    | notice_types::LVC_RETRACTION
            )
        ) {
            push("GW".into());
        }
        if notice_type == Some(notice_types::LVC_RETRACTION) {
            push("retracted".into());
        }

        for name in ["Long_short", "Duration_class"] {
            if let Some(value) = self.param(name) {
                if value != "unknown" {
                    push(value.to_lowercase());
                }
            }
        }

        if let Some(group) = self.what_group("Classification") {
            let best = group
                .children_named("Param")
                .filter_map(|p| Some((p.attr("name")?, p.attr("value")?.trim().parse::<f64>().ok()?)))
                .fold(None::<(&str, f64)>, |best, (name, value)| match best {
                    Some((_, b)) if b >= value => best,
                    _ => Some((name, value)),
                });
            if let Some((name, _)) = best {
                push(name.to_string());
            }
        }

        if let Some(search) = self.what_param("Search") {
            push(search.to_string());
        }

        if self.role == "test" {
            push("Test".into());
        }

        tags
    }

    /// Numeric properties of the event.
    pub fn properties(&self) -> BTreeMap<String, f64> {
        let mut properties = BTreeMap::new();
        for name in PROPERTY_PARAMS {
            if let Some(value) = self.param(name).and_then(|v| v.trim().parse::<f64>().ok()) {
                properties.insert(name.to_string(), value);
            }
        }
        for group_type in ["Classification", "Properties"] {
            if let Some(group) = self.what_group(group_type) {
                for param in group.children_named("Param") {
                    let parsed = param
                        .attr("name")
                        .zip(param.attr("value").and_then(|v| v.trim().parse::<f64>().ok()));
                    if let Some((name, value)) = parsed {
                        properties.insert(name.to_string(), value);
                    }
                }
            }
        }
        properties
    }

    /// Where the localization of this notice comes from, if anywhere.
    pub fn skymap_source(&self) -> Option<SkymapSource> {
        let url = |url: String| SkymapSource::Url {
            localization_name: Some(url_basename(&url)),
            url,
        };

        match self.notice_type() {
            Some(notice_types::FERMI_GBM_FIN_POS) => {
                if let Some(plot) = self.what_param("LocationMap_URL") {
                    let fits = plot
                        .replace("http://", "https://")
                        .replace("_locplot_", "_healpix_")
                        .replace(".png", ".fit");
                    return Some(url(fits));
                }
            }
            Some(notice_types::FERMI_GBM_SUBTHRESH) => {
                if let Some(healpix) = self.what_param("HealPix_URL") {
                    return Some(url(healpix.to_string()));
                }
            }
            _ => {}
        }

        let skymap_fits = self
            .what_group("GW_SKYMAP")
            .and_then(|g| g.children_named("Param").find(|p| p.attr("name") == Some("skymap_fits")))
            .and_then(|p| p.attr("value"))
            .or_else(|| self.param("skymap_fits"));
        if let Some(fits) = skymap_fits {
            return Some(url(fits.to_string()));
        }

        if self
            .what_param("Retraction")
            .and_then(|v| v.trim().parse::<i32>().ok())
            == Some(1)
        {
            return None;
        }

        let position = self.root.path(&[
            "WhereWhen",
            "ObsDataLocation",
            "ObservationLocation",
            "AstroCoords",
            "Position2D",
        ])?;
        let number = |path: &[&str]| position.path(path)?.text.trim().parse::<f64>().ok();
        let ra = number(&["Value2", "C1"])?;
        let dec = number(&["Value2", "C2"])?;
        let mut error = number(&["Error2Radius"])?;
        if self.stream() == "AMON" {
            error /= AMON_RADIUS_SCALE;
        }
        Some(SkymapSource::Cone { ra, dec, error })
    }
}

/// Path component of an IVORN, without the leading slash or fragment.
pub fn ivorn_path(ivorn: &str) -> String {
    let rest = ivorn.split_once("://").map(|(_, r)| r).unwrap_or(ivorn);
    let rest = rest.split(['#', '?']).next().unwrap_or(rest);
    match rest.find('/') {
        Some(slash) => rest[slash..].trim_start_matches('/').to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
#[path = "voevent_tests.rs"]
mod voevent_tests;
