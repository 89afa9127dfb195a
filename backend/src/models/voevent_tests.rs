use super::*;
use chrono::TimeZone;

const GW190425: &str = include_str!("../../tests/data/GW190425_initial.xml");
const FERMI_GND_POS: &str = include_str!("../../tests/data/GRB180116_Fermi_GBM_Gnd_Pos.xml");

fn packet(ivorn: &str, role: &str, what: &str, where_when: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" version="2.0" role="{role}" ivorn="{ivorn}">
  <Who><Date>2020-01-01T00:00:00</Date></Who>
  <What>{what}</What>
  <WhereWhen><ObsDataLocation><ObservationLocation><AstroCoords>
    <Time><TimeInstant><ISOTime>2020-01-01T12:00:00.5</ISOTime></TimeInstant></Time>
    {where_when}
  </AstroCoords></ObservationLocation></ObsDataLocation></WhereWhen>
</voe:VOEvent>"#
    )
}

fn position(ra: f64, dec: f64, error: f64) -> String {
    format!(
        "<Position2D unit=\"deg\"><Value2><C1>{ra}</C1><C2>{dec}</C2></Value2>\
         <Error2Radius>{error}</Error2Radius></Position2D>"
    )
}

#[test]
fn test_parse_lvc_initial_notice() {
    let voevent = VoEvent::parse(GW190425).unwrap();
    assert_eq!(voevent.ivorn, "ivo://gwnet/LVC#S190425z-1-Initial");
    assert_eq!(voevent.role, "observation");
    assert_eq!(voevent.version, "2.0");
    assert_eq!(voevent.stream(), "LVC");
    assert_eq!(voevent.notice_type(), Some(notice_types::LVC_INITIAL));
    assert_eq!(
        voevent.dateobs().unwrap(),
        Utc.with_ymd_and_hms(2019, 4, 25, 8, 18, 5).unwrap()
    );
    assert_eq!(
        voevent.notice_date(),
        Some(Utc.with_ymd_and_hms(2019, 4, 25, 9, 31, 1).unwrap())
    );
    assert_eq!(voevent.param("GraceID"), Some("S190425z"));
}

#[test]
fn test_lvc_tags_and_properties() {
    let voevent = VoEvent::parse(GW190425).unwrap();
    assert_eq!(voevent.tags(), vec!["LVC", "GW", "BNS", "AllSky"]);

    let expected = BTreeMap::from([
        ("BBH".to_string(), 0.0),
        ("BNS".to_string(), 0.999402567114),
        ("FAR".to_string(), 4.53764787126e-13),
        ("NSBH".to_string(), 0.0),
        ("HasNS".to_string(), 1.0),
        ("MassGap".to_string(), 0.0),
        ("HasRemnant".to_string(), 1.0),
        ("Terrestrial".to_string(), 0.00059743288626),
    ]);
    assert_eq!(voevent.properties(), expected);
}

#[test]
fn test_lvc_skymap_is_fits_url() {
    let voevent = VoEvent::parse(GW190425).unwrap();
    let source = voevent.skymap_source().unwrap();
    assert_eq!(
        source,
        SkymapSource::Url {
            url: "https://gracedb.ligo.org/api/superevents/S190425z/files/bayestar.fits.gz,0".into(),
            localization_name: Some("bayestar.fits.gz".into()),
        }
    );
}

#[test]
fn test_fermi_ground_position() {
    let voevent = VoEvent::parse(FERMI_GND_POS).unwrap();
    assert_eq!(voevent.stream(), "Fermi");
    assert_eq!(voevent.notice_type(), Some(112));
    assert_eq!(
        voevent.dateobs().unwrap(),
        Utc.with_ymd_and_hms(2018, 1, 16, 0, 36, 53).unwrap()
    );
    assert_eq!(voevent.tags(), vec!["Fermi", "GRB"]);
    assert!(voevent.properties().is_empty());

    let source = voevent.skymap_source().unwrap();
    assert_eq!(source, SkymapSource::Cone { ra: 214.74, dec: 28.14, error: 11.19 });
    assert_eq!(source.localization_name(), "214.74000_28.14000_11.19000");
}

#[test]
fn test_fermi_final_position_uses_healpix_map() {
    let xml = packet(
        "ivo://nasa.gsfc.gcn/Fermi#GBM_Fin_Pos_2019",
        "observation",
        r#"<Param name="Packet_Type" value="115"/>
           <Param name="LocationMap_URL" value="http://heasarc.gsfc.nasa.gov/FTP/fermi/data/gbm/triggers/2019/bn190425089/quicklook/glg_locplot_all_bn190425089.png"/>"#,
        &position(10.0, 20.0, 5.0),
    );
    let voevent = VoEvent::parse(&xml).unwrap();
    match voevent.skymap_source().unwrap() {
        SkymapSource::Url { url, localization_name } => {
            assert_eq!(
                url,
                "https://heasarc.gsfc.nasa.gov/FTP/fermi/data/gbm/triggers/2019/bn190425089/quicklook/glg_healpix_all_bn190425089.fit"
            );
            assert_eq!(localization_name.as_deref(), Some("glg_healpix_all_bn190425089.fit"));
        }
        other => panic!("expected url source, got {other:?}"),
    }
}

#[test]
fn test_retraction_has_no_skymap() {
    let xml = packet(
        "ivo://gwnet/LVC#S190425z-3-Retraction",
        "observation",
        r#"<Param name="Packet_Type" value="164"/><Param name="Retraction" value="1"/>"#,
        &position(10.0, 20.0, 5.0),
    );
    let voevent = VoEvent::parse(&xml).unwrap();
    assert_eq!(voevent.tags(), vec!["LVC", "GW", "retracted"]);
    assert_eq!(voevent.skymap_source(), None);
}

#[test]
fn test_amon_error_is_rescaled() {
    let xml = packet(
        "ivo://nasa.gsfc.gcn/AMON#ICECUBE_GOLD_Event",
        "observation",
        r#"<Param name="Packet_Type" value="173"/><Param name="Signif" value="0.5"/>"#,
        &position(100.0, -10.0, 2.447746830680816),
    );
    let voevent = VoEvent::parse(&xml).unwrap();
    match voevent.skymap_source().unwrap() {
        SkymapSource::Cone { ra, dec, error } => {
            assert_eq!((ra, dec), (100.0, -10.0));
            assert!((error - 1.0).abs() < 1e-12);
        }
        other => panic!("expected cone, got {other:?}"),
    }
    assert_eq!(voevent.properties().get("Signif"), Some(&0.5));
}

#[test]
fn test_test_role_and_duration_tags() {
    let xml = packet(
        "ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos",
        "test",
        r#"<Param name="Packet_Type" value="61"/><Param name="Long_short" value="Short"/>
           <Param name="Duration_class" value="unknown"/>"#,
        "",
    );
    let voevent = VoEvent::parse(&xml).unwrap();
    assert_eq!(voevent.tags(), vec!["SWIFT", "short", "Test"]);
    assert_eq!(voevent.skymap_source(), None);
}

#[test]
fn test_not_grb_when_identified_false() {
    let xml = packet(
        "ivo://nasa.gsfc.gcn/Fermi#GBM_Alert",
        "observation",
        r#"<Param name="Packet_Type" value="110"/><Param name="GRB_Identified" value="false"/>"#,
        "",
    )
    .replace(
        "</voe:VOEvent>",
        "<Why><Inference><Concept>process.variation.burst;em.gamma</Concept></Inference></Why></voe:VOEvent>",
    );
    let voevent = VoEvent::parse(&xml).unwrap();
    assert_eq!(voevent.tags(), vec!["Fermi", "Not GRB"]);
}

#[test]
fn test_dateobs_truncated_to_seconds() {
    let xml = packet("ivo://example/Stream#1", "observation", "", "");
    let voevent = VoEvent::parse(&xml).unwrap();
    assert_eq!(
        voevent.dateobs().unwrap(),
        Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap()
    );
}

#[test]
fn test_rejects_malformed_xml() {
    assert!(matches!(VoEvent::parse("<VOEvent"), Err(VoEventError::Xml(_))));
    assert!(matches!(VoEvent::parse("<a></b>"), Err(VoEventError::Xml(_))));
    assert!(matches!(VoEvent::parse(""), Err(VoEventError::Xml(_))));
    assert!(matches!(parse_document("<a/><b/>"), Err(VoEventError::Xml(_))));
}

#[test]
fn test_rejects_invalid_voevents() {
    let wrong_root = "<Event ivorn=\"ivo://x/y\" role=\"observation\" version=\"2.0\"/>";
    assert!(matches!(VoEvent::parse(wrong_root), Err(VoEventError::Invalid(_))));

    let not_ivo = packet("http://example/Stream#1", "observation", "", "");
    assert!(matches!(VoEvent::parse(&not_ivo), Err(VoEventError::Invalid(_))));

    let bad_role = packet("ivo://example/Stream#1", "rumour", "", "");
    assert!(matches!(VoEvent::parse(&bad_role), Err(VoEventError::Invalid(_))));

    let no_time = packet("ivo://example/Stream#1", "observation", "", "").replace(
        "<ISOTime>2020-01-01T12:00:00.5</ISOTime>",
        "",
    );
    assert!(matches!(VoEvent::parse(&no_time), Err(VoEventError::Invalid(_))));

    let bad_time = packet("ivo://example/Stream#1", "observation", "", "")
        .replace("2020-01-01T12:00:00.5", "soon");
    assert!(matches!(VoEvent::parse(&bad_time), Err(VoEventError::InvalidTime(_))));
}

#[test]
fn test_element_queries() {
    let root = parse_document(
        "<r a=\"1\"><x><y>one</y></x><y>two</y><z><![CDATA[<raw>]]></z></r>",
    )
    .unwrap();
    assert_eq!(root.attr("a"), Some("1"));
    assert_eq!(root.path(&["x", "y"]).map(|e| e.text.as_str()), Some("one"));
    assert_eq!(root.find_all("y").len(), 2);
    // Depth first: the nested <y> comes before its later sibling.
    assert_eq!(root.find("y").map(|e| e.text.as_str()), Some("one"));
    assert_eq!(root.child("z").map(|e| e.text.as_str()), Some("<raw>"));
}

#[test]
fn test_ivorn_path() {
    assert_eq!(ivorn_path("ivo://gwnet/LVC#S190425z-1-Initial"), "LVC");
    assert_eq!(ivorn_path("ivo://nasa.gsfc.gcn/Fermi#GBM_Gnd_Pos"), "Fermi");
    assert_eq!(ivorn_path("ivo://nasa.gsfc.gcn/SWIFT/BAT#1"), "SWIFT/BAT");
    assert_eq!(ivorn_path("ivo://authority"), "");
}
