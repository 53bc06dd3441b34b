//! Integration tests for the extraction pipeline
//!
//! Tests the full path from archive bytes to the feature record, across
//! all three format dialects.

use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::ZipWriter;

use musefeat::{extract_archive, extract_document, ExtractError, HandPair};

fn archive_with(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn chord(duration: &str, pitches: &[i32]) -> String {
    let notes: String = pitches
        .iter()
        .map(|p| format!("<Note><pitch>{p}</pitch><tpc>14</tpc></Note>"))
        .collect();
    format!("<Chord><durationType>{duration}</durationType>{notes}</Chord>")
}

/// Two-staff keyboard score: one 4/4 measure under tempo 2.0, the upper
/// staff playing four quarter chords C5 E5 G5 C6, the lower staff one
/// whole chord C4.
fn two_hand_score() -> String {
    let upper_voice = format!(
        "<Tempo><tempo>2</tempo><text>Allegro</text></Tempo>{}{}{}{}",
        chord("quarter", &[72]),
        chord("quarter", &[76]),
        chord("quarter", &[79]),
        chord("quarter", &[84])
    );
    let lower_voice = chord("whole", &[60]);
    format!(
        r#"<museScore version="3.02">
  <programVersion>3.2.3</programVersion>
  <programRevision>d2d863f</programRevision>
  <Score>
    <Part>
      <Staff id="1"/>
      <Staff id="2"/>
      <trackName>Piano</trackName>
      <Instrument>
        <longName>Piano</longName>
        <trackName>Piano</trackName>
        <instrumentId>keyboard.piano</instrumentId>
      </Instrument>
    </Part>
    <metaTag name="composer">Anonymous</metaTag>
    <Staff id="1">
      <VBox>
        <Text><style>Title</style><text>Study</text></Text>
      </VBox>
      <Measure>
        <voice>
          <TimeSig><sigN>4</sigN><sigD>4</sigD></TimeSig>
          {upper_voice}
        </voice>
      </Measure>
    </Staff>
    <Staff id="2">
      <Measure>
        <voice>
          <TimeSig><sigN>4</sigN><sigD>4</sigD></TimeSig>
          {lower_voice}
        </voice>
      </Measure>
    </Staff>
  </Score>
</museScore>"#
    )
}

#[test]
fn test_two_hand_scenario_features() {
    let data = archive_with(&[("thumbnail.png", "png"), ("1234.mscx", &two_hand_score())]);
    let extraction = extract_archive(&data, "1234").unwrap();
    let features = extraction.features.expect("keyboard part expected");

    // five distinct pitches, one occurrence each
    let expected_pe = (5f64.log2() * 10000.0).round() / 10000.0;
    assert_eq!(features.pitch_entropy, Some(expected_pe));
    assert_eq!(features.altered_note_rate, Some(0.0));
    assert_eq!(
        features.polyphony_rate,
        HandPair {
            left: Some(0.0),
            right: Some(0.0)
        }
    );
    // |mean(72,76,79,84) - 60|
    assert_eq!(features.hand_stretch, Some(17.75));
    // measure tick sets {0} and {0,480,960,1440}
    assert_eq!(features.distinct_stroke_rate, Some(0.75));
    // upper staff: mean pulsation 1 over tempo 2 across its full span
    assert_eq!(features.playing_speed.right, Some(0.5));
    // the lower staff spans zero ticks, its weighted average is undefined
    assert!(features.playing_speed.left.unwrap().is_nan());
    assert_eq!(features.hand_displacement_rate.right, Some(0.0));
    assert!(features.hand_displacement_rate.left.unwrap().is_nan());
}

#[test]
fn test_metadata_record() {
    let data = archive_with(&[("1234.mscx", &two_hand_score())]);
    let extraction = extract_archive(&data, "1234").unwrap();
    let meta = extraction.meta;
    assert_eq!(meta.id, "1234");
    assert_eq!(meta.primary_entry, "1234.mscx");
    assert_eq!(meta.version, "3.02");
    assert_eq!(meta.program_version, "3.2.3");
    assert_eq!(meta.title.as_deref(), Some("Study"));
    assert_eq!(meta.composer.as_deref(), Some("Anonymous"));
    assert_eq!(meta.subtitle, None);
}

#[test]
fn test_extraction_is_deterministic() {
    // both staves carry several chords so no statistic degenerates to NaN
    let upper = format!(
        "<Tempo><tempo>2</tempo><text>Allegro</text></Tempo>{}{}{}{}",
        chord("quarter", &[72, 76]),
        chord("quarter", &[76]),
        chord("quarter", &[79]),
        chord("quarter", &[84])
    );
    let lower = format!("{}{}", chord("half", &[60]), chord("half", &[55]));
    let xml = two_hand_score()
        .replace(&chord("whole", &[60]), &lower)
        .replace(
            &format!(
                "<Tempo><tempo>2</tempo><text>Allegro</text></Tempo>{}{}{}{}",
                chord("quarter", &[72]),
                chord("quarter", &[76]),
                chord("quarter", &[79]),
                chord("quarter", &[84])
            ),
            &upper,
        );
    let data = archive_with(&[("55.mscx", &xml)]);
    let first = extract_archive(&data, "55").unwrap();
    let second = extract_archive(&data, "55").unwrap();
    assert_eq!(first.features, second.features);
    assert_eq!(first.meta, second.meta);
}

#[test]
fn test_missing_primary_document() {
    let data = archive_with(&[("thumbnail.png", "png")]);
    assert!(matches!(
        extract_archive(&data, "1"),
        Err(ExtractError::PrimaryDocumentNotFound)
    ));
}

#[test]
fn test_unsupported_version() {
    let data = archive_with(&[("x.mscx", r#"<museScore version="4.00"/>"#)]);
    match extract_archive(&data, "1") {
        Err(ExtractError::UnsupportedVersion(version)) => assert_eq!(version, "4.00"),
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }
}

#[test]
fn test_non_keyboard_score_has_no_features() {
    let xml = two_hand_score().replace("Piano", "Violin").replace(
        "<instrumentId>keyboard.piano</instrumentId>",
        "<instrumentId>strings.violin</instrumentId>",
    );
    let data = archive_with(&[("9.mscx", &xml)]);
    let extraction = extract_archive(&data, "9").unwrap();
    assert!(extraction.features.is_none());
    assert!(extraction
        .diagnostics
        .unknown_instruments
        .contains("violin"));
}

#[test]
fn test_three_staff_keyboard_part_is_skipped() {
    let xml = two_hand_score().replace(
        "<Staff id=\"1\"/>\n      <Staff id=\"2\"/>",
        "<Staff id=\"1\"/><Staff id=\"2\"/><Staff id=\"3\"/>",
    );
    let data = archive_with(&[("7.mscx", &xml)]);
    let extraction = extract_archive(&data, "7").unwrap();
    assert!(extraction.features.is_none());
    assert_eq!(extraction.diagnostics.ambiguous_parts.len(), 1);
    assert_eq!(extraction.diagnostics.ambiguous_parts[0].staff_count, 3);
}

#[test]
fn test_dialect_a_document() {
    let xml = r#"<museScore version="1.14">
  <programVersion>1.3</programVersion>
  <programRevision>5702</programRevision>
  <siglist><sig tick="0"><nom>4</nom><denom>4</denom></sig></siglist>
  <tempolist><tempo tick="0">2</tempo></tempolist>
  <Part>
    <Staff>
      <cleflist><clef tick="0" idx="0"/></cleflist>
      <keylist><key tick="0" idx="0"/></keylist>
    </Staff>
    <Staff>
      <cleflist><clef tick="0" idx="4"/></cleflist>
      <keylist><key tick="0" idx="0"/></keylist>
    </Staff>
    <name><html-data><html><body>Piano</body></html></html-data></name>
    <Instrument><trackName>Piano</trackName></Instrument>
  </Part>
  <Staff id="1">
    <Measure number="1">
      <Tempo><tempo>2</tempo><style>20</style><subtype>Tempo</subtype><html-data><html><body>Allegro</body></html></html-data></Tempo>
      <Chord><durationType>half</durationType><Note><pitch>72</pitch><tpc>14</tpc></Note></Chord>
      <Chord><durationType>half</durationType><Note><pitch>76</pitch><tpc>18</tpc></Note></Chord>
    </Measure>
  </Staff>
  <Staff id="2">
    <Measure number="1">
      <Chord><durationType>whole</durationType><Note><pitch>48</pitch><tpc>14</tpc></Note></Chord>
    </Measure>
  </Staff>
</museScore>"#;
    let data = archive_with(&[("3.mscx", xml)]);
    let extraction = extract_archive(&data, "3").unwrap();
    let features = extraction.features.expect("keyboard part expected");
    assert_eq!(features.hand_stretch, Some(26.0));
    assert_eq!(features.distinct_stroke_rate, Some(0.5));
    assert_eq!(extraction.meta.version, "1.14");
}

#[test]
fn test_dialect_b_document() {
    let xml = r#"<museScore version="2.06">
  <programVersion>2.0.3</programVersion>
  <programRevision>3c7a69d</programRevision>
  <Score>
    <Part>
      <Staff id="1"/>
      <Staff id="2"/>
      <trackName>Piano</trackName>
      <Instrument><trackName>Piano</trackName></Instrument>
    </Part>
    <Staff id="1">
      <Measure number="1">
        <TimeSig><sigN>4</sigN><sigD>4</sigD><showCourtesySig>1</showCourtesySig></TimeSig>
        <Tempo><tempo>2</tempo><text>Allegro</text></Tempo>
        <Chord><durationType>quarter</durationType><Note><pitch>72</pitch><tpc>14</tpc></Note></Chord>
        <Chord><durationType>quarter</durationType><Note><pitch>74</pitch><tpc>16</tpc></Note></Chord>
        <Chord><durationType>half</durationType><Note><pitch>76</pitch><tpc>18</tpc></Note></Chord>
      </Measure>
    </Staff>
    <Staff id="2">
      <Measure number="1">
        <TimeSig><sigN>4</sigN><sigD>4</sigD><showCourtesySig>1</showCourtesySig></TimeSig>
        <Rest><durationType>measure</durationType><duration z="4" n="4"/></Rest>
      </Measure>
    </Staff>
  </Score>
</museScore>"#;
    let data = archive_with(&[("4.mscx", xml)]);
    let extraction = extract_archive(&data, "4").unwrap();
    let features = extraction.features.expect("keyboard part expected");
    // the lower staff holds a single whole-measure rest: it spans zero
    // ticks and its weighted average degenerates
    assert!(features.playing_speed.left.unwrap().is_nan());
    // mean pulsation (1+1+2)/3 over tempo 2 across the staff's span
    assert_eq!(features.playing_speed.right, Some(0.66667));
    assert_eq!(features.pitch_entropy, Some(1.585));
    assert_eq!(extraction.meta.version, "2.06");
}

#[test]
fn test_extract_document_without_archive() {
    let extraction = extract_document(&two_hand_score(), "inline").unwrap();
    assert!(extraction.features.is_some());
    assert_eq!(extraction.meta.id, "inline");
    assert_eq!(extraction.meta.primary_entry, "");
}
