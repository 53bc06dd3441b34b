//! # Format 2.x ("2.06")
//!
//! Document model and timeline reconstruction for the middle format family.
//!
//! Unlike the 1.x format there is no document-level signature list: a measure's
//! tick length comes from its own `<TimeSig>` child when present and is
//! inherited from the previous measure otherwise. Strokes never carry their
//! own tick; instead a standalone `<tick>` marker element overrides the
//! running position of the next stroke. Score-level `<metaTag>` entries
//! complement the front-matter `<VBox>` texts.

use roxmltree::Node;
use std::collections::{BTreeMap, BTreeSet};

use crate::diag::Diagnostics;
use crate::duration::{self, DurationSym};
use crate::error::ExtractError;
use crate::features::{
    average_playing_speed, collect_features, tempo_segment, ChordPoint, Features, NotePoint,
    StaffMetrics,
};
use crate::piano::is_keyboard_part;

use super::xml::{
    child, children, dots, flag, html_body_text, note_possible_tags, opt_bool, opt_float, opt_int,
    opt_text, parse_int, req_attr, req_child, req_child_text, req_float, req_int,
};

/// A parsed and fully reconstructed 2.x document.
#[derive(Debug, Clone)]
pub struct Document {
    pub version: String,
    pub program_version: String,
    pub program_revision: String,
    pub score: Score,
}

#[derive(Debug, Clone)]
pub struct Score {
    pub parts: Vec<Part>,
    /// Sorted by staff id.
    pub staves: Vec<Staff>,
    pub meta_entries: Vec<MetaEntry>,
    /// Tempo markings from all staves as `(tick, value)`, sorted by tick.
    pub tempos: Vec<(i64, f64)>,
}

/// A document-level `<metaTag name="...">` entry.
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub name: String,
    pub text: String,
}

impl MetaEntry {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(MetaEntry {
            name: req_attr(node, "name")?.to_string(),
            text: node.text().unwrap_or("").to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Part {
    /// Ids of the staves belonging to this part, in document order.
    pub staff_ids: Vec<i64>,
    pub track_name: String,
    pub instrument: Instrument,
}

impl Part {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut staff_ids = Vec::new();
        for staff in children(node, "Staff") {
            staff_ids.push(parse_int(req_attr(staff, "id")?, "part staff id")?);
        }
        Ok(Part {
            staff_ids,
            track_name: req_child_text(node, "trackName")?.to_string(),
            instrument: Instrument::parse(req_child(node, "Instrument")?)?,
        })
    }

    fn is_keyboard(&self, diag: &mut Diagnostics) -> bool {
        is_keyboard_part(
            [
                Some(self.track_name.as_str()),
                self.instrument.instrument_id.as_deref(),
                Some(self.instrument.track_name.as_str()),
                self.instrument.long_name.as_deref(),
                self.instrument.short_name.as_deref(),
            ],
            diag,
        )
    }

    fn display_name(&self) -> &str {
        if self.track_name.is_empty() {
            &self.instrument.track_name
        } else {
            &self.track_name
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub track_name: String,
    pub instrument_id: Option<String>,
    pub articulations: Vec<InstrumentArticulation>,
}

impl Instrument {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut articulations = Vec::new();
        for articulation in children(node, "Articulation") {
            articulations.push(InstrumentArticulation::parse(articulation)?);
        }
        Ok(Instrument {
            long_name: opt_text(node, "longName"),
            short_name: opt_text(node, "shortName"),
            track_name: req_child_text(node, "trackName")?.to_string(),
            instrument_id: opt_text(node, "instrumentId"),
            articulations,
        })
    }
}

/// Articulation playback defaults declared on the instrument.
#[derive(Debug, Clone)]
pub struct InstrumentArticulation {
    pub velocity: i64,
    pub gate_time: i64,
}

impl InstrumentArticulation {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(InstrumentArticulation {
            velocity: req_int(node, "velocity")?,
            gate_time: req_int(node, "gateTime")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Staff {
    pub id: i64,
    pub vbox: Option<VBox>,
    pub measures: Vec<Measure>,
}

impl Staff {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let id = parse_int(req_attr(node, "id")?, "staff id")?;
        let vbox = match child(node, "VBox") {
            Some(vbox) => Some(VBox::parse(vbox)?),
            None => None,
        };
        let mut measures = Vec::new();
        for measure in children(node, "Measure") {
            measures.push(Measure::parse(measure, diag)?);
        }
        Ok(Staff { id, vbox, measures })
    }
}

#[derive(Debug, Clone)]
pub struct VBox {
    pub texts: Vec<FrameText>,
}

impl VBox {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut texts = Vec::new();
        for text in children(node, "Text") {
            texts.push(FrameText::parse(text)?);
        }
        Ok(VBox { texts })
    }
}

/// A front-matter text; the payload is either a plain `<text>` child or an
/// escaped `<html-data>` block.
#[derive(Debug, Clone)]
pub struct FrameText {
    pub subtype: Option<String>,
    pub style: Option<String>,
    pub text: String,
}

impl FrameText {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let html_text = child(node, "html-data").and_then(html_body_text);
        let text = match html_text {
            Some(text) => text,
            None => req_child_text(node, "text")?.to_string(),
        };
        Ok(FrameText {
            subtype: opt_text(node, "subtype"),
            style: opt_text(node, "style"),
            text,
        })
    }

    /// Key under which the text lands in the meta map.
    pub fn key(&self) -> Option<&str> {
        self.subtype.as_deref().or(self.style.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct Measure {
    pub number: i64,
    pub len_attr: Option<String>,
    /// Excluded from display numbering, not from timing.
    pub irregular: bool,
    pub key_sig: Option<KeySig>,
    pub time_sig: Option<TimeSig>,
    pub children: Vec<Event>,
    pub slurs: Vec<SlurDef>,
    /// Start tick, computed from the running sum of prior measures.
    pub tick: i64,
    /// Tick length, from the time signature in force.
    pub tick_length: i64,
    /// Distinct strokes after voice merging, in stream order.
    pub strokes: Vec<Stroke>,
    /// Resolved tick of each merged stroke.
    pub stroke_ticks: Vec<i64>,
}

impl Measure {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let number = parse_int(req_attr(node, "number")?, "measure number")?;
        let len_attr = node.attribute("len").map(str::to_string);
        let key_sig = match child(node, "KeySig") {
            Some(n) => Some(KeySig::parse(n)?),
            None => None,
        };
        let time_sig = match child(node, "TimeSig") {
            Some(n) => Some(TimeSig::parse(n, diag)?),
            None => None,
        };
        let mut slurs = Vec::new();
        for slur in children(node, "Slur") {
            slurs.push(SlurDef::parse(slur)?);
        }
        let mut events = Vec::new();
        for item in node.children().filter(|c| c.is_element()) {
            match item.tag_name().name() {
                "tick" => events.push(Event::TickMarker(parse_int(
                    item.text().unwrap_or(""),
                    "tick marker",
                )?)),
                "Dynamic" => events.push(Event::Dynamic(Dynamic::parse(item, diag)?)),
                "Tempo" => events.push(Event::Tempo(Tempo::parse(item, diag)?)),
                "Rest" => events.push(Event::Rest(Rest::parse(item, diag)?)),
                "Chord" => events.push(Event::Chord(Chord::parse(item, diag)?)),
                "Clef" => events.push(Event::Clef(Clef::parse(item, diag)?)),
                "StaffText" => events.push(Event::StaffText(StaffText::parse(item)?)),
                "Tuplet" => events.push(Event::Tuplet(TupletDef::parse(item, diag)?)),
                "Beam" | "LayoutBreak" | "BarLine" | "Harmony" | "KeySig" | "TimeSig" | "Slur"
                | "irregular" => {}
                other => diag.note_unknown_tag("Measure", other),
            }
        }
        Ok(Measure {
            number,
            len_attr,
            irregular: flag(node, "irregular"),
            key_sig,
            time_sig,
            children: events,
            slurs,
            tick: 0,
            tick_length: 0,
            strokes: Vec::new(),
            stroke_ticks: Vec::new(),
        })
    }

    fn merge_strokes(&mut self, stream_ticks: &[i64]) -> Result<(), ExtractError> {
        let mut strokes: Vec<Stroke> = Vec::new();
        let mut ticks: Vec<i64> = Vec::new();
        let mut stream = stream_ticks.iter();
        for event in &self.children {
            let stroke = match event {
                Event::Rest(rest) => Stroke::Rest(rest.clone()),
                Event::Chord(chord) => Stroke::Chord(chord.clone()),
                _ => continue,
            };
            let &tick = stream
                .next()
                .ok_or_else(|| ExtractError::malformed("stroke without resolved tick"))?;
            merge_into(&mut strokes, &mut ticks, stroke, tick);
        }
        if strokes.is_empty() {
            return Err(ExtractError::malformed(format!(
                "measure {} has no strokes",
                self.number
            )));
        }
        let distinct: BTreeSet<i64> = ticks.iter().copied().collect();
        if distinct.len() != ticks.len() {
            return Err(ExtractError::malformed(format!(
                "duplicate stroke tick after merge in measure {}",
                self.number
            )));
        }
        self.strokes = strokes;
        self.stroke_ticks = ticks;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KeySig {
    pub lid: Option<i64>,
    pub accidental: Option<i64>,
    pub custom: Option<i64>,
    pub mode: Option<String>,
}

impl KeySig {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(KeySig {
            lid: opt_int(node, "lid")?,
            accidental: opt_int(node, "accidental")?,
            custom: opt_int(node, "custom")?,
            mode: opt_text(node, "mode"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TimeSig {
    pub subtype: Option<i64>,
    pub lid: Option<i64>,
    pub sig_n: i64,
    pub sig_d: i64,
    pub show_courtesy_sig: bool,
}

impl TimeSig {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "TimeSig", &["tick"], diag);
        Ok(TimeSig {
            subtype: opt_int(node, "subtype")?,
            lid: opt_int(node, "lid")?,
            sig_n: req_int(node, "sigN")?,
            sig_d: req_int(node, "sigD")?,
            show_courtesy_sig: req_int(node, "showCourtesySig")? != 0,
        })
    }

    /// Duration symbol of a single beat.
    pub fn beat_sym(&self) -> Result<DurationSym, ExtractError> {
        duration::sym_for_denominator(self.sig_d)
    }

    /// Tick length of one measure under this signature.
    pub fn measure_tick_length(&self) -> Result<i64, ExtractError> {
        Ok(duration::tick_length(self.beat_sym()?, 0) * self.sig_n)
    }
}

/// One event in a measure's stream. Order matters.
#[derive(Debug, Clone)]
pub enum Event {
    /// Absolute-tick override for the next stroke.
    TickMarker(i64),
    Tempo(Tempo),
    Dynamic(Dynamic),
    Rest(Rest),
    Chord(Chord),
    Clef(Clef),
    StaffText(StaffText),
    Tuplet(TupletDef),
}

#[derive(Debug, Clone)]
pub struct Tempo {
    pub tempo: f64,
    pub text: String,
    pub follow_text: Option<bool>,
    pub lid: Option<i64>,
    pub visible: Option<bool>,
    /// Filled during reconstruction.
    pub resolved_tick: Option<i64>,
}

impl Tempo {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Tempo", &["tick"], diag);
        Ok(Tempo {
            tempo: req_float(node, "tempo")?,
            text: req_child_text(node, "text")?.to_string(),
            follow_text: opt_bool(node, "followText")?,
            lid: opt_int(node, "lid")?,
            visible: opt_bool(node, "visible")?,
            resolved_tick: None,
        })
    }

    /// Beats per minute.
    pub fn bpm(&self) -> f64 {
        duration::bpm(self.tempo)
    }
}

#[derive(Debug, Clone)]
pub struct Dynamic {
    pub subtype: String,
    pub velocity: Option<i64>,
    pub track: Option<i64>,
    pub text: Option<String>,
}

impl Dynamic {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Dynamic", &["style", "tick"], diag);
        let html_text = child(node, "html-data").and_then(html_body_text);
        let text = opt_text(node, "text").or(html_text);
        Ok(Dynamic {
            subtype: req_child_text(node, "subtype")?.to_string(),
            velocity: opt_int(node, "velocity")?,
            track: opt_int(node, "track")?,
            text,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StaffText {
    pub style: Option<String>,
    pub pos_x: Option<f64>,
    pub pos_y: Option<f64>,
    pub text: String,
}

impl StaffText {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let pos = child(node, "pos");
        let parse_pos = |value: Option<&str>| value.and_then(|v| v.trim().parse().ok());
        Ok(StaffText {
            style: opt_text(node, "style"),
            pos_x: parse_pos(pos.and_then(|p| p.attribute("x"))),
            pos_y: parse_pos(pos.and_then(|p| p.attribute("y"))),
            text: req_child_text(node, "text")?.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Clef {
    pub concert_clef_type: String,
    pub transposing_clef_type: String,
}

impl Clef {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Clef", &["subtype"], diag);
        Ok(Clef {
            concert_clef_type: req_child_text(node, "concertClefType")?.to_string(),
            transposing_clef_type: req_child_text(node, "transposingClefType")?.to_string(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self.concert_clef_type.as_str() {
            "G" => "Treble",
            "F" => "Bass",
            "C3" => "Alto",
            "C4" => "Tenor",
            _ => "Unknown",
        }
    }
}

/// A tuplet definition referenced by chords and rests through their
/// `<Tuplet>` id child.
#[derive(Debug, Clone)]
pub struct TupletDef {
    pub id: i64,
    pub track: Option<i64>,
    pub normal_notes: i64,
    pub actual_notes: i64,
    pub base_note: String,
}

impl TupletDef {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Tuplet", &["numberType", "bracketType", "tick"], diag);
        Ok(TupletDef {
            id: parse_int(req_attr(node, "id")?, "tuplet id")?,
            track: opt_int(node, "track")?,
            normal_notes: req_int(node, "normalNotes")?,
            actual_notes: req_int(node, "actualNotes")?,
            base_note: req_child_text(node, "baseNote")?.to_string(),
        })
    }
}

/// A measure-level slur definition; chords reference it by id.
#[derive(Debug, Clone)]
pub struct SlurDef {
    pub id: i64,
    pub track: i64,
}

impl SlurDef {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(SlurDef {
            id: parse_int(req_attr(node, "id")?, "slur id")?,
            track: req_int(node, "track")?,
        })
    }
}

/// Whole-measure rest length declared as a beat fraction.
#[derive(Debug, Clone, Copy)]
pub struct MeasureRestLen {
    pub numerator: i64,
    pub denominator: i64,
    pub ticks: i64,
}

impl MeasureRestLen {
    fn new(numerator: i64, denominator: i64) -> Result<Self, ExtractError> {
        let beat = duration::sym_for_denominator(denominator)?;
        Ok(MeasureRestLen {
            numerator,
            denominator,
            ticks: duration::tick_length(beat, 0) * numerator,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RestDuration {
    Measure(MeasureRestLen),
    Value(DurationSym),
}

#[derive(Debug, Clone)]
pub struct Rest {
    pub visible: Option<bool>,
    pub duration: RestDuration,
    pub dots: u32,
    pub articulation: Option<Articulation>,
}

impl Rest {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Rest", &["tick"], diag);
        let duration = match req_child_text(node, "durationType")? {
            "measure" => {
                let fraction = req_child(node, "duration")?;
                let numerator = parse_int(req_attr(fraction, "z")?, "rest duration")?;
                let denominator = parse_int(req_attr(fraction, "n")?, "rest duration")?;
                RestDuration::Measure(MeasureRestLen::new(numerator, denominator)?)
            }
            name => RestDuration::Value(duration::sym_from_name(name)?),
        };
        let articulation = match child(node, "Articulation") {
            Some(n) => Some(Articulation::parse(n)?),
            None => None,
        };
        Ok(Rest {
            visible: opt_bool(node, "visible")?,
            duration,
            dots: dots(node)?,
            articulation,
        })
    }

    pub fn pulsation(&self) -> f64 {
        match self.duration {
            RestDuration::Measure(len) => duration::ticks_to_pulsation(len.ticks),
            RestDuration::Value(sym) => duration::pulsation(sym, self.dots),
        }
    }

    pub fn tick_length(&self) -> i64 {
        match self.duration {
            RestDuration::Measure(len) => len.ticks,
            RestDuration::Value(sym) => duration::tick_length(sym, self.dots),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chord {
    pub track: Option<i64>,
    pub tuplet_id: Option<i64>,
    pub beam_id: Option<i64>,
    pub dots: u32,
    pub duration: DurationSym,
    pub slur: Option<SlurRef>,
    pub appoggiatura: bool,
    pub notes: Vec<Note>,
    pub articulation: Option<Articulation>,
    pub arpeggio: Option<Arpeggio>,
    pub tremolo: Option<Tremolo>,
}

impl Chord {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Chord", &["tick"], diag);
        let slur = match child(node, "Slur") {
            Some(n) => Some(SlurRef::parse(n)?),
            None => None,
        };
        let mut notes = Vec::new();
        for note in children(node, "Note") {
            notes.push(Note::parse(note)?);
        }
        if notes.is_empty() {
            return Err(ExtractError::malformed("chord without notes"));
        }
        let articulation = match child(node, "Articulation") {
            Some(n) => Some(Articulation::parse(n)?),
            None => None,
        };
        let arpeggio = match child(node, "Arpeggio") {
            Some(n) => Some(Arpeggio::parse(n)?),
            None => None,
        };
        let tremolo = match child(node, "Tremolo") {
            Some(n) => Some(Tremolo::parse(n)?),
            None => None,
        };
        Ok(Chord {
            track: opt_int(node, "track")?,
            tuplet_id: opt_int(node, "Tuplet")?,
            beam_id: opt_int(node, "Beam")?,
            dots: dots(node)?,
            duration: duration::sym_from_name(req_child_text(node, "durationType")?)?,
            slur,
            appoggiatura: flag(node, "appoggiatura"),
            notes,
            articulation,
            arpeggio,
            tremolo,
        })
    }

    pub fn pulsation(&self) -> f64 {
        duration::pulsation(self.duration, self.dots)
    }

    pub fn tick_length(&self) -> i64 {
        duration::tick_length(self.duration, self.dots)
    }

    pub fn is_multi_note(&self) -> bool {
        self.notes.len() > 1
    }
}

/// A chord-level slur reference tied to a measure-level definition.
#[derive(Debug, Clone)]
pub struct SlurRef {
    pub kind: Option<String>,
    pub id: i64,
}

impl SlurRef {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(SlurRef {
            kind: node.attribute("type").map(str::to_string),
            id: parse_int(req_attr(node, "id")?, "slur id")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Articulation {
    pub subtype: String,
    pub track: Option<i64>,
}

impl Articulation {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Articulation {
            subtype: req_child_text(node, "subtype")?.to_string(),
            track: opt_int(node, "track")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Arpeggio {
    pub track: Option<i64>,
    pub user_len: Option<f64>,
}

impl Arpeggio {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Arpeggio {
            track: opt_int(node, "track")?,
            user_len: opt_float(node, "userLen1")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Tremolo {
    pub subtype: String,
}

impl Tremolo {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Tremolo {
            subtype: req_child_text(node, "subtype")?.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Note {
    pub track: Option<i64>,
    pub visible: Option<bool>,
    /// True when the note starts or continues a tie.
    pub tie: bool,
    pub tie_id: Option<i64>,
    pub end_spanner_id: Option<i64>,
    pub pitch: i32,
    pub tpc: i32,
    pub tpc2: Option<i32>,
    pub accidental: Option<Accidental>,
    pub symbol: Option<Symbol>,
    pub velo_type: Option<String>,
    pub velocity: Option<i64>,
}

impl Note {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let tie = child(node, "Tie");
        let end_spanner = child(node, "endSpanner");
        let accidental = match child(node, "Accidental") {
            Some(n) => Some(Accidental::parse(n)?),
            None => None,
        };
        let symbol = match child(node, "Symbol") {
            Some(n) => Some(Symbol::parse(n)?),
            None => None,
        };
        Ok(Note {
            track: opt_int(node, "track")?,
            visible: opt_bool(node, "visible")?,
            tie: tie.is_some(),
            tie_id: tie
                .and_then(|n| n.attribute("id"))
                .and_then(|v| v.trim().parse().ok()),
            end_spanner_id: end_spanner
                .and_then(|n| n.attribute("id"))
                .and_then(|v| v.trim().parse().ok()),
            pitch: req_int(node, "pitch")? as i32,
            tpc: req_int(node, "tpc")? as i32,
            tpc2: opt_int(node, "tpc2")?.map(|v| v as i32),
            accidental,
            symbol,
            velo_type: opt_text(node, "veloType"),
            velocity: opt_int(node, "velocity")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Accidental {
    pub subtype: String,
    pub track: Option<i64>,
    pub visible: Option<bool>,
}

impl Accidental {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Accidental {
            subtype: req_child_text(node, "subtype")?.to_string(),
            track: opt_int(node, "track")?,
            visible: opt_bool(node, "visible")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
}

impl Symbol {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Symbol {
            name: req_child_text(node, "name")?.to_string(),
        })
    }
}

/// A stroke after voice merging.
#[derive(Debug, Clone)]
pub enum Stroke {
    Rest(Rest),
    Chord(Chord),
}

impl Stroke {
    pub fn tick_length(&self) -> i64 {
        match self {
            Stroke::Rest(rest) => rest.tick_length(),
            Stroke::Chord(chord) => chord.tick_length(),
        }
    }
}

impl Document {
    pub fn parse(root: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let version = root.attribute("version").unwrap_or("").to_string();
        let program_version = req_child_text(root, "programVersion")?.to_string();
        let program_revision = req_child_text(root, "programRevision")?.to_string();
        let score = Score::parse(req_child(root, "Score")?, diag)?;
        Ok(Document {
            version,
            program_version,
            program_revision,
            score,
        })
    }

    pub fn features(&self, diag: &mut Diagnostics) -> Option<Features> {
        self.score.features(diag)
    }

    pub fn meta_info(&self) -> BTreeMap<String, String> {
        self.score.meta_info()
    }
}

impl Score {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let mut parts = Vec::new();
        for part in children(node, "Part") {
            parts.push(Part::parse(part)?);
        }
        let mut meta_entries = Vec::new();
        for entry in children(node, "metaTag") {
            meta_entries.push(MetaEntry::parse(entry)?);
        }
        let mut staves = Vec::new();
        for staff in children(node, "Staff") {
            staves.push(Staff::parse(staff, diag)?);
        }
        staves.sort_by_key(|s| s.id);

        let mut score = Score {
            parts,
            staves,
            meta_entries,
            tempos: Vec::new(),
        };
        score.finalize()?;
        Ok(score)
    }

    /// Assign measure positions, resolve stroke and tempo ticks, and merge
    /// each measure's strokes. Runs once; the score is immutable after.
    fn finalize(&mut self) -> Result<(), ExtractError> {
        for staff in &mut self.staves {
            assign_measure_positions(staff)?;
            let stream_ticks = resolve_staff_ticks(staff)?;
            for (measure, ticks) in staff.measures.iter_mut().zip(&stream_ticks) {
                measure.merge_strokes(ticks)?;
            }
        }
        let mut tempos: Vec<(i64, f64)> = Vec::new();
        for staff in &self.staves {
            for measure in &staff.measures {
                for event in &measure.children {
                    if let Event::Tempo(tempo) = event {
                        let tick = tempo.resolved_tick.ok_or_else(|| {
                            ExtractError::malformed("tempo marking left unresolved")
                        })?;
                        tempos.push((tick, tempo.tempo));
                    }
                }
            }
        }
        tempos.sort_by_key(|t| t.0);
        self.tempos = tempos;
        Ok(())
    }

    fn features(&self, diag: &mut Diagnostics) -> Option<Features> {
        let staffs = self.keyboard_staffs(diag);
        if staffs.is_empty() {
            return None;
        }
        let refs: Vec<&dyn StaffMetrics> = staffs.iter().map(|s| s as &dyn StaffMetrics).collect();
        Some(collect_features(&refs))
    }

    /// The staves of the first keyboard part with exactly two staves,
    /// resolved through the part's staff-id references.
    fn keyboard_staffs(&self, diag: &mut Diagnostics) -> Vec<StaffView<'_>> {
        let mut views = Vec::new();
        let mut claimed = false;
        for part in &self.parts {
            if !part.is_keyboard(diag) {
                continue;
            }
            if part.staff_ids.len() != 2 {
                diag.note_ambiguous_part(part.display_name(), part.staff_ids.len());
                continue;
            }
            if claimed {
                diag.note_surplus_part(part.display_name());
                continue;
            }
            let resolved: Vec<&Staff> = part
                .staff_ids
                .iter()
                .filter_map(|&id| self.staves.iter().find(|s| s.id == id))
                .collect();
            if resolved.len() != 2 {
                log::warn!(
                    "keyboard part {:?} references missing staves",
                    part.display_name()
                );
                continue;
            }
            for staff in resolved {
                views.push(StaffView { score: self, staff });
            }
            claimed = true;
        }
        views
    }

    /// Front-matter texts first, score meta entries filling the gaps.
    fn meta_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        for staff in &self.staves {
            if let Some(vbox) = &staff.vbox {
                for text in &vbox.texts {
                    if let Some(key) = text.key() {
                        info.entry(key.to_string())
                            .or_insert_with(|| text.text.clone());
                    }
                }
            }
        }
        for entry in &self.meta_entries {
            if !entry.text.is_empty() {
                info.entry(entry.name.clone())
                    .or_insert_with(|| entry.text.clone());
            }
        }
        info
    }
}

/// Walk a staff's measures assigning start ticks and lengths: a measure's
/// length comes from its own time signature, else it inherits the previous
/// measure's.
fn assign_measure_positions(staff: &mut Staff) -> Result<(), ExtractError> {
    let mut tick = 0i64;
    let mut length: Option<i64> = None;
    for measure in &mut staff.measures {
        let current = match &measure.time_sig {
            Some(sig) => sig.measure_tick_length()?,
            None => length.ok_or_else(|| {
                ExtractError::malformed("first measure missing a time signature")
            })?,
        };
        measure.tick = tick;
        measure.tick_length = current;
        tick += current;
        length = Some(current);
    }
    Ok(())
}

/// Forward pass over one staff's event stream: resolves every stroke's
/// tick, honoring absolute-tick markers, and stamps tempo markings with
/// the tick of the next stroke. Returns the stream ticks per measure.
fn resolve_staff_ticks(staff: &mut Staff) -> Result<Vec<Vec<i64>>, ExtractError> {
    enum Seen {
        Marker(i64),
        PendingTempo,
        Stroke { length: i64 },
        Other,
    }

    let mut stream_ticks: Vec<Vec<i64>> = Vec::with_capacity(staff.measures.len());
    let mut pending_tempos: Vec<(usize, usize)> = Vec::new();
    let mut pending_tick: Option<i64> = None;
    for mi in 0..staff.measures.len() {
        let measure_tick = staff.measures[mi].tick;
        let mut previous: Option<(i64, i64)> = None;
        let mut ticks = Vec::new();
        for ci in 0..staff.measures[mi].children.len() {
            let seen = match &staff.measures[mi].children[ci] {
                Event::TickMarker(value) => Seen::Marker(*value),
                Event::Tempo(_) => Seen::PendingTempo,
                Event::Rest(rest) => Seen::Stroke {
                    length: rest.tick_length(),
                },
                Event::Chord(chord) => Seen::Stroke {
                    length: chord.tick_length(),
                },
                _ => Seen::Other,
            };
            match seen {
                Seen::Marker(value) => pending_tick = Some(value),
                Seen::PendingTempo => {
                    // a marker seen before the tempo fixes it immediately
                    if let Some(tick) = pending_tick {
                        if let Event::Tempo(tempo) = &mut staff.measures[mi].children[ci] {
                            tempo.resolved_tick = Some(tick);
                        }
                    } else {
                        pending_tempos.push((mi, ci));
                    }
                }
                Seen::Stroke { length } => {
                    let tick = match pending_tick.take() {
                        Some(tick) => tick,
                        None => match previous {
                            Some((prev_tick, prev_length)) => prev_tick + prev_length,
                            None => measure_tick,
                        },
                    };
                    ticks.push(tick);
                    previous = Some((tick, length));
                    for (pmi, pci) in pending_tempos.drain(..) {
                        if let Event::Tempo(tempo) = &mut staff.measures[pmi].children[pci] {
                            tempo.resolved_tick = Some(tick);
                        }
                    }
                }
                Seen::Other => {}
            }
        }
        stream_ticks.push(ticks);
    }
    if !pending_tempos.is_empty() {
        return Err(ExtractError::malformed(
            "tempo marking with no following stroke",
        ));
    }
    Ok(stream_ticks)
}

enum Resolution {
    Keep,
    Replace,
    Merged(Chord),
}

fn merge_into(strokes: &mut Vec<Stroke>, ticks: &mut Vec<i64>, stroke: Stroke, tick: i64) {
    let Some(idx) = ticks.iter().position(|&t| t == tick) else {
        strokes.push(stroke);
        ticks.push(tick);
        return;
    };
    let existing_len = strokes[idx].tick_length();
    let new_len = stroke.tick_length();
    let resolution = match (&strokes[idx], &stroke) {
        // the shorter stroke is assumed to be followed by another event
        (Stroke::Rest(_), _) if new_len < existing_len => Resolution::Replace,
        (Stroke::Rest(_), _) => Resolution::Keep,
        (Stroke::Chord(existing), Stroke::Chord(incoming)) => {
            Resolution::Merged(if new_len < existing_len {
                merge_chords(incoming, existing)
            } else {
                merge_chords(existing, incoming)
            })
        }
        (Stroke::Chord(_), Stroke::Rest(_)) => Resolution::Keep,
    };
    match resolution {
        Resolution::Keep => {}
        Resolution::Replace => strokes[idx] = stroke,
        Resolution::Merged(chord) => strokes[idx] = Stroke::Chord(chord),
    }
}

/// Union of two colliding chords' notes by pitch; the primary chord keeps
/// its duration and note order.
fn merge_chords(primary: &Chord, secondary: &Chord) -> Chord {
    let mut merged = primary.clone();
    let pitches: Vec<i32> = primary.notes.iter().map(|n| n.pitch).collect();
    merged.notes.extend(
        secondary
            .notes
            .iter()
            .filter(|n| !pitches.contains(&n.pitch))
            .cloned(),
    );
    merged
}

/// Per-staff view handed to the feature engine.
pub struct StaffView<'a> {
    score: &'a Score,
    staff: &'a Staff,
}

impl StaffMetrics for StaffView<'_> {
    fn notes(&self) -> Vec<NotePoint> {
        let mut notes = Vec::new();
        for measure in &self.staff.measures {
            for event in &measure.children {
                if let Event::Chord(chord) = event {
                    for note in &chord.notes {
                        notes.push(NotePoint {
                            pitch: note.pitch,
                            altered: note.accidental.is_some(),
                        });
                    }
                }
            }
        }
        notes
    }

    fn merged_chords(&self) -> Vec<ChordPoint> {
        let mut chords = Vec::new();
        for measure in &self.staff.measures {
            for stroke in &measure.strokes {
                if let Stroke::Chord(chord) = stroke {
                    chords.push(chord_point(chord));
                }
            }
        }
        chords
    }

    fn stroke_tick_sets(&self) -> Vec<BTreeSet<i64>> {
        self.staff
            .measures
            .iter()
            .map(|m| m.stroke_ticks.iter().copied().collect())
            .collect()
    }

    fn playing_speed(&self) -> Option<f64> {
        let tempos = &self.score.tempos;
        if tempos.is_empty() {
            return None;
        }
        let tempo_ticks: Vec<i64> = tempos.iter().map(|t| t.0).collect();
        let mut segments = vec![Vec::new(); tempos.len()];
        let mut last_tick = 0i64;
        for measure in &self.staff.measures {
            for (stroke, &tick) in measure.strokes.iter().zip(&measure.stroke_ticks) {
                if let Stroke::Chord(chord) = stroke {
                    segments[tempo_segment(&tempo_ticks, tick)].push(chord.pulsation());
                }
            }
            if let Some(&tick) = measure.stroke_ticks.last() {
                last_tick = tick;
            }
        }
        Some(average_playing_speed(tempos, &segments, last_tick))
    }
}

fn chord_point(chord: &Chord) -> ChordPoint {
    ChordPoint {
        notes: chord.notes.len(),
        all_tied: chord.notes.iter().all(|n| n.tie),
        low: chord.notes.iter().map(|n| n.pitch).min().unwrap_or(0),
        high: chord.notes.iter().map(|n| n.pitch).max().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_doc(xml: &str) -> (Document, Diagnostics) {
        let tree = roxmltree::Document::parse(xml).unwrap();
        let mut diag = Diagnostics::default();
        let doc = Document::parse(tree.root_element(), &mut diag).unwrap();
        (doc, diag)
    }

    fn try_parse(xml: &str) -> Result<Document, ExtractError> {
        let tree = roxmltree::Document::parse(xml).unwrap();
        let mut diag = Diagnostics::default();
        Document::parse(tree.root_element(), &mut diag)
    }

    fn chord(pitch: i32, duration: &str) -> String {
        format!(
            "<Chord><durationType>{duration}</durationType>\
             <Note><pitch>{pitch}</pitch><tpc>14</tpc></Note></Chord>"
        )
    }

    const TIME_SIG: &str =
        "<TimeSig><sigN>4</sigN><sigD>4</sigD><showCourtesySig>1</showCourtesySig></TimeSig>";

    fn doc_with_staff(staff_body: &str) -> String {
        format!(
            r#"<museScore version="2.06">
  <programVersion>2.0.3</programVersion>
  <programRevision>3c7a69d</programRevision>
  <Score>
    <Part>
      <Staff id="1"/>
      <trackName>Piano</trackName>
      <Instrument>
        <longName>Piano</longName>
        <trackName>Piano</trackName>
        <instrumentId>keyboard.piano</instrumentId>
      </Instrument>
    </Part>
    <metaTag name="workTitle">Invention</metaTag>
    <Staff id="1">{staff_body}</Staff>
  </Score>
</museScore>"#
        )
    }

    #[test]
    fn test_measure_length_from_time_signature_and_inheritance() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}</Measure><Measure number=\"2\">{}</Measure>",
            chord(60, "whole"),
            chord(62, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let staff = &doc.score.staves[0];
        assert_eq!(staff.measures[0].tick, 0);
        assert_eq!(staff.measures[0].tick_length, 1920);
        assert_eq!(staff.measures[1].tick, 1920);
        assert_eq!(staff.measures[1].tick_length, 1920);
    }

    #[test]
    fn test_first_measure_without_time_signature_is_malformed() {
        let body = format!("<Measure number=\"1\">{}</Measure>", chord(60, "whole"));
        assert!(matches!(
            try_parse(&doc_with_staff(&body)),
            Err(ExtractError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_tick_marker_overrides_next_stroke() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}<tick>960</tick>{}</Measure>",
            chord(60, "quarter"),
            chord(62, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert_eq!(doc.score.staves[0].measures[0].stroke_ticks, vec![0, 960]);
    }

    #[test]
    fn test_tempo_resolved_by_marker() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}<tick>480</tick>\
             <Tempo><tempo>2</tempo><text>Allegro</text></Tempo>{}</Measure>",
            chord(60, "quarter"),
            chord(62, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert_eq!(doc.score.tempos, vec![(480, 2.0)]);
        // the marker still applies to the stroke after the tempo
        assert_eq!(doc.score.staves[0].measures[0].stroke_ticks, vec![0, 480]);
    }

    #[test]
    fn test_tempo_resolved_by_next_stroke() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}\
             <Tempo><tempo>1.5</tempo><text>Adagio</text></Tempo>{}</Measure>",
            chord(60, "quarter"),
            chord(62, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert_eq!(doc.score.tempos, vec![(480, 1.5)]);
    }

    #[test]
    fn test_trailing_tempo_is_malformed() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}\
             <Tempo><tempo>1.5</tempo><text>Adagio</text></Tempo></Measure>",
            chord(60, "whole")
        );
        assert!(matches!(
            try_parse(&doc_with_staff(&body)),
            Err(ExtractError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_whole_measure_rest_uses_declared_fraction() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}\
             <Rest><durationType>measure</durationType><duration z=\"4\" n=\"4\"/></Rest></Measure>\
             <Measure number=\"2\">{}</Measure>",
            chord(60, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let staff = &doc.score.staves[0];
        match &staff.measures[0].strokes[0] {
            Stroke::Rest(rest) => assert_eq!(rest.tick_length(), 1920),
            _ => panic!("expected rest"),
        }
    }

    #[test]
    fn test_voice_collision_merges_chords() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}{}<tick>0</tick>{}{}</Measure>",
            chord(60, "half"),
            chord(62, "half"),
            chord(72, "quarter"),
            chord(74, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let measure = &doc.score.staves[0].measures[0];
        assert_eq!(measure.stroke_ticks, vec![0, 960, 480]);
        match &measure.strokes[0] {
            Stroke::Chord(c) => {
                let pitches: Vec<i32> = c.notes.iter().map(|n| n.pitch).collect();
                // the shorter quarter chord dominates, pitches are unioned
                assert_eq!(pitches, vec![72, 60]);
            }
            _ => panic!("expected chord"),
        }
    }

    #[test]
    fn test_meta_prefers_front_matter_over_meta_entries() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}</Measure>",
            chord(60, "whole")
        );
        let xml = doc_with_staff(&body).replace(
            "<Staff id=\"1\"><Measure",
            "<Staff id=\"1\"><VBox><Text><style>workTitle</style>\
             <text>Front Matter Title</text></Text></VBox><Measure",
        );
        let (doc, _) = parse_doc(&xml);
        let info = doc.meta_info();
        assert_eq!(
            info.get("workTitle").map(String::as_str),
            Some("Front Matter Title")
        );
    }

    #[test]
    fn test_meta_entries_fill_gaps() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}</Measure>",
            chord(60, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let info = doc.meta_info();
        assert_eq!(info.get("workTitle").map(String::as_str), Some("Invention"));
    }

    #[test]
    fn test_probe_fields_recorded() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}\
             <Tempo><tempo>2</tempo><text>fast</text><tick>0</tick></Tempo>{}</Measure>",
            chord(60, "quarter"),
            chord(62, "quarter")
        );
        let (_, diag) = parse_doc(&doc_with_staff(&body));
        assert!(diag.unexpected_fields.contains("Tempo/tick"));
    }

    #[test]
    fn test_single_staff_keyboard_part_excluded() {
        let body = format!(
            "<Measure number=\"1\">{TIME_SIG}{}</Measure>",
            chord(60, "whole")
        );
        let (doc, mut diag) = parse_doc(&doc_with_staff(&body));
        assert!(doc.features(&mut diag).is_none());
        assert_eq!(diag.ambiguous_parts.len(), 1);
    }
}
