//! # Format 3.x ("3.01" / "3.02")
//!
//! Document model and timeline reconstruction for the newest format family.
//!
//! Measure content is nested inside explicit `<voice>` groups, each an
//! independent event stream; the measure's canonical strokes are the union
//! of its voices' strokes merged by tick. A measure may declare a `len`
//! attribute (a beat fraction such as "3/4" or "1/8") that overrides its
//! effective length for pickup and irregular measures, while the nominal
//! length from the time signature keeps governing inheritance. A
//! `<RepeatMeasure>` child turns the measure into a copy of its
//! predecessor.

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

/// A parsed and fully reconstructed 3.x document.
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
    pub staff_refs: Vec<PartStaff>,
    pub track_name: String,
    pub instrument: Instrument,
}

impl Part {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut staff_refs = Vec::new();
        for staff in children(node, "Staff") {
            staff_refs.push(PartStaff::parse(staff)?);
        }
        Ok(Part {
            staff_refs,
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

/// A part's reference to one of its staves.
#[derive(Debug, Clone)]
pub struct PartStaff {
    pub id: i64,
    pub default_clef: Option<String>,
}

impl PartStaff {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(PartStaff {
            id: parse_int(req_attr(node, "id")?, "part staff id")?,
            default_clef: opt_text(node, "defaultClef"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub track_name: String,
    pub instrument_id: Option<String>,
    pub clef: Option<InstrumentClef>,
    pub articulations: Vec<InstrumentArticulation>,
}

impl Instrument {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let clef = match child(node, "clef") {
            Some(n) => Some(InstrumentClef::parse(n)),
            None => None,
        };
        let mut articulations = Vec::new();
        for articulation in children(node, "Articulation") {
            articulations.push(InstrumentArticulation::parse(articulation)?);
        }
        Ok(Instrument {
            long_name: opt_text(node, "longName"),
            short_name: opt_text(node, "shortName"),
            track_name: req_child_text(node, "trackName")?.to_string(),
            instrument_id: opt_text(node, "instrumentId"),
            clef,
            articulations,
        })
    }
}

/// Default clef declared on the instrument for one of its staves.
#[derive(Debug, Clone)]
pub struct InstrumentClef {
    /// 1-based staff number within the part; absent means the only staff.
    pub staff: i64,
    pub text: String,
}

impl InstrumentClef {
    fn parse(node: Node) -> Self {
        let staff = node
            .attribute("staff")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1);
        InstrumentClef {
            staff,
            text: node.text().unwrap_or("").to_string(),
        }
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
        let mut measures: Vec<Measure> = Vec::new();
        for measure_node in children(node, "Measure") {
            let measure = Measure::parse(measure_node, measures.last(), diag)?;
            measures.push(measure);
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

    pub fn key(&self) -> Option<&str> {
        self.subtype.as_deref().or(self.style.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct Measure {
    /// Effective-length override as a beat fraction, e.g. 3/4 or 1/8.
    pub len_override: Option<(i64, i64)>,
    /// Excluded from display numbering, not from timing.
    pub irregular: bool,
    pub key_sig: Option<KeySig>,
    pub time_sig: Option<TimeSig>,
    pub voices: Vec<Voice>,
    /// Start tick, computed from the running sum of prior measures.
    pub tick: i64,
    /// Length from the time signature in force, ignoring the override.
    pub nominal_tick_length: i64,
    /// Effective length; the override supersedes the time signature.
    pub tick_length: i64,
    /// Distinct strokes after cross-voice merging, in tick order.
    pub strokes: Vec<Stroke>,
    /// Resolved tick of each merged stroke, ascending.
    pub stroke_ticks: Vec<i64>,
}

impl Measure {
    fn parse(
        node: Node,
        previous: Option<&Measure>,
        diag: &mut Diagnostics,
    ) -> Result<Self, ExtractError> {
        let len_override = match node.attribute("len") {
            Some(text) => Some(parse_fraction(text)?),
            None => None,
        };
        let key_sig = match node
            .descendants()
            .find(|d| d.is_element() && d.has_tag_name("KeySig"))
        {
            Some(n) => Some(KeySig::parse(n)?),
            None => None,
        };
        let time_sig = match node
            .descendants()
            .find(|d| d.is_element() && d.has_tag_name("TimeSig"))
        {
            Some(n) => Some(TimeSig::parse(n, diag)?),
            None => None,
        };
        let mut voices = Vec::new();
        for voice in children(node, "voice") {
            voices.push(Voice::parse(voice, diag)?);
        }
        if voices.is_empty() {
            return Err(ExtractError::malformed("measure without voices"));
        }
        if voices.iter().all(|v| v.children.is_empty()) {
            return Err(ExtractError::malformed("measure with only empty voices"));
        }
        let repeats_previous = voices
            .iter()
            .flat_map(|v| v.children.iter())
            .any(|e| matches!(e, Event::RepeatMeasure(_)));
        if repeats_previous {
            let previous = previous
                .ok_or_else(|| ExtractError::malformed("measure repeat without predecessor"))?;
            return Ok(previous.clone());
        }
        Ok(Measure {
            len_override,
            irregular: flag(node, "irregular"),
            key_sig,
            time_sig,
            voices,
            tick: 0,
            nominal_tick_length: 0,
            tick_length: 0,
            strokes: Vec::new(),
            stroke_ticks: Vec::new(),
        })
    }

    /// Merge every voice's strokes into one tick-ordered sequence.
    fn merge_strokes(&mut self, voice_ticks: &[Vec<i64>]) -> Result<(), ExtractError> {
        let mut per_voice: Vec<Vec<(i64, &Event)>> = Vec::with_capacity(self.voices.len());
        for (voice, ticks) in self.voices.iter().zip(voice_ticks) {
            let mut stream = ticks.iter();
            let mut entries = Vec::new();
            for event in &voice.children {
                if matches!(event, Event::Rest(_) | Event::Chord(_)) {
                    let &tick = stream
                        .next()
                        .ok_or_else(|| ExtractError::malformed("stroke without resolved tick"))?;
                    entries.push((tick, event));
                }
            }
            per_voice.push(entries);
        }

        let union: BTreeSet<i64> = per_voice
            .iter()
            .flat_map(|entries| entries.iter().map(|(tick, _)| *tick))
            .collect();

        let mut strokes: Vec<Stroke> = Vec::new();
        let mut ticks: Vec<i64> = Vec::new();
        for &tick in &union {
            let mut merged: Option<Stroke> = None;
            for entries in &per_voice {
                for (entry_tick, event) in entries {
                    if *entry_tick != tick {
                        continue;
                    }
                    let stroke = match event {
                        Event::Rest(rest) => Stroke::Rest(rest.clone()),
                        Event::Chord(chord) => Stroke::Chord(chord.clone()),
                        _ => continue,
                    };
                    merged = Some(match merged {
                        None => stroke,
                        Some(existing) => merge_pair(existing, stroke),
                    });
                }
            }
            if let Some(stroke) = merged {
                strokes.push(stroke);
                ticks.push(tick);
            }
        }
        if strokes.is_empty() {
            return Err(ExtractError::malformed("measure has no strokes"));
        }
        let distinct: BTreeSet<i64> = ticks.iter().copied().collect();
        if distinct.len() != ticks.len() {
            return Err(ExtractError::malformed(
                "duplicate stroke tick after merge",
            ));
        }
        self.strokes = strokes;
        self.stroke_ticks = ticks;
        Ok(())
    }
}

fn parse_fraction(text: &str) -> Result<(i64, i64), ExtractError> {
    let mut split = text.trim().splitn(2, '/');
    let numerator = split
        .next()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ExtractError::malformed(format!("invalid fraction: {text:?}")))?;
    let denominator = split
        .next()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ExtractError::malformed(format!("invalid fraction: {text:?}")))?;
    Ok((numerator, denominator))
}

/// Ticks spanned by `numerator` beats of a `1/denominator` beat unit.
fn fraction_ticks(numerator: i64, denominator: i64) -> Result<i64, ExtractError> {
    let beat = duration::sym_for_denominator(denominator)?;
    Ok(duration::tick_length(beat, 0) * numerator)
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
    pub sig_n: i64,
    pub sig_d: i64,
}

impl TimeSig {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "TimeSig", &["tick", "showCourtesySig", "lid"], diag);
        Ok(TimeSig {
            subtype: opt_int(node, "subtype")?,
            sig_n: req_int(node, "sigN")?,
            sig_d: req_int(node, "sigD")?,
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

/// One independent event stream of a measure.
#[derive(Debug, Clone)]
pub struct Voice {
    pub children: Vec<Event>,
}

impl Voice {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
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
                "Harmony" => events.push(Event::Harmony(Harmony::parse(item)?)),
                "RepeatMeasure" => {
                    events.push(Event::RepeatMeasure(RepeatMeasure::parse(item)?))
                }
                "Tuplet" => events.push(Event::Tuplet(TupletDef::parse(item, diag)?)),
                "Beam" | "LayoutBreak" | "BarLine" | "KeySig" | "TimeSig" => {}
                other => diag.note_unknown_tag("voice", other),
            }
        }
        Ok(Voice { children: events })
    }
}

/// One event in a voice's stream. Order matters.
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
    Harmony(Harmony),
    RepeatMeasure(RepeatMeasure),
    Tuplet(TupletDef),
}

/// Replaces the containing measure with a copy of its predecessor.
#[derive(Debug, Clone)]
pub struct RepeatMeasure {
    pub duration: (i64, i64),
}

impl RepeatMeasure {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let duration_type = req_child_text(node, "durationType")?;
        if duration_type != "measure" {
            return Err(ExtractError::malformed(format!(
                "unexpected RepeatMeasure durationType: {duration_type:?}"
            )));
        }
        let duration = parse_fraction(req_child_text(node, "duration")?)?;
        Ok(RepeatMeasure { duration })
    }
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
    pub style: Option<i64>,
    pub subtype: String,
    pub velocity: Option<i64>,
    pub track: Option<i64>,
    pub text: Option<String>,
}

impl Dynamic {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Dynamic", &["tick"], diag);
        let html_text = child(node, "html-data").and_then(html_body_text);
        let text = opt_text(node, "text").or(html_text);
        Ok(Dynamic {
            style: opt_int(node, "style")?,
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

/// Latches onto the next rest or chord.
#[derive(Debug, Clone)]
pub struct Harmony {
    pub root: i64,
    pub name: Option<String>,
    pub base: Option<i64>,
    pub play: Option<bool>,
}

impl Harmony {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Harmony {
            root: req_int(node, "root")?,
            name: opt_text(node, "name"),
            base: opt_int(node, "base")?,
            play: opt_bool(node, "play")?,
        })
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

/// Whole-measure rest length declared as a beat fraction.
#[derive(Debug, Clone, Copy)]
pub struct MeasureRestLen {
    pub numerator: i64,
    pub denominator: i64,
    pub ticks: i64,
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
                let (numerator, denominator) = parse_fraction(req_child_text(node, "duration")?)?;
                RestDuration::Measure(MeasureRestLen {
                    numerator,
                    denominator,
                    ticks: fraction_ticks(numerator, denominator)?,
                })
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

/// A chord-level slur reference.
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
    pub subtype: i64,
    pub track: Option<i64>,
    pub user_len: Option<f64>,
}

impl Arpeggio {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Arpeggio {
            subtype: req_int(node, "subtype")?,
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
    pub fingering: Option<i64>,
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
        let fingering = child(node, "Fingering")
            .and_then(|n| child(n, "text"))
            .and_then(|n| n.text())
            .and_then(|v| v.trim().parse().ok());
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
            fingering,
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

/// A stroke after cross-voice merging.
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
    /// each measure's voices. Runs once; the score is immutable after.
    fn finalize(&mut self) -> Result<(), ExtractError> {
        for staff in &mut self.staves {
            assign_measure_positions(staff)?;
            let voice_ticks = resolve_staff_ticks(staff)?;
            for (measure, ticks) in staff.measures.iter_mut().zip(&voice_ticks) {
                measure.merge_strokes(ticks)?;
            }
        }
        let mut tempos: Vec<(i64, f64)> = Vec::new();
        for staff in &self.staves {
            for measure in &staff.measures {
                for voice in &measure.voices {
                    for event in &voice.children {
                        if let Event::Tempo(tempo) = event {
                            let tick = tempo.resolved_tick.ok_or_else(|| {
                                ExtractError::malformed("tempo marking left unresolved")
                            })?;
                            tempos.push((tick, tempo.tempo));
                        }
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
            if part.staff_refs.len() != 2 {
                diag.note_ambiguous_part(part.display_name(), part.staff_refs.len());
                continue;
            }
            if claimed {
                diag.note_surplus_part(part.display_name());
                continue;
            }
            let resolved: Vec<&Staff> = part
                .staff_refs
                .iter()
                .filter_map(|r| self.staves.iter().find(|s| s.id == r.id))
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

/// Walk a staff's measures assigning start ticks and lengths. The nominal
/// length follows the time-signature chain; the `len` override supersedes
/// it for the measure's own span only.
fn assign_measure_positions(staff: &mut Staff) -> Result<(), ExtractError> {
    let mut tick = 0i64;
    let mut previous_nominal: Option<i64> = None;
    for measure in &mut staff.measures {
        let nominal = match &measure.time_sig {
            Some(sig) => sig.measure_tick_length()?,
            None => match previous_nominal {
                Some(length) => length,
                // first measure with no signature at all
                None => match measure.len_override {
                    Some((_, denominator)) => fraction_ticks(denominator, denominator)?,
                    None => duration::tick_length(DurationSym::Quarter, 0) * 4,
                },
            },
        };
        let effective = match measure.len_override {
            Some((numerator, denominator)) => fraction_ticks(numerator, denominator)?,
            None => nominal,
        };
        if effective <= 0 || nominal <= 0 {
            return Err(ExtractError::malformed("non-positive measure length"));
        }
        measure.tick = tick;
        measure.nominal_tick_length = nominal;
        measure.tick_length = effective;
        tick += effective;
        previous_nominal = Some(nominal);
    }
    Ok(())
}

/// Forward pass over one staff's voice streams: resolves every stroke's
/// tick per voice, honoring absolute-tick markers, and stamps tempo
/// markings with the tick of the next stroke. Returns the stream ticks per
/// measure and voice.
fn resolve_staff_ticks(staff: &mut Staff) -> Result<Vec<Vec<Vec<i64>>>, ExtractError> {
    enum Seen {
        Marker(i64),
        PendingTempo,
        Stroke { length: i64 },
        Other,
    }

    let mut all_ticks: Vec<Vec<Vec<i64>>> = Vec::with_capacity(staff.measures.len());
    let mut pending_tempos: Vec<(usize, usize, usize)> = Vec::new();
    let mut pending_tick: Option<i64> = None;
    for mi in 0..staff.measures.len() {
        let measure_tick = staff.measures[mi].tick;
        let voice_count = staff.measures[mi].voices.len();
        let mut measure_ticks: Vec<Vec<i64>> = Vec::with_capacity(voice_count);
        for vi in 0..voice_count {
            let mut previous: Option<(i64, i64)> = None;
            let mut ticks = Vec::new();
            for ci in 0..staff.measures[mi].voices[vi].children.len() {
                let seen = match &staff.measures[mi].voices[vi].children[ci] {
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
                        if let Some(tick) = pending_tick {
                            if let Event::Tempo(tempo) =
                                &mut staff.measures[mi].voices[vi].children[ci]
                            {
                                tempo.resolved_tick = Some(tick);
                            }
                        } else {
                            pending_tempos.push((mi, vi, ci));
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
                        for (pmi, pvi, pci) in pending_tempos.drain(..) {
                            if let Event::Tempo(tempo) =
                                &mut staff.measures[pmi].voices[pvi].children[pci]
                            {
                                tempo.resolved_tick = Some(tick);
                            }
                        }
                    }
                    Seen::Other => {}
                }
            }
            measure_ticks.push(ticks);
        }
        all_ticks.push(measure_ticks);
    }
    if !pending_tempos.is_empty() {
        return Err(ExtractError::malformed(
            "tempo marking with no following stroke",
        ));
    }
    Ok(all_ticks)
}

/// Resolve two strokes colliding at one tick.
fn merge_pair(existing: Stroke, incoming: Stroke) -> Stroke {
    let existing_len = existing.tick_length();
    let incoming_len = incoming.tick_length();
    match (&existing, &incoming) {
        // the shorter stroke is assumed to be followed by another event
        (Stroke::Rest(_), _) => {
            if incoming_len < existing_len {
                incoming
            } else {
                existing
            }
        }
        (Stroke::Chord(a), Stroke::Chord(b)) => Stroke::Chord(if incoming_len < existing_len {
            merge_chords(b, a)
        } else {
            merge_chords(a, b)
        }),
        (Stroke::Chord(_), Stroke::Rest(_)) => existing,
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
            for voice in &measure.voices {
                for event in &voice.children {
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

    const TIME_SIG: &str = "<TimeSig><sigN>4</sigN><sigD>4</sigD></TimeSig>";

    fn doc_with_staff(staff_body: &str) -> String {
        format!(
            r#"<museScore version="3.02">
  <programVersion>3.2.3</programVersion>
  <programRevision>d2d863f</programRevision>
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
    <metaTag name="workTitle">Prelude</metaTag>
    <Staff id="1">{staff_body}</Staff>
  </Score>
</museScore>"#
        )
    }

    #[test]
    fn test_voice_union_merging() {
        let body = format!(
            "<Measure>{TIME_SIG}<voice>{}{}</voice><voice>{}{}{}{}</voice></Measure>",
            chord(60, "half"),
            chord(62, "half"),
            chord(72, "quarter"),
            chord(74, "quarter"),
            chord(76, "quarter"),
            chord(77, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let measure = &doc.score.staves[0].measures[0];
        // union of {0, 960} and {0, 480, 960, 1440}, ascending
        assert_eq!(measure.stroke_ticks, vec![0, 480, 960, 1440]);
        assert_eq!(measure.strokes.len(), measure.stroke_ticks.len());
        match &measure.strokes[0] {
            Stroke::Chord(c) => {
                let pitches: Vec<i32> = c.notes.iter().map(|n| n.pitch).collect();
                // the quarter in voice 2 is shorter and dominates the merge
                assert_eq!(pitches, vec![72, 60]);
            }
            _ => panic!("expected chord"),
        }
        match &measure.strokes[2] {
            Stroke::Chord(c) => {
                let pitches: Vec<i32> = c.notes.iter().map(|n| n.pitch).collect();
                assert_eq!(pitches, vec![76, 62]);
            }
            _ => panic!("expected chord"),
        }
    }

    #[test]
    fn test_len_override_supersedes_time_signature() {
        let body = format!(
            "<Measure len=\"1/8\">{TIME_SIG}<voice>\
             <Rest><durationType>measure</durationType><duration>1/8</duration></Rest>\
             </voice></Measure>\
             <Measure><voice>{}</voice></Measure>",
            chord(60, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let staff = &doc.score.staves[0];
        assert_eq!(staff.measures[0].tick_length, 240);
        assert_eq!(staff.measures[0].nominal_tick_length, 1920);
        // the next measure starts after the overridden span and inherits
        // the nominal length
        assert_eq!(staff.measures[1].tick, 240);
        assert_eq!(staff.measures[1].tick_length, 1920);
    }

    #[test]
    fn test_whole_measure_rest_with_fraction() {
        let body = format!(
            "<Measure len=\"3/4\">{TIME_SIG}<voice>\
             <Rest><durationType>measure</durationType><duration>3/4</duration></Rest>\
             </voice></Measure>\
             <Measure><voice>{}</voice></Measure>",
            chord(60, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let measure = &doc.score.staves[0].measures[0];
        assert_eq!(measure.tick_length, 1440);
        match &measure.strokes[0] {
            Stroke::Rest(rest) => assert_eq!(rest.tick_length(), 1440),
            _ => panic!("expected rest"),
        }
    }

    #[test]
    fn test_repeat_measure_clones_previous() {
        let body = format!(
            "<Measure>{TIME_SIG}<voice>{}{}</voice></Measure>\
             <Measure><voice>\
             <RepeatMeasure><durationType>measure</durationType><duration>4/4</duration></RepeatMeasure>\
             </voice></Measure>",
            chord(60, "half"),
            chord(64, "half")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let staff = &doc.score.staves[0];
        assert_eq!(staff.measures[1].stroke_ticks, vec![1920, 2880]);
        assert_eq!(staff.measures[1].strokes.len(), 2);
    }

    #[test]
    fn test_repeat_measure_first_is_malformed() {
        let body = "<Measure><voice>\
             <RepeatMeasure><durationType>measure</durationType><duration>4/4</duration></RepeatMeasure>\
             </voice></Measure>";
        assert!(matches!(
            try_parse(&doc_with_staff(body)),
            Err(ExtractError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_tempo_resolution_across_voices() {
        let body = format!(
            "<Measure>{TIME_SIG}<voice>\
             <Tempo><tempo>2</tempo><text>Allegro</text></Tempo>{}{}</voice></Measure>",
            chord(60, "half"),
            chord(62, "half")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert_eq!(doc.score.tempos, vec![(0, 2.0)]);
    }

    #[test]
    fn test_first_measure_without_signature_defaults_to_common_time() {
        let body = format!(
            "<Measure><voice>{}</voice></Measure><Measure><voice>{}</voice></Measure>",
            chord(60, "whole"),
            chord(62, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let staff = &doc.score.staves[0];
        assert_eq!(staff.measures[0].tick_length, 1920);
        assert_eq!(staff.measures[1].tick, 1920);
    }

    #[test]
    fn test_irregular_flag_parsed() {
        let body = format!(
            "<Measure len=\"1/4\">{TIME_SIG}<irregular/><voice>{}</voice></Measure>",
            chord(60, "quarter")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert!(doc.score.staves[0].measures[0].irregular);
        assert_eq!(doc.score.staves[0].measures[0].tick_length, 480);
    }

    #[test]
    fn test_measure_without_voices_is_malformed() {
        let body = "<Measure></Measure>";
        assert!(matches!(
            try_parse(&doc_with_staff(body)),
            Err(ExtractError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_time_signature_found_inside_voice() {
        let body = format!(
            "<Measure><voice>{TIME_SIG}{}</voice></Measure>",
            chord(60, "whole")
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        assert_eq!(doc.score.staves[0].measures[0].tick_length, 1920);
    }

    #[test]
    fn test_tie_detection() {
        let body = format!(
            "<Measure>{TIME_SIG}<voice>\
             <Chord><durationType>half</durationType>\
             <Note><pitch>60</pitch><tpc>14</tpc><Tie id=\"1\"/></Note></Chord>\
             <Chord><durationType>half</durationType>\
             <Note><pitch>60</pitch><tpc>14</tpc><endSpanner id=\"1\"/></Note></Chord>\
             </voice></Measure>"
        );
        let (doc, _) = parse_doc(&doc_with_staff(&body));
        let measure = &doc.score.staves[0].measures[0];
        match (&measure.strokes[0], &measure.strokes[1]) {
            (Stroke::Chord(first), Stroke::Chord(second)) => {
                assert!(first.notes[0].tie);
                assert!(!second.notes[0].tie);
                assert_eq!(second.notes[0].end_spanner_id, Some(1));
            }
            _ => panic!("expected chords"),
        }
    }
}
