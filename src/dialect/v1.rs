//! # Format 1.x ("1.14")
//!
//! Document model and timeline reconstruction for the oldest format family.
//!
//! This dialect centralizes timing at the document level: a `<siglist>` of
//! time-signature change records determines every measure's start tick and
//! length (staves only reference measures positionally), and a document
//! `<tempolist>` mirrors the tempo markings found in the event streams.
//! Individual chords, rests and tempo markings may also carry their own
//! explicit `<tick>` child, which overrides the running position.
//!
//! Front matter lives in per-staff `<VBox>` blocks whose texts are wrapped
//! in escaped `<html-data>` payloads.

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
    opt_text, parse_float, parse_int, req_attr, req_child, req_child_text, req_float, req_int,
};

/// A parsed and fully reconstructed 1.x document.
#[derive(Debug, Clone)]
pub struct Document {
    pub version: String,
    pub program_version: String,
    pub program_revision: String,
    pub sig_changes: Vec<SigChange>,
    pub tempo_changes: Vec<TempoChange>,
    pub parts: Vec<Part>,
    pub staves: Vec<Staff>,
    /// Tempo markings from all staves as `(tick, value)`, sorted by tick.
    pub tempos: Vec<(i64, f64)>,
}

/// One `<siglist>` entry: the time signature in force from `tick` on, with
/// an actual (pickup) value that may differ from the nominal one.
#[derive(Debug, Clone)]
pub struct SigChange {
    pub tick: i64,
    pub nom: i64,
    pub denom: i64,
    pub nom2: Option<i64>,
    pub denom2: Option<i64>,
}

impl SigChange {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(SigChange {
            tick: parse_int(req_attr(node, "tick")?, "sig tick")?,
            nom: req_int(node, "nom")?,
            denom: req_int(node, "denom")?,
            nom2: opt_int(node, "nom2")?,
            denom2: opt_int(node, "denom2")?,
        })
    }

    /// Beats in the measure exactly at this record's tick (pickup value).
    pub fn actual_nominator(&self) -> i64 {
        self.nom
    }

    pub fn actual_denominator(&self) -> i64 {
        self.denom
    }

    /// Beats per measure while this record is in force.
    pub fn nominal_nominator(&self) -> i64 {
        self.nom2.unwrap_or(self.nom)
    }

    pub fn nominal_denominator(&self) -> i64 {
        self.denom2.unwrap_or(self.denom)
    }

    pub fn nominal_measure_ticks(&self) -> Result<i64, ExtractError> {
        let beat = duration::sym_for_denominator(self.nominal_denominator())?;
        Ok(duration::tick_length(beat, 0) * self.nominal_nominator())
    }

    pub fn actual_measure_ticks(&self) -> Result<i64, ExtractError> {
        let beat = duration::sym_for_denominator(self.actual_denominator())?;
        Ok(duration::tick_length(beat, 0) * self.actual_nominator())
    }
}

/// One `<tempolist>` entry.
#[derive(Debug, Clone)]
pub struct TempoChange {
    pub tick: i64,
    pub value: f64,
}

impl TempoChange {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(TempoChange {
            tick: parse_int(req_attr(node, "tick")?, "tempo tick")?,
            value: parse_float(node.text().unwrap_or(""), "tempo")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Part {
    /// Placeholder staves sizing the positional part-to-staff mapping.
    pub staff_slots: Vec<PartStaff>,
    pub name: Option<String>,
    pub instrument: Instrument,
}

impl Part {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut staff_slots = Vec::new();
        for staff in children(node, "Staff") {
            staff_slots.push(PartStaff::parse(staff)?);
        }
        let name = match child(node, "name") {
            Some(name_node) => Some(
                html_body_text(req_child(name_node, "html-data")?)
                    .ok_or_else(|| ExtractError::malformed("part name without html body"))?,
            ),
            None => None,
        };
        let instrument = Instrument::parse(req_child(node, "Instrument")?)?;
        Ok(Part {
            staff_slots,
            name,
            instrument,
        })
    }

    fn is_keyboard(&self, diag: &mut Diagnostics) -> bool {
        is_keyboard_part(
            [self.name.as_deref(), self.instrument.track_name.as_deref()],
            diag,
        )
    }

    fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.instrument.track_name.as_deref())
            .unwrap_or("")
    }
}

/// Per-part staff entry carrying clef and key change lists.
#[derive(Debug, Clone)]
pub struct PartStaff {
    pub clef_changes: Vec<IdxChange>,
    pub key_changes: Vec<IdxChange>,
}

impl PartStaff {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut clef_changes = Vec::new();
        for clef in children(req_child(node, "cleflist")?, "clef") {
            clef_changes.push(IdxChange::parse(clef)?);
        }
        let mut key_changes = Vec::new();
        for key in children(req_child(node, "keylist")?, "key") {
            key_changes.push(IdxChange::parse(key)?);
        }
        Ok(PartStaff {
            clef_changes,
            key_changes,
        })
    }
}

/// A `(tick, idx)` change record from a clef or key list.
#[derive(Debug, Clone, Copy)]
pub struct IdxChange {
    pub tick: i64,
    pub idx: i64,
}

impl IdxChange {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(IdxChange {
            tick: parse_int(req_attr(node, "tick")?, "tick")?,
            idx: parse_int(req_attr(node, "idx")?, "idx")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub track_name: Option<String>,
}

impl Instrument {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Instrument {
            track_name: opt_text(node, "trackName"),
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

/// A front-matter text, e.g. subtype "Title" or "Composer".
#[derive(Debug, Clone)]
pub struct FrameText {
    pub subtype: String,
    pub text: String,
}

impl FrameText {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let subtype = req_child_text(node, "subtype")?.to_string();
        let text = html_body_text(req_child(node, "html-data")?)
            .ok_or_else(|| ExtractError::malformed("frame text without html body"))?;
        Ok(FrameText { subtype, text })
    }
}

#[derive(Debug, Clone)]
pub struct Measure {
    pub number: i64,
    pub len_attr: Option<String>,
    pub key_sig: Option<KeySig>,
    pub time_sig: Option<TimeSig>,
    pub children: Vec<Event>,
    /// Start tick, from the document signature list.
    pub tick: i64,
    /// Tick length, from the document signature list.
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
            Some(n) => Some(TimeSig::parse(n)?),
            None => None,
        };
        let mut events = Vec::new();
        for item in node.children().filter(|c| c.is_element()) {
            match item.tag_name().name() {
                "Dynamic" => events.push(Event::Dynamic(Dynamic::parse(item)?)),
                "Tempo" => events.push(Event::Tempo(Tempo::parse(item)?)),
                "Rest" => events.push(Event::Rest(Rest::parse(item, diag)?)),
                "Chord" => events.push(Event::Chord(Chord::parse(item, diag)?)),
                "Clef" => events.push(Event::Clef(Clef::parse(item))),
                "Harmony" => events.push(Event::Harmony(Harmony::parse(item)?)),
                "Beam" | "LayoutBreak" | "BarLine" | "KeySig" | "TimeSig" => {}
                other => diag.note_unknown_tag("Measure", other),
            }
        }
        Ok(Measure {
            number,
            len_attr,
            key_sig,
            time_sig,
            children: events,
            tick: 0,
            tick_length: 0,
            strokes: Vec::new(),
            stroke_ticks: Vec::new(),
        })
    }

    /// Collapse the event stream into distinct strokes using the resolved
    /// stream ticks.
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
            merge_into(&mut strokes, &mut ticks, stroke, tick, self.tick_length);
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
    pub subtype: Option<i64>,
    pub key_syms: Vec<KeySym>,
    pub show_courtesy_sig: Option<bool>,
    pub show_naturals: Option<bool>,
}

impl KeySig {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let mut key_syms = Vec::new();
        for sym in children(node, "KeySym") {
            key_syms.push(KeySym::parse(sym)?);
        }
        Ok(KeySig {
            subtype: opt_int(node, "subtype")?,
            key_syms,
            show_courtesy_sig: opt_bool(node, "showCourtesySig")?,
            show_naturals: opt_bool(node, "showNaturals")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeySym {
    pub sym: i64,
    pub pos_x: Option<String>,
    pub pos_y: Option<String>,
}

impl KeySym {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let pos = child(node, "pos");
        Ok(KeySym {
            sym: req_int(node, "sym")?,
            pos_x: pos.and_then(|p| p.attribute("x")).map(str::to_string),
            pos_y: pos.and_then(|p| p.attribute("y")).map(str::to_string),
        })
    }
}

/// A measure-level time signature record. Measure lengths come from the
/// document signature list; this is kept for the model only.
#[derive(Debug, Clone)]
pub struct TimeSig {
    pub subtype: i64,
    pub tick: Option<i64>,
    pub den: i64,
    pub nom1: i64,
    pub nom2: Option<i64>,
}

impl TimeSig {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(TimeSig {
            subtype: req_int(node, "subtype")?,
            tick: opt_int(node, "tick")?,
            den: req_int(node, "den")?,
            nom1: req_int(node, "nom1")?,
            nom2: opt_int(node, "nom2")?,
        })
    }

    pub fn nominator(&self) -> i64 {
        self.nom2.unwrap_or(self.nom1)
    }

    pub fn measure_tick_length(&self) -> Result<i64, ExtractError> {
        let beat = duration::sym_for_denominator(self.den)?;
        Ok(duration::tick_length(beat, 0) * self.nominator())
    }
}

/// One event in a measure's stream. Order matters.
#[derive(Debug, Clone)]
pub enum Event {
    Tempo(Tempo),
    Dynamic(Dynamic),
    Rest(Rest),
    Chord(Chord),
    Clef(Clef),
    Harmony(Harmony),
}

#[derive(Debug, Clone)]
pub struct Tempo {
    pub tempo: f64,
    pub style: i64,
    pub text: String,
    pub explicit_tick: Option<i64>,
    /// Filled during reconstruction when no explicit tick is present.
    pub resolved_tick: Option<i64>,
}

impl Tempo {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        let subtype = req_child_text(node, "subtype")?;
        if subtype != "Tempo" {
            return Err(ExtractError::malformed(format!(
                "unexpected Tempo subtype: {subtype:?}"
            )));
        }
        let text = html_body_text(req_child(node, "html-data")?)
            .ok_or_else(|| ExtractError::malformed("tempo text without html body"))?;
        Ok(Tempo {
            tempo: req_float(node, "tempo")?,
            style: req_int(node, "style")?,
            text,
            explicit_tick: opt_int(node, "tick")?,
            resolved_tick: None,
        })
    }

    /// The tick this marking takes effect at.
    pub fn tick(&self) -> Option<i64> {
        self.explicit_tick.or(self.resolved_tick)
    }

    /// Beats per minute.
    pub fn bpm(&self) -> f64 {
        duration::bpm(self.tempo)
    }
}

#[derive(Debug, Clone)]
pub struct Dynamic {
    pub style: i64,
    pub subtype: Option<String>,
    pub tick: Option<i64>,
    pub text: Option<String>,
}

impl Dynamic {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Dynamic {
            style: req_int(node, "style")?,
            subtype: opt_text(node, "subtype"),
            tick: opt_int(node, "tick")?,
            text: child(node, "html-data").and_then(html_body_text),
        })
    }
}

/// Latches onto the next rest or chord.
#[derive(Debug, Clone)]
pub struct Harmony {
    pub root: i64,
    pub extension: i64,
    pub tick: Option<i64>,
}

impl Harmony {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Harmony {
            root: req_int(node, "root")?,
            extension: req_int(node, "extension")?,
            tick: opt_int(node, "tick")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Clef {
    pub subtype: Option<String>,
}

impl Clef {
    fn parse(node: Node) -> Self {
        Clef {
            subtype: opt_text(node, "subtype"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.subtype.as_deref() {
            None => "Treble",
            Some("4") => "Bass",
            _ => "Unknown",
        }
    }
}

/// Rest duration: either an explicit symbol or the whole measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestDuration {
    Measure,
    Value(DurationSym),
}

#[derive(Debug, Clone)]
pub struct Rest {
    pub visible: Option<bool>,
    pub tick: Option<i64>,
    pub duration: RestDuration,
    pub dots: u32,
    pub articulation: Option<Articulation>,
}

impl Rest {
    fn parse(node: Node, _diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let duration = match req_child_text(node, "durationType")? {
            "measure" => RestDuration::Measure,
            name => RestDuration::Value(duration::sym_from_name(name)?),
        };
        let articulation = match child(node, "Articulation") {
            Some(n) => Some(Articulation::parse(n)?),
            None => None,
        };
        Ok(Rest {
            visible: opt_bool(node, "visible")?,
            tick: opt_int(node, "tick")?,
            duration,
            dots: dots(node)?,
            articulation,
        })
    }

    /// Length in quarter-note units; a whole-measure rest spans the
    /// containing measure.
    pub fn pulsation(&self, measure_ticks: i64) -> f64 {
        match self.duration {
            RestDuration::Measure => duration::ticks_to_pulsation(measure_ticks),
            RestDuration::Value(sym) => duration::pulsation(sym, self.dots),
        }
    }

    pub fn tick_length(&self, measure_ticks: i64) -> i64 {
        match self.duration {
            RestDuration::Measure => measure_ticks,
            RestDuration::Value(sym) => duration::tick_length(sym, self.dots),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chord {
    pub track: Option<i64>,
    pub tick: Option<i64>,
    pub tuplet_id: Option<i64>,
    pub dots: u32,
    pub duration: DurationSym,
    pub slur: Option<Slur>,
    pub appoggiatura: bool,
    pub notes: Vec<Note>,
    pub articulation: Option<Articulation>,
    pub arpeggio: Option<Arpeggio>,
}

impl Chord {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let slur = match child(node, "Slur") {
            Some(n) => Some(Slur::parse(n)?),
            None => None,
        };
        let mut notes = Vec::new();
        for note in children(node, "Note") {
            notes.push(Note::parse(note, diag)?);
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
        Ok(Chord {
            track: opt_int(node, "track")?,
            tick: opt_int(node, "tick")?,
            tuplet_id: opt_int(node, "Tuplet")?,
            dots: dots(node)?,
            duration: duration::sym_from_name(req_child_text(node, "durationType")?)?,
            slur,
            appoggiatura: flag(node, "appoggiatura"),
            notes,
            articulation,
            arpeggio,
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

#[derive(Debug, Clone)]
pub struct Slur {
    pub kind: Option<String>,
    pub number: i64,
}

impl Slur {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Slur {
            kind: node.attribute("type").map(str::to_string),
            number: parse_int(req_attr(node, "number")?, "slur number")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Articulation {
    pub subtype: Option<String>,
    pub track: Option<i64>,
}

impl Articulation {
    fn parse(node: Node) -> Result<Self, ExtractError> {
        Ok(Articulation {
            subtype: opt_text(node, "subtype"),
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
pub struct Note {
    pub track: Option<i64>,
    pub visible: Option<bool>,
    pub pitch: i32,
    pub tpc: i32,
    pub tie: bool,
    pub accidental: Option<Accidental>,
    pub symbol: Option<Symbol>,
    pub velo_type: Option<String>,
    pub velocity: Option<i64>,
}

impl Note {
    fn parse(node: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        note_possible_tags(node, "Note", &["tpc2"], diag);
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
            pitch: req_int(node, "pitch")? as i32,
            tpc: req_int(node, "tpc")? as i32,
            tie: flag(node, "Tie"),
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
    pub fn tick_length(&self, measure_ticks: i64) -> i64 {
        match self {
            Stroke::Rest(rest) => rest.tick_length(measure_ticks),
            Stroke::Chord(chord) => chord.tick_length(),
        }
    }
}

impl Document {
    pub fn parse(root: Node, diag: &mut Diagnostics) -> Result<Self, ExtractError> {
        let version = root.attribute("version").unwrap_or("").to_string();
        let program_version = req_child_text(root, "programVersion")?.to_string();
        let program_revision = req_child_text(root, "programRevision")?.to_string();

        let mut sig_changes = Vec::new();
        for sig in children(req_child(root, "siglist")?, "sig") {
            sig_changes.push(SigChange::parse(sig)?);
        }
        let mut tempo_changes = Vec::new();
        for tempo in children(req_child(root, "tempolist")?, "tempo") {
            tempo_changes.push(TempoChange::parse(tempo)?);
        }
        let mut parts = Vec::new();
        for part in children(root, "Part") {
            parts.push(Part::parse(part)?);
        }
        let mut staves = Vec::new();
        for staff in children(root, "Staff") {
            staves.push(Staff::parse(staff, diag)?);
        }

        let mut document = Document {
            version,
            program_version,
            program_revision,
            sig_changes,
            tempo_changes,
            parts,
            staves,
            tempos: Vec::new(),
        };
        document.finalize()?;
        Ok(document)
    }

    /// Assign measure positions, resolve stroke and tempo ticks, and merge
    /// each measure's strokes. Runs once; the document is immutable after.
    fn finalize(&mut self) -> Result<(), ExtractError> {
        let measure_count = self
            .staves
            .iter()
            .map(|s| s.measures.len())
            .max()
            .unwrap_or(0);
        let positions = sig_positions(&self.sig_changes, measure_count)?;
        for staff in &mut self.staves {
            for (idx, measure) in staff.measures.iter_mut().enumerate() {
                let (tick, length) = positions[idx];
                measure.tick = tick;
                measure.tick_length = length;
            }
        }
        for staff in &mut self.staves {
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
                        let tick = tempo.tick().ok_or_else(|| {
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

    pub fn features(&self, diag: &mut Diagnostics) -> Option<Features> {
        let staffs = self.keyboard_staffs(diag);
        if staffs.is_empty() {
            return None;
        }
        let refs: Vec<&dyn StaffMetrics> = staffs.iter().map(|s| s as &dyn StaffMetrics).collect();
        Some(collect_features(&refs))
    }

    /// The staves of the first keyboard part with exactly two staves,
    /// mapped positionally onto the document staff list.
    fn keyboard_staffs(&self, diag: &mut Diagnostics) -> Vec<StaffView<'_>> {
        let mut views = Vec::new();
        let mut base = 0usize;
        let mut claimed = false;
        for part in &self.parts {
            let count = part.staff_slots.len();
            if part.is_keyboard(diag) {
                if count != 2 {
                    diag.note_ambiguous_part(part.display_name(), count);
                } else if claimed {
                    diag.note_surplus_part(part.display_name());
                } else {
                    match (self.staves.get(base), self.staves.get(base + 1)) {
                        (Some(upper), Some(lower)) => {
                            views.push(StaffView {
                                document: self,
                                staff: upper,
                            });
                            views.push(StaffView {
                                document: self,
                                staff: lower,
                            });
                            claimed = true;
                        }
                        _ => {
                            log::warn!(
                                "keyboard part {:?} references missing staves",
                                part.display_name()
                            );
                        }
                    }
                }
            }
            base += count;
        }
        views
    }

    /// Front-matter texts keyed by subtype, first occurrence wins.
    pub fn meta_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        for staff in &self.staves {
            if let Some(vbox) = &staff.vbox {
                for text in &vbox.texts {
                    info.entry(text.subtype.clone())
                        .or_insert_with(|| text.text.clone());
                }
            }
        }
        info
    }
}

/// Expand the signature list into `(start tick, tick length)` for each
/// measure index. The record exactly at a measure's start supplies its
/// actual (pickup) length; otherwise the last record at or before the tick
/// supplies the nominal length.
fn sig_positions(sigs: &[SigChange], count: usize) -> Result<Vec<(i64, i64)>, ExtractError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if sigs.is_empty() {
        return Err(ExtractError::malformed("document has an empty signature list"));
    }
    let mut positions = Vec::with_capacity(count);
    let mut tick = 0i64;
    let mut i = 0usize;
    while positions.len() < count {
        if tick == sigs[i].tick {
            let length = sigs[i].actual_measure_ticks()?;
            if length <= 0 {
                return Err(ExtractError::malformed("non-positive measure length"));
            }
            positions.push((tick, length));
            tick += length;
        } else if i + 1 == sigs.len() || (sigs[i].tick < tick && tick < sigs[i + 1].tick) {
            let length = sigs[i].nominal_measure_ticks()?;
            if length <= 0 {
                return Err(ExtractError::malformed("non-positive measure length"));
            }
            positions.push((tick, length));
            tick += length;
        } else if tick > sigs[i].tick && tick >= sigs[i + 1].tick {
            i += 1;
        } else {
            return Err(ExtractError::malformed(format!(
                "signature list does not cover tick {tick}"
            )));
        }
    }
    Ok(positions)
}

/// Forward pass over one staff's event streams: resolves every stroke's
/// tick and stamps tempo markings that lack an explicit one with the tick
/// of the next stroke. Returns the stream ticks per measure.
fn resolve_staff_ticks(staff: &mut Staff) -> Result<Vec<Vec<i64>>, ExtractError> {
    enum Seen {
        PendingTempo,
        Stroke { explicit: Option<i64>, length: i64 },
        Other,
    }

    let mut stream_ticks: Vec<Vec<i64>> = Vec::with_capacity(staff.measures.len());
    let mut pending: Vec<(usize, usize)> = Vec::new();
    for mi in 0..staff.measures.len() {
        let measure_tick = staff.measures[mi].tick;
        let measure_len = staff.measures[mi].tick_length;
        let mut previous: Option<(i64, i64)> = None;
        let mut ticks = Vec::new();
        for ci in 0..staff.measures[mi].children.len() {
            let seen = match &staff.measures[mi].children[ci] {
                Event::Tempo(tempo) if tempo.explicit_tick.is_none() => Seen::PendingTempo,
                Event::Rest(rest) => Seen::Stroke {
                    explicit: rest.tick,
                    length: rest.tick_length(measure_len),
                },
                Event::Chord(chord) => Seen::Stroke {
                    explicit: chord.tick,
                    length: chord.tick_length(),
                },
                _ => Seen::Other,
            };
            match seen {
                Seen::PendingTempo => pending.push((mi, ci)),
                Seen::Stroke { explicit, length } => {
                    let tick = explicit.unwrap_or(match previous {
                        Some((prev_tick, prev_length)) => prev_tick + prev_length,
                        None => measure_tick,
                    });
                    ticks.push(tick);
                    previous = Some((tick, length));
                    for (pmi, pci) in pending.drain(..) {
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
    if !pending.is_empty() {
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

fn merge_into(
    strokes: &mut Vec<Stroke>,
    ticks: &mut Vec<i64>,
    stroke: Stroke,
    tick: i64,
    measure_ticks: i64,
) {
    let Some(idx) = ticks.iter().position(|&t| t == tick) else {
        strokes.push(stroke);
        ticks.push(tick);
        return;
    };
    let existing_len = strokes[idx].tick_length(measure_ticks);
    let new_len = stroke.tick_length(measure_ticks);
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
    document: &'a Document,
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
        let tempos = &self.document.tempos;
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
