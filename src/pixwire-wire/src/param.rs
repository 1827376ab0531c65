//! Parameter codec: the typed value union carried by procedure messages.
//!
//! Every parameter travels as a big-endian `u32` type tag followed by its
//! value. Arrays carry no length of their own; the element count is the
//! `Int32` parameter immediately before them.

use crate::error::{ProtocolError, WireError};
use serde::{Deserialize, Serialize};

/// Longest string accepted from the wire, terminator included.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;
/// Largest array element count accepted from the wire.
pub const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;
/// Most parameters a single procedure message may carry.
pub const MAX_PARAMS: usize = 4096;

// Upper bound on speculative allocation before elements have actually arrived.
const PREALLOC_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ParamType {
    Int32 = 0,
    Int16,
    Int8,
    Float,
    String,
    Int32Array,
    Int16Array,
    Int8Array,
    FloatArray,
    StringArray,
    Color,
    Region,
    Display,
    Image,
    Layer,
    Channel,
    Drawable,
    Selection,
    Boundary,
    Path,
    Status,
    End,
}

impl ParamType {
    pub const ALL: [ParamType; 22] = [
        ParamType::Int32,
        ParamType::Int16,
        ParamType::Int8,
        ParamType::Float,
        ParamType::String,
        ParamType::Int32Array,
        ParamType::Int16Array,
        ParamType::Int8Array,
        ParamType::FloatArray,
        ParamType::StringArray,
        ParamType::Color,
        ParamType::Region,
        ParamType::Display,
        ParamType::Image,
        ParamType::Layer,
        ParamType::Channel,
        ParamType::Drawable,
        ParamType::Selection,
        ParamType::Boundary,
        ParamType::Path,
        ParamType::Status,
        ParamType::End,
    ];

    pub fn from_wire(tag: u32) -> Result<Self, ProtocolError> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(ProtocolError::UnknownParamType(tag))
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            ParamType::Int32Array
                | ParamType::Int16Array
                | ParamType::Int8Array
                | ParamType::FloatArray
                | ParamType::StringArray
        )
    }

    /// Kinds whose value is a resource handle id.
    pub fn is_id(self) -> bool {
        matches!(
            self,
            ParamType::Display
                | ParamType::Image
                | ParamType::Layer
                | ParamType::Channel
                | ParamType::Drawable
                | ParamType::Selection
                | ParamType::Boundary
                | ParamType::Path
                | ParamType::Status
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamType::Int32 => "INT32",
            ParamType::Int16 => "INT16",
            ParamType::Int8 => "INT8",
            ParamType::Float => "FLOAT",
            ParamType::String => "STRING",
            ParamType::Int32Array => "INT32ARRAY",
            ParamType::Int16Array => "INT16ARRAY",
            ParamType::Int8Array => "INT8ARRAY",
            ParamType::FloatArray => "FLOATARRAY",
            ParamType::StringArray => "STRINGARRAY",
            ParamType::Color => "COLOR",
            ParamType::Region => "REGION",
            ParamType::Display => "DISPLAY",
            ParamType::Image => "IMAGE",
            ParamType::Layer => "LAYER",
            ParamType::Channel => "CHANNEL",
            ParamType::Drawable => "DRAWABLE",
            ParamType::Selection => "SELECTION",
            ParamType::Boundary => "BOUNDARY",
            ParamType::Path => "PATH",
            ParamType::Status => "STATUS",
            ParamType::End => "END",
        }
    }

    /// Case-insensitive lookup by [`ParamType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome code carried as the first return value of every procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PdbStatus {
    ExecutionError = 0,
    CallingError = 1,
    PassThrough = 2,
    Success = 3,
    Cancel = 4,
}

impl PdbStatus {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(PdbStatus::ExecutionError),
            1 => Some(PdbStatus::CallingError),
            2 => Some(PdbStatus::PassThrough),
            3 => Some(PdbStatus::Success),
            4 => Some(PdbStatus::Cancel),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// How a procedure was invoked; always the first argument of menu procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum RunMode {
    Interactive = 0,
    NonInteractive = 1,
    WithLastVals = 2,
}

impl RunMode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunMode::Interactive),
            1 => Some(RunMode::NonInteractive),
            2 => Some(RunMode::WithLastVals),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Declared shape of one procedure argument or return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub kind: ParamType,
    pub name: String,
    pub description: String,
}

impl ParamDef {
    pub fn new(kind: ParamType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Returns the index of the first array kind not immediately preceded by an
/// `Int32`, if any. An array in the first slot is always a violation.
pub fn array_rule_violation<I>(kinds: I) -> Option<usize>
where
    I: IntoIterator<Item = ParamType>,
{
    let mut previous = None;
    for (index, kind) in kinds.into_iter().enumerate() {
        if kind.is_array() && previous != Some(ParamType::Int32) {
            return Some(index);
        }
        previous = Some(kind);
    }
    None
}

/// An owned parameter value, as decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int32(i32),
    Int16(i16),
    Int8(u8),
    Float(f64),
    String(Option<String>),
    Int32Array(Vec<i32>),
    Int16Array(Vec<i16>),
    Int8Array(Vec<u8>),
    FloatArray(Vec<f64>),
    StringArray(Vec<Option<String>>),
    Color(Rgb),
    Region,
    Display(i32),
    Image(i32),
    Layer(i32),
    Channel(i32),
    Drawable(i32),
    Selection(i32),
    Boundary(i32),
    Path(i32),
    Status(i32),
}

impl Param {
    pub fn string(value: impl Into<String>) -> Self {
        Param::String(Some(value.into()))
    }

    pub fn status(status: PdbStatus) -> Self {
        Param::Status(status.as_i32())
    }

    /// Builds a handle parameter for one of the id kinds.
    pub fn id(kind: ParamType, id: i32) -> Option<Self> {
        Some(match kind {
            ParamType::Display => Param::Display(id),
            ParamType::Image => Param::Image(id),
            ParamType::Layer => Param::Layer(id),
            ParamType::Channel => Param::Channel(id),
            ParamType::Drawable => Param::Drawable(id),
            ParamType::Selection => Param::Selection(id),
            ParamType::Boundary => Param::Boundary(id),
            ParamType::Path => Param::Path(id),
            ParamType::Status => Param::Status(id),
            _ => return None,
        })
    }

    /// The zero value of a kind: 0, 0.0, null string, empty array or black.
    pub fn zero(kind: ParamType) -> Option<Self> {
        Some(match kind {
            ParamType::Int32 => Param::Int32(0),
            ParamType::Int16 => Param::Int16(0),
            ParamType::Int8 => Param::Int8(0),
            ParamType::Float => Param::Float(0.0),
            ParamType::String => Param::String(None),
            ParamType::Int32Array => Param::Int32Array(Vec::new()),
            ParamType::Int16Array => Param::Int16Array(Vec::new()),
            ParamType::Int8Array => Param::Int8Array(Vec::new()),
            ParamType::FloatArray => Param::FloatArray(Vec::new()),
            ParamType::StringArray => Param::StringArray(Vec::new()),
            ParamType::Color => Param::Color(Rgb::default()),
            ParamType::Region => Param::Region,
            ParamType::End => return None,
            id_kind => return Param::id(id_kind, 0),
        })
    }

    pub fn kind(&self) -> ParamType {
        self.view().kind()
    }

    pub fn view(&self) -> ParamRef<'_> {
        match self {
            Param::Int32(v) => ParamRef::Int32(*v),
            Param::Int16(v) => ParamRef::Int16(*v),
            Param::Int8(v) => ParamRef::Int8(*v),
            Param::Float(v) => ParamRef::Float(*v),
            Param::String(v) => ParamRef::String(v.as_deref()),
            Param::Int32Array(v) => ParamRef::Int32Array(v),
            Param::Int16Array(v) => ParamRef::Int16Array(v),
            Param::Int8Array(v) => ParamRef::Int8Array(v),
            Param::FloatArray(v) => ParamRef::FloatArray(v),
            Param::StringArray(v) => ParamRef::StringArray(v),
            Param::Color(v) => ParamRef::Color(*v),
            Param::Region => ParamRef::Region,
            Param::Display(v) => ParamRef::Display(*v),
            Param::Image(v) => ParamRef::Image(*v),
            Param::Layer(v) => ParamRef::Layer(*v),
            Param::Channel(v) => ParamRef::Channel(*v),
            Param::Drawable(v) => ParamRef::Drawable(*v),
            Param::Selection(v) => ParamRef::Selection(*v),
            Param::Boundary(v) => ParamRef::Boundary(*v),
            Param::Path(v) => ParamRef::Path(*v),
            Param::Status(v) => ParamRef::Status(*v),
        }
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Param::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::String(v) => v.as_deref(),
            _ => None,
        }
    }

    /// Handle value of an id kind (image, drawable, status, ...).
    pub fn as_id(&self) -> Option<i32> {
        self.view().as_id()
    }

    pub fn as_status(&self) -> Option<PdbStatus> {
        match self {
            Param::Status(v) => PdbStatus::from_i32(*v),
            _ => None,
        }
    }
}

/// A borrowed parameter. Arrays and strings point into the caller's storage,
/// so a `ParamRef` can never outlive the values it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamRef<'a> {
    Int32(i32),
    Int16(i16),
    Int8(u8),
    Float(f64),
    String(Option<&'a str>),
    Int32Array(&'a [i32]),
    Int16Array(&'a [i16]),
    Int8Array(&'a [u8]),
    FloatArray(&'a [f64]),
    StringArray(&'a [Option<String>]),
    Color(Rgb),
    Region,
    Display(i32),
    Image(i32),
    Layer(i32),
    Channel(i32),
    Drawable(i32),
    Selection(i32),
    Boundary(i32),
    Path(i32),
    Status(i32),
}

impl<'a> ParamRef<'a> {
    pub fn kind(&self) -> ParamType {
        match self {
            ParamRef::Int32(_) => ParamType::Int32,
            ParamRef::Int16(_) => ParamType::Int16,
            ParamRef::Int8(_) => ParamType::Int8,
            ParamRef::Float(_) => ParamType::Float,
            ParamRef::String(_) => ParamType::String,
            ParamRef::Int32Array(_) => ParamType::Int32Array,
            ParamRef::Int16Array(_) => ParamType::Int16Array,
            ParamRef::Int8Array(_) => ParamType::Int8Array,
            ParamRef::FloatArray(_) => ParamType::FloatArray,
            ParamRef::StringArray(_) => ParamType::StringArray,
            ParamRef::Color(_) => ParamType::Color,
            ParamRef::Region => ParamType::Region,
            ParamRef::Display(_) => ParamType::Display,
            ParamRef::Image(_) => ParamType::Image,
            ParamRef::Layer(_) => ParamType::Layer,
            ParamRef::Channel(_) => ParamType::Channel,
            ParamRef::Drawable(_) => ParamType::Drawable,
            ParamRef::Selection(_) => ParamType::Selection,
            ParamRef::Boundary(_) => ParamType::Boundary,
            ParamRef::Path(_) => ParamType::Path,
            ParamRef::Status(_) => ParamType::Status,
        }
    }

    /// Deep copy into an owned [`Param`].
    pub fn to_param(&self) -> Param {
        match *self {
            ParamRef::Int32(v) => Param::Int32(v),
            ParamRef::Int16(v) => Param::Int16(v),
            ParamRef::Int8(v) => Param::Int8(v),
            ParamRef::Float(v) => Param::Float(v),
            ParamRef::String(v) => Param::String(v.map(str::to_owned)),
            ParamRef::Int32Array(v) => Param::Int32Array(v.to_vec()),
            ParamRef::Int16Array(v) => Param::Int16Array(v.to_vec()),
            ParamRef::Int8Array(v) => Param::Int8Array(v.to_vec()),
            ParamRef::FloatArray(v) => Param::FloatArray(v.to_vec()),
            ParamRef::StringArray(v) => Param::StringArray(v.to_vec()),
            ParamRef::Color(v) => Param::Color(v),
            ParamRef::Region => Param::Region,
            ParamRef::Display(v) => Param::Display(v),
            ParamRef::Image(v) => Param::Image(v),
            ParamRef::Layer(v) => Param::Layer(v),
            ParamRef::Channel(v) => Param::Channel(v),
            ParamRef::Drawable(v) => Param::Drawable(v),
            ParamRef::Selection(v) => Param::Selection(v),
            ParamRef::Boundary(v) => Param::Boundary(v),
            ParamRef::Path(v) => Param::Path(v),
            ParamRef::Status(v) => Param::Status(v),
        }
    }

    pub fn as_id(&self) -> Option<i32> {
        match *self {
            ParamRef::Display(v)
            | ParamRef::Image(v)
            | ParamRef::Layer(v)
            | ParamRef::Channel(v)
            | ParamRef::Drawable(v)
            | ParamRef::Selection(v)
            | ParamRef::Boundary(v)
            | ParamRef::Path(v)
            | ParamRef::Status(v) => Some(v),
            _ => None,
        }
    }

    /// Element count for array kinds.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            ParamRef::Int32Array(v) => Some(v.len()),
            ParamRef::Int16Array(v) => Some(v.len()),
            ParamRef::Int8Array(v) => Some(v.len()),
            ParamRef::FloatArray(v) => Some(v.len()),
            ParamRef::StringArray(v) => Some(v.len()),
            _ => None,
        }
    }
}

/// A parameter list to encode, either owned values or borrowed views.
#[derive(Debug, Clone, Copy)]
pub enum ParamList<'a> {
    Owned(&'a [Param]),
    Borrowed(&'a [ParamRef<'a>]),
}

impl<'a> ParamList<'a> {
    pub fn len(&self) -> usize {
        match self {
            ParamList::Owned(params) => params.len(),
            ParamList::Borrowed(params) => params.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<ParamRef<'a>> {
        match *self {
            ParamList::Owned(params) => params.get(index).map(Param::view),
            ParamList::Borrowed(params) => params.get(index).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ParamRef<'a>> + 'a {
        let list = *self;
        (0..list.len()).filter_map(move |index| list.get(index))
    }

    pub fn to_params(&self) -> Vec<Param> {
        self.iter().map(|param| param.to_param()).collect()
    }
}

impl<'a> From<&'a [Param]> for ParamList<'a> {
    fn from(params: &'a [Param]) -> Self {
        ParamList::Owned(params)
    }
}

impl<'a> From<&'a Vec<Param>> for ParamList<'a> {
    fn from(params: &'a Vec<Param>) -> Self {
        ParamList::Owned(params)
    }
}

impl<'a> From<&'a [ParamRef<'a>]> for ParamList<'a> {
    fn from(params: &'a [ParamRef<'a>]) -> Self {
        ParamList::Borrowed(params)
    }
}

/// Source of raw bytes for the decoders.
pub trait WireRead {
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError>;
}

/// Decodes from an in-memory slice; running out of input is `Truncated`.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

impl WireRead for ByteReader<'_> {
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        if self.bytes.len() < buf.len() {
            return Err(ProtocolError::Truncated.into());
        }
        let (head, tail) = self.bytes.split_at(buf.len());
        buf.copy_from_slice(head);
        self.bytes = tail;
        Ok(())
    }
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i16(buf: &mut Vec<u8>, value: i16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_string(buf: &mut Vec<u8>, value: Option<&str>) -> Result<(), ProtocolError> {
    let Some(value) = value else {
        put_u32(buf, 0);
        return Ok(());
    };
    let len = value.len() + 1;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::Oversized {
            what: "string",
            len,
            max: MAX_STRING_LEN,
        });
    }
    put_u32(buf, len as u32);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

pub(crate) fn put_float(buf: &mut Vec<u8>, value: f64) -> Result<(), ProtocolError> {
    put_string(buf, Some(&format_float(value)))
}

pub(crate) fn get_u32<R: WireRead + ?Sized>(r: &mut R) -> Result<u32, WireError> {
    let mut raw = [0u8; 4];
    r.read_exact_bytes(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

pub(crate) fn get_i32<R: WireRead + ?Sized>(r: &mut R) -> Result<i32, WireError> {
    let mut raw = [0u8; 4];
    r.read_exact_bytes(&mut raw)?;
    Ok(i32::from_be_bytes(raw))
}

pub(crate) fn get_i16<R: WireRead + ?Sized>(r: &mut R) -> Result<i16, WireError> {
    let mut raw = [0u8; 2];
    r.read_exact_bytes(&mut raw)?;
    Ok(i16::from_be_bytes(raw))
}

pub(crate) fn get_u8<R: WireRead + ?Sized>(r: &mut R) -> Result<u8, WireError> {
    let mut raw = [0u8; 1];
    r.read_exact_bytes(&mut raw)?;
    Ok(raw[0])
}

pub(crate) fn get_string<R: WireRead + ?Sized>(r: &mut R) -> Result<Option<String>, WireError> {
    let len = get_u32(r)? as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::Oversized {
            what: "string",
            len,
            max: MAX_STRING_LEN,
        }
        .into());
    }
    let mut raw = vec![0u8; len];
    r.read_exact_bytes(&mut raw)?;
    if raw.last() == Some(&0) {
        raw.pop();
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidString.into())
}

pub(crate) fn get_float<R: WireRead + ?Sized>(r: &mut R) -> Result<f64, WireError> {
    let text = get_string(r)?.unwrap_or_default();
    parse_float(&text).map_err(WireError::from)
}

/// Formats a float the way C's `"%0.50e"` does: 50 fraction digits and an
/// exponent with explicit sign and at least two digits.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let formatted = format!("{value:.50e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

pub fn parse_float(text: &str) -> Result<f64, ProtocolError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ProtocolError::InvalidFloat(text.to_string()))
}

fn check_array_count(
    params: ParamList<'_>,
    index: usize,
    actual: usize,
) -> Result<(), ProtocolError> {
    match index.checked_sub(1).and_then(|prev| params.get(prev)) {
        Some(ParamRef::Int32(declared)) if declared >= 0 && declared as usize == actual => Ok(()),
        Some(ParamRef::Int32(declared)) => Err(ProtocolError::ArrayCountMismatch {
            index,
            declared,
            actual,
        }),
        _ => Err(ProtocolError::MissingArrayCount { index }),
    }
}

fn declared_count(previous: Option<&Param>, index: usize) -> Result<usize, ProtocolError> {
    match previous {
        Some(Param::Int32(declared)) if *declared >= 0 => {
            let count = *declared as usize;
            if count > MAX_ARRAY_LEN {
                return Err(ProtocolError::Oversized {
                    what: "array",
                    len: count,
                    max: MAX_ARRAY_LEN,
                });
            }
            Ok(count)
        }
        Some(Param::Int32(declared)) => Err(ProtocolError::ArrayCountMismatch {
            index,
            declared: *declared,
            actual: 0,
        }),
        _ => Err(ProtocolError::MissingArrayCount { index }),
    }
}

/// Appends `params` without a leading count.
pub fn write_params(buf: &mut Vec<u8>, params: ParamList<'_>) -> Result<(), ProtocolError> {
    for (index, param) in params.iter().enumerate() {
        if let Some(actual) = param.array_len() {
            check_array_count(params, index, actual)?;
        }
        put_u32(buf, param.kind().to_wire());
        write_value(buf, param)?;
    }
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, param: ParamRef<'_>) -> Result<(), ProtocolError> {
    match param {
        ParamRef::Int32(v)
        | ParamRef::Display(v)
        | ParamRef::Image(v)
        | ParamRef::Layer(v)
        | ParamRef::Channel(v)
        | ParamRef::Drawable(v)
        | ParamRef::Selection(v)
        | ParamRef::Boundary(v)
        | ParamRef::Path(v)
        | ParamRef::Status(v) => put_i32(buf, v),
        ParamRef::Int16(v) => put_i16(buf, v),
        ParamRef::Int8(v) => buf.push(v),
        ParamRef::Float(v) => put_float(buf, v)?,
        ParamRef::String(v) => put_string(buf, v)?,
        ParamRef::Int32Array(values) => values.iter().for_each(|v| put_i32(buf, *v)),
        ParamRef::Int16Array(values) => values.iter().for_each(|v| put_i16(buf, *v)),
        ParamRef::Int8Array(values) => buf.extend_from_slice(values),
        ParamRef::FloatArray(values) => {
            for v in values {
                put_float(buf, *v)?;
            }
        }
        ParamRef::StringArray(values) => {
            for v in values {
                put_string(buf, v.as_deref())?;
            }
        }
        ParamRef::Color(rgb) => buf.extend_from_slice(&[rgb.r, rgb.g, rgb.b]),
        ParamRef::Region => {}
    }
    Ok(())
}

/// Reads `count` parameters, resolving array lengths from their predecessors.
pub fn read_params<R: WireRead + ?Sized>(r: &mut R, count: u32) -> Result<Vec<Param>, WireError> {
    let count = count as usize;
    if count > MAX_PARAMS {
        return Err(ProtocolError::Oversized {
            what: "parameter count",
            len: count,
            max: MAX_PARAMS,
        }
        .into());
    }
    let mut params: Vec<Param> = Vec::with_capacity(count);
    for index in 0..count {
        let kind = ParamType::from_wire(get_u32(r)?)?;
        let param = read_value(r, kind, params.last(), index)?;
        params.push(param);
    }
    Ok(params)
}

fn read_value<R: WireRead + ?Sized>(
    r: &mut R,
    kind: ParamType,
    previous: Option<&Param>,
    index: usize,
) -> Result<Param, WireError> {
    let param = match kind {
        ParamType::Int32 => Param::Int32(get_i32(r)?),
        ParamType::Int16 => Param::Int16(get_i16(r)?),
        ParamType::Int8 => Param::Int8(get_u8(r)?),
        ParamType::Float => Param::Float(get_float(r)?),
        ParamType::String => Param::String(get_string(r)?),
        ParamType::Int32Array => {
            let count = declared_count(previous, index)?;
            let mut values = Vec::with_capacity(count.min(PREALLOC_LIMIT));
            for _ in 0..count {
                values.push(get_i32(r)?);
            }
            Param::Int32Array(values)
        }
        ParamType::Int16Array => {
            let count = declared_count(previous, index)?;
            let mut values = Vec::with_capacity(count.min(PREALLOC_LIMIT));
            for _ in 0..count {
                values.push(get_i16(r)?);
            }
            Param::Int16Array(values)
        }
        ParamType::Int8Array => {
            let count = declared_count(previous, index)?;
            let mut values = vec![0u8; count];
            r.read_exact_bytes(&mut values)?;
            Param::Int8Array(values)
        }
        ParamType::FloatArray => {
            let count = declared_count(previous, index)?;
            let mut values = Vec::with_capacity(count.min(PREALLOC_LIMIT));
            for _ in 0..count {
                values.push(get_float(r)?);
            }
            Param::FloatArray(values)
        }
        ParamType::StringArray => {
            let count = declared_count(previous, index)?;
            let mut values = Vec::with_capacity(count.min(PREALLOC_LIMIT));
            for _ in 0..count {
                values.push(get_string(r)?);
            }
            Param::StringArray(values)
        }
        ParamType::Color => {
            let mut rgb = [0u8; 3];
            r.read_exact_bytes(&mut rgb)?;
            Param::Color(Rgb::new(rgb[0], rgb[1], rgb[2]))
        }
        ParamType::Region => Param::Region,
        ParamType::End => return Err(ProtocolError::EndMarker.into()),
        id_kind => {
            let id = get_i32(r)?;
            match Param::id(id_kind, id) {
                Some(param) => param,
                None => return Err(ProtocolError::UnknownParamType(id_kind.to_wire()).into()),
            }
        }
    };
    Ok(param)
}

/// Encodes a parameter list as it appears in procedure messages: a `u32`
/// count followed by each parameter.
pub fn encode(params: &[Param]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    put_u32(&mut buf, params.len() as u32);
    write_params(&mut buf, ParamList::Owned(params))?;
    Ok(buf)
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Vec<Param>, WireError> {
    let mut reader = ByteReader::new(bytes);
    let count = get_u32(&mut reader)?;
    read_params(&mut reader, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> Vec<Param> {
        vec![
            Param::Int32(-7),
            Param::Int16(-300),
            Param::Int8(250),
            Param::Float(0.1),
            Param::String(None),
            Param::string(""),
            Param::string("gaussian blur"),
            Param::Int32(3),
            Param::Int32Array(vec![1, -2, i32::MAX]),
            Param::Int32(2),
            Param::Int16Array(vec![i16::MIN, 9]),
            Param::Int32(4),
            Param::Int8Array(vec![0, 1, 128, 255]),
            Param::Int32(3),
            Param::FloatArray(vec![-0.0, 1.0e-300, f64::MAX]),
            Param::Int32(3),
            Param::StringArray(vec![Some("a".into()), None, Some(String::new())]),
            Param::Color(Rgb::new(255, 128, 0)),
            Param::Region,
            Param::Display(1),
            Param::Image(2),
            Param::Layer(3),
            Param::Channel(4),
            Param::Drawable(5),
            Param::Selection(6),
            Param::Boundary(7),
            Param::Path(8),
            Param::status(PdbStatus::Success),
        ]
    }

    #[test]
    fn parameter_lists_round_trip() {
        let params = sample_params();
        let bytes = encode(&params).unwrap();
        assert_eq!(decode(&bytes).unwrap(), params);
    }

    #[test]
    fn floats_keep_every_bit() {
        for value in [
            0.1,
            -2.5e-310,
            1.0 / 3.0,
            std::f64::consts::PI,
            f64::MIN_POSITIVE,
            -1234567890.125,
        ] {
            let parsed = parse_float(&format_float(value)).unwrap();
            assert_eq!(parsed.to_bits(), value.to_bits(), "{value}");
        }
    }

    #[test]
    fn float_text_matches_c_exponent_format() {
        let text = format_float(1.0);
        assert!(text.starts_with("1.0000"));
        assert!(text.ends_with("e+00"));
        assert_eq!(text.len(), "1.".len() + 50 + "e+00".len());
        assert!(format_float(-0.00125).ends_with("e-03"));
        assert!(format_float(1.0e200).ends_with("e+200"));
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn integers_are_big_endian() {
        let bytes = encode(&[Param::Int32(0x01020304), Param::Int16(0x0506)]).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 2, 0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 1, 5, 6]
        );
    }

    #[test]
    fn strings_carry_terminator_and_null_is_empty_count() {
        let mut buf = Vec::new();
        put_string(&mut buf, Some("ab")).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'a', b'b', 0]);

        let mut buf = Vec::new();
        put_string(&mut buf, None).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);

        let mut buf = Vec::new();
        put_string(&mut buf, Some("")).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1, 0]);
    }

    #[test]
    fn array_without_count_is_rejected_on_encode() {
        let err = encode(&[Param::string("x"), Param::Int8Array(vec![1])]).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingArrayCount { index: 1 }));

        let err = encode(&[Param::Int8Array(vec![1])]).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingArrayCount { index: 0 }));
    }

    #[test]
    fn array_with_wrong_count_is_rejected_on_encode() {
        let err = encode(&[Param::Int32(5), Param::Int32Array(vec![1, 2])]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ArrayCountMismatch {
                index: 1,
                declared: 5,
                actual: 2
            }
        ));
    }

    #[test]
    fn array_without_count_is_rejected_on_decode() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, 1);
        put_u32(&mut bytes, ParamType::Int32Array.to_wire());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::MissingArrayCount { index: 0 })
        ));
    }

    #[test]
    fn truncated_input_is_reported() {
        let bytes = encode(&[Param::string("truncate me")]).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, WireError::Protocol(ProtocolError::Truncated)));
    }

    #[test]
    fn unknown_kind_and_end_marker_are_rejected() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, 1);
        put_u32(&mut bytes, 99);
        assert!(matches!(
            decode(&bytes),
            Err(WireError::Protocol(ProtocolError::UnknownParamType(99)))
        ));

        let mut bytes = Vec::new();
        put_u32(&mut bytes, 1);
        put_u32(&mut bytes, ParamType::End.to_wire());
        assert!(matches!(
            decode(&bytes),
            Err(WireError::Protocol(ProtocolError::EndMarker))
        ));
    }

    #[test]
    fn array_rule_finds_first_violation() {
        use ParamType::*;
        assert_eq!(array_rule_violation([Int32, Int32, Int8Array]), None);
        assert_eq!(array_rule_violation([Int32, String, Int16Array]), Some(2));
        assert_eq!(array_rule_violation([FloatArray]), Some(0));
        assert_eq!(array_rule_violation(std::iter::empty::<ParamType>()), None);
    }

    #[test]
    fn borrowed_view_converts_back_to_equal_owned_value() {
        for param in sample_params() {
            assert_eq!(param.view().to_param(), param);
            assert_eq!(param.view().kind(), param.kind());
        }
    }

    #[test]
    fn type_names_parse_case_insensitively() {
        assert_eq!(ParamType::from_name("drawable"), Some(ParamType::Drawable));
        assert_eq!(ParamType::from_name("INT8ARRAY"), Some(ParamType::Int8Array));
        assert_eq!(ParamType::from_name("pixel"), None);
        assert_eq!(ParamType::from_wire(13).unwrap(), ParamType::Image);
    }
}
