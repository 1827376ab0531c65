//! Conversion between procedure-database arguments and wire parameters.
//!
//! [`BorrowedArgs`] points into the caller's arguments and is used for the
//! one synchronous round trip of sending a call. [`OwnedArgs`] deep-copies
//! and is used for anything that outlives the call, such as results forwarded
//! to a blocked plug-in.

use crate::error::ProcedureError;
use pixwire_wire::{Param, ParamDef, ParamList, ParamRef, ParamType, PdbStatus, Rgb};

/// Payload of an [`Argument`]. Handle kinds share the `Id` variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
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
    Id(i32),
}

impl ArgValue {
    /// Element count of an array value.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            ArgValue::Int32Array(v) => Some(v.len()),
            ArgValue::Int16Array(v) => Some(v.len()),
            ArgValue::Int8Array(v) => Some(v.len()),
            ArgValue::FloatArray(v) => Some(v.len()),
            ArgValue::StringArray(v) => Some(v.len()),
            _ => None,
        }
    }
}

/// One procedure argument or return value as the database sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    kind: ParamType,
    value: ArgValue,
}

impl Argument {
    pub fn kind(&self) -> ParamType {
        self.kind
    }

    pub fn value(&self) -> &ArgValue {
        &self.value
    }

    pub fn int32(value: i32) -> Self {
        Self::from(Param::Int32(value))
    }

    pub fn float(value: f64) -> Self {
        Self::from(Param::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::from(Param::string(value))
    }

    pub fn status(status: PdbStatus) -> Self {
        Self::from(Param::status(status))
    }

    /// A handle argument. Returns `None` for kinds that are not handles.
    pub fn id(kind: ParamType, id: i32) -> Option<Self> {
        Param::id(kind, id).map(Self::from)
    }

    /// Zero value of a kind; `End` has none.
    pub fn zero(kind: ParamType) -> Option<Self> {
        Param::zero(kind).map(Self::from)
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self.value {
            ArgValue::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            ArgValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            ArgValue::String(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<i32> {
        match self.value {
            ArgValue::Id(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<PdbStatus> {
        match (self.kind, &self.value) {
            (ParamType::Status, ArgValue::Id(code)) => PdbStatus::from_i32(*code),
            _ => None,
        }
    }

    /// Wire view of this argument; arrays and strings are borrowed.
    pub fn as_param(&self) -> ParamRef<'_> {
        match &self.value {
            ArgValue::Int32(v) => ParamRef::Int32(*v),
            ArgValue::Int16(v) => ParamRef::Int16(*v),
            ArgValue::Int8(v) => ParamRef::Int8(*v),
            ArgValue::Float(v) => ParamRef::Float(*v),
            ArgValue::String(v) => ParamRef::String(v.as_deref()),
            ArgValue::Int32Array(v) => ParamRef::Int32Array(v),
            ArgValue::Int16Array(v) => ParamRef::Int16Array(v),
            ArgValue::Int8Array(v) => ParamRef::Int8Array(v),
            ArgValue::FloatArray(v) => ParamRef::FloatArray(v),
            ArgValue::StringArray(v) => ParamRef::StringArray(v),
            ArgValue::Color(v) => ParamRef::Color(*v),
            ArgValue::Region => ParamRef::Region,
            ArgValue::Id(v) => handle_ref(self.kind, *v),
        }
    }

    pub fn into_param(self) -> Param {
        match self.value {
            ArgValue::Int32(v) => Param::Int32(v),
            ArgValue::Int16(v) => Param::Int16(v),
            ArgValue::Int8(v) => Param::Int8(v),
            ArgValue::Float(v) => Param::Float(v),
            ArgValue::String(v) => Param::String(v),
            ArgValue::Int32Array(v) => Param::Int32Array(v),
            ArgValue::Int16Array(v) => Param::Int16Array(v),
            ArgValue::Int8Array(v) => Param::Int8Array(v),
            ArgValue::FloatArray(v) => Param::FloatArray(v),
            ArgValue::StringArray(v) => Param::StringArray(v),
            ArgValue::Color(v) => Param::Color(v),
            ArgValue::Region => Param::Region,
            ArgValue::Id(v) => handle_ref(self.kind, v).to_param(),
        }
    }
}

fn handle_ref(kind: ParamType, id: i32) -> ParamRef<'static> {
    match kind {
        ParamType::Display => ParamRef::Display(id),
        ParamType::Image => ParamRef::Image(id),
        ParamType::Layer => ParamRef::Layer(id),
        ParamType::Channel => ParamRef::Channel(id),
        ParamType::Drawable => ParamRef::Drawable(id),
        ParamType::Selection => ParamRef::Selection(id),
        ParamType::Boundary => ParamRef::Boundary(id),
        ParamType::Path => ParamRef::Path(id),
        // Arguments are only built from params, so every Id carries a handle kind.
        _ => ParamRef::Status(id),
    }
}

impl From<Param> for Argument {
    fn from(param: Param) -> Self {
        let kind = param.kind();
        let value = match param {
            Param::Int32(v) => ArgValue::Int32(v),
            Param::Int16(v) => ArgValue::Int16(v),
            Param::Int8(v) => ArgValue::Int8(v),
            Param::Float(v) => ArgValue::Float(v),
            Param::String(v) => ArgValue::String(v),
            Param::Int32Array(v) => ArgValue::Int32Array(v),
            Param::Int16Array(v) => ArgValue::Int16Array(v),
            Param::Int8Array(v) => ArgValue::Int8Array(v),
            Param::FloatArray(v) => ArgValue::FloatArray(v),
            Param::StringArray(v) => ArgValue::StringArray(v),
            Param::Color(v) => ArgValue::Color(v),
            Param::Region => ArgValue::Region,
            Param::Display(v)
            | Param::Image(v)
            | Param::Layer(v)
            | Param::Channel(v)
            | Param::Drawable(v)
            | Param::Selection(v)
            | Param::Boundary(v)
            | Param::Path(v)
            | Param::Status(v) => ArgValue::Id(v),
        };
        Self { kind, value }
    }
}

/// Wire parameters that alias the arguments they were built from.
#[derive(Debug, Clone)]
pub struct BorrowedArgs<'a>(Vec<ParamRef<'a>>);

impl<'a> BorrowedArgs<'a> {
    /// Views the first `count` arguments.
    pub fn new(args: &'a [Argument], count: usize) -> Self {
        Self(args.iter().take(count).map(Argument::as_param).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_list(&self) -> ParamList<'_> {
        ParamList::Borrowed(&self.0)
    }
}

/// Wire parameters with storage of their own.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OwnedArgs(Vec<Param>);

impl OwnedArgs {
    /// Deep-copies the first `count` arguments.
    pub fn copied(args: &[Argument], count: usize) -> Self {
        Self(
            args.iter()
                .take(count)
                .map(|arg| arg.as_param().to_param())
                .collect(),
        )
    }

    pub fn params(&self) -> &[Param] {
        &self.0
    }

    pub fn into_params(self) -> Vec<Param> {
        self.0
    }

    /// Moves the parameters into database arguments without copying buffers.
    pub fn into_arguments(self) -> Vec<Argument> {
        self.0.into_iter().map(Argument::from).collect()
    }

    pub fn as_list(&self) -> ParamList<'_> {
        ParamList::Owned(&self.0)
    }
}

impl From<Vec<Param>> for OwnedArgs {
    fn from(params: Vec<Param>) -> Self {
        Self(params)
    }
}

/// Converts arguments to wire parameters. With `full_copy` the result owns
/// deep copies; without it the result borrows from `args`.
pub fn args_to_params<'a>(args: &'a [Argument], count: usize, full_copy: bool) -> WireArgs<'a> {
    if full_copy {
        WireArgs::Owned(OwnedArgs::copied(args, count))
    } else {
        WireArgs::Borrowed(BorrowedArgs::new(args, count))
    }
}

/// Converts wire parameters to database arguments, always copying.
pub fn params_to_args(params: ParamList<'_>) -> Vec<Argument> {
    params.iter().map(|param| Argument::from(param.to_param())).collect()
}

/// Result of [`args_to_params`].
#[derive(Debug, Clone)]
pub enum WireArgs<'a> {
    Borrowed(BorrowedArgs<'a>),
    Owned(OwnedArgs),
}

impl WireArgs<'_> {
    pub fn as_list(&self) -> ParamList<'_> {
        match self {
            WireArgs::Borrowed(args) => args.as_list(),
            WireArgs::Owned(args) => args.as_list(),
        }
    }
}

/// Return values of a procedure; the first is always the status.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValues(Vec<Argument>);

impl ReturnValues {
    /// Only a status.
    pub fn status_only(status: PdbStatus) -> Self {
        Self(vec![Argument::status(status)])
    }

    /// A status followed by the zero value of every declared return.
    pub fn defaults(status: PdbStatus, returns: &[ParamDef]) -> Self {
        Self::status_only(status).resized(returns)
    }

    /// Success followed by `values`.
    pub fn success(values: Vec<Argument>) -> Self {
        let mut all = Vec::with_capacity(values.len() + 1);
        all.push(Argument::status(PdbStatus::Success));
        all.extend(values);
        Self(all)
    }

    /// Wraps values received from a plug-in. A missing or malformed status
    /// counts as an execution error.
    pub fn from_params(params: Vec<Param>) -> Self {
        let mut values: Vec<Argument> = params.into_iter().map(Argument::from).collect();
        if values.first().and_then(Argument::as_status).is_none() {
            values.insert(0, Argument::status(PdbStatus::ExecutionError));
        }
        Self(values)
    }

    pub fn status(&self) -> PdbStatus {
        self.0
            .first()
            .and_then(Argument::as_status)
            .unwrap_or(PdbStatus::ExecutionError)
    }

    pub fn is_success(&self) -> bool {
        self.status() == PdbStatus::Success
    }

    /// Everything after the status.
    pub fn values(&self) -> &[Argument] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[Argument] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fits the values to `returns.len() + 1` entries. Extra values are
    /// dropped and missing ones are zero-filled from the declared kinds.
    pub fn resized(mut self, returns: &[ParamDef]) -> Self {
        self.0.truncate(returns.len() + 1);
        for def in returns.iter().skip(self.0.len() - 1) {
            if let Some(zero) = Argument::zero(def.kind) {
                self.0.push(zero);
            }
        }
        self
    }

    /// Checks values returned by `name` against its declared returns and
    /// fits them with [`ReturnValues::resized`].
    ///
    /// A failure status drops every value in favour of that status's
    /// defaults. A value of the wrong kind, an array that disagrees with its
    /// count, or a list cut off after a non-zero count is an error; the
    /// caller is expected to substitute execution-error defaults.
    pub fn conform(self, name: &str, returns: &[ParamDef]) -> Result<Self, ProcedureError> {
        let status = self.status();
        if status != PdbStatus::Success {
            return Ok(Self::defaults(status, returns));
        }

        let mut values = self.0;
        values.truncate(returns.len() + 1);
        let supplied = &values[1..];
        for (index, (value, def)) in supplied.iter().zip(returns).enumerate() {
            if value.kind() != def.kind {
                return Err(ProcedureError::ReturnKind {
                    name: name.to_string(),
                    index,
                    expected: def.kind,
                    actual: value.kind(),
                });
            }
            if let Some(len) = value.value().array_len() {
                let count = index
                    .checked_sub(1)
                    .and_then(|previous| supplied[previous].as_int32());
                if count != i32::try_from(len).ok() {
                    return Err(ProcedureError::ReturnArrayCount {
                        name: name.to_string(),
                        index,
                    });
                }
            }
        }

        // Zero-filling an array is only sound if its count is zero too.
        let cut = supplied.len();
        if let (Some(next), Some(count)) = (returns.get(cut), supplied.last()) {
            if next.kind.is_array() && count.as_int32() != Some(0) {
                return Err(ProcedureError::ReturnArrayCount {
                    name: name.to_string(),
                    index: cut,
                });
            }
        }

        Ok(Self(values).resized(returns))
    }

    pub fn into_params(self) -> Vec<Param> {
        self.0.into_iter().map(Argument::into_param).collect()
    }
}
