//! Typed properties and their resource locations.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PropError, PropResult};

/// Which resource a property is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    /// Set through the user-facing API.
    User,
    /// Describes the stream arriving on an input port.
    InputEdge,
    /// Describes the stream leaving an output port.
    OutputEdge,
    /// Owned by the framework; never part of dirty-node detection.
    Framework,
}

impl SourceKind {
    /// Swap input and output edges; other kinds are returned unchanged.
    pub fn invert_edge(self) -> Self {
        match self {
            SourceKind::InputEdge => SourceKind::OutputEdge,
            SourceKind::OutputEdge => SourceKind::InputEdge,
            other => other,
        }
    }

    pub fn is_edge(self) -> bool {
        matches!(self, SourceKind::InputEdge | SourceKind::OutputEdge)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::User => "USER",
            SourceKind::InputEdge => "INPUT_EDGE",
            SourceKind::OutputEdge => "OUTPUT_EDGE",
            SourceKind::Framework => "FRAMEWORK",
        };
        f.write_str(s)
    }
}

/// Resource location: kind plus instance (port number for edges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResSourceInfo {
    pub kind: SourceKind,
    pub instance: usize,
}

impl ResSourceInfo {
    pub const fn new(kind: SourceKind, instance: usize) -> Self {
        Self { kind, instance }
    }

    pub const fn user(instance: usize) -> Self {
        Self::new(SourceKind::User, instance)
    }

    pub const fn input_edge(port: usize) -> Self {
        Self::new(SourceKind::InputEdge, port)
    }

    pub const fn output_edge(port: usize) -> Self {
        Self::new(SourceKind::OutputEdge, port)
    }

    pub const fn framework() -> Self {
        Self::new(SourceKind::Framework, 0)
    }

    /// Same instance on the opposite edge kind.
    pub fn inverted(self) -> Self {
        Self::new(self.kind.invert_edge(), self.instance)
    }
}

impl fmt::Display for ResSourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.instance)
    }
}

/// Value types a property can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    Str,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::Str => "string",
        }
    }

    /// Parse a string into a value of this type.
    pub fn parse(self, s: &str) -> Option<PropValue> {
        let s = s.trim();
        match self {
            ValueType::Bool => match s {
                "true" | "1" => Some(PropValue::Bool(true)),
                "false" | "0" => Some(PropValue::Bool(false)),
                _ => None,
            },
            ValueType::Int => s.parse().ok().map(PropValue::Int),
            ValueType::Double => s.parse().ok().map(PropValue::Double),
            ValueType::Str => Some(PropValue::Str(s.to_string())),
        }
    }
}

/// Dynamically typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl PropValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PropValue::Bool(_) => ValueType::Bool,
            PropValue::Int(_) => ValueType::Int,
            PropValue::Double(_) => ValueType::Double,
            PropValue::Str(_) => ValueType::Str,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Double(v) => write!(f, "{v}"),
            PropValue::Str(v) => f.write_str(v),
        }
    }
}

/// Rust types that can be stored in a property.
pub trait PropType: Sized {
    const VALUE_TYPE: ValueType;

    fn into_value(self) -> PropValue;

    fn from_value(value: &PropValue) -> Option<Self>;
}

impl PropType for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;

    fn into_value(self) -> PropValue {
        PropValue::Bool(self)
    }

    fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl PropType for i64 {
    const VALUE_TYPE: ValueType = ValueType::Int;

    fn into_value(self) -> PropValue {
        PropValue::Int(self)
    }

    fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl PropType for usize {
    const VALUE_TYPE: ValueType = ValueType::Int;

    fn into_value(self) -> PropValue {
        PropValue::Int(i64::try_from(self).unwrap_or(i64::MAX))
    }

    fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Int(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl PropType for f64 {
    const VALUE_TYPE: ValueType = ValueType::Double;

    fn into_value(self) -> PropValue {
        PropValue::Double(self)
    }

    fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl PropType for String {
    const VALUE_TYPE: ValueType = ValueType::Str;

    fn into_value(self) -> PropValue {
        PropValue::Str(self)
    }

    fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Regular properties hold values; the always-dirty sentinel only exists to
/// trigger resolvers on every resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropKind {
    Regular,
    AlwaysDirty,
}

/// Write permission currently granted on a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    Ro,
    Rw,
    /// Writable only with the value it already holds.
    RwLocked,
}

/// ID of the always-dirty sentinel registered on every node.
pub const ALWAYS_DIRTY_ID: &str = "__ALWAYS_DIRTY__";

/// A named, typed value attached to one resource location.
#[derive(Debug, Clone)]
pub struct Property {
    id: String,
    src: ResSourceInfo,
    kind: PropKind,
    value_type: ValueType,
    value: Option<PropValue>,
    dirty: bool,
    access: Access,
}

impl Property {
    /// A valid property. New properties start out dirty.
    pub fn new<T: PropType>(id: impl Into<String>, src: ResSourceInfo, value: T) -> Self {
        Self {
            id: id.into(),
            src,
            kind: PropKind::Regular,
            value_type: T::VALUE_TYPE,
            value: Some(value.into_value()),
            dirty: true,
            access: Access::Ro,
        }
    }

    /// A property with no value yet; it is skipped when edges are forwarded.
    pub fn empty(id: impl Into<String>, src: ResSourceInfo, value_type: ValueType) -> Self {
        Self {
            id: id.into(),
            src,
            kind: PropKind::Regular,
            value_type,
            value: None,
            dirty: false,
            access: Access::Ro,
        }
    }

    pub fn always_dirty() -> Self {
        Self {
            id: ALWAYS_DIRTY_ID.to_string(),
            src: ResSourceInfo::framework(),
            kind: PropKind::AlwaysDirty,
            value_type: ValueType::Bool,
            value: None,
            dirty: true,
            access: Access::Ro,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn src(&self) -> ResSourceInfo {
        self.src
    }

    pub fn kind(&self) -> PropKind {
        self.kind
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.kind == PropKind::AlwaysDirty || self.dirty
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn value(&self) -> Option<&PropValue> {
        self.value.as_ref()
    }

    /// `id[KIND:n]`, used in diagnostics.
    pub fn describe(&self) -> String {
        format!("{}[{}]", self.id, self.src)
    }

    pub fn get<T: PropType>(&self) -> PropResult<T> {
        let value = self.value.as_ref().ok_or_else(|| PropError::Invalid {
            id: self.id.clone(),
            src: self.src.to_string(),
        })?;
        T::from_value(value).ok_or(PropError::TypeMismatch {
            id: self.id.clone(),
            expected: T::VALUE_TYPE.name(),
            got: value.value_type().name(),
        })
    }

    /// Compare the values of two properties (both invalid counts as equal).
    pub fn equal(&self, other: &Property) -> bool {
        self.value == other.value
    }

    /// Write through the access check.
    ///
    /// Returns `true` when the value changed (and the property became dirty).
    pub(crate) fn write(&mut self, value: PropValue) -> PropResult<bool> {
        if value.value_type() != self.value_type {
            return Err(PropError::TypeMismatch {
                id: self.id.clone(),
                expected: self.value_type.name(),
                got: value.value_type().name(),
            });
        }
        match self.access {
            Access::Rw => {
                if self.value.as_ref() == Some(&value) {
                    return Ok(false);
                }
                self.value = Some(value);
                self.dirty = true;
                Ok(true)
            }
            Access::RwLocked => {
                if self.value.as_ref() == Some(&value) {
                    return Ok(false);
                }
                Err(PropError::LockedOverwrite {
                    id: self.id.clone(),
                    src: self.src.to_string(),
                    current: self
                        .value
                        .as_ref()
                        .map_or_else(|| "<invalid>".to_string(), |v| v.to_string()),
                    requested: value.to_string(),
                })
            }
            Access::Ro | Access::None => Err(PropError::AccessDenied {
                id: self.id.clone(),
                src: self.src.to_string(),
            }),
        }
    }

    /// Write with temporary RW access.
    pub(crate) fn write_unlocked(&mut self, value: PropValue) -> PropResult<bool> {
        let prev = self.access;
        self.access = Access::Rw;
        let result = self.write(value);
        self.access = prev;
        result
    }

    pub(crate) fn force_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    /// Copy of this property at another location, dirty if it holds a value.
    pub(crate) fn clone_to(&self, src: ResSourceInfo) -> Property {
        Property {
            id: self.id.clone(),
            src,
            kind: self.kind,
            value_type: self.value_type,
            value: self.value.clone(),
            dirty: self.value.is_some(),
            access: Access::Ro,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_property_is_dirty_and_valid() {
        let p = Property::new("samp_rate", ResSourceInfo::input_edge(0), 1e9);
        assert!(p.is_dirty());
        assert!(p.is_valid());
        assert_eq!(p.get::<f64>().unwrap(), 1e9);
        assert_eq!(p.describe(), "samp_rate[INPUT_EDGE:0]");
    }

    #[test]
    fn write_requires_access() {
        let mut p = Property::new("decim", ResSourceInfo::user(0), 1_i64);
        assert!(matches!(
            p.write(PropValue::Int(2)),
            Err(PropError::AccessDenied { .. })
        ));
        p.set_access(Access::Rw);
        p.mark_clean();
        assert!(p.write(PropValue::Int(2)).unwrap());
        assert!(p.is_dirty());
    }

    #[test]
    fn unchanged_write_stays_clean() {
        let mut p = Property::new("decim", ResSourceInfo::user(0), 4_i64);
        p.mark_clean();
        assert!(!p.write_unlocked(PropValue::Int(4)).unwrap());
        assert!(!p.is_dirty());
    }

    #[test]
    fn locked_property_rejects_new_value() {
        let mut p = Property::new("type", ResSourceInfo::output_edge(0), "sc16".to_string());
        p.set_access(Access::RwLocked);
        assert!(!p.write(PropValue::Str("sc16".into())).unwrap());
        let err = p.write(PropValue::Str("s8".into())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sc16") && msg.contains("s8"), "{msg}");
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut p = Property::new("mtu", ResSourceInfo::input_edge(0), 8000_usize);
        let err = p.write_unlocked(PropValue::Double(1.0)).unwrap_err();
        assert!(matches!(err, PropError::TypeMismatch { expected: "int", got: "double", .. }));
        assert!(p.get::<f64>().is_err());
    }

    #[test]
    fn always_dirty_cannot_be_cleaned() {
        let mut p = Property::always_dirty();
        p.mark_clean();
        assert!(p.is_dirty());
        assert_eq!(p.src().kind, SourceKind::Framework);
    }

    #[test]
    fn value_type_parsing() {
        assert_eq!(ValueType::Int.parse(" 12 "), Some(PropValue::Int(12)));
        assert_eq!(ValueType::Double.parse("1e6"), Some(PropValue::Double(1e6)));
        assert_eq!(ValueType::Bool.parse("true"), Some(PropValue::Bool(true)));
        assert_eq!(ValueType::Int.parse("abc"), None);
    }

    #[test]
    fn edge_inversion() {
        assert_eq!(
            ResSourceInfo::input_edge(3).inverted(),
            ResSourceInfo::output_edge(3)
        );
        assert_eq!(ResSourceInfo::user(1).inverted(), ResSourceInfo::user(1));
    }
}
