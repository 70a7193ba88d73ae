//! Marshalling vocabulary for proxied calls.
//!
//! Proxied arguments cross the native boundary as machine words. These
//! types name the declared parameter semantics and carry owned argument
//! data until call time; the conversion itself is word-sized on purpose,
//! matching the arity-dispatched trampoline in [`crate::proxy`].

use std::ffi::CString;
use std::fmt;

use crate::error::{LinkError, Result};

/// Declared semantic type of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Void,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Opaque pointer (platform word)
    Pointer,
    /// Null-terminated C string
    CStr,
    /// Raw byte buffer passed by address
    Bytes,
}

impl ValueKind {
    /// Size in bytes of this kind's native representation.
    pub fn size(&self) -> usize {
        match self {
            ValueKind::Void => 0,
            ValueKind::I32 | ValueKind::U32 | ValueKind::F32 => 4,
            ValueKind::I64 | ValueKind::U64 | ValueKind::F64 => 8,
            ValueKind::Pointer | ValueKind::CStr | ValueKind::Bytes => {
                std::mem::size_of::<usize>()
            }
        }
    }

    /// Whether this kind is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ValueKind::I32 | ValueKind::I64 | ValueKind::U32 | ValueKind::U64
        )
    }

    /// Whether this kind is a floating point type.
    pub fn is_float(&self) -> bool {
        matches!(self, ValueKind::F32 | ValueKind::F64)
    }

    /// Whether this kind is pointer-shaped.
    pub fn is_pointer(&self) -> bool {
        matches!(self, ValueKind::Pointer | ValueKind::CStr | ValueKind::Bytes)
    }

    /// Parse a declaration token. C spellings are accepted alongside the
    /// Rust ones.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "void" => Some(ValueKind::Void),
            "i32" | "int" | "int32" | "int32_t" => Some(ValueKind::I32),
            "i64" | "long" | "int64" | "int64_t" => Some(ValueKind::I64),
            "u32" | "uint" | "uint32" | "uint32_t" => Some(ValueKind::U32),
            "u64" | "ulong" | "uint64" | "uint64_t" | "size_t" => Some(ValueKind::U64),
            "f32" | "float" => Some(ValueKind::F32),
            "f64" | "double" => Some(ValueKind::F64),
            "ptr" | "pointer" | "void*" => Some(ValueKind::Pointer),
            "cstr" | "string" | "char*" => Some(ValueKind::CStr),
            "bytes" | "buffer" => Some(ValueKind::Bytes),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            ValueKind::Void => "void",
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::U32 => "u32",
            ValueKind::U64 => "u64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::Pointer => "ptr",
            ValueKind::CStr => "cstr",
            ValueKind::Bytes => "bytes",
        };
        write!(f, "{}", token)
    }
}

/// An argument or return value for a proxied native call.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Void,
    /// Any integer width, sign-extended
    Int(i64),
    /// Any float width
    Float(f64),
    /// Raw pointer value
    Pointer(usize),
    /// Owned string, materialized as a C string at call time
    Str(String),
    /// Owned buffer, passed by address
    Bytes(Vec<u8>),
}

impl Value {
    /// Lower to a call word. String arguments materialize a C-string
    /// temporary pushed onto `temps`, which must outlive the native call.
    pub fn to_word(&self, temps: &mut Vec<CString>) -> Result<u64> {
        match self {
            Value::Void => Ok(0),
            Value::Int(v) => Ok(*v as u64),
            Value::Float(v) => Ok(v.to_bits()),
            Value::Pointer(p) => Ok(*p as u64),
            Value::Str(s) => {
                let c = CString::new(s.as_str()).map_err(|_| {
                    LinkError::InvalidArgument(
                        "string argument contains an interior NUL byte".to_string(),
                    )
                })?;
                let word = c.as_ptr() as u64;
                temps.push(c);
                Ok(word)
            }
            Value::Bytes(b) => Ok(b.as_ptr() as u64),
        }
    }

    /// Raise a returned word back to a `Value` per the declared kind.
    ///
    /// Narrow integer returns are masked before sign extension; the upper
    /// register bits are unspecified for a 32-bit native return.
    pub fn from_word(raw: u64, kind: ValueKind) -> Value {
        match kind {
            ValueKind::Void => Value::Void,
            ValueKind::I32 => Value::Int(raw as u32 as i32 as i64),
            ValueKind::U32 => Value::Int((raw as u32) as i64),
            ValueKind::I64 | ValueKind::U64 => Value::Int(raw as i64),
            ValueKind::F32 => Value::Float(f32::from_bits(raw as u32) as f64),
            ValueKind::F64 => Value::Float(f64::from_bits(raw)),
            ValueKind::Pointer | ValueKind::CStr | ValueKind::Bytes => {
                Value::Pointer(raw as usize)
            }
        }
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload, if any.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Pointer payload, if any.
    pub fn as_pointer(&self) -> Option<usize> {
        match self {
            Value::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Signature of one interface method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Declared method name; also the default exported symbol name.
    pub name: String,
    /// Parameter kinds, in call order.
    pub params: Vec<ValueKind>,
    /// Return kind.
    pub returns: ValueKind,
}

impl MethodSignature {
    /// Create a new method signature.
    pub fn new(name: impl Into<String>, params: Vec<ValueKind>, returns: ValueKind) -> Self {
        Self {
            name: name.into(),
            params,
            returns,
        }
    }

    /// Whether `count` arguments satisfy this signature.
    pub fn accepts(&self, count: usize) -> bool {
        count == self.params.len()
    }

    /// Parse a C-style declaration.
    /// Format: `"return_kind name(param_kind, param_kind, ...)"`.
    pub fn parse(decl: &str) -> Option<Self> {
        let decl = decl.trim();
        let open = decl.find('(')?;
        let head = decl[..open].trim();
        let body = decl[open + 1..].trim_end_matches(')').trim();

        let mut head_parts = head.rsplitn(2, char::is_whitespace);
        let name = head_parts.next()?.trim();
        let returns = ValueKind::parse(head_parts.next()?.trim())?;
        if name.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        for param in body.split(',') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            // First word is the kind; a trailing parameter name is allowed
            // and ignored.
            let kind = ValueKind::parse(param.split_whitespace().next()?)?;
            params.push(kind);
        }

        Some(Self {
            name: name.to_string(),
            params,
            returns,
        })
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.returns, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")
    }
}
