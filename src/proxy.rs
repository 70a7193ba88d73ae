//! Interface dispatch proxies over loaded native modules.
//!
//! A proxy binds an application-declared interface to a loaded module.
//! Method bindings resolve lazily: the exported symbol for a method is
//! looked up on its first invocation and cached for the proxy's
//! lifetime, so a descriptor may declare methods the module does not
//! export as long as they are never called. Identity-style methods
//! (`to_string`, `eq`, `hash`) are pre-bound to local handlers before
//! any native resolution; no module exports them and they never cross
//! the boundary.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;

use crate::error::{LinkError, Result};
use crate::library::NativeLibrary;
use crate::platform;
use crate::types::{MethodSignature, Value};

/// Method names answered locally against the proxy's own identity.
const IDENTITY_METHODS: [&str; 3] = ["to_string", "eq", "hash"];

/// Calling convention recorded in a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConvention {
    /// The platform C convention.
    #[default]
    C,
    /// Stdcall; decorates symbol names where the platform defines it.
    StdCall,
}

/// The ordered set of methods a proxy exposes.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    methods: Vec<MethodSignature>,
}

impl InterfaceDescriptor {
    /// An empty descriptor.
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    /// Add a method signature. Builder-style.
    pub fn method(mut self, signature: MethodSignature) -> Self {
        self.methods.push(signature);
        self
    }

    /// Parse-and-add convenience: `descriptor.declare("i32 strlen(cstr)")`.
    pub fn declare(self, decl: &str) -> Result<Self> {
        let signature = MethodSignature::parse(decl).ok_or_else(|| {
            LinkError::InvalidArgument(format!("malformed method declaration '{}'", decl))
        })?;
        Ok(self.method(signature))
    }

    /// The declared methods, in declaration order.
    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }
}

/// Maps an interface method name to an exported symbol name.
pub type NameMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Dynamic option values for [`ProxyOptions::from_entries`].
pub enum OptionValue {
    /// Calling-convention override.
    Convention(CallConvention),
    /// Function-name mapper.
    Mapper(NameMapper),
    /// Pointer-width assumption, in bits.
    PointerBits(usize),
}

/// Recognized proxy configuration.
#[derive(Clone, Default)]
pub struct ProxyOptions {
    convention: CallConvention,
    name_mapper: Option<NameMapper>,
    pointer_bits: Option<usize>,
}

impl ProxyOptions {
    /// Defaults: C convention, no name mapping, native pointer width.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the calling convention.
    pub fn convention(mut self, convention: CallConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Map interface method names to exported symbol names.
    pub fn name_mapper(
        mut self,
        mapper: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.name_mapper = Some(Arc::new(mapper));
        self
    }

    /// Assert the pointer width the interface was declared against.
    pub fn pointer_bits(mut self, bits: usize) -> Self {
        self.pointer_bits = Some(bits);
        self
    }

    /// Build from dynamic `(key, value)` entries. Unrecognized keys are
    /// rejected here, at bind time, never silently ignored.
    pub fn from_entries<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, OptionValue)>,
    {
        let mut options = Self::default();
        for (key, value) in entries {
            match key {
                "calling-convention" => match value {
                    OptionValue::Convention(convention) => options.convention = convention,
                    _ => return Err(bad_entry(key)),
                },
                "function-mapper" => match value {
                    OptionValue::Mapper(mapper) => options.name_mapper = Some(mapper),
                    _ => return Err(bad_entry(key)),
                },
                "pointer-bits" => match value {
                    OptionValue::PointerBits(bits) => options.pointer_bits = Some(bits),
                    _ => return Err(bad_entry(key)),
                },
                other => return Err(LinkError::UnknownOption(other.to_string())),
            }
        }
        Ok(options)
    }
}

fn bad_entry(key: &str) -> LinkError {
    LinkError::InvalidArgument(format!("option '{}' given a value of the wrong shape", key))
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("convention", &self.convention)
            .field("name_mapper", &self.name_mapper.as_ref().map(|_| "<fn>"))
            .field("pointer_bits", &self.pointer_bits)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Binding {
    Native { address: usize },
    Identity(IdentityMethod),
}

#[derive(Clone, Copy)]
enum IdentityMethod {
    ToString,
    Eq,
    Hash,
}

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

/// A dispatch proxy implementing an interface over a loaded module.
///
/// Holds one cache reference to its module for its whole lifetime and
/// releases it on drop.
pub struct LibraryProxy {
    id: u64,
    handle: Arc<NativeLibrary>,
    methods: HashMap<String, MethodSignature>,
    bindings: RwLock<HashMap<String, Binding>>,
    options: ProxyOptions,
}

impl LibraryProxy {
    /// Validate `options` and `descriptor` and bind over `handle`.
    ///
    /// The proxy takes its own cache reference; the caller's remains the
    /// caller's. Symbol resolution is deferred to first invocation per
    /// method.
    pub fn bind(
        descriptor: InterfaceDescriptor,
        handle: Arc<NativeLibrary>,
        options: ProxyOptions,
    ) -> Result<Self> {
        if let Some(bits) = options.pointer_bits {
            if bits != platform::POINTER_BITS {
                return Err(LinkError::InvalidArgument(format!(
                    "declared pointer width {} does not match this process ({})",
                    bits,
                    platform::POINTER_BITS
                )));
            }
        }

        let mut methods = HashMap::new();
        for signature in descriptor.methods {
            if IDENTITY_METHODS.contains(&signature.name.as_str()) {
                return Err(LinkError::InvalidArgument(format!(
                    "method name '{}' is reserved for identity dispatch",
                    signature.name
                )));
            }
            let name = signature.name.clone();
            if methods.insert(name.clone(), signature).is_some() {
                return Err(LinkError::InvalidArgument(format!(
                    "duplicate method '{}'",
                    name
                )));
            }
        }

        let mut bindings = HashMap::new();
        bindings.insert(
            "to_string".to_string(),
            Binding::Identity(IdentityMethod::ToString),
        );
        bindings.insert("eq".to_string(), Binding::Identity(IdentityMethod::Eq));
        bindings.insert("hash".to_string(), Binding::Identity(IdentityMethod::Hash));

        handle.retain();
        Ok(Self {
            id: NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed),
            handle,
            methods,
            bindings: RwLock::new(bindings),
            options,
        })
    }

    /// The module this proxy dispatches into.
    pub fn library(&self) -> &Arc<NativeLibrary> {
        &self.handle
    }

    /// Token distinguishing this proxy instance; stable across moves.
    pub fn identity(&self) -> u64 {
        self.id
    }

    /// Invoke `method` with `args`, marshalling across the native
    /// boundary. The first invocation of a method resolves and caches
    /// its binding; a missing export surfaces as `SymbolNotFound` then,
    /// not at bind time.
    pub fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        match self.binding_for(method)? {
            Binding::Identity(kind) => self.invoke_identity(kind, args),
            Binding::Native { address } => self.invoke_native(method, address, args),
        }
    }

    fn binding_for(&self, method: &str) -> Result<Binding> {
        if let Some(binding) = self.bindings.read().get(method) {
            return Ok(*binding);
        }

        let signature = self
            .methods
            .get(method)
            .ok_or_else(|| LinkError::UnknownMethod(method.to_string()))?;
        let symbol = self.symbol_name(signature);
        trace!("binding method '{}' to symbol '{}'", method, symbol);
        let address = self.handle.find_symbol(&symbol)?;

        let binding = Binding::Native { address };
        self.bindings.write().insert(method.to_string(), binding);
        Ok(binding)
    }

    fn symbol_name(&self, signature: &MethodSignature) -> String {
        let base = match &self.options.name_mapper {
            Some(mapper) => mapper(&signature.name),
            None => signature.name.clone(),
        };
        if self.options.convention == CallConvention::StdCall
            && platform::capabilities().stdcall_decoration
        {
            // `_name@<argument bytes>` per the 32-bit stdcall rule.
            let arg_bytes: usize = signature.params.iter().map(|k| k.size().max(4)).sum();
            return format!("_{}@{}", base, arg_bytes);
        }
        base
    }

    fn invoke_identity(&self, kind: IdentityMethod, args: &[Value]) -> Result<Value> {
        match kind {
            IdentityMethod::ToString => Ok(Value::Str(self.to_string())),
            IdentityMethod::Eq => {
                let other = args.first().and_then(Value::as_pointer).unwrap_or(0);
                Ok(Value::Int((other as u64 == self.id) as i64))
            }
            IdentityMethod::Hash => {
                let mut hasher = DefaultHasher::new();
                self.id.hash(&mut hasher);
                Ok(Value::Int(hasher.finish() as i64))
            }
        }
    }

    fn invoke_native(&self, method: &str, address: usize, args: &[Value]) -> Result<Value> {
        let signature = self
            .methods
            .get(method)
            .ok_or_else(|| LinkError::UnknownMethod(method.to_string()))?;
        if !signature.accepts(args.len()) {
            return Err(LinkError::ArgCount {
                method: method.to_string(),
                expected: signature.params.len(),
                got: args.len(),
            });
        }

        let mut temps: Vec<CString> = Vec::new();
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            words.push(arg.to_word(&mut temps)?);
        }
        let raw = dispatch(address, &words)?;
        // `temps` outlives the call above; string arguments stayed valid.
        drop(temps);
        Ok(Value::from_word(raw, signature.returns))
    }
}

/// Arity-dispatched trampoline. Rust FFI needs the parameter count at
/// compile time, so each arity transmutes to its own signature.
fn dispatch(address: usize, words: &[u64]) -> Result<u64> {
    type Fn0 = extern "C" fn() -> u64;
    type Fn1 = extern "C" fn(u64) -> u64;
    type Fn2 = extern "C" fn(u64, u64) -> u64;
    type Fn3 = extern "C" fn(u64, u64, u64) -> u64;
    type Fn4 = extern "C" fn(u64, u64, u64, u64) -> u64;
    type Fn5 = extern "C" fn(u64, u64, u64, u64, u64) -> u64;
    type Fn6 = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

    // Safety: the address came from the module's export table and the
    // word-per-argument convention is the declared contract for proxied
    // methods.
    unsafe {
        Ok(match words {
            [] => std::mem::transmute::<usize, Fn0>(address)(),
            [a] => std::mem::transmute::<usize, Fn1>(address)(*a),
            [a, b] => std::mem::transmute::<usize, Fn2>(address)(*a, *b),
            [a, b, c] => std::mem::transmute::<usize, Fn3>(address)(*a, *b, *c),
            [a, b, c, d] => std::mem::transmute::<usize, Fn4>(address)(*a, *b, *c, *d),
            [a, b, c, d, e] => {
                std::mem::transmute::<usize, Fn5>(address)(*a, *b, *c, *d, *e)
            }
            [a, b, c, d, e, f] => {
                std::mem::transmute::<usize, Fn6>(address)(*a, *b, *c, *d, *e, *f)
            }
            _ => {
                return Err(LinkError::InvalidArgument(format!(
                    "proxied calls are limited to 6 arguments, got {}",
                    words.len()
                )))
            }
        })
    }
}

impl fmt::Display for LibraryProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "native proxy #{} to {}",
            self.id,
            self.handle.location().describe()
        )
    }
}

impl PartialEq for LibraryProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LibraryProxy {}

impl Hash for LibraryProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Drop for LibraryProxy {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;

    #[test]
    fn test_descriptor_declares_and_rejects() {
        let descriptor = InterfaceDescriptor::new()
            .declare("i32 strlen(cstr)")
            .expect("valid declaration")
            .declare("i32 geteuid()")
            .expect("valid declaration");
        assert_eq!(descriptor.methods().len(), 2);

        assert!(InterfaceDescriptor::new().declare("gibberish").is_err());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = ProxyOptions::from_entries([(
            "definitely-not-an-option",
            OptionValue::PointerBits(64),
        )])
        .expect_err("unknown key");
        match err {
            LinkError::UnknownOption(key) => assert_eq!(key, "definitely-not-an-option"),
            other => panic!("expected UnknownOption, got {:?}", other),
        }
    }

    #[test]
    fn test_recognized_entries_accepted() {
        let options = ProxyOptions::from_entries([
            ("calling-convention", OptionValue::Convention(CallConvention::C)),
            ("pointer-bits", OptionValue::PointerBits(platform::POINTER_BITS)),
            (
                "function-mapper",
                OptionValue::Mapper(Arc::new(|name: &str| name.to_string())),
            ),
        ])
        .expect("all keys recognized");
        assert_eq!(options.pointer_bits, Some(platform::POINTER_BITS));
    }

    #[test]
    fn test_wrong_shape_value_rejected() {
        let err = ProxyOptions::from_entries([(
            "calling-convention",
            OptionValue::PointerBits(64),
        )])
        .expect_err("wrong value shape");
        assert!(matches!(err, LinkError::InvalidArgument(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_bind_rejects_bad_declarations() {
        let handle = NativeLibrary::the_process().expect("process handle");

        let reserved = InterfaceDescriptor::new().method(MethodSignature::new(
            "to_string",
            vec![],
            ValueKind::Void,
        ));
        assert!(matches!(
            LibraryProxy::bind(reserved, Arc::clone(&handle), ProxyOptions::new()),
            Err(LinkError::InvalidArgument(_))
        ));

        let duplicated = InterfaceDescriptor::new()
            .method(MethodSignature::new("twice", vec![], ValueKind::Void))
            .method(MethodSignature::new("twice", vec![], ValueKind::Void));
        assert!(matches!(
            LibraryProxy::bind(duplicated, Arc::clone(&handle), ProxyOptions::new()),
            Err(LinkError::InvalidArgument(_))
        ));

        let mismatched = LibraryProxy::bind(
            InterfaceDescriptor::new(),
            Arc::clone(&handle),
            ProxyOptions::new().pointer_bits(platform::POINTER_BITS / 2),
        );
        assert!(matches!(mismatched, Err(LinkError::InvalidArgument(_))));

        handle.release();
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_methods_answer_locally() {
        let handle = NativeLibrary::the_process().expect("process handle");
        let proxy = LibraryProxy::bind(
            InterfaceDescriptor::new(),
            Arc::clone(&handle),
            ProxyOptions::new(),
        )
        .expect("binds");
        handle.release();

        let text = proxy
            .invoke("to_string", &[])
            .expect("to_string is always satisfiable");
        assert!(text.as_str().map_or(false, |s| s.contains("native proxy")));

        let self_eq = proxy
            .invoke("eq", &[Value::Pointer(proxy.identity() as usize)])
            .expect("eq is always satisfiable");
        assert_eq!(self_eq, Value::Int(1));
        let other_eq = proxy
            .invoke("eq", &[Value::Pointer(0)])
            .expect("eq is always satisfiable");
        assert_eq!(other_eq, Value::Int(0));

        let first = proxy.invoke("hash", &[]).expect("hash is always satisfiable");
        let second = proxy.invoke("hash", &[]).expect("hash is stable");
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_undeclared_method_rejected() {
        let handle = NativeLibrary::the_process().expect("process handle");
        let proxy = LibraryProxy::bind(
            InterfaceDescriptor::new(),
            Arc::clone(&handle),
            ProxyOptions::new(),
        )
        .expect("binds");
        handle.release();

        assert!(matches!(
            proxy.invoke("never_declared", &[]),
            Err(LinkError::UnknownMethod(_))
        ));
    }
}
