//! Hosted library adapters and their operation catalogs.
//!
//! A [`HostedLibrary`] is the worker-side face of the foreign library: it is
//! loaded once from a path and exposes a fixed [`Catalog`] mapping operation
//! names to a typed signature and a callable. The catalog binds and checks
//! arguments before the callable runs, so handlers only ever see values of
//! their declared tags.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::sync::Once;
use std::path::{Path, PathBuf};

use crate::protocol::{FromValue, ProtocolError, Request, TypeTag, Value};

/// Error kind for arguments that fail binding or type checks.
pub const INVALID_ARGUMENT: &str = "InvalidArgument";
/// Error kind for a handler returning a value of the wrong tag.
pub const INVALID_RETURN: &str = "InvalidReturn";
/// Error kind for a handler that panicked.
pub const PANIC: &str = "Panic";

/// The library could not be loaded. The worker exits before binding.
#[derive(Debug, thiserror::Error)]
#[error("failed to load library {}: {reason}", path.display())]
pub struct LoadError {
    pub path: PathBuf,
    pub reason: String,
}

impl LoadError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failure raised by a native call. Reported to the caller, never fatal to
/// the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NativeError {
    pub kind: String,
    pub message: String,
    /// `file:line` of the panic, for [`PANIC`] failures.
    pub location: Option<String>,
}

impl NativeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            location: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(INVALID_ARGUMENT, message)
    }

    pub fn invalid_return(message: impl Into<String>) -> Self {
        Self::new(INVALID_RETURN, message)
    }
}

impl From<ProtocolError> for NativeError {
    fn from(err: ProtocolError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}

/// A library hosted by a worker process.
pub trait HostedLibrary: Send + Sized + 'static {
    /// Load the library at `path`. Called once, before the worker binds.
    fn load(path: &Path) -> Result<Self, LoadError>;

    /// Absolute path the library was loaded from.
    fn path(&self) -> &Path;

    /// The operations this library exposes.
    fn catalog() -> Catalog<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub tag: TypeTag,
}

/// Declared parameter list and return tag of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Param>,
    pub returns: TypeTag,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", param.name, param.tag)?;
        }
        write!(f, ") -> {}", self.returns)
    }
}

/// Bound arguments, in parameter order, already checked against the
/// signature.
#[derive(Debug, Clone)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Typed copy of the argument at `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, NativeError> {
        let value = self.values.get(index).cloned().ok_or_else(|| {
            NativeError::invalid_argument(format!("no argument at position {index}"))
        })?;
        Ok(value.into_typed()?)
    }
}

type Handler<L> = dyn Fn(&mut L, &Args) -> Result<Value, NativeError> + Send + Sync;

struct Operation<L> {
    signature: Signature,
    handler: Box<Handler<L>>,
}

/// Why an invocation did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("{error}")]
    Native {
        error: NativeError,
        signature: Signature,
    },
}

/// Map from operation name to signature and callable. Built once per worker.
pub struct Catalog<L> {
    operations: BTreeMap<&'static str, Operation<L>>,
}

impl<L> Default for Catalog<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> Catalog<L> {
    pub fn new() -> Self {
        Self {
            operations: BTreeMap::new(),
        }
    }

    /// Add an operation. A later registration under the same name replaces
    /// the earlier one.
    pub fn register<F>(
        mut self,
        name: &'static str,
        params: &[(&'static str, TypeTag)],
        returns: TypeTag,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut L, &Args) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        let signature = Signature {
            params: params
                .iter()
                .map(|&(name, tag)| Param { name, tag })
                .collect(),
            returns,
        };
        self.operations.insert(
            name,
            Operation {
                signature,
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.operations.keys().copied()
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.operations.get(name).map(|op| &op.signature)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Bind the request's arguments to the named operation and run it.
    ///
    /// Positional arguments bind first, then named ones. Handler panics are
    /// caught and reported as [`PANIC`] failures.
    pub fn invoke(&self, library: &mut L, request: &Request) -> Result<Value, InvokeError> {
        let operation = self
            .operations
            .get(request.operation())
            .ok_or_else(|| InvokeError::UnknownOperation(request.operation().to_string()))?;
        let native = |error| InvokeError::Native {
            error,
            signature: operation.signature.clone(),
        };

        let args = bind(&operation.signature, request).map_err(native)?;

        record_panic_locations();
        PANIC_LOCATION.with(|cell| cell.set(None));
        let outcome = catch_unwind(AssertUnwindSafe(|| (operation.handler)(library, &args)));
        let value = match outcome {
            Ok(result) => result.map_err(native)?,
            Err(payload) => {
                let mut error = NativeError::new(PANIC, panic_message(payload.as_ref()));
                error.location = PANIC_LOCATION.with(Cell::take);
                return Err(native(error));
            }
        };

        let returns = operation.signature.returns;
        if value.tag() != returns {
            return Err(native(NativeError::invalid_return(format!(
                "declared {returns}, returned {}",
                value.tag()
            ))));
        }
        Ok(value)
    }
}

fn bind(signature: &Signature, request: &Request) -> Result<Args, NativeError> {
    let params = &signature.params;
    let positional = request.positional();
    if positional.len() > params.len() {
        return Err(NativeError::invalid_argument(format!(
            "expected at most {} arguments, got {}",
            params.len(),
            positional.len()
        )));
    }

    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in slots.iter_mut().zip(positional) {
        *slot = Some(value.clone());
    }

    for (name, value) in request.named() {
        let index = params
            .iter()
            .position(|param| param.name == name.as_str())
            .ok_or_else(|| NativeError::invalid_argument(format!("unknown argument `{name}`")))?;
        if slots[index].is_some() {
            return Err(NativeError::invalid_argument(format!(
                "argument `{name}` given more than once"
            )));
        }
        slots[index] = Some(value.clone());
    }

    let mut values = Vec::with_capacity(params.len());
    for (param, slot) in params.iter().zip(slots) {
        let value = slot.ok_or_else(|| {
            NativeError::invalid_argument(format!("missing argument `{}`", param.name))
        })?;
        if value.tag() != param.tag {
            return Err(NativeError::invalid_argument(format!(
                "argument `{}` expects {}, got {}",
                param.name,
                param.tag,
                value.tag()
            )));
        }
        values.push(value);
    }
    Ok(Args { values })
}

thread_local! {
    static PANIC_LOCATION: Cell<Option<String>> = const { Cell::new(None) };
}

/// Chain a panic hook, once per process, that remembers where the latest
/// panic on each thread happened.
fn record_panic_locations() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|location| format!("{}:{}", location.file(), location.line()));
            PANIC_LOCATION.with(|cell| cell.set(location));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}
