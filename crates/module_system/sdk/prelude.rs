// Horizon module SDK.
//
// The host compiler places this file at the root of every module crate, next
// to the generated ABI glue. Items below are what module authors program
// against; `__horizon_sdk` is support code for the glue only.

/// A module extending the game server.
#[allow(dead_code)]
pub trait ServerModule {
    /// Called once every module of the generation is loaded and bound.
    fn on_modules_loaded(&mut self) {}

    /// Called before the generation holding this module is torn down.
    fn on_module_unloading(&mut self) {}

    /// Called when the host creates its server instance.
    fn on_creating_server_instance(&mut self, _server: &ServerHandle) {}
}

/// A module that only contributes console commands.
#[allow(dead_code)]
pub trait ConsoleModule {
    fn on_modules_loaded(&mut self) {}

    fn on_module_unloading(&mut self) {}

    fn on_creating_server_instance(&mut self, _server: &ServerHandle) {}
}

/// The server a module is attached to.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    pub name: String,
    pub bind_address: String,
}

/// A reference to another module, bound by the host after loading.
#[allow(dead_code)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleRef {
    name: String,
    loaded: bool,
}

#[allow(dead_code)]
impl ModuleRef {
    pub fn new(name: &str, loaded: bool) -> Self {
        Self {
            name: name.to_string(),
            loaded,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the referenced module is loaded in the same generation.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

/// Converts a command handler's return value into console output.
#[allow(dead_code)]
pub trait IntoReply {
    fn into_reply(self) -> Result<Option<String>, String>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Option<String>, String> {
        Ok(None)
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Option<String>, String> {
        Ok(Some(self))
    }
}

impl IntoReply for &str {
    fn into_reply(self) -> Result<Option<String>, String> {
        Ok(Some(self.to_string()))
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Option<String>, String> {
        match self {
            Some(value) => value.into_reply(),
            None => Ok(None),
        }
    }
}

impl<T: IntoReply, E: std::fmt::Display> IntoReply for Result<T, E> {
    fn into_reply(self) -> Result<Option<String>, String> {
        match self {
            Ok(value) => value.into_reply(),
            Err(error) => Err(error.to_string()),
        }
    }
}

#[doc(hidden)]
#[allow(dead_code)]
pub mod __horizon_sdk {
    use super::{IntoReply, ModuleRef, ServerHandle};
    use std::any::Any;
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;

    pub enum Failure {
        Conversion { value: String, target: String },
        Handler(String),
    }

    /// # Safety
    /// `ptr` is null or a valid NUL-terminated string.
    pub unsafe fn text(ptr: *const c_char) -> String {
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }

    /// # Safety
    /// `argv` is null or points to `argc` entries, each null or a valid C string.
    pub unsafe fn collect_args(argv: *const *const c_char, argc: usize) -> Vec<Option<String>> {
        if argv.is_null() || argc == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(argv, argc)
            .iter()
            .map(|&arg| if arg.is_null() { None } else { Some(text(arg)) })
            .collect()
    }

    pub fn raw(args: &[Option<String>], index: usize) -> Option<&str> {
        args.get(index).and_then(|arg| arg.as_deref())
    }

    pub fn required<'a>(
        args: &'a [Option<String>],
        index: usize,
        name: &str,
    ) -> Result<&'a str, Failure> {
        raw(args, index).ok_or_else(|| Failure::Handler(format!("missing argument '{}'", name)))
    }

    pub fn conversion(value: &str, target: &str) -> Failure {
        Failure::Conversion {
            value: value.to_string(),
            target: target.to_string(),
        }
    }

    pub fn parse<T: std::str::FromStr>(value: &str, target: &str) -> Result<T, Failure> {
        value.parse().map_err(|_| conversion(value, target))
    }

    pub fn handler<R: IntoReply>(value: R) -> Result<Option<String>, Failure> {
        value.into_reply().map_err(Failure::Handler)
    }

    /// # Safety
    /// Both pointers are null or valid C strings.
    pub unsafe fn server_handle(name: *const c_char, address: *const c_char) -> ServerHandle {
        ServerHandle {
            name: text(name),
            bind_address: text(address),
        }
    }

    pub fn module_ref(name: &str, loaded: bool) -> ModuleRef {
        ModuleRef::new(name, loaded)
    }

    /// Encodes a handler outcome as a tagged reply string owned by this module.
    pub fn encode(outcome: std::thread::Result<Result<Option<String>, Failure>>) -> *mut c_char {
        let reply = match outcome {
            Ok(Ok(None)) => "N".to_string(),
            Ok(Ok(Some(output))) => format!("O{}", output),
            Ok(Err(Failure::Handler(message))) => format!("E{}", message),
            Ok(Err(Failure::Conversion { value, target })) => {
                format!("A{}\u{1f}{}", value, target)
            }
            Err(payload) => format!("P{}", panic_message(payload.as_ref())),
        };
        CString::new(reply.replace('\0', ""))
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut())
    }

    pub fn panic_message(payload: &(dyn Any + Send)) -> String {
        if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "module panicked".to_string()
        }
    }

    /// # Safety
    /// `reply` is null or was returned by [`encode`] and not released yet.
    pub unsafe fn release(reply: *mut c_char) {
        if !reply.is_null() {
            drop(CString::from_raw(reply));
        }
    }
}
