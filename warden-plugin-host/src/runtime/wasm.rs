//! WebAssembly isolation via wasmtime.
//!
//! Guests are core modules in WAT text form with no WASI. The only
//! import module is `warden`:
//!
//! - `call(ptr: i32, len: i32) -> i64` reads a JSON `{method, args, reason?}`
//!   from guest memory, performs the host call and returns the byte length
//!   of the JSON reply (`{"ok": value}` or `{"error": {...}}`).
//! - `take_response(ptr: i32)` copies that reply into guest memory.
//!
//! The module must export `memory` and `run: () -> i32`; the execution
//! result is the value `run` returns. Each context has its own engine so
//! an epoch bump interrupts exactly one guest.

use super::{GuestContext, GuestFault, Interrupter, IsolationRuntime, RuntimeKind};
use crate::error::PluginHostResult;
use crate::message::{ApiCallPayload, ErrorPayload};
use crate::proxy::ApiProxy;
use serde_json::{Value, json};
use tracing::debug;
use wasmtime::{Caller, Engine, Linker, Module, ResourceLimiter, Store};
use warden_types::PluginId;

/// Upper bound on a single request read out of guest memory.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

const MAX_TABLE_ELEMENTS: usize = 10_000;

pub struct WasmRuntime {
    max_memory_bytes: usize,
}

impl WasmRuntime {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self { max_memory_bytes }
    }
}

impl IsolationRuntime for WasmRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    fn create_context(&self, plugin_id: &PluginId) -> PluginHostResult<Box<dyn GuestContext>> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;
        debug!(plugin_id = %plugin_id, "Created wasm engine for context");
        Ok(Box::new(WasmContext {
            interrupter: Interrupter::with_engine(engine.clone()),
            engine,
            max_memory_bytes: self.max_memory_bytes,
        }))
    }
}

/// Caps linear memory and table growth for one guest.
struct MemoryCeiling {
    max_memory: usize,
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired <= self.max_memory {
            Ok(true)
        } else {
            debug!(
                current,
                desired,
                max = self.max_memory,
                "Guest memory growth denied"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

struct GuestState {
    proxy: ApiProxy,
    response: Vec<u8>,
    /// Set when a host call had to abort the guest.
    fault: Option<GuestFault>,
    limiter: MemoryCeiling,
}

struct WasmContext {
    engine: Engine,
    interrupter: Interrupter,
    max_memory_bytes: usize,
}

impl GuestContext for WasmContext {
    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn run(self: Box<Self>, code: &str, proxy: ApiProxy) -> Result<Value, GuestFault> {
        let module = Module::new(&self.engine, code)
            .map_err(|e| GuestFault::Raised(format!("invalid module: {e}")))?;

        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        linker
            .func_wrap(
                "warden",
                "call",
                |caller: Caller<'_, GuestState>, ptr: i32, len: i32| host_call(caller, ptr, len),
            )
            .and_then(|l| {
                l.func_wrap(
                    "warden",
                    "take_response",
                    |caller: Caller<'_, GuestState>, ptr: i32| take_response(caller, ptr),
                )
            })
            .map_err(|e| GuestFault::Raised(format!("linker setup failed: {e}")))?;

        let mut store = Store::new(
            &self.engine,
            GuestState {
                proxy,
                response: Vec::new(),
                fault: None,
                limiter: MemoryCeiling {
                    max_memory: self.max_memory_bytes,
                },
            },
        );
        store.limiter(|state| &mut state.limiter);
        store.set_epoch_deadline(1);
        // An interrupt that bumped the epoch before the deadline existed
        // would never trap. The flag is set before the bump, so checking
        // it after arming the deadline covers that window.
        if self.interrupter.is_interrupted() {
            debug!("Guest interrupted before instantiation");
            return Err(GuestFault::Interrupted);
        }

        let outcome = linker
            .instantiate(&mut store, &module)
            .and_then(|instance| instance.get_typed_func::<(), i32>(&mut store, "run"))
            .and_then(|run| run.call(&mut store, ()));

        match outcome {
            Ok(code) => Ok(json!(code)),
            Err(e) => Err(store
                .data_mut()
                .fault
                .take()
                .unwrap_or_else(|| self.classify(e))),
        }
    }
}

impl WasmContext {
    fn classify(&self, error: wasmtime::Error) -> GuestFault {
        if self.interrupter.is_interrupted() {
            GuestFault::Interrupted
        } else {
            GuestFault::Trap(format!("{error:#}"))
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> wasmtime::Result<wasmtime::Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("guest does not export 'memory'"))
}

fn host_call(mut caller: Caller<'_, GuestState>, ptr: i32, len: i32) -> wasmtime::Result<i64> {
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(wasmtime::Error::msg("negative pointer or length"));
    };
    if len > MAX_REQUEST_BYTES {
        return Err(wasmtime::Error::msg(format!(
            "request of {len} bytes exceeds {MAX_REQUEST_BYTES}"
        )));
    }

    let memory = guest_memory(&mut caller)?;
    let mut request = vec![0u8; len];
    memory
        .read(&caller, ptr, &mut request)
        .map_err(|e| wasmtime::Error::msg(e.to_string()))?;

    let reply = match serde_json::from_slice::<ApiCallPayload>(&request) {
        Ok(call) => {
            let state = caller.data_mut();
            match state.proxy.call(&call.method, call.args, call.reason) {
                Ok(Ok(value)) => json!({ "ok": value }),
                Ok(Err(error)) => json!({ "error": error }),
                Err(fault) => {
                    state.fault = Some(fault);
                    return Err(wasmtime::Error::msg("host call aborted"));
                }
            }
        }
        Err(e) => json!({ "error": ErrorPayload::invalid_arguments(format!("malformed call: {e}")) }),
    };

    let bytes = serde_json::to_vec(&reply).map_err(|e| wasmtime::Error::msg(e.to_string()))?;
    let written = bytes.len() as i64;
    caller.data_mut().response = bytes;
    Ok(written)
}

fn take_response(mut caller: Caller<'_, GuestState>, ptr: i32) -> wasmtime::Result<()> {
    let ptr = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative pointer"))?;
    let memory = guest_memory(&mut caller)?;
    let response = std::mem::take(&mut caller.data_mut().response);
    memory
        .write(&mut caller, ptr, &response)
        .map_err(|e| wasmtime::Error::msg(e.to_string()))
}
