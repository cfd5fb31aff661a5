//! Embedded evaluation of compiled OPA policy modules.
//!
//! Policy definitions are base64-encoded WebAssembly modules following the
//! OPA Wasm ABI. The engine keeps a single loaded instance, identified by the
//! SHA-256 digest of the module bytes, and swaps it when a different module
//! arrives.
//!
//! ```text
//! evaluate(policy, input, query)
//!   1. decode base64, hash module bytes
//!   2. lock loaded slot (Mutex)
//!   3. digest differs → drop old instance, compile + instantiate new one
//!   4. reset heap, write input, parse it
//!   5. eval_ctx_new → set_input / set_data / set_entrypoint
//!   6. eval → get_result → json_dump
//!   7. interpret result[0].result
//! ```
//!
//! Guest memory is imported from the host (`env.memory`) and capped by a
//! store limiter. Fuel metering is enabled when a fuel limit is configured.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use wasmtime::{
    AsContext, Caller, Config, Engine, ExternType, Instance, Linker, Memory, Module, Store,
    StoreLimits, StoreLimitsBuilder, TypedFunc, WasmParams, WasmResults,
};

use crate::config::WasmConfig;
use crate::engine::{EvaluationOutcome, interpret_result};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the embedded engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WasmEngineError {
    /// The policy definition is not valid base64.
    #[error("Policy module is not valid base64: {0}")]
    InvalidEncoding(String),

    /// The module bytes are not a valid WebAssembly module.
    #[error("Failed to compile policy module: {0}")]
    Compile(String),

    /// The module could not be linked or instantiated.
    #[error("Failed to instantiate policy module: {0}")]
    Instantiate(String),

    /// A required OPA ABI export is missing or has the wrong signature.
    #[error("Policy module is missing export {0}")]
    MissingExport(String),

    /// The query does not name an entrypoint of the module.
    #[error("Unknown entrypoint '{query}' (available: {available})")]
    UnknownEntrypoint { query: String, available: String },

    /// The guest trapped or aborted.
    #[error("Policy module trapped: {0}")]
    Trap(String),

    /// `eval` returned a non-zero status.
    #[error("Policy evaluation returned error code {0}")]
    EvalFailed(i32),

    /// A guest pointer or string could not be read.
    #[error("Invalid policy module memory access: {0}")]
    Memory(String),

    /// The sandbox itself could not be configured.
    #[error("Sandbox error: {0}")]
    Sandbox(String),
}

fn trap(err: wasmtime::Error) -> WasmEngineError {
    WasmEngineError::Trap(format!("{err:#}"))
}

// =============================================================================
// Sandbox State
// =============================================================================

struct SandboxState {
    limits: StoreLimits,
}

/// OPA ABI exports used by the engine.
struct OpaExports {
    malloc: TypedFunc<i32, i32>,
    json_parse: TypedFunc<(i32, i32), i32>,
    json_dump: TypedFunc<i32, i32>,
    heap_ptr_get: TypedFunc<(), i32>,
    heap_ptr_set: TypedFunc<i32, ()>,
    entrypoints: TypedFunc<(), i32>,
    eval_ctx_new: TypedFunc<(), i32>,
    eval_ctx_set_input: TypedFunc<(i32, i32), ()>,
    eval_ctx_set_data: TypedFunc<(i32, i32), ()>,
    eval_ctx_set_entrypoint: TypedFunc<(i32, i32), ()>,
    eval_ctx_get_result: TypedFunc<i32, i32>,
    eval: TypedFunc<i32, i32>,
}

impl OpaExports {
    fn resolve(instance: &Instance, store: &mut Store<SandboxState>) -> Result<Self, WasmEngineError> {
        Ok(Self {
            malloc: typed(instance, store, "opa_malloc")?,
            json_parse: typed(instance, store, "opa_json_parse")?,
            json_dump: typed(instance, store, "opa_json_dump")?,
            heap_ptr_get: typed(instance, store, "opa_heap_ptr_get")?,
            heap_ptr_set: typed(instance, store, "opa_heap_ptr_set")?,
            entrypoints: typed(instance, store, "entrypoints")?,
            eval_ctx_new: typed(instance, store, "opa_eval_ctx_new")?,
            eval_ctx_set_input: typed(instance, store, "opa_eval_ctx_set_input")?,
            eval_ctx_set_data: typed(instance, store, "opa_eval_ctx_set_data")?,
            eval_ctx_set_entrypoint: typed(instance, store, "opa_eval_ctx_set_entrypoint")?,
            eval_ctx_get_result: typed(instance, store, "opa_eval_ctx_get_result")?,
            eval: typed(instance, store, "eval")?,
        })
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: &mut Store<SandboxState>,
    name: &str,
) -> Result<TypedFunc<P, R>, WasmEngineError>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| WasmEngineError::MissingExport(format!("{name}: {e}")))
}

/// Reads a NUL-terminated UTF-8 string from guest memory.
fn read_string(memory: &Memory, store: impl AsContext, addr: i32) -> Result<String, WasmEngineError> {
    let data = memory.data(&store);
    let start = usize::try_from(addr)
        .map_err(|_| WasmEngineError::Memory(format!("negative address {addr}")))?;
    let tail = data
        .get(start..)
        .ok_or_else(|| WasmEngineError::Memory(format!("address {addr} out of bounds")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WasmEngineError::Memory(format!("unterminated string at {addr}")))?;
    String::from_utf8(tail[..end].to_vec()).map_err(|e| WasmEngineError::Memory(e.to_string()))
}

// =============================================================================
// Loaded Module
// =============================================================================

/// One instantiated policy module with its store.
struct LoadedModule {
    digest: String,
    store: Store<SandboxState>,
    memory: Memory,
    exports: OpaExports,
    entrypoints: HashMap<String, i32>,
    data_addr: i32,
    base_heap_ptr: i32,
}

impl LoadedModule {
    fn write_json(&mut self, text: &str) -> Result<i32, WasmEngineError> {
        let len = i32::try_from(text.len())
            .map_err(|_| WasmEngineError::Memory("document too large".to_string()))?;
        let addr = self.exports.malloc.call(&mut self.store, len).map_err(trap)?;
        let offset = usize::try_from(addr)
            .map_err(|_| WasmEngineError::Memory(format!("negative address {addr}")))?;
        self.memory
            .write(&mut self.store, offset, text.as_bytes())
            .map_err(|e| WasmEngineError::Memory(e.to_string()))?;

        let parsed = self
            .exports
            .json_parse
            .call(&mut self.store, (addr, len))
            .map_err(trap)?;
        if parsed == 0 {
            return Err(WasmEngineError::Memory(
                "guest failed to parse JSON document".to_string(),
            ));
        }
        Ok(parsed)
    }

    fn dump_json(&mut self, value_addr: i32) -> Result<String, WasmEngineError> {
        let text_addr = self
            .exports
            .json_dump
            .call(&mut self.store, value_addr)
            .map_err(trap)?;
        read_string(&self.memory, &self.store, text_addr)
    }

    fn resolve_entrypoint(&self, query: &str) -> Result<i32, WasmEngineError> {
        if let Some(id) = self.entrypoints.get(query) {
            return Ok(*id);
        }
        let path = query.strip_prefix("data.").unwrap_or(query).replace('.', "/");
        self.entrypoints.get(&path).copied().ok_or_else(|| {
            let mut available: Vec<_> = self.entrypoints.keys().cloned().collect();
            available.sort();
            WasmEngineError::UnknownEntrypoint {
                query: query.to_string(),
                available: available.join(", "),
            }
        })
    }

    fn evaluate(
        &mut self,
        input: &Value,
        query: &str,
        fuel_limit: Option<u64>,
    ) -> Result<EvaluationOutcome, WasmEngineError> {
        let entrypoint = self.resolve_entrypoint(query)?;

        if let Some(fuel) = fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(|e| WasmEngineError::Sandbox(e.to_string()))?;
        }

        self.exports
            .heap_ptr_set
            .call(&mut self.store, self.base_heap_ptr)
            .map_err(trap)?;

        let input_text =
            serde_json::to_string(input).map_err(|e| WasmEngineError::Memory(e.to_string()))?;
        let input_addr = self.write_json(&input_text)?;

        let ctx = self.exports.eval_ctx_new.call(&mut self.store, ()).map_err(trap)?;
        self.exports
            .eval_ctx_set_input
            .call(&mut self.store, (ctx, input_addr))
            .map_err(trap)?;
        self.exports
            .eval_ctx_set_data
            .call(&mut self.store, (ctx, self.data_addr))
            .map_err(trap)?;
        self.exports
            .eval_ctx_set_entrypoint
            .call(&mut self.store, (ctx, entrypoint))
            .map_err(trap)?;

        let code = self.exports.eval.call(&mut self.store, ctx).map_err(trap)?;
        if code != 0 {
            return Err(WasmEngineError::EvalFailed(code));
        }

        let result_addr = self
            .exports
            .eval_ctx_get_result
            .call(&mut self.store, ctx)
            .map_err(trap)?;
        let result_set = self.dump_json(result_addr)?;

        Ok(interpret_result_set(&result_set))
    }
}

/// Interprets an OPA result set (`[{"result": ...}]`). Empty or malformed is deny.
fn interpret_result_set(text: &str) -> EvaluationOutcome {
    let results = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(results)) => results,
        _ => {
            tracing::warn!(output = %text, "Malformed policy module output, denying");
            return EvaluationOutcome::deny();
        }
    };

    match results.first().and_then(|entry| entry.get("result")) {
        Some(result) => interpret_result(result),
        None => {
            tracing::debug!("Empty policy result set, denying");
            EvaluationOutcome::deny()
        }
    }
}

// =============================================================================
// Wasm Engine
// =============================================================================

/// In-process sandbox for compiled OPA policy modules.
pub struct WasmEngine {
    engine: Engine,
    config: WasmConfig,
    loaded: Mutex<Option<LoadedModule>>,
    loads: AtomicU64,
    evaluations: AtomicU64,
}

impl WasmEngine {
    /// Creates a sandbox with no module loaded.
    ///
    /// # Errors
    ///
    /// Returns `WasmEngineError::Sandbox` if the wasmtime engine cannot be created.
    pub fn new(config: &WasmConfig) -> Result<Self, WasmEngineError> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(config.fuel_limit.is_some());
        let engine =
            Engine::new(&wasm_config).map_err(|e| WasmEngineError::Sandbox(e.to_string()))?;

        tracing::info!(
            memory_limit_mb = config.memory_limit_mb,
            fuel_limit = ?config.fuel_limit,
            "Wasm policy sandbox initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
            loaded: Mutex::new(None),
            loads: AtomicU64::new(0),
            evaluations: AtomicU64::new(0),
        })
    }

    /// Evaluates a base64-encoded policy module against `input`.
    ///
    /// Loading, swapping and evaluating happen under one lock, so an
    /// evaluation never observes a half-replaced module.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid base64, compile or link failures, unknown
    /// entrypoints, guest traps and non-zero eval codes. Empty or malformed
    /// result sets are a deny, not an error.
    pub fn evaluate(
        &self,
        policy: &str,
        input: &Value,
        query: &str,
    ) -> Result<EvaluationOutcome, WasmEngineError> {
        let bytes = STANDARD
            .decode(policy.trim())
            .map_err(|e| WasmEngineError::InvalidEncoding(e.to_string()))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let mut slot = match self.loaded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Wasm module mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let module = match slot.take() {
            Some(current) if current.digest == digest => current,
            previous => {
                if let Some(previous) = previous {
                    tracing::info!(
                        previous = %previous.digest,
                        next = %digest,
                        "Replacing loaded policy module"
                    );
                }
                self.load(&bytes, digest)?
            }
        };
        let module = slot.insert(module);

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let result = module.evaluate(input, query, self.config.fuel_limit);

        if let Err(WasmEngineError::Trap(reason)) = &result {
            // a trapped instance is not reused
            tracing::error!(digest = %module.digest, reason = %reason, "Policy module trapped");
            *slot = None;
        }

        result
    }

    fn load(&self, bytes: &[u8], digest: String) -> Result<LoadedModule, WasmEngineError> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| WasmEngineError::Compile(format!("{e:#}")))?;

        let memory_limit = self.config.memory_limit_mb.saturating_mul(1024 * 1024);
        let mut store = Store::new(
            &self.engine,
            SandboxState {
                limits: StoreLimitsBuilder::new().memory_size(memory_limit).build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| WasmEngineError::Sandbox(e.to_string()))?;
        }

        let memory_type = module
            .imports()
            .find_map(|import| match (import.module(), import.name(), import.ty()) {
                ("env", "memory", ExternType::Memory(ty)) => Some(ty),
                _ => None,
            })
            .ok_or_else(|| {
                WasmEngineError::Instantiate("module does not import env.memory".to_string())
            })?;
        let memory = Memory::new(&mut store, memory_type)
            .map_err(|e| WasmEngineError::Instantiate(format!("memory: {e:#}")))?;

        let linker = self.linker(&store, memory)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| WasmEngineError::Instantiate(format!("{e:#}")))?;
        let exports = OpaExports::resolve(&instance, &mut store)?;

        let mut loaded = LoadedModule {
            digest,
            store,
            memory,
            exports,
            entrypoints: HashMap::new(),
            data_addr: 0,
            base_heap_ptr: 0,
        };

        let entrypoints_addr = loaded
            .exports
            .entrypoints
            .call(&mut loaded.store, ())
            .map_err(trap)?;
        let entrypoints = loaded.dump_json(entrypoints_addr)?;
        loaded.entrypoints = serde_json::from_str(&entrypoints).map_err(|e| {
            WasmEngineError::Instantiate(format!("invalid entrypoints table: {e}"))
        })?;

        loaded.data_addr = loaded.write_json("{}")?;
        loaded.base_heap_ptr = loaded
            .exports
            .heap_ptr_get
            .call(&mut loaded.store, ())
            .map_err(trap)?;

        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            digest = %loaded.digest,
            entrypoints = loaded.entrypoints.len(),
            "Policy module loaded"
        );

        Ok(loaded)
    }

    fn linker(
        &self,
        store: &Store<SandboxState>,
        memory: Memory,
    ) -> Result<Linker<SandboxState>, WasmEngineError> {
        let link_err = |e: wasmtime::Error| WasmEngineError::Instantiate(format!("{e:#}"));
        let mut linker = Linker::new(&self.engine);

        linker.define(store, "env", "memory", memory).map_err(link_err)?;

        linker
            .func_wrap(
                "env",
                "opa_abort",
                move |caller: Caller<'_, SandboxState>, addr: i32| -> wasmtime::Result<()> {
                    let message = read_string(&memory, &caller, addr)
                        .unwrap_or_else(|e| e.to_string());
                    Err(wasmtime::Error::msg(format!("opa_abort: {message}")))
                },
            )
            .map_err(link_err)?;

        linker
            .func_wrap(
                "env",
                "opa_println",
                move |caller: Caller<'_, SandboxState>, addr: i32| {
                    if let Ok(message) = read_string(&memory, &caller, addr) {
                        tracing::debug!(message = %message, "Policy module output");
                    }
                },
            )
            .map_err(link_err)?;

        // Builtins are compiled into the module as calls to opa_builtinN; none are provided.
        linker
            .func_wrap("env", "opa_builtin0", |id: i32, _ctx: i32| -> wasmtime::Result<i32> {
                Err(unsupported_builtin(id))
            })
            .map_err(link_err)?;
        linker
            .func_wrap(
                "env",
                "opa_builtin1",
                |id: i32, _ctx: i32, _a: i32| -> wasmtime::Result<i32> { Err(unsupported_builtin(id)) },
            )
            .map_err(link_err)?;
        linker
            .func_wrap(
                "env",
                "opa_builtin2",
                |id: i32, _ctx: i32, _a: i32, _b: i32| -> wasmtime::Result<i32> {
                    Err(unsupported_builtin(id))
                },
            )
            .map_err(link_err)?;
        linker
            .func_wrap(
                "env",
                "opa_builtin3",
                |id: i32, _ctx: i32, _a: i32, _b: i32, _c: i32| -> wasmtime::Result<i32> {
                    Err(unsupported_builtin(id))
                },
            )
            .map_err(link_err)?;
        linker
            .func_wrap(
                "env",
                "opa_builtin4",
                |id: i32, _ctx: i32, _a: i32, _b: i32, _c: i32, _d: i32| -> wasmtime::Result<i32> {
                    Err(unsupported_builtin(id))
                },
            )
            .map_err(link_err)?;

        Ok(linker)
    }

    /// Engine statistics.
    pub fn stats(&self) -> WasmEngineStats {
        let loaded_digest = match self.loaded.lock() {
            Ok(guard) => guard.as_ref().map(|m| m.digest.clone()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|m| m.digest.clone()),
        };
        WasmEngineStats {
            module_loads: self.loads.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            loaded_digest,
            memory_limit_mb: self.config.memory_limit_mb,
            fuel_limit: self.config.fuel_limit,
        }
    }
}

fn unsupported_builtin(id: i32) -> wasmtime::Error {
    wasmtime::Error::msg(format!("unsupported builtin {id}"))
}

/// Statistics about the embedded engine.
#[derive(Debug, Clone)]
pub struct WasmEngineStats {
    /// Number of modules compiled and instantiated.
    pub module_loads: u64,
    pub evaluations: u64,
    /// SHA-256 digest of the currently loaded module.
    pub loaded_digest: Option<String>,
    pub memory_limit_mb: usize,
    pub fuel_limit: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================
