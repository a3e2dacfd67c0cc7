//! Embedding core of the per-function JavaScript worker.
//!
//! [`WorkerRuntime`] owns a QuickJS runtime and a single context for the
//! whole process lifetime. It loads exactly one user bundle, retains its
//! handler function, and runs one invocation at a time: build a guest
//! `Request`, call the handler, drive the job queue until the result
//! settles, and read back status, headers and body. Everything the guest
//! can see is installed by [`globals`] before the bundle executes.

use std::fs;
use std::path::Path;

use anyhow::{Context as _, anyhow, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rquickjs::function::{Constructor, This};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::promise::MaybePromise;
use rquickjs::{
    CatchResultExt as _, CaughtError, Coerced, Context, Ctx, Function, Module, Object, Persistent,
    Runtime, Value,
};
use serde_json::{Map, Value as JsonValue};
use tracing::instrument;

pub mod config;
pub mod dispatch;
mod globals;
pub mod limits;
mod utils;
pub mod wire;

use crate::config::Capabilities;
use crate::utils::{latin1_to_string, string_to_latin1};
use crate::wire::{Emitter, ErrorCode, InvokePayload, ResponsePayload};

/// Largest bundle the loader accepts.
pub const MAX_BUNDLE_SIZE: u64 = 10 * 1024 * 1024;

/// An invocation failure that the worker reports on the wire and then
/// survives: the engine and handler stay live for the next `invoke`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeError {
    pub code: ErrorCode,
    pub message: String,
}

impl InvokeError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The engine host: one runtime, one context, and at most one retained
/// handler, exclusively owned for the process lifetime.
pub struct WorkerRuntime {
    context: Context,
    handler: Option<Persistent<Function<'static>>>,
}

impl WorkerRuntime {
    /// Creates the runtime, installs the guest-visible globals, and
    /// applies the `allow_eval` capability. The ordering is a contract:
    /// shims are installed first, then dynamic code construction is
    /// removed, and only afterwards may a bundle execute.
    #[instrument(skip_all, level = "info")]
    pub fn new(caps: &Capabilities, emitter: &Emitter) -> anyhow::Result<Self> {
        let runtime = Runtime::new().context("initializing the JavaScript runtime")?;
        if caps.max_memory_bytes > 0 {
            runtime.set_memory_limit(usize::try_from(caps.max_memory_bytes).unwrap_or(usize::MAX));
        }
        // The bundle is single-file by contract; anything it tries to
        // import is rejected at module resolution.
        runtime.set_loader(RejectImports, RejectImports);

        let context = Context::full(&runtime).context("creating the JavaScript context")?;

        context.with(|ctx| -> anyhow::Result<()> {
            globals::setup(&ctx, emitter);
            if !caps.allow_eval {
                disable_dynamic_eval(&ctx)
                    .catch_text(&ctx)
                    .map_err(|message| anyhow!("disabling eval: {message}"))?;
            }
            Ok(())
        })?;

        Ok(Self {
            context,
            handler: None,
        })
    }

    /// Compiles, links and executes the bundle, then retains its handler:
    /// a callable `default` export, or failing that a callable named
    /// `handler` export. Top-level `await` is honoured before the exports
    /// are inspected.
    #[instrument(skip_all, level = "info")]
    pub fn load_bundle(&mut self, path: &Path) -> anyhow::Result<()> {
        let metadata =
            fs::metadata(path).with_context(|| format!("reading bundle {}", path.display()))?;
        ensure!(
            metadata.len() <= MAX_BUNDLE_SIZE,
            "bundle is {} bytes, larger than the {MAX_BUNDLE_SIZE} byte limit",
            metadata.len(),
        );
        let source =
            fs::read(path).with_context(|| format!("reading bundle {}", path.display()))?;
        let name = path.display().to_string();

        let handler = self.context.with(|ctx| -> anyhow::Result<_> {
            let declared = Module::declare(ctx.clone(), name.as_str(), source)
                .catch_text(&ctx)
                .map_err(|message| anyhow!("compiling bundle: {message}"))?;

            let (module, pending) = declared
                .eval()
                .catch_text(&ctx)
                .map_err(|message| anyhow!("evaluating bundle: {message}"))?;

            // Drive the job queue until module evaluation settles so that
            // top-level await has run before exports are read.
            pending
                .finish::<()>()
                .catch_text(&ctx)
                .map_err(|message| anyhow!("evaluating bundle: {message}"))?;

            let handler = module
                .get::<_, Value>("default")
                .ok()
                .and_then(Value::into_function)
                .or_else(|| {
                    module
                        .get::<_, Value>("handler")
                        .ok()
                        .and_then(Value::into_function)
                });
            let Some(handler) = handler else {
                bail!(
                    "No handler function found (expected a callable default export \
                     or a named `handler` export)"
                );
            };

            Ok(Persistent::save(&ctx, handler))
        })?;

        self.handler = Some(handler);
        Ok(())
    }

    /// Runs one invocation to completion and returns the extracted
    /// response. The handler's promise is driven until it settles, so an
    /// async handler behaves exactly like a synchronous one.
    pub fn invoke(&mut self, invocation: &InvokePayload) -> Result<ResponsePayload, InvokeError> {
        let Some(handler) = self.handler.clone() else {
            return Err(InvokeError::new(
                ErrorCode::HandlerNotLoaded,
                "Handler not loaded",
            ));
        };

        self.context.with(|ctx| {
            // Collect invocation garbage on every exit path so steady-state
            // memory stays bounded across invocations.
            let _gc = RunGcGuard::new(&ctx);

            let request = build_request(&ctx, invocation)
                .catch_text(&ctx)
                .map_err(|message| InvokeError::new(ErrorCode::RequestCreationError, message))?;

            let func = handler
                .restore(&ctx)
                .catch_text(&ctx)
                .map_err(|message| InvokeError::new(ErrorCode::UnknownError, message))?;

            let pending: MaybePromise = func
                .call((request,))
                .catch_text(&ctx)
                .map_err(|message| InvokeError::new(ErrorCode::HandlerError, message))?;

            let settled: Value = pending
                .finish()
                .catch_text(&ctx)
                .map_err(|message| InvokeError::new(ErrorCode::HandlerError, message))?;

            Ok(extract_response(&ctx, settled))
        })
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        // The Persistent must be released before the context; QuickJS
        // aborts on runtime teardown if guest references are still live.
        self.handler = None;
    }
}

fn disable_dynamic_eval(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.remove("eval")?;
    globals.remove("Function")?;
    Ok(())
}

/// Builds the guest `Request` for an invocation by calling the shim
/// constructors directly: a `URL` against base `http://localhost` with
/// the query applied through `searchParams`, then `Request` with method,
/// headers and the decoded body.
fn build_request<'js>(
    ctx: &Ctx<'js>,
    invocation: &InvokePayload,
) -> rquickjs::Result<Value<'js>> {
    let globals = ctx.globals();

    let url_ctor: Constructor = globals.get("URL")?;
    let url: Object = url_ctor.construct((invocation.path.as_str(), "http://localhost"))?;

    let params: Object = url.get("searchParams")?;
    let set: Function = params.get("set")?;
    for (key, value) in &invocation.query {
        let value = match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        set.call::<_, ()>((This(params.clone()), key.as_str(), value))?;
    }

    let to_string: Function = url.get("toString")?;
    let href: String = to_string.call((This(url),))?;

    let headers: Value = ctx.json_parse(
        serde_json::to_string(&invocation.headers).unwrap_or_else(|_| "{}".into()),
    )?;

    let init = Object::new(ctx.clone())?;
    init.set("method", invocation.method.as_str())?;
    init.set("headers", headers)?;
    if invocation.body.is_empty() {
        init.set("body", Value::new_null(ctx.clone()))?;
    } else {
        let bytes = STANDARD.decode(invocation.body.as_bytes()).map_err(|err| {
            rquickjs::Exception::throw_message(
                ctx,
                &format!("request body is not valid base64: {err}"),
            )
        })?;
        init.set("body", latin1_to_string(&bytes))?;
    }

    let request_ctor: Constructor = globals.get("Request")?;
    request_ctor.construct((href, init))
}

/// Reads `status`, `headers` and `body` off whatever the handler
/// resolved to. Anything missing falls back to an empty 200; a non-string
/// body is treated as absent.
fn extract_response<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> ResponsePayload {
    let Some(response) = value.as_object() else {
        return ResponsePayload {
            status: 200,
            headers: Map::new(),
            body: String::new(),
        };
    };

    let status = response
        .get::<_, Option<Coerced<i32>>>("status")
        .ok()
        .flatten()
        .map_or(200, |status| status.0);

    let headers = response
        .get::<_, Value>("headers")
        .ok()
        .filter(|v| !v.is_undefined() && !v.is_null())
        .map(|v| headers_map(ctx, &v))
        .unwrap_or_default();

    let body = response
        .get::<_, Value>("body")
        .ok()
        .and_then(Value::into_string)
        .and_then(|s| s.to_string().ok())
        .map(|body| encode_body(&body))
        .unwrap_or_default();

    ResponsePayload {
        status,
        headers,
        body,
    }
}

/// Serializes a response's headers to a JSON map, preferring the shim's
/// case-normalized `_headers` map, then a `headers` field, then the
/// value itself.
fn headers_map<'js>(ctx: &Ctx<'js>, headers: &Value<'js>) -> Map<String, JsonValue> {
    let picked = headers
        .as_object()
        .and_then(|obj| {
            obj.get::<_, Value>("_headers")
                .ok()
                .filter(|v| !v.is_undefined())
                .or_else(|| {
                    obj.get::<_, Value>("headers")
                        .ok()
                        .filter(|v| !v.is_undefined())
                })
        })
        .unwrap_or_else(|| headers.clone());

    ctx.json_stringify(picked)
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Base64 for outgoing bodies. A body whose code points all fit in a
/// byte is encoded byte-per-code-point so binary payloads round-trip;
/// anything wider falls back to UTF-8 bytes.
fn encode_body(body: &str) -> String {
    let bytes = string_to_latin1(body).unwrap_or_else(|| body.as_bytes().to_vec());
    STANDARD.encode(bytes)
}

// Resolver/loader pair for a world without imports.
#[derive(Clone, Copy)]
struct RejectImports;

impl Resolver for RejectImports {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        Err(rquickjs::Error::new_resolving(base, name))
    }
}

impl Loader for RejectImports {
    fn load<'js>(&mut self, _ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        Err(rquickjs::Error::new_loading(name))
    }
}

// RAII guard that runs a GC cycle when dropped.
struct RunGcGuard<'js> {
    ctx: Ctx<'js>,
}

impl<'js> RunGcGuard<'js> {
    fn new(ctx: &Ctx<'js>) -> Self {
        Self { ctx: ctx.clone() }
    }
}

impl Drop for RunGcGuard<'_> {
    fn drop(&mut self) {
        self.ctx.run_gc();
    }
}

trait CatchJsErrorExt {
    type Ok;
    /// Catches a thrown guest exception and renders it as the text the
    /// wire and stderr diagnostics carry.
    fn catch_text(self, ctx: &Ctx<'_>) -> Result<Self::Ok, String>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;

    fn catch_text(self, ctx: &Ctx<'_>) -> Result<T, String> {
        self.catch(ctx).map_err(|caught| match caught {
            CaughtError::Error(rquickjs::Error::WouldBlock) => {
                "promise never settled before the job queue drained".to_string()
            }
            caught => caught.to_string(),
        })
    }
}
