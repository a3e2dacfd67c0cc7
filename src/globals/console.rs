//! Guest `console`, forwarded to the wire as `log` records.
//!
//! The shim stringifies its arguments guest-side and hands a single
//! `(level, message)` pair to a host hook; the hook tags the record with
//! the invocation currently on the guest stack.

use rquickjs::{Coerced, Ctx, Function};

use crate::wire::{Emitter, LogLevel};

const CONSOLE_SHIM: &str = r#"
(() => {
  const stringify = (args) => {
    if (!args || args.length === 0) return "";
    try {
      return Array.from(args).map((x) => {
        if (x === null) return "null";
        if (typeof x === "object") return JSON.stringify(x);
        return String(x);
      }).join(" ");
    } catch (e) {
      return String(args[0]);
    }
  };
  globalThis.console = {
    log(...args) { __worker_log("info", stringify(args)); },
    info(...args) { __worker_log("info", stringify(args)); },
    warn(...args) { __worker_log("warn", stringify(args)); },
    error(...args) { __worker_log("error", stringify(args)); },
    debug(...args) { __worker_log("debug", stringify(args)); },
  };
})();
"#;

pub fn setup(ctx: &Ctx<'_>, emitter: &Emitter) -> rquickjs::Result<()> {
    let emitter = emitter.clone();
    let hook = Function::new(
        ctx.clone(),
        move |level: Coerced<String>, message: Coerced<String>| {
            emitter.log(LogLevel::from_name(&level.0), &message.0);
        },
    )?
    .with_name("__worker_log")?;

    ctx.globals().set("__worker_log", hook)?;
    ctx.eval::<(), _>(CONSOLE_SHIM)
}
