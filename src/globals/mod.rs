//! Guest-visible Web APIs, installed before the bundle runs.
//!
//! The shims give user code a plausible subset of the Fetch API while
//! keeping the host↔guest contract limited to strings, integers and
//! plain objects. A failed shim install is a stderr diagnostic, not a
//! startup failure.

use rquickjs::{CatchResultExt as _, Ctx};
use tracing::warn;

use crate::wire::Emitter;

mod base64;
mod console;
mod fetch;
mod url;

pub fn setup(ctx: &Ctx<'_>, emitter: &Emitter) {
    install(ctx, "base64", base64::setup(ctx));
    install(ctx, "URL", url::setup(ctx));
    install(ctx, "fetch types", fetch::setup(ctx));
    install(ctx, "console", console::setup(ctx, emitter));
}

fn install(ctx: &Ctx<'_>, what: &str, result: rquickjs::Result<()>) {
    if let Err(err) = result.catch(ctx) {
        warn!("failed to install {what} shim: {err}");
    }
}
