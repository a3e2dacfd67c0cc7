//! WHATWG `btoa`/`atob`, implemented host-side.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use rquickjs::{Coerced, Ctx, Exception, Function};

use crate::utils::{latin1_to_string, string_to_latin1};

#[rquickjs::function]
fn btoa(ctx: Ctx<'_>, input: Coerced<String>) -> rquickjs::Result<String> {
    let Some(bytes) = string_to_latin1(&input.0) else {
        return Err(Exception::throw_message(
            &ctx,
            "'btoa' failed: The string to be encoded contains characters outside of the Latin1 range.",
        ));
    };
    Ok(STANDARD.encode(bytes))
}

#[rquickjs::function]
fn atob(ctx: Ctx<'_>, input: Coerced<String>) -> rquickjs::Result<String> {
    let trimmed = input.0.trim_end_matches('=');
    if trimmed.len() % 4 == 1 {
        return Err(Exception::throw_message(
            &ctx,
            "'atob' failed: The string to be decoded is not correctly encoded.",
        ));
    }
    match STANDARD_NO_PAD.decode(trimmed) {
        Ok(bytes) => Ok(latin1_to_string(&bytes)),
        Err(_) => Err(Exception::throw_message(
            &ctx,
            "'atob' failed: The string to be decoded is not correctly encoded.",
        )),
    }
}

pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("btoa", Function::new(ctx.clone(), btoa)?.with_name("btoa")?)?;
    globals.set("atob", Function::new(ctx.clone(), atob)?.with_name("atob")?)?;
    Ok(())
}
