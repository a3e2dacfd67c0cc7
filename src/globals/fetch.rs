//! `Headers`, `Request` and `Response` shims.
//!
//! Headers are a case-insensitive single-valued map; keys are lowercased
//! on insert. `Request` keeps its body as the string the dispatcher
//! decoded, readable through `body` or the async `text()`/`json()`
//! accessors. `Response` carries the fields the dispatcher extracts
//! after the handler returns.

use rquickjs::Ctx;

const FETCH_SHIM: &str = r#"
(() => {
  class Headers {
    constructor(init) {
      this._headers = {};
      if (init && typeof init === "object" && !Array.isArray(init)) {
        for (const [k, v] of Object.entries(init)) {
          this._headers[k.toLowerCase()] = String(v);
        }
      }
    }
    get(name) { return this._headers[name.toLowerCase()] || null; }
    set(name, value) { this._headers[name.toLowerCase()] = String(value); }
    has(name) { return name.toLowerCase() in this._headers; }
    delete(name) { delete this._headers[name.toLowerCase()]; }
    forEach(callback) { Object.entries(this._headers).forEach(([k, v]) => callback(v, k)); }
    get headers() { return this._headers; }
  }

  class Response {
    constructor(body, init) {
      this.body = body || null;
      this.status = (init && init.status) || 200;
      this.statusText = (init && init.statusText) || "OK";
      this.headers = new Headers(init && init.headers);
      this.ok = this.status >= 200 && this.status < 300;
    }
    static json(data) {
      return new Response(JSON.stringify(data), {
        headers: { "Content-Type": "application/json" },
      });
    }
    static text(text) {
      return new Response(String(text), {
        headers: { "Content-Type": "text/plain" },
      });
    }
  }

  class Request {
    constructor(input, init) {
      if (typeof input === "string") {
        this.url = input;
      } else if (input && input.url) {
        this.url = input.url;
        this.method = input.method || "GET";
        this.headers = input.headers || new Headers();
        this.body = input.body || null;
      } else {
        this.url = "/";
      }
      if (init) {
        this.method = init.method || this.method || "GET";
        this.headers = new Headers(init.headers || this.headers);
        this.body = init.body || this.body || null;
      } else {
        this.method = this.method || "GET";
        this.headers = this.headers || new Headers();
        this.body = this.body || null;
      }
    }
    async text() { return this.body === null ? "" : String(this.body); }
    async json() { return JSON.parse(await this.text()); }
  }

  globalThis.Headers = Headers;
  globalThis.Response = Response;
  globalThis.Request = Request;
})();
"#;

pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.eval::<(), _>(FETCH_SHIM)
}
