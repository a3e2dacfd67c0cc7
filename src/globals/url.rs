//! Minimal `URL` / `URLSearchParams` shim.
//!
//! Deliberately not WHATWG-complete: enough surface for handlers to read
//! the request path and query, and for `toString()` to reserialize edits
//! made through `searchParams`.

use rquickjs::Ctx;

const URL_SHIM: &str = r#"
(() => {
  class URLSearchParams {
    constructor(init) {
      this.params = {};
      if (typeof init === "string") {
        if (init) {
          for (const pair of init.split("&")) {
            const eq = pair.indexOf("=");
            if (eq >= 0) {
              const key = decodeURIComponent(pair.substring(0, eq));
              const value = decodeURIComponent(pair.substring(eq + 1));
              this.params[key] = value;
            } else if (pair) {
              this.params[decodeURIComponent(pair)] = "";
            }
          }
        }
      } else if (init) {
        for (const [k, v] of Object.entries(init)) this.params[k] = v;
      }
    }
    get(name) { return this.params[name] || null; }
    set(name, value) { this.params[name] = value; }
    has(name) { return name in this.params; }
    delete(name) { delete this.params[name]; }
    forEach(callback) { Object.entries(this.params).forEach(([k, v]) => callback(v, k)); }
    entries() { return Object.entries(this.params); }
    keys() { return Object.keys(this.params); }
    values() { return Object.values(this.params); }
  }

  class URL {
    constructor(url, base) {
      let fullUrl = url;
      if (base) {
        if (typeof base === "string") {
          const baseUrl = new URL(base);
          if (url.startsWith("/")) {
            fullUrl = baseUrl.origin + url;
          } else {
            fullUrl = baseUrl.href.replace(/\/[^/]*$/, "/") + url;
          }
        } else {
          fullUrl = base.href + url;
        }
      }
      this.href = fullUrl;
      const match = fullUrl.match(/^(https?:\/\/[^\/]+)?([^?#]*)(\?[^#]*)?(#.*)?$/);
      this.origin = match && match[1] ? match[1] : "";
      this.pathname = match && match[2] ? match[2] : "/";
      const search = match && match[3] ? match[3] : "";
      this.search = search;
      this.hash = match && match[4] ? match[4] : "";
      this.searchParams = new URLSearchParams(search.substring(1));
    }
    toString() {
      const pairs = [];
      for (const [k, v] of Object.entries(this.searchParams.params)) {
        pairs.push(encodeURIComponent(k) + (v ? "=" + encodeURIComponent(v) : ""));
      }
      this.search = pairs.length > 0 ? "?" + pairs.join("&") : "";
      this.href = this.origin + this.pathname + this.search + this.hash;
      return this.href;
    }
  }

  globalThis.URL = URL;
  globalThis.URLSearchParams = URLSearchParams;
})();
"#;

pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.eval::<(), _>(URL_SHIM)
}
