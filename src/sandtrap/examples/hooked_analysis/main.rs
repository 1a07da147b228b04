//! Analysis session with custom hooks and structured logging.
//!
//! Shows the three hook variants working together: a copied fingerprint
//! surface, a host callable that decodes base64 the way a page would
//! expect `atob` to, and an alias, plus a query pass over the report.
//!
//! ```bash
//! RUST_LOG=sandtrap=debug cargo run --example hooked_analysis
//! ```

use sandtrap::{Query, Reference, SandboxBuilder, Value};
use tracing_subscriber::EnvFilter;

const PAYLOAD: &str = r#"
// A typical fingerprint-then-exfiltrate flow.
const ua = navigator.userAgent;
const lang = navigator.language;
const token = atob("c2VjcmV0LXRva2Vu");
if (top === window) {
    navigator.sendBeacon("/collect", JSON.stringify({ ua, lang, token }));
}
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut sandbox = SandboxBuilder::new().build()?;

    sandbox.hook("navigator.userAgent", "Mozilla/5.0 (X11; Linux x86_64)")?;
    sandbox.hook("navigator.language", "en-US")?;
    sandbox.hook("top", Reference::new("globalThis"))?;
    sandbox.hook_fn("atob", |data: String| {
        String::from_utf8_lossy(&base64_decode(&data)).into_owned()
    })?;

    sandbox.run_source("index.js", PAYLOAD).await?;

    let report = sandbox.report();
    println!("payload touched {} API points", report.size());

    // What did it try to send, and where?
    for event in report.find_all(&Query::new().path("navigator.sendBeacon")) {
        if let Some(args) = event.arguments() {
            println!("beacon to {:?} with {:?}", args.first(), args.get(1));
        }
    }

    // Did the decoded token flow anywhere observable?
    let leaked = report.has(&Query::new().argument(Value::literal("secret-token")));
    println!("decoded token observed in a call: {leaked}");
    Ok(())
}

/// Minimal base64 decoder so the example stays dependency-free.
fn base64_decode(data: &str) -> Vec<u8> {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = Vec::new();
    let mut buffer = 0u32;
    let mut bits = 0u8;
    for byte in data.bytes() {
        if byte == b'=' {
            break;
        }
        let Some(value) = ALPHABET.iter().position(|&c| c == byte) else {
            continue;
        };
        buffer = (buffer << 6) | value as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    out
}
