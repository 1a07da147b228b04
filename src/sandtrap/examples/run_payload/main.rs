//! Run a JavaScript payload and dump the recorded API surface.
//!
//! ```bash
//! cargo run --example run_payload -- path/to/payload.js
//! cargo run --example run_payload -- --module path/to/entry.js
//! cargo run --example run_payload -- --eval 'navigator.sendBeacon("/x", document.title)'
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use sandtrap::{Error, Event, ResolvedSource, SandboxBuilder, SourceResolver, SourceType};
use url::Url;

/// Serves `file://` URLs straight from disk, so module payloads can pull
/// their imports from the directory they live in.
struct FsResolver;

#[async_trait]
impl SourceResolver for FsResolver {
    async fn resolve(&self, url: &Url) -> anyhow::Result<Option<ResolvedSource>> {
        if url.scheme() != "file" {
            return Ok(None);
        }
        let Ok(path) = url.to_file_path() else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Execute untrusted JavaScript and print every recorded event")]
struct Args {
    /// Path to the payload. The file's directory becomes the origin so
    /// relative imports resolve next to it.
    #[arg(required_unless_present = "eval")]
    payload: Option<PathBuf>,

    /// Inline source instead of a file.
    #[arg(long)]
    eval: Option<String>,

    /// Compile the entry as an ES module instead of a script.
    #[arg(long)]
    module: bool,

    /// Soft timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Engine memory cap in MiB.
    #[arg(long, default_value_t = 64)]
    max_memory: usize,

    /// Print events as JSON instead of debug formatting.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let source_type = if args.module {
        SourceType::Module
    } else {
        SourceType::Script
    };

    let mut builder = SandboxBuilder::new()
        .with_source_type(source_type)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_max_memory(args.max_memory);

    let (specifier, source) = match (&args.payload, &args.eval) {
        (_, Some(inline)) => ("payload.js".to_string(), inline.clone()),
        (Some(path), None) => {
            let source = std::fs::read_to_string(path)?;
            // Anchor the origin next to the payload so relative imports
            // resolve against its directory.
            if let Some(parent) = path.canonicalize()?.parent() {
                if let Ok(origin) = url::Url::from_directory_path(parent) {
                    builder = builder.with_origin(origin.as_str());
                }
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "payload.js".to_string());
            (name, source)
        }
        (None, None) => unreachable!("clap requires a payload or --eval"),
    };

    let mut sandbox = builder.build()?;
    sandbox.set_resolver(FsResolver);

    let outcome = sandbox.run_source(&specifier, source).await;
    match outcome {
        Ok(()) => {}
        // Timeouts and guest throws still leave a useful report behind.
        Err(Error::Timeout(t)) => eprintln!("payload timed out after {t:?}"),
        Err(Error::Execution { message }) => eprintln!("payload threw: {message}"),
        Err(other) => return Err(other.into()),
    }

    let report = sandbox.report();
    eprintln!("{} events recorded", report.size());
    for event in report.get_all() {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }

    let stats = sandbox.stats();
    eprintln!(
        "runs={} events={} wall={:?} cpu={:?} heap={}B",
        stats.runs, stats.events, stats.wall_time, stats.cpu_time, stats.heap_used
    );
    Ok(())
}

fn print_event(event: &Event) {
    let location = event.location();
    match event {
        Event::GetEvent { path, value, .. } => {
            println!("get  {path} -> {value:?}  @ {}:{}", location.filename, location.line);
        }
        Event::SetEvent { path, value, .. } => {
            println!("set  {path} = {value:?}  @ {}:{}", location.filename, location.line);
        }
        Event::CallEvent {
            path,
            arguments,
            returns,
            is_constructor,
            ..
        } => {
            let kind = if *is_constructor { "new " } else { "call" };
            println!(
                "{kind} {path}({arguments:?}) -> {returns:?}  @ {}:{}",
                location.filename, location.line
            );
        }
    }
}
