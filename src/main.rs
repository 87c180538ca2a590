#![forbid(unsafe_code)]

//! CLI binary: evaluate JavaScript snippets and files on one runtime.
//!
//! ```text
//! jsbridge --eval '1 + 2' --eval 'Promise.resolve([1, {a: true}])'
//! jsbridge --config options.json5 --drain script.js
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::executor::block_on;
use jsbridge::{EngineKind, RuntimeOptions, ScriptRuntime, WallClock};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jsbridge")]
#[command(about = "Evaluate JavaScript and print the converted results as JSON")]
struct Args {
    /// Script source to evaluate (repeatable, runs before files).
    #[arg(long = "eval", short = 'e')]
    snippets: Vec<String>,

    /// Script files to evaluate in order.
    files: Vec<PathBuf>,

    /// Use the alternate engine on Android (also `JSBRIDGE_ALTERNATE_ENGINE`).
    #[arg(long, default_value_t = false)]
    alternate_engine: bool,

    /// Force a specific engine instead of the platform default.
    #[arg(long, value_parser = parse_engine)]
    engine: Option<EngineKind>,

    /// Runtime options as JSON or JSON5.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run ready timers and channel completions after each evaluation.
    #[arg(long, default_value_t = false)]
    drain: bool,

    /// Enable engine inspection hooks where supported.
    #[arg(long, default_value_t = false)]
    inspect: bool,

    /// Keep going after a script error.
    #[arg(long, default_value_t = false)]
    keep_going: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<jsbridge::ScriptValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drained: Option<usize>,
}

fn parse_engine(raw: &str) -> Result<EngineKind, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "quickjs" => Ok(EngineKind::QuickJs),
        "boa" => Ok(EngineKind::Boa),
        "browser" => Ok(EngineKind::Browser),
        other => Err(format!("unknown engine `{other}` (expected quickjs, boa or browser)")),
    }
}

fn load_options(args: &Args) -> Result<RuntimeOptions> {
    let options = match &args.config {
        Some(path) => RuntimeOptions::load(path)
            .with_context(|| format!("loading runtime options from {}", path.display()))?,
        None => RuntimeOptions::default(),
    };
    let options = options.with_env_overrides();
    Ok(if args.alternate_engine {
        options.with_alternate_engine(true)
    } else {
        options
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = load_options(&args)?;

    let mut runtime = match args.engine {
        Some(kind) => ScriptRuntime::with_engine_kind(options, kind, Arc::new(WallClock)),
        None => ScriptRuntime::new(options),
    }
    .context("creating script runtime")?;
    runtime.set_inspectable(args.inspect);
    eprintln!(
        "jsbridge: {} engine ({})",
        runtime.engine_kind(),
        runtime.instance_id()
    );

    let mut sources: Vec<(String, String)> = args
        .snippets
        .iter()
        .enumerate()
        .map(|(index, code)| (format!("<eval #{}>", index + 1), code.clone()))
        .collect();
    for path in &args.files {
        let code = fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        sources.push((path.display().to_string(), code));
    }

    let mut failures = 0usize;
    for (source, code) in sources {
        let mut report = Report {
            source,
            value: None,
            error: None,
            drained: None,
        };
        match block_on(runtime.evaluate(&code)) {
            Ok(value) => report.value = Some(value),
            Err(err) if err.is_script_error() => {
                failures += 1;
                report.error = Some(err.to_string());
            }
            Err(err) => return Err(err).context("evaluating script"),
        }
        if args.drain {
            report.drained = Some(runtime.drain_pending_jobs().context("draining pending jobs")?);
        }
        println!("{}", serde_json::to_string(&report).context("serializing result")?);
        if report.error.is_some() && !args.keep_going {
            break;
        }
    }

    runtime.dispose();
    if failures > 0 {
        anyhow::bail!("{failures} script(s) failed");
    }
    Ok(())
}
