//! Developer runner for data definitions.
//!
//! Loads a definition (raw or previously compiled), reads a local HTML or
//! JSON payload, runs the extraction, and prints one JSON record per line.
//! The exit code is the fatal slot of the combined status, so scripts can
//! distinguish "no data" from "broken definition".
//!
//! Examples:
//! ```not_rust
//! ❯ dtgrab --def listings.json page.html
//! {"name":"news","start":"2016-05-29T18:00:00+00:00"}
//! {"name":"film","start":"2016-05-29T20:30:00+00:00"}
//! ```
//!
//! Inspect the tree a payload parses into while authoring a definition:
//! ```not_rust
//! ❯ dtgrab --def listings.json --show-tree page.html
//! ```
//!
//! Persist a compiled definition for later runs:
//! ```not_rust
//! ❯ dtgrab --def listings.json --compiled-out listings.c.json page.html
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use stable_eyre::eyre::{Report, WrapErr};
use tracing::{error, warn};

use datatree::{DataDef, Extractor, Fatal, Status, Tree, TreeKind};

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Opts {
    /// Path to the data definition, raw or previously compiled.
    #[clap(long, short = 'd')]
    def: PathBuf,

    /// Path to the input payload (HTML or JSON document).
    input: PathBuf,

    /// Force the input format instead of trusting the definition.
    #[clap(long, value_parser = ["html", "json"])]
    format: Option<String>,

    /// Print the parsed tree instead of extracting.
    #[clap(long)]
    show_tree: bool,

    /// Override the current-date anchor (YYYY-MM-DD).
    #[clap(long)]
    current_date: Option<String>,

    /// Write the compiled definition to this path.
    #[clap(long)]
    compiled_out: Option<PathBuf>,

    /// Pretty-print records instead of one JSON object per line.
    #[clap(long)]
    pretty: bool,
}

/// Caller id under which this binary reports engine warnings.
const CALLER: u32 = 1;

fn main() -> Result<ExitCode, Report> {
    stable_eyre::install()?;
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let mut status = Status::default();

    let raw = fs::read_to_string(&opts.def)
        .wrap_err_with(|| format!("read definition {}", opts.def.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("parse definition {}", opts.def.display()))?;

    let warner = datatree::warn::Warner::new(CALLER);
    let (def, compile_flags) = match DataDef::compile(&parsed, &warner) {
        Ok(compiled) => compiled,
        Err(err) => {
            status.set_fatal(Fatal::InvalidDataDef);
            status.flag(err.soft());
            error!("definition does not compile: {err}");
            error!("status: {status} (bitmask {:#x})", status.check_errors());
            return Ok(exit_code(status));
        }
    };
    status.flag(compile_flags);

    if let Some(path) = &opts.compiled_out {
        let stamped = serde_json::to_string_pretty(&def).wrap_err("serialize compiled definition")?;
        fs::write(path, stamped)
            .wrap_err_with(|| format!("write compiled definition {}", path.display()))?;
    }

    let payload = fs::read_to_string(&opts.input)
        .wrap_err_with(|| format!("read input {}", opts.input.display()))?;

    let built = match input_format(&opts, &def, &payload) {
        TreeKind::Html => Tree::from_html(&payload, &def.html_options()),
        TreeKind::Json => Tree::from_json_str(&payload, &def.sorts),
    };
    let (tree, build_flags) = match built {
        Ok(built) => built,
        Err(err) => {
            status.set_fatal(match err {
                datatree::tree::BuildError::Empty => Fatal::Empty,
                datatree::tree::BuildError::Json(_) => Fatal::Json,
                _ => Fatal::InvalidDataSet,
            });
            error!("input does not build: {err}");
            return Ok(exit_code(status));
        }
    };
    status.flag(build_flags);

    if opts.show_tree {
        print!("{tree}");
        return Ok(exit_code(status));
    }

    let mut extractor = Extractor::new(&tree, &def).with_caller(CALLER);
    if let Some(date) = &opts.current_date {
        extractor = extractor.with_current_date(date);
    }
    extractor.merge_status(status);

    let records = extractor.extract();
    let status = extractor.status();

    for record in &records {
        let fields: serde_json::Map<String, serde_json::Value> = record
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        let json = serde_json::Value::Object(fields);
        if opts.pretty {
            println!("{}", serde_json::to_string_pretty(&json)?);
        } else {
            println!("{json}");
        }
    }

    if !status.is_ok() {
        warn!("status: {status} (bitmask {:#x})", status.check_errors());
    }
    Ok(exit_code(status))
}

/// The caller's `--format` wins; otherwise the tree type the definition was
/// written against; otherwise a sniff at the payload's first character.
fn input_format(opts: &Opts, def: &DataDef, payload: &str) -> TreeKind {
    match opts.format.as_deref() {
        Some("html") => TreeKind::Html,
        Some("json") => TreeKind::Json,
        _ => def.tree_kind.unwrap_or_else(|| {
            if payload.trim_start().starts_with(['{', '[']) {
                TreeKind::Json
            } else {
                TreeKind::Html
            }
        }),
    }
}

fn exit_code(status: Status) -> ExitCode {
    ExitCode::from(status.fatal() as u8)
}
