//! `linguist` — transforms CIF data among CIF formats and dialects.
//!
//! Exit status: 0 when the input was parsed and transformed without error;
//! 1 when recoverable parse errors were met but the whole input was consumed
//! and output produced; 2 when no parse was attempted (usage or I/O setup
//! failure); 3 when the parse or transformation was aborted early.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cif_emit::{EmitOptions, Emitter, OutFormat};
use cif_parse::{Format, ParseOptions};
use cif_store::Cif;
use cif_walk::CifHandler;

mod config;

const EXIT_OK: i32 = 0;
const EXIT_RECOVERED: i32 = 1;
const EXIT_NO_PARSE: i32 = 2;
const EXIT_ABORTED: i32 = 3;

/// Boolean option arguments accept 1/yes/true and 0/no/false.
fn parse_switch(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "yes" | "true" => Ok(true),
        "0" | "no" | "false" => Ok(false),
        other => Err(format!("expected 1|yes|true or 0|no|false, got `{other}`")),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "linguist",
    version,
    about = "Transforms CIF data among CIF formats and dialects",
    after_help = "If no input file is given, or it is `-`, input is read from standard input; \
likewise output goes to standard output."
)]
struct Args {
    /// Input format: auto, cif10, cif11, or cif20. `auto` trusts the
    /// `#\#CIF_` magic comment and otherwise assumes CIF 1.1.
    #[arg(short = 'f', long = "input-format", value_name = "FORMAT")]
    input_format: Option<String>,

    /// Input character encoding: auto or a UTF-8 alias.
    #[arg(short = 'e', long = "input-encoding", value_name = "ENCODING")]
    input_encoding: Option<String>,

    /// Recognize and decode the line-folding protocol in input text fields.
    #[arg(
        short = 'l',
        long = "input-line-folding",
        value_name = "1|0",
        num_args = 0..=1,
        default_missing_value = "1",
        value_parser = parse_switch
    )]
    input_line_folding: Option<bool>,

    /// Recognize and decode the text-prefixing protocol in input text fields.
    #[arg(
        short = 'p',
        long = "input-text-prefixing",
        value_name = "1|0",
        num_args = 0..=1,
        default_missing_value = "1",
        value_parser = parse_switch
    )]
    input_text_prefixing: Option<bool>,

    /// Output format: cif11 or cif20.
    #[arg(short = 'F', long = "output-format", value_name = "FORMAT")]
    output_format: Option<String>,

    /// Output character encoding: auto or a UTF-8 alias.
    #[arg(short = 'E', long = "output-encoding", value_name = "ENCODING")]
    output_encoding: Option<String>,

    /// Allow line folding of output text fields (chosen field by field).
    #[arg(
        short = 'L',
        long = "output-line-folding",
        value_name = "1|0",
        num_args = 0..=1,
        default_missing_value = "1",
        value_parser = parse_switch
    )]
    output_line_folding: Option<bool>,

    /// Allow text prefixing of output text fields (chosen field by field).
    #[arg(
        short = 'P',
        long = "output-text-prefixing",
        value_name = "1|0",
        num_args = 0..=1,
        default_missing_value = "1",
        value_parser = parse_switch
    )]
    output_text_prefixing: Option<bool>,

    /// Suppress diagnostic messages; the exit status still reflects errors.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Insist on strict conformance: terminate on the first parse error.
    #[arg(short = 's', long = "strict")]
    strict: bool,

    /// Input file (`-` for standard input).
    input: Option<String>,

    /// Output file (`-` for standard output).
    output: Option<String>,
}

fn input_format(name: &str) -> Option<Format> {
    match name {
        "auto" => Some(Format::Auto),
        "cif10" | "cif1.0" => Some(Format::Cif10),
        "cif11" | "cif1.1" => Some(Format::Cif11),
        "cif20" | "cif2.0" => Some(Format::Cif20),
        _ => None,
    }
}

fn output_format(name: &str) -> Option<OutFormat> {
    match name {
        "cif11" | "cif1.1" => Some(OutFormat::Cif11),
        "cif20" | "cif2.0" => Some(OutFormat::Cif20),
        _ => None,
    }
}

/// Encoding conversion is out of scope: the pipeline reads and writes UTF-8.
fn encoding_supported(name: &str) -> bool {
    matches!(name.to_lowercase().as_str(), "auto" | "utf-8" | "utf8")
}

fn usage_error(message: &str) -> i32 {
    eprintln!("linguist: {message}");
    EXIT_NO_PARSE
}

fn read_input(spec: Option<&str>) -> anyhow::Result<String> {
    match spec {
        None | Some("-") => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("standard input")?;
            Ok(text)
        }
        Some(path) => std::fs::read_to_string(path).with_context(|| path.to_string()),
    }
}

fn open_output(spec: Option<&str>) -> anyhow::Result<Box<dyn Write>> {
    match spec {
        None | Some("-") => Ok(Box::new(BufWriter::new(io::stdout()))),
        Some(path) => {
            let file = File::create(path).with_context(|| path.to_string())?;
            Ok(Box::new(BufWriter::new(file)))
        }
    }
}

fn run() -> i32 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();

    let args = Args::parse();
    let cfg = config::load_from(None);

    let Some(in_format) = input_format(args.input_format.as_deref().unwrap_or("auto")) else {
        return usage_error("unrecognized input format (expected auto, cif10, cif11, or cif20)");
    };
    let out_format_name = args
        .output_format
        .as_deref()
        .map(str::to_string)
        .or(cfg.output.format.clone())
        .unwrap_or_else(|| "cif20".to_string());
    let Some(out_format) = output_format(&out_format_name) else {
        return usage_error("unrecognized output format (expected cif11 or cif20)");
    };
    for encoding in [&args.input_encoding, &args.output_encoding].into_iter().flatten() {
        if !encoding_supported(encoding) {
            return usage_error("only `auto` and UTF-8 encodings are supported");
        }
    }

    let mut parse_opts = ParseOptions::for_format(in_format);
    parse_opts.decode_folding = args.input_line_folding.unwrap_or(true);
    parse_opts.decode_prefixing = args.input_text_prefixing.unwrap_or(true);

    let emit_opts = EmitOptions {
        format: out_format,
        allow_folding: args
            .output_line_folding
            .or(cfg.output.line_folding)
            .unwrap_or(true),
        allow_prefixing: args
            .output_text_prefixing
            .or(cfg.output.text_prefixing)
            .unwrap_or(true),
        quiet: args.quiet || cfg.diagnostics.quiet.unwrap_or(false),
        halt_on_error: args.strict,
        extra_ws: parse_opts.extra_ws.clone(),
        extra_eol: parse_opts.extra_eol.clone(),
    };

    let input = match read_input(args.input.as_deref()) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("linguist: cannot read input: {e:#}");
            return EXIT_NO_PARSE;
        }
    };
    let output = match open_output(args.output.as_deref()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("linguist: cannot open output: {e:#}");
            return EXIT_NO_PARSE;
        }
    };
    let cif = match Cif::create() {
        Ok(cif) => cif,
        Err(e) => {
            eprintln!("linguist: cannot initialize the working store: {e}");
            return EXIT_NO_PARSE;
        }
    };

    info!(
        target: "linguist",
        input_format = ?in_format,
        output_format = out_format.name(),
        strict = args.strict,
        bytes = input.len(),
        "transforming"
    );

    let mut emitter = Emitter::new(output, emit_opts);
    match cif_parse::parse_into(&cif, &input, &parse_opts, &mut emitter) {
        Ok(()) => {
            if emitter.error_count() > 0 {
                EXIT_RECOVERED
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            // close the document as far as possible before reporting
            let _ = emitter.cif_end(&cif);
            if !args.quiet {
                eprintln!("linguist: {e}");
            }
            EXIT_ABORTED
        }
    }
}

fn main() {
    std::process::exit(run());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_synonyms() {
        for yes in ["1", "yes", "true", "YES", "True"] {
            assert_eq!(parse_switch(yes), Ok(true), "{yes}");
        }
        for no in ["0", "no", "false", "NO", "False"] {
            assert_eq!(parse_switch(no), Ok(false), "{no}");
        }
        assert!(parse_switch("maybe").is_err());
        assert!(parse_switch("").is_err());
    }

    #[test]
    fn format_names() {
        assert_eq!(input_format("auto"), Some(Format::Auto));
        assert_eq!(input_format("cif10"), Some(Format::Cif10));
        assert_eq!(input_format("cif1.1"), Some(Format::Cif11));
        assert_eq!(input_format("star20"), None);
        assert_eq!(output_format("cif11"), Some(OutFormat::Cif11));
        assert_eq!(output_format("cif2.0"), Some(OutFormat::Cif20));
        assert_eq!(output_format("auto"), None);
    }

    #[test]
    fn encodings() {
        assert!(encoding_supported("auto"));
        assert!(encoding_supported("UTF-8"));
        assert!(encoding_supported("utf8"));
        assert!(!encoding_supported("latin-1"));
    }

    #[test]
    fn cli_shape_parses() {
        let args = Args::try_parse_from([
            "linguist",
            "-f",
            "cif11",
            "-F",
            "cif20",
            "--input-line-folding=0",
            "--output-text-prefixing=no",
            "-q",
            "-s",
            "--",
            "in.cif",
            "out.cif",
        ])
        .unwrap();
        assert_eq!(args.input_format.as_deref(), Some("cif11"));
        assert_eq!(args.input_line_folding, Some(false));
        assert_eq!(args.output_text_prefixing, Some(false));
        assert!(args.quiet && args.strict);
        assert_eq!(args.input.as_deref(), Some("in.cif"));
        assert_eq!(args.output.as_deref(), Some("out.cif"));
    }

    #[test]
    fn optional_switch_argument_defaults_to_on() {
        let args = Args::try_parse_from(["linguist", "--output-line-folding"]).unwrap();
        assert_eq!(args.output_line_folding, Some(true));
    }
}
