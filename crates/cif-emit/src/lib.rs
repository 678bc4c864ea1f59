//! Whitespace-preserving CIF serialization.
//!
//! The crate supplies the emitter side of the transformation pipeline:
//!
//! - [`analyze`](analyze::analyze) — pure classification of a text value
//!   (viable delimiters, line metrics, folding triggers);
//! - [`WsQueue`](ws::WsQueue) — the run/piece queue of captured inter-token
//!   whitespace;
//! - [`Emitter`] — the serializing handler driven by the parser or the store
//!   walker, including the error interceptor.

pub mod analyze;
pub mod emitter;
pub mod ws;

pub use emitter::{EmitOptions, Emitter, MAX_LINE_LENGTH, OutFormat};

use cif_model::{CifError, Result};
use cif_parse::ParseOptions;
use cif_store::Cif;
use cif_walk::CifHandler;

/// Parse `input` and emit it in the selected output dialect. Returns the
/// transformed document and the number of recovered errors; an aborted parse
/// (strict mode, store failure) returns the error instead. Diagnostic
/// messages are discarded; drive [`Emitter`] directly to capture them.
pub fn transform(
    input: &str,
    parse_opts: &ParseOptions,
    emit_opts: EmitOptions,
) -> Result<(String, u32)> {
    let cif = Cif::create()?;
    let mut emitter =
        Emitter::new(Vec::new(), emit_opts).with_diagnostics(Box::new(std::io::sink()));
    match cif_parse::parse_into(&cif, input, parse_opts, &mut emitter) {
        Ok(()) => {}
        Err(e) => {
            // best-effort: flush trailing whitespace and close the document
            let _ = emitter.cif_end(&cif);
            return Err(e);
        }
    }
    let errors = emitter.error_count();
    let bytes = emitter.into_inner();
    let text = String::from_utf8(bytes)
        .map_err(|e| CifError::Internal(format!("emitted invalid UTF-8: {e}")))?;
    Ok((text, errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cif20(input: &str) -> (String, u32) {
        transform(input, &ParseOptions::default(), EmitOptions::default()).expect("transform")
    }

    fn cif11(input: &str) -> (String, u32) {
        let opts = EmitOptions {
            format: OutFormat::Cif11,
            ..EmitOptions::default()
        };
        transform(input, &ParseOptions::default(), opts).expect("transform")
    }

    #[test]
    fn scalar_document_round_trips_layout() {
        let input = "#\\#CIF_1.1\ndata_test\n_a 1\n_b 'two words'\n";
        let (out, errors) = cif20(input);
        assert_eq!(errors, 0);
        // the consumed version comment leaves a blank line behind the fresh
        // header; everything else reproduces the author's layout
        assert_eq!(out, "#\\#CIF_2.0\n\ndata_test\n_a 1\n_b 'two words'\n");
    }

    #[test]
    fn comments_survive_in_order() {
        let input = "# top\ndata_a # after code\n_x 1 # after value\n";
        let (out, errors) = cif20(input);
        assert_eq!(errors, 0);
        let top = out.find("# top").expect("top comment kept");
        let code = out.find("# after code").expect("code comment kept");
        let value = out.find("# after value").expect("value comment kept");
        assert!(top < code && code < value);
    }

    #[test]
    fn loops_preserve_their_layout() {
        let input = "data_a\nloop_\n _x\n _y\n 1 2\n 3 4\n";
        let (out, errors) = cif20(input);
        assert_eq!(errors, 0);
        assert!(out.contains("loop_\n _x\n _y\n 1 2\n 3 4\n"));
    }

    #[test]
    fn same_dialect_reemission_is_idempotent() {
        let inputs = [
            "data_a\n_x 1\n# trailing\n",
            "data_a\nloop_\n_p\n_q\n1 2\n3 4\ndata_b\n_z ?\n",
            "data_m\n_t\n;free\ntext\n;\n_u .\n",
        ];
        for input in inputs {
            let (once, e1) = cif11(input);
            let (twice, e2) = cif11(&once);
            assert_eq!(e1, 0, "{input:?}");
            assert_eq!(e2, 0, "{input:?}");
            let (thrice, _) = cif11(&twice);
            assert_eq!(twice, thrice, "emit(parse(x)) must be a fixed point");
        }
    }

    #[test]
    fn values_round_trip_exactly() {
        let cases = [
            ("_n", "1.234(5)"),
            ("_q", "'a b c'"),
            ("_u", "?"),
            ("_d", "."),
            ("_w", "bare"),
        ];
        for (name, literal) in cases {
            let input = format!("data_a\n{name} {literal}\n");
            let (out, errors) = cif11(&input);
            assert_eq!(errors, 0);
            assert!(
                out.contains(&format!("{name} {literal}")),
                "{literal} came back as {out:?}"
            );
        }
    }

    #[test]
    fn multiline_value_upgrades_to_triple_quotes_in_cif20() {
        let input = "data_a\n_t\n;ab\ncd\n;\n";
        let (out, errors) = cif20(input);
        assert_eq!(errors, 0);
        assert!(out.contains("'''ab\ncd'''"), "got {out:?}");
    }

    #[test]
    fn multiline_value_stays_text_field_in_cif11() {
        let input = "data_a\n_t\n;ab\ncd\n;\n";
        let (out, errors) = cif11(input);
        assert_eq!(errors, 0);
        assert!(out.contains("\n;ab\ncd\n;"), "got {out:?}");
    }

    #[test]
    fn no_emitted_line_exceeds_the_limit() {
        // one long unbroken line, one long line with spaces, a wide loop
        let long = "x".repeat(5000);
        let spaced = "word ".repeat(800);
        let input = format!(
            "data_a\n_l\n;{long}\n;\n_s\n;{spaced}\n;\nloop_\n_p\n_q\n{}\n",
            "v ".repeat(40)
        );
        let (out, _) = cif20(&input);
        for line in out.lines() {
            assert!(
                line.chars().count() <= MAX_LINE_LENGTH,
                "line of {} chars",
                line.chars().count()
            );
        }
    }

    #[test]
    fn folded_long_value_round_trips() {
        let long = "x".repeat(5000);
        let input = format!("data_a\n_l\n;{long}\n;\n");
        let (out, errors) = cif11(&input);
        assert_eq!(errors, 0);
        // decode again: the value must come back intact
        let cif = Cif::create().unwrap();
        let mut sink = Collector::default();
        cif_parse::parse_into(&cif, &out, &ParseOptions::default(), &mut sink).unwrap();
        let block = cif.block("a").unwrap();
        let v = cif.value(&block, "_l").unwrap();
        assert_eq!(v.as_text(), Some(long.as_str()));
    }

    #[test]
    fn value_with_embedded_close_is_prefixed() {
        // a value containing "\n;" cannot be typed literally into a text
        // field, so build it through the store and emit via the walker
        let cif = Cif::create().unwrap();
        let block = cif.create_block("a").unwrap();
        cif.set_value(&block, "_v", &cif_model::Value::quoted("line\n;inside"))
            .unwrap();
        let mut emitter = Emitter::new(
            Vec::new(),
            EmitOptions {
                format: OutFormat::Cif11,
                ..EmitOptions::default()
            },
        )
        .with_diagnostics(Box::new(std::io::sink()));
        cif_walk::walk(&cif, &mut emitter).unwrap();
        let out = String::from_utf8(emitter.into_inner()).unwrap();
        assert!(out.contains("\n;> \\\n"), "prefix marker missing: {out:?}");
        assert!(out.contains("\n> line\n> ;inside\n;"), "got {out:?}");
    }

    #[test]
    fn disallowed_value_is_recovered_in_cif11() {
        let input = "#\\#CIF_2.0\ndata_a\n_x [1 2 3]\n_y 5\n";
        let (out, errors) = cif11(input);
        assert_eq!(errors, 1);
        assert!(out.contains("_x ?"), "placeholder expected: {out:?}");
        assert!(out.contains("_y 5"), "later items still emitted: {out:?}");
    }

    #[test]
    fn list_and_table_emit_in_cif20() {
        let input = "#\\#CIF_2.0\ndata_a\n_l [1 2]\n_t {'k':v}\n";
        let (out, errors) = cif20(input);
        assert_eq!(errors, 0);
        assert!(out.contains("[1 2]"), "got {out:?}");
        assert!(out.contains("{'k':v}"), "got {out:?}");
    }

    /// Minimal sink: build the store, ignore events.
    #[derive(Default)]
    struct Collector;
    impl cif_walk::CifHandler for Collector {}
    impl cif_parse::ParseSink for Collector {}
}
