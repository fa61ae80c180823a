mod common;

use clatter_core::ast::{Form, FormKind, Span, Symbol};
use clatter_core::error::ReaderErrorKind;
use clatter_core::reader::{ReadCond, Reader, ReaderOptions};
use common::{read_all, read_one};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn reader_err(source: &str) -> ReaderErrorKind {
    let err = Reader::new(source)
        .read_all()
        .expect_err("expected a reader error");
    err.reader_kind()
        .unwrap_or_else(|| panic!("not a reader error: {}", err))
}

fn with_features(source: &str, features: &[&str]) -> Result<Option<Form>, clatter_core::error::ClatterError> {
    let mut opts = ReaderOptions::default().with_read_cond(ReadCond::Allow);
    for feature in features {
        opts = opts.with_feature(*feature);
    }
    Reader::with_options(source, opts).read_one()
}

#[test]
fn reads_basic_collections() {
    let forms = read_all("(def x 1) [true nil 3.5] {:port 80} #{1 2}");
    assert_eq!(forms.len(), 4);
    assert_eq!(
        forms[0].kind,
        FormKind::List(vec![
            Form::symbol("def", Span::start()),
            Form::symbol("x", Span::start()),
            Form::int(1, Span::start()),
        ])
    );
    assert!(matches!(&forms[1].kind, FormKind::Vector(items) if items.len() == 3));
    assert!(matches!(&forms[2].kind, FormKind::Map(entries) if entries.len() == 1));
    assert!(matches!(&forms[3].kind, FormKind::Set(items) if items.len() == 2));
}

#[test]
fn commas_are_whitespace_and_comments_vanish() {
    let forms = read_all("; leading\n[1, 2,, 3] #!shebang\n#_ (ignored) :kept");
    assert_eq!(forms.len(), 2);
    assert!(matches!(&forms[0].kind, FormKind::Vector(items) if items.len() == 3));
    assert_eq!(forms[1].kind, FormKind::Keyword(Symbol::simple("kept")));
}

#[test]
fn strings_and_chars_unescape() {
    assert_eq!(
        read_one("\"a\\n\\t\\u0041\"").kind,
        FormKind::String("a\n\tA".to_string())
    );
    assert_eq!(read_one("\\newline").kind, FormKind::Char('\n'));
    assert_eq!(read_one("\\u0041").kind, FormKind::Char('A'));
    assert_eq!(read_one("\\a").kind, FormKind::Char('a'));
}

#[test]
fn reader_error_kinds_are_specific() {
    assert_eq!(reader_err("(1 2"), ReaderErrorKind::UnterminatedList);
    assert_eq!(reader_err("\"abc"), ReaderErrorKind::UnterminatedString);
    assert_eq!(reader_err("(1]"), ReaderErrorKind::UnmatchedDelimiter);
    assert_eq!(reader_err("12abc"), ReaderErrorKind::InvalidNumber);
    assert_eq!(reader_err("\"\\q\""), ReaderErrorKind::InvalidEscape);
    assert_eq!(reader_err("%2"), ReaderErrorKind::UnsupportedArg);
    assert_eq!(reader_err("^:kw 42"), ReaderErrorKind::InvalidMeta);
}

#[test]
fn metadata_attaches_and_merges_left_to_right() {
    let form = read_one("^:a ^{:b 1 :a false} sym");
    assert_eq!(form.kind, FormKind::Symbol(Symbol::simple("sym")));
    assert!(form.meta_get("b").is_some());
    // the later map wins for :a
    assert_eq!(
        form.meta_get("a").map(|f| &f.kind),
        Some(&FormKind::Bool(false))
    );
    assert!(form.meta_get("line").is_some());
    assert!(form.meta_get("column").is_some());
}

#[test]
fn spans_track_line_and_column() {
    let forms = read_all("x\n  (y)");
    assert_eq!(forms[0].span.line, 1);
    assert_eq!(forms[0].span.col, 1);
    assert_eq!(forms[1].span.line, 2);
    assert_eq!(forms[1].span.col, 3);
}

#[test]
fn quote_deref_and_var_sugar() {
    assert!(read_one("'x").is_call_to("quote"));
    assert!(read_one("#'x").is_call_to("var"));
    let deref = read_one("@x");
    let items = deref.as_list().unwrap();
    assert_eq!(items[0].as_symbol().unwrap().to_string(), "clatter.core/deref");
}

#[test]
fn anonymous_fn_rewrites_to_fn_star() {
    let form = read_one("#(f %1 %2)");
    let items = form.as_list().unwrap();
    assert_eq!(items[0].as_symbol().unwrap().name, "fn*");
    let FormKind::Vector(params) = &items[1].kind else {
        panic!("params must be a vector");
    };
    assert_eq!(params.len(), 2);

    let variadic = read_one("#(f %&)");
    let items = variadic.as_list().unwrap();
    let FormKind::Vector(params) = &items[1].kind else {
        panic!("params must be a vector");
    };
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].as_symbol().unwrap().name, "&");
}

#[test]
fn bare_percent_counts_as_first_arg() {
    let form = read_one("#(inc %)");
    let items = form.as_list().unwrap();
    let FormKind::Vector(params) = &items[1].kind else {
        panic!("params must be a vector");
    };
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].as_symbol().unwrap().name, "%1");
}

#[test]
fn reader_conditional_picks_matching_feature() {
    let form = with_features("#?(:clj 1 :cljs 2)", &["clj"]).unwrap().unwrap();
    assert_eq!(form.kind, FormKind::Int(1));
    let form = with_features("#?(:clj 1 :cljs 2)", &["cljs"]).unwrap().unwrap();
    assert_eq!(form.kind, FormKind::Int(2));
    let form = with_features("#?(:clj 1 :default 9)", &[]).unwrap().unwrap();
    assert_eq!(form.kind, FormKind::Int(9));
}

#[test]
fn reader_conditional_without_match_is_feature_not_found() {
    let err = with_features("#?(:clj 1 :cljs 2)", &[]).expect_err("no branch matches");
    assert_eq!(err.reader_kind(), Some(ReaderErrorKind::FeatureNotFound));
}

#[test]
fn splicing_conditional_expands_into_the_sequence() {
    let form = with_features("[1 #?@(:clj [2 3]) 4]", &["clj"]).unwrap().unwrap();
    let FormKind::Vector(items) = &form.kind else {
        panic!("vector expected");
    };
    assert_eq!(items.len(), 4);

    let err = with_features("#?@(:clj [1])", &["clj"]).expect_err("top level splice");
    assert_eq!(err.reader_kind(), Some(ReaderErrorKind::UnsupportedArg));
}

#[test]
fn preserve_mode_keeps_the_conditional() {
    let opts = ReaderOptions::default().with_read_cond(ReadCond::Preserve);
    let form = Reader::with_options("#?(:clj 1)", opts)
        .read_one()
        .unwrap()
        .unwrap();
    assert!(matches!(form.kind, FormKind::ReaderCond { .. }));
}

#[test]
fn disallow_mode_rejects_conditionals() {
    let opts = ReaderOptions::default().with_read_cond(ReadCond::Disallow);
    let err = Reader::with_options("#?(:clj 1)", opts)
        .read_one()
        .expect_err("conditionals disallowed");
    assert_eq!(err.reader_kind(), Some(ReaderErrorKind::InvalidDispatchChar));
}

#[test]
fn read_eval_is_disabled_by_default() {
    let err = Reader::new("#=(f 1)").read_one().expect_err("read eval off");
    assert_eq!(err.reader_kind(), Some(ReaderErrorKind::InvalidDispatchChar));
}

#[test]
fn syntax_quote_qualifies_symbols_into_the_current_ns() {
    let form = read_one("`x");
    // `(quote user/x)
    let items = form.as_list().unwrap();
    assert_eq!(items[0].as_symbol().unwrap().name, "quote");
    assert_eq!(items[1].as_symbol().unwrap().to_string(), "user/x");
}

#[test]
fn syntax_quote_builds_constructors_around_unquotes() {
    let form = read_one("`(f ~x ~@ys)");
    let printed = form.to_string();
    assert!(printed.contains("clatter.rt/concat"));
    assert!(printed.contains("clatter.rt/list"));
    assert!(printed.contains("ys"));
}

#[test]
fn auto_resolved_keywords_qualify() {
    let form = read_one("::local");
    assert_eq!(
        form.kind,
        FormKind::Keyword(Symbol::qualified("user", "local"))
    );
}

#[test]
fn read_fold_threads_the_accumulator_between_reads() {
    let count = clatter_core::reader::read_fold(
        |_, acc: usize| Ok(acc + 1),
        "1 2 3 #_4 5",
        ReaderOptions::default(),
        0,
    )
    .unwrap();
    assert_eq!(count, 4);
}

#[test]
fn eof_behavior_error_rejects_truncated_streams() {
    let opts = ReaderOptions {
        eof_behavior: clatter_core::reader::EofBehavior::Error,
        ..ReaderOptions::default()
    };
    let mut reader = Reader::with_options("", opts);
    assert!(reader.read_one().is_err());
}

// ---- round-trip property ---------------------------------------------------

fn gen_atom(rng: &mut StdRng, counter: &mut usize) -> Form {
    *counter += 1;
    let span = Span::start();
    match rng.gen_range(0..8) {
        0 => Form::nil(span),
        1 => Form::new(FormKind::Bool(rng.gen()), span),
        2 => Form::int(rng.gen_range(-1_000_000..1_000_000), span),
        3 => Form::new(
            FormKind::Float(f64::from(rng.gen_range(-500..500)) / 4.0),
            span,
        ),
        4 => Form::keyword(&format!("k{}", *counter), span),
        5 => Form::symbol(&format!("s{}", *counter), span),
        6 => Form::string(format!("text {} \"quoted\"\n", *counter), span),
        _ => Form::new(FormKind::Char(char::from(rng.gen_range(b'a'..=b'z'))), span),
    }
}

fn gen_form(rng: &mut StdRng, depth: usize, counter: &mut usize) -> Form {
    let span = Span::start();
    if depth == 0 || rng.gen_bool(0.5) {
        return gen_atom(rng, counter);
    }
    let len = rng.gen_range(0..4);
    match rng.gen_range(0..4) {
        0 => Form::new(
            FormKind::List((0..len).map(|_| gen_form(rng, depth - 1, counter)).collect()),
            span,
        ),
        1 => Form::new(
            FormKind::Vector((0..len).map(|_| gen_form(rng, depth - 1, counter)).collect()),
            span,
        ),
        2 => {
            // unique keys by construction
            let entries = (0..len)
                .map(|_| {
                    *counter += 1;
                    (
                        Form::keyword(&format!("key{}", *counter), span),
                        gen_form(rng, depth - 1, counter),
                    )
                })
                .collect();
            Form::new(FormKind::Map(entries), span)
        }
        _ => {
            let items = (0..len)
                .map(|_| {
                    *counter += 1;
                    Form::int(*counter as i64, span)
                })
                .collect();
            Form::new(FormKind::Set(items), span)
        }
    }
}

#[test]
fn printable_forms_round_trip_through_the_reader() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut counter = 0;
    for _ in 0..500 {
        let form = gen_form(&mut rng, 3, &mut counter);
        let printed = form.to_string();
        let reread = read_one(&printed);
        assert_eq!(form, reread, "round trip failed for {}", printed);
    }
}

#[test]
fn numeric_tower_round_trips() {
    for source in ["42", "-7", "9N", "1/3", "-5/7", "2.5", "1.5M", "\\space"] {
        let form = read_one(source);
        let reread = read_one(&form.to_string());
        assert_eq!(form, reread, "round trip failed for {}", source);
    }
}
