use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Num;

use crate::ast::{Form, FormKind, Span, Symbol};
use crate::error::{ClatterError, ReaderErrorKind};

pub const CORE_NS: &str = "clatter.core";
pub const RT_NS: &str = "clatter.rt";
pub const UNQUOTE_SYM: &str = "clatter.core/unquote";
pub const UNQUOTE_SPLICING_SYM: &str = "clatter.core/unquote-splicing";

/// Handler for a `#tag value` literal: receives the already-read value and
/// the span of the tag.
pub type TagHandler = Arc<dyn Fn(&Form, Span) -> Result<Form, ClatterError> + Send + Sync>;

/// Hook used by `#=(...)` when read-time eval is explicitly enabled.
pub type ReadEvalHook = Arc<dyn Fn(&Form) -> Result<Form, ClatterError> + Send + Sync>;

/// How `#?` / `#?@` forms are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadCond {
    Preserve,
    Allow,
    Disallow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EofBehavior {
    /// `read_one` returns `None` at end of stream.
    ReturnNone,
    /// End of stream before a complete form is an error.
    Error,
}

/// Namespace knowledge the reader needs for `::kw` and syntax-quote
/// resolution. The driver supplies a registry-backed implementation; the
/// default qualifies everything into a fixed namespace.
pub trait SyntaxResolver: Send + Sync {
    fn current_ns(&self) -> String;
    fn resolve_alias(&self, alias: &str) -> Option<String>;
    fn qualify(&self, sym: &Symbol) -> Symbol;
}

pub struct FixedResolver {
    pub ns: String,
}

impl FixedResolver {
    pub fn new(ns: impl Into<String>) -> Self {
        FixedResolver { ns: ns.into() }
    }
}

impl SyntaxResolver for FixedResolver {
    fn current_ns(&self) -> String {
        self.ns.clone()
    }

    fn resolve_alias(&self, _alias: &str) -> Option<String> {
        None
    }

    fn qualify(&self, sym: &Symbol) -> Symbol {
        match &sym.ns {
            Some(_) => sym.clone(),
            None => Symbol::qualified(self.ns.clone(), sym.name.clone()),
        }
    }
}

#[derive(Clone)]
pub struct ReaderOptions {
    pub file: Option<String>,
    pub read_cond: ReadCond,
    pub eof_behavior: EofBehavior,
    /// Active feature keys for reader conditionals, without the leading `:`.
    pub features: HashSet<String>,
    /// Unmatched `#?` with no `:default` reads as nil instead of failing.
    pub missing_feature_nil: bool,
    pub data_readers: HashMap<String, TagHandler>,
    pub allow_read_eval: bool,
    pub read_eval: Option<ReadEvalHook>,
    pub resolver: Arc<dyn SyntaxResolver>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            file: None,
            read_cond: ReadCond::Allow,
            eof_behavior: EofBehavior::ReturnNone,
            features: HashSet::new(),
            missing_feature_nil: false,
            data_readers: crate::reader_tags::default_data_readers(),
            allow_read_eval: false,
            read_eval: None,
            resolver: Arc::new(FixedResolver::new("user")),
        }
    }
}

impl ReaderOptions {
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn with_read_cond(mut self, mode: ReadCond) -> Self {
        self.read_cond = mode;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SyntaxResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Outcome of reading one syntactic element inside a collection. `#_`,
/// unmatched conditionals and `#?@` need more than a single-form answer.
enum ReadEvent {
    One(Form),
    Splice(Vec<Form>),
    Skip,
    Eof,
}

pub struct Reader {
    chars: Vec<char>,
    index: usize,
    line: usize,
    col: usize,
    pub options: ReaderOptions,
    anon_args: Option<AnonArgs>,
    gensym_counter: usize,
}

struct AnonArgs {
    max: usize,
    rest: bool,
}

impl Reader {
    pub fn new(source: &str) -> Self {
        Self::with_options(source, ReaderOptions::default())
    }

    pub fn with_options(source: &str, options: ReaderOptions) -> Self {
        Reader {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            col: 1,
            options,
            anon_args: None,
            gensym_counter: 0,
        }
    }

    /// Reads the next top-level form, or `None` at end of stream.
    pub fn read_one(&mut self) -> Result<Option<Form>, ClatterError> {
        loop {
            self.skip_ws_and_comments();
            if self.eof() {
                return match self.options.eof_behavior {
                    EofBehavior::ReturnNone => Ok(None),
                    EofBehavior::Error => Err(self.err(
                        ReaderErrorKind::UnterminatedList,
                        "unexpected end of input",
                    )),
                };
            }
            match self.read_event()? {
                ReadEvent::One(form) => return Ok(Some(form)),
                ReadEvent::Skip => continue,
                ReadEvent::Splice(_) => {
                    return Err(self.err(
                        ReaderErrorKind::UnsupportedArg,
                        "splicing reader conditional outside a sequence",
                    ))
                }
                ReadEvent::Eof => return Ok(None),
            }
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<Form>, ClatterError> {
        let mut forms = Vec::new();
        while let Some(form) = self.read_one()? {
            forms.push(form);
        }
        Ok(forms)
    }

    fn read_event(&mut self) -> Result<ReadEvent, ClatterError> {
        self.skip_ws_and_comments();
        if self.eof() {
            return Ok(ReadEvent::Eof);
        }
        let span = self.span();
        let form = match self.current() {
            '(' => self.read_list(span)?,
            '[' => self.read_vector(span)?,
            '{' => self.read_map(span)?,
            '"' => self.read_string(span)?,
            ':' => self.read_keyword(span)?,
            '\\' => self.read_char(span)?,
            '\'' => self.read_wrapped("quote", span)?,
            '`' => self.read_syntax_quote(span)?,
            '~' => self.read_unquote(span)?,
            '@' => self.read_wrapped("clatter.core/deref", span)?,
            '^' => self.read_meta(span)?,
            '#' => return self.read_dispatch(span),
            ch @ (')' | ']' | '}') => {
                return Err(self.err(
                    ReaderErrorKind::UnmatchedDelimiter,
                    format!("unexpected closing delimiter '{}'", ch),
                ))
            }
            _ => self.read_atom(span)?,
        };
        Ok(ReadEvent::One(form))
    }

    fn read_form(&mut self) -> Result<Form, ClatterError> {
        loop {
            match self.read_event()? {
                ReadEvent::One(form) => return Ok(form),
                ReadEvent::Skip => continue,
                ReadEvent::Splice(_) => {
                    return Err(self.err(
                        ReaderErrorKind::UnsupportedArg,
                        "splicing reader conditional outside a sequence",
                    ))
                }
                ReadEvent::Eof => {
                    return Err(self.err(
                        ReaderErrorKind::UnterminatedList,
                        "unexpected end of input",
                    ))
                }
            }
        }
    }

    // ---- collections ----------------------------------------------------

    fn read_seq_items(&mut self, close: char) -> Result<Vec<Form>, ClatterError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws_and_comments();
            if self.eof() {
                return Err(self.err(
                    ReaderErrorKind::UnterminatedList,
                    format!("expected '{}' before end of input", close),
                ));
            }
            let ch = self.current();
            if ch == close {
                self.advance();
                return Ok(items);
            }
            if matches!(ch, ')' | ']' | '}') {
                return Err(self.err(
                    ReaderErrorKind::UnmatchedDelimiter,
                    format!("expected '{}', found '{}'", close, ch),
                ));
            }
            match self.read_event()? {
                ReadEvent::One(form) => items.push(form),
                ReadEvent::Splice(forms) => items.extend(forms),
                ReadEvent::Skip => {}
                ReadEvent::Eof => {
                    return Err(self.err(
                        ReaderErrorKind::UnterminatedList,
                        format!("expected '{}' before end of input", close),
                    ))
                }
            }
        }
    }

    fn read_list(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance();
        let items = self.read_seq_items(')')?;
        Ok(Form::new(FormKind::List(items), span))
    }

    fn read_vector(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance();
        let items = self.read_seq_items(']')?;
        Ok(Form::new(FormKind::Vector(items), span))
    }

    fn read_map(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance();
        let items = self.read_seq_items('}')?;
        if items.len() % 2 != 0 {
            return Err(ClatterError::reader(
                ReaderErrorKind::UnmatchedDelimiter,
                "map literal must contain an even number of forms",
            )
            .with_span(span)
            .with_file(self.options.file.clone()));
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            entries.push((k, v));
        }
        Ok(Form::new(FormKind::Map(entries), span))
    }

    // ---- atoms -----------------------------------------------------------

    fn read_string(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // opening quote
        let mut buf = String::new();
        while !self.eof() {
            let ch = self.current();
            match ch {
                '"' => {
                    self.advance();
                    return Ok(Form::new(FormKind::String(buf), span));
                }
                '\\' => {
                    self.advance();
                    if self.eof() {
                        return Err(
                            self.err(ReaderErrorKind::UnterminatedString, "unterminated escape")
                        );
                    }
                    let esc = self.current();
                    self.advance();
                    match esc {
                        'n' => buf.push('\n'),
                        't' => buf.push('\t'),
                        'r' => buf.push('\r'),
                        'b' => buf.push('\u{08}'),
                        'f' => buf.push('\u{0c}'),
                        '0' => buf.push('\0'),
                        '"' => buf.push('"'),
                        '\\' => buf.push('\\'),
                        'u' => buf.push(self.read_unicode_escape(4)?),
                        other => {
                            return Err(self.err(
                                ReaderErrorKind::InvalidEscape,
                                format!("unsupported escape character '\\{}'", other),
                            ))
                        }
                    }
                }
                _ => {
                    buf.push(ch);
                    self.advance();
                }
            }
        }
        Err(self.err(ReaderErrorKind::UnterminatedString, "unterminated string"))
    }

    fn read_unicode_escape(&mut self, digits: usize) -> Result<char, ClatterError> {
        let mut value: u32 = 0;
        for _ in 0..digits {
            if self.eof() {
                return Err(self.err(
                    ReaderErrorKind::InvalidEscape,
                    "truncated unicode escape",
                ));
            }
            let ch = self.current();
            let digit = ch.to_digit(16).ok_or_else(|| {
                self.err(
                    ReaderErrorKind::InvalidEscape,
                    format!("invalid hex digit '{}' in unicode escape", ch),
                )
            })?;
            value = value * 16 + digit;
            self.advance();
        }
        char::from_u32(value).ok_or_else(|| {
            self.err(
                ReaderErrorKind::InvalidEscape,
                format!("\\u{:04x} is not a valid character", value),
            )
        })
    }

    fn read_keyword(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // ':'
        let auto_resolve = !self.eof() && self.current() == ':';
        if auto_resolve {
            self.advance();
        }
        let token = self.read_token();
        if token.is_empty() {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                "keyword must have a name",
            ));
        }
        let mut sym = Symbol::parse(&token);
        if auto_resolve {
            sym = match sym.ns.take() {
                None => Symbol::qualified(self.options.resolver.current_ns(), sym.name),
                Some(alias) => match self.options.resolver.resolve_alias(&alias) {
                    Some(ns) => Symbol::qualified(ns, sym.name),
                    None => {
                        return Err(ClatterError::unresolved(format!(
                            "no namespace alias '{}' for keyword ::{}/{}",
                            alias, alias, sym.name
                        ))
                        .with_span(span)
                        .with_file(self.options.file.clone()))
                    }
                },
            };
        }
        Ok(Form::new(FormKind::Keyword(sym), span))
    }

    fn read_char(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // '\'
        if self.eof() {
            return Err(self.err(
                ReaderErrorKind::InvalidEscape,
                "expected character after '\\'",
            ));
        }
        let first = self.current();
        self.advance();
        let mut name = String::from(first);
        while !self.eof() {
            let ch = self.current();
            if is_ws(ch) || is_delimiter(ch) {
                break;
            }
            name.push(ch);
            self.advance();
        }
        let c = match name.as_str() {
            "space" => ' ',
            "tab" => '\t',
            "newline" => '\n',
            "return" => '\r',
            "formfeed" => '\u{0c}',
            "backspace" => '\u{08}',
            _ if name.chars().count() == 1 => first,
            _ if name.starts_with('u') && name.len() == 5 => {
                let value = u32::from_str_radix(&name[1..], 16).map_err(|_| {
                    self.err(
                        ReaderErrorKind::InvalidEscape,
                        format!("invalid unicode character literal \\{}", name),
                    )
                })?;
                char::from_u32(value).ok_or_else(|| {
                    self.err(
                        ReaderErrorKind::InvalidEscape,
                        format!("\\{} is not a valid character", name),
                    )
                })?
            }
            "u+" => {
                return Err(self.err(
                    ReaderErrorKind::InvalidEscape,
                    "expected hex digits after \\u",
                ))
            }
            _ => {
                return Err(self.err(
                    ReaderErrorKind::InvalidEscape,
                    format!("unsupported character literal \\{}", name),
                ))
            }
        };
        Ok(Form::new(FormKind::Char(c), span))
    }

    fn read_wrapped(&mut self, head: &str, span: Span) -> Result<Form, ClatterError> {
        self.advance();
        let inner = self.read_form()?;
        Ok(Form::list(vec![Form::symbol(head, span), inner], span))
    }

    fn read_unquote(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // '~'
        let head = if !self.eof() && self.current() == '@' {
            self.advance();
            UNQUOTE_SPLICING_SYM
        } else {
            UNQUOTE_SYM
        };
        let inner = self.read_form()?;
        Ok(Form::list(vec![Form::symbol(head, span), inner], span))
    }

    fn read_meta(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // '^'
        let meta_form = self.read_form()?;
        let mut entries = vec![
            (
                Form::keyword("line", span),
                Form::int(span.line as i64, span),
            ),
            (
                Form::keyword("column", span),
                Form::int(span.col as i64, span),
            ),
        ];
        if let Some(file) = &self.options.file {
            entries.push((Form::keyword("file", span), Form::string(file.clone(), span)));
        }
        entries.extend(self.meta_entries(meta_form, span)?);
        let mut target = self.read_form()?;
        if !target.accepts_meta() {
            return Err(ClatterError::reader(
                ReaderErrorKind::InvalidMeta,
                "metadata can only be applied to symbols and collections",
            )
            .with_span(span)
            .with_file(self.options.file.clone()));
        }
        target.merge_meta(entries);
        Ok(target)
    }

    fn meta_entries(&self, meta: Form, span: Span) -> Result<Vec<(Form, Form)>, ClatterError> {
        match meta.kind {
            FormKind::Keyword(_) => Ok(vec![(meta, Form::new(FormKind::Bool(true), span))]),
            FormKind::Symbol(_) | FormKind::String(_) => {
                Ok(vec![(Form::keyword("tag", span), meta)])
            }
            FormKind::Map(entries) => Ok(entries),
            _ => Err(ClatterError::reader(
                ReaderErrorKind::InvalidMeta,
                "metadata must be a symbol, keyword, string or map",
            )
            .with_span(span)
            .with_file(self.options.file.clone())),
        }
    }

    // ---- dispatch (#) ----------------------------------------------------

    fn read_dispatch(&mut self, span: Span) -> Result<ReadEvent, ClatterError> {
        self.advance(); // '#'
        if self.eof() {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                "expected dispatch character after '#'",
            ));
        }
        match self.current() {
            '{' => {
                self.advance();
                let items = self.read_seq_items('}')?;
                Ok(ReadEvent::One(Form::new(FormKind::Set(items), span)))
            }
            '(' => Ok(ReadEvent::One(self.read_anon_fn(span)?)),
            '"' => Ok(ReadEvent::One(self.read_regex(span)?)),
            '\'' => Ok(ReadEvent::One(self.read_wrapped("var", span)?)),
            '_' => {
                self.advance();
                self.read_form()?; // read and discard
                Ok(ReadEvent::Skip)
            }
            '!' => {
                while !self.eof() && self.current() != '\n' {
                    self.advance();
                }
                Ok(ReadEvent::Skip)
            }
            '^' => Ok(ReadEvent::One(self.read_meta(span)?)),
            '=' => Ok(ReadEvent::One(self.read_eval_form(span)?)),
            '?' => self.read_conditional(span),
            ch if is_ws(ch) || is_delimiter(ch) => Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                format!("invalid dispatch character '{}'", ch),
            )),
            _ => Ok(ReadEvent::One(self.read_tagged(span)?)),
        }
    }

    fn read_regex(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // opening quote
        let mut pattern = String::new();
        while !self.eof() {
            let ch = self.current();
            if ch == '"' {
                self.advance();
                regex::Regex::new(&pattern).map_err(|e| {
                    ClatterError::reader(
                        ReaderErrorKind::InvalidDispatchChar,
                        format!("invalid regex literal: {}", e),
                    )
                    .with_span(span)
                    .with_file(self.options.file.clone())
                })?;
                return Ok(Form::new(FormKind::Regex(pattern), span));
            }
            if ch == '\\' {
                pattern.push(ch);
                self.advance();
                if self.eof() {
                    break;
                }
                pattern.push(self.current());
                self.advance();
                continue;
            }
            pattern.push(ch);
            self.advance();
        }
        Err(self.err(ReaderErrorKind::UnterminatedString, "unterminated regex"))
    }

    fn read_anon_fn(&mut self, span: Span) -> Result<Form, ClatterError> {
        if self.anon_args.is_some() {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                "nested #() forms are not allowed",
            ));
        }
        self.anon_args = Some(AnonArgs { max: 0, rest: false });
        let body = self.read_list(span);
        let args = self.anon_args.take().expect("anon context present");
        let body = body?;
        let mut params = Vec::new();
        for n in 1..=args.max {
            params.push(Form::symbol(&format!("%{}", n), span));
        }
        if args.rest {
            params.push(Form::symbol("&", span));
            params.push(Form::symbol("%&", span));
        }
        Ok(Form::list(
            vec![
                Form::symbol("fn*", span),
                Form::new(FormKind::Vector(params), span),
                body,
            ],
            span,
        ))
    }

    fn read_eval_form(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // '='
        let form = self.read_form()?;
        if !self.options.allow_read_eval {
            return Err(ClatterError::reader(
                ReaderErrorKind::InvalidDispatchChar,
                "read-time eval (#=) is disabled",
            )
            .with_span(span)
            .with_file(self.options.file.clone()));
        }
        match &self.options.read_eval {
            Some(hook) => hook(&form).map_err(|e| e.with_span(span)),
            None => Err(ClatterError::reader(
                ReaderErrorKind::InvalidDispatchChar,
                "read-time eval (#=) enabled but no evaluator is installed",
            )
            .with_span(span)
            .with_file(self.options.file.clone())),
        }
    }

    fn read_tagged(&mut self, span: Span) -> Result<Form, ClatterError> {
        let tag_token = self.read_token();
        if tag_token.is_empty() {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                "expected tag symbol after '#'",
            ));
        }
        let tag = Symbol::parse(&tag_token);
        let value = self.read_form()?;
        if let Some(handler) = self.options.data_readers.get(&tag.to_string()).cloned() {
            return handler(&value, span);
        }
        Ok(Form::new(
            FormKind::Tagged {
                tag,
                value: Box::new(value),
            },
            span,
        ))
    }

    fn read_conditional(&mut self, span: Span) -> Result<ReadEvent, ClatterError> {
        self.advance(); // '?'
        let splicing = !self.eof() && self.current() == '@';
        if splicing {
            self.advance();
        }
        if self.options.read_cond == ReadCond::Disallow {
            return Err(ClatterError::reader(
                ReaderErrorKind::InvalidDispatchChar,
                "reader conditionals are not allowed in this source",
            )
            .with_span(span)
            .with_file(self.options.file.clone()));
        }
        self.skip_ws_and_comments();
        if self.eof() || self.current() != '(' {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                "reader conditional body must be a list",
            ));
        }
        let body_span = self.span();
        self.advance();
        let items = self.read_seq_items(')')?;
        if items.len() % 2 != 0 {
            return Err(ClatterError::reader(
                ReaderErrorKind::UnmatchedDelimiter,
                "reader conditional requires an even number of forms",
            )
            .with_span(body_span)
            .with_file(self.options.file.clone()));
        }
        let mut branches = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(feature), Some(branch)) = (iter.next(), iter.next()) {
            branches.push((feature, branch));
        }

        if self.options.read_cond == ReadCond::Preserve {
            return Ok(ReadEvent::One(Form::new(
                FormKind::ReaderCond { splicing, branches },
                span,
            )));
        }

        for (feature, branch) in branches {
            let key = match feature.as_keyword() {
                Some(sym) if sym.ns.is_none() => sym.name.clone(),
                _ => {
                    return Err(ClatterError::UnknownFeature(crate::error::ErrorData::new(
                        format!("reader conditional feature must be a keyword: {}", feature),
                    ))
                    .with_span(feature.span)
                    .with_file(self.options.file.clone()))
                }
            };
            if key == "default" || self.options.features.contains(&key) {
                if splicing {
                    let items = match branch.kind {
                        FormKind::List(items) | FormKind::Vector(items) => items,
                        _ => {
                            return Err(self.err(
                                ReaderErrorKind::UnsupportedArg,
                                "#?@ branch must be a sequential collection",
                            ))
                        }
                    };
                    return Ok(ReadEvent::Splice(items));
                }
                return Ok(ReadEvent::One(branch));
            }
        }

        if self.options.missing_feature_nil {
            if splicing {
                return Ok(ReadEvent::Skip);
            }
            return Ok(ReadEvent::One(Form::nil(span)));
        }
        Err(ClatterError::reader(
            ReaderErrorKind::FeatureNotFound,
            "no reader conditional branch matched and no :default was given",
        )
        .with_span(span)
        .with_file(self.options.file.clone()))
    }

    // ---- syntax quote ----------------------------------------------------

    fn read_syntax_quote(&mut self, span: Span) -> Result<Form, ClatterError> {
        self.advance(); // '`'
        let form = self.read_form()?;
        let mut gensyms = HashMap::new();
        self.syntax_quote(&form, &mut gensyms, span)
    }

    fn syntax_quote(
        &mut self,
        form: &Form,
        gensyms: &mut HashMap<String, Symbol>,
        span: Span,
    ) -> Result<Form, ClatterError> {
        if let Some(inner) = unquote_payload(form, UNQUOTE_SYM) {
            return Ok(inner.clone());
        }
        if unquote_payload(form, UNQUOTE_SPLICING_SYM).is_some() {
            return Err(ClatterError::bad_form("unquote-splicing outside of a sequence")
                .with_span(form.span)
                .with_file(self.options.file.clone()));
        }
        match &form.kind {
            FormKind::Symbol(sym) => {
                let resolved = if sym.ns.is_none() && sym.name.ends_with('#') {
                    let base = sym.name.trim_end_matches('#').to_string();
                    gensyms
                        .entry(base.clone())
                        .or_insert_with(|| {
                            self.gensym_counter += 1;
                            Symbol::simple(format!("{}__{}__auto__", base, self.gensym_counter))
                        })
                        .clone()
                } else if sym.ns.is_none()
                    && (crate::hir::is_special_form(&sym.name) || sym.name == "&")
                {
                    sym.clone()
                } else {
                    self.options.resolver.qualify(sym)
                };
                Ok(Form::list(
                    vec![
                        Form::symbol("quote", span),
                        Form::new(FormKind::Symbol(resolved), form.span),
                    ],
                    span,
                ))
            }
            FormKind::List(items) => self.syntax_quote_seq(items, "concat", gensyms, span),
            FormKind::Vector(items) => self.syntax_quote_seq(items, "vec", gensyms, span),
            FormKind::Set(items) => self.syntax_quote_seq(items, "set", gensyms, span),
            FormKind::Map(entries) => {
                let mut flat = Vec::with_capacity(entries.len() * 2);
                for (k, v) in entries {
                    flat.push(k.clone());
                    flat.push(v.clone());
                }
                self.syntax_quote_seq(&flat, "map*", gensyms, span)
            }
            _ => Ok(form.clone()),
        }
    }

    /// Builds `(clatter.rt/concat seg...)` and, for non-list collections,
    /// wraps the result in the given rt constructor.
    fn syntax_quote_seq(
        &mut self,
        items: &[Form],
        wrap: &str,
        gensyms: &mut HashMap<String, Symbol>,
        span: Span,
    ) -> Result<Form, ClatterError> {
        let mut segments = vec![Form::symbol(&format!("{}/concat", RT_NS), span)];
        for item in items {
            if let Some(inner) = unquote_payload(item, UNQUOTE_SPLICING_SYM) {
                segments.push(inner.clone());
            } else {
                let quoted = self.syntax_quote(item, gensyms, span)?;
                segments.push(Form::list(
                    vec![Form::symbol(&format!("{}/list", RT_NS), span), quoted],
                    span,
                ));
            }
        }
        let concat = Form::list(segments, span);
        if wrap == "concat" {
            return Ok(concat);
        }
        Ok(Form::list(
            vec![Form::symbol(&format!("{}/{}", RT_NS, wrap), span), concat],
            span,
        ))
    }

    // ---- tokens and numbers ----------------------------------------------

    fn read_atom(&mut self, span: Span) -> Result<Form, ClatterError> {
        let token = self.read_token();
        if token.is_empty() {
            return Err(self.err(
                ReaderErrorKind::InvalidDispatchChar,
                format!("unexpected character '{}'", self.current()),
            ));
        }
        match token.as_str() {
            "nil" => return Ok(Form::nil(span)),
            "true" => return Ok(Form::new(FormKind::Bool(true), span)),
            "false" => return Ok(Form::new(FormKind::Bool(false), span)),
            _ => {}
        }
        if starts_number(&token) {
            let kind = parse_number(&token).ok_or_else(|| {
                self.err(
                    ReaderErrorKind::InvalidNumber,
                    format!("invalid number literal '{}'", token),
                )
            })?;
            return Ok(Form::new(kind, span));
        }
        if let Some(rest) = token.strip_prefix('%') {
            if let Some(args) = self.anon_args.as_mut() {
                if rest.is_empty() {
                    args.max = args.max.max(1);
                    return Ok(Form::symbol("%1", span));
                }
                if rest == "&" {
                    args.rest = true;
                    return Ok(Form::symbol("%&", span));
                }
                if let Ok(n) = rest.parse::<usize>() {
                    if n == 0 {
                        return Err(self.err(
                            ReaderErrorKind::UnsupportedArg,
                            "%0 is not a valid fn arg",
                        ));
                    }
                    args.max = args.max.max(n);
                    return Ok(Form::symbol(&token, span));
                }
            } else if rest == "&" || rest.parse::<usize>().is_ok() {
                return Err(self.err(
                    ReaderErrorKind::UnsupportedArg,
                    format!("fn arg {} used outside #()", token),
                ));
            }
        }
        Ok(Form::new(FormKind::Symbol(Symbol::parse(&token)), span))
    }

    fn read_token(&mut self) -> String {
        let mut buf = String::new();
        while !self.eof() {
            let ch = self.current();
            if is_ws(ch) || is_delimiter(ch) {
                break;
            }
            buf.push(ch);
            self.advance();
        }
        buf
    }

    // ---- low level -------------------------------------------------------

    fn skip_ws_and_comments(&mut self) {
        loop {
            while !self.eof() && is_ws(self.current()) {
                self.advance();
            }
            if !self.eof() && self.current() == ';' {
                while !self.eof() && self.current() != '\n' {
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
            index: self.index,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.chars.len()
    }

    fn current(&self) -> char {
        self.chars[self.index]
    }

    fn advance(&mut self) {
        if let Some(&ch) = self.chars.get(self.index) {
            self.index += 1;
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }

    fn err(&self, kind: ReaderErrorKind, message: impl Into<String>) -> ClatterError {
        ClatterError::reader(kind, message)
            .with_span(self.span())
            .with_file(self.options.file.clone())
    }
}

/// Reads every form in `source`, threading an accumulator through `f`.
pub fn read_fold<T, F>(
    mut f: F,
    source: &str,
    options: ReaderOptions,
    mut acc: T,
) -> Result<T, ClatterError>
where
    F: FnMut(Form, T) -> Result<T, ClatterError>,
{
    let mut reader = Reader::with_options(source, options);
    while let Some(form) = reader.read_one()? {
        acc = f(form, acc)?;
    }
    Ok(acc)
}

fn unquote_payload<'a>(form: &'a Form, head: &str) -> Option<&'a Form> {
    let items = form.as_list()?;
    match items {
        [first, payload] if matches!(&first.kind, FormKind::Symbol(sym) if sym.to_string() == head) => {
            Some(payload)
        }
        _ => None,
    }
}

fn is_ws(ch: char) -> bool {
    ch.is_whitespace() || ch == ','
}

fn is_delimiter(ch: char) -> bool {
    matches!(ch, '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';')
}

fn starts_number(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('+') | Some('-') => matches!(chars.next(), Some(c) if c.is_ascii_digit()),
        _ => false,
    }
}

/// Parses one numeric token. Returns `None` when the token is not a valid
/// number, which the reader reports as `InvalidNumber` (tokens are committed
/// as numeric once they start with a digit).
fn parse_number(token: &str) -> Option<FormKind> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    if body.is_empty() {
        return None;
    }

    // ratio: a/b over decimal integers
    if let Some((numer, denom)) = body.split_once('/') {
        if !numer.is_empty()
            && !denom.is_empty()
            && numer.chars().all(|c| c.is_ascii_digit())
            && denom.chars().all(|c| c.is_ascii_digit())
        {
            let mut n = BigInt::from_str_radix(numer, 10).ok()?;
            let d = BigInt::from_str_radix(denom, 10).ok()?;
            if d == BigInt::from(0) {
                return None;
            }
            if negative {
                n = -n;
            }
            return Some(FormKind::Ratio(BigRational::new(n, d)));
        }
        return None;
    }

    // big decimal: trailing M on an integer or float body
    if let Some(mantissa) = body.strip_suffix('M') {
        let text = if negative {
            format!("-{}", mantissa)
        } else {
            mantissa.to_string()
        };
        return text.parse::<bigdecimal::BigDecimal>().ok().map(FormKind::BigDecimal);
    }

    // big integer: trailing N
    if let Some(digits) = body.strip_suffix('N') {
        let value = parse_radix_int(digits)?;
        return Some(FormKind::BigInt(if negative { -value } else { value }));
    }

    let is_float = body.contains('.')
        || ((body.contains('e') || body.contains('E'))
            && !body.contains('x')
            && !body.contains('X')
            && !body.contains('r')
            && !body.contains('R'));
    if is_float {
        return token.parse::<f64>().ok().map(FormKind::Float);
    }

    let value = parse_radix_int(body)?;
    let value = if negative { -value } else { value };
    match i64::try_from(&value) {
        Ok(small) => Some(FormKind::Int(small)),
        Err(_) => Some(FormKind::BigInt(value)),
    }
}

/// Decimal, `0x` hex, leading-zero octal, and `NrDIGITS` radix forms.
fn parse_radix_int(body: &str) -> Option<BigInt> {
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        return BigInt::from_str_radix(hex, 16).ok();
    }
    if let Some(idx) = body.find(['r', 'R']) {
        let radix: u32 = body[..idx].parse().ok()?;
        if !(2..=36).contains(&radix) {
            return None;
        }
        let digits = &body[idx + 1..];
        if digits.is_empty() {
            return None;
        }
        return BigInt::from_str_radix(digits, radix).ok();
    }
    if body.len() > 1 && body.starts_with('0') && body.chars().all(|c| c.is_ascii_digit()) {
        return BigInt::from_str_radix(&body[1..], 8).ok();
    }
    if body.chars().all(|c| c.is_ascii_digit()) {
        return BigInt::from_str_radix(body, 10).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(src: &str) -> Form {
        Reader::new(src).read_one().unwrap().unwrap()
    }

    #[test]
    fn numbers_parse_into_the_full_tower() {
        assert_eq!(read("42").kind, FormKind::Int(42));
        assert_eq!(read("-7").kind, FormKind::Int(-7));
        assert_eq!(read("2r101").kind, FormKind::Int(5));
        assert_eq!(read("0x10").kind, FormKind::Int(16));
        assert_eq!(read("017").kind, FormKind::Int(15));
        assert!(matches!(read("9N").kind, FormKind::BigInt(_)));
        assert!(matches!(read("1/3").kind, FormKind::Ratio(_)));
        assert!(matches!(read("1.5M").kind, FormKind::BigDecimal(_)));
        assert!(matches!(read("1e3").kind, FormKind::Float(_)));
        // literals past i64 promote
        assert!(matches!(
            read("92233720368547758080").kind,
            FormKind::BigInt(_)
        ));
    }

    #[test]
    fn invalid_number_is_a_reader_error() {
        let err = Reader::new("12abc").read_one().unwrap_err();
        assert_eq!(err.reader_kind(), Some(ReaderErrorKind::InvalidNumber));
    }

    #[test]
    fn auto_gensyms_are_stable_within_one_syntax_quote() {
        let form = read("`(let* [x# 1] x#)");
        let printed = form.to_string();
        let first = printed.find("x__").unwrap();
        let last = printed.rfind("x__").unwrap();
        assert_ne!(first, last);
        assert_eq!(
            printed[first..].split(')').next(),
            printed[last..].split(')').next()
        );
    }

    #[test]
    fn unquote_is_preserved_as_a_list_form() {
        let form = read("~x");
        let items = form.as_list().unwrap();
        assert_eq!(items[0].as_symbol().unwrap().to_string(), UNQUOTE_SYM);
        assert_eq!(items[1].as_symbol().unwrap().name, "x");
    }
}
