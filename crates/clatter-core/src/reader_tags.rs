use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use once_cell::sync::Lazy;

use crate::ast::{Form, FormKind, Span, Symbol};
use crate::error::{ClatterError, ReaderErrorKind};
use crate::reader::TagHandler;

static DEFAULT_READERS: Lazy<HashMap<String, TagHandler>> = Lazy::new(|| {
    let mut handlers: HashMap<String, TagHandler> = HashMap::new();
    handlers.insert("inst".to_string(), Arc::new(read_inst));
    handlers.insert("uuid".to_string(), Arc::new(read_uuid));
    handlers
});

/// Built-in data readers: `#inst` and `#uuid`. Callers extend the returned
/// map with their own `data_readers`.
pub fn default_data_readers() -> HashMap<String, TagHandler> {
    DEFAULT_READERS.clone()
}

fn read_inst(value: &Form, span: Span) -> Result<Form, ClatterError> {
    let text = match &value.kind {
        FormKind::String(s) => s,
        _ => {
            return Err(tag_err(span, "#inst expects a string literal"));
        }
    };
    DateTime::parse_from_rfc3339(text)
        .map_err(|e| tag_err(span, format!("#inst \"{}\" is not RFC 3339: {}", text, e)))?;
    Ok(tagged("inst", value.clone(), span))
}

fn read_uuid(value: &Form, span: Span) -> Result<Form, ClatterError> {
    let text = match &value.kind {
        FormKind::String(s) => s,
        _ => {
            return Err(tag_err(span, "#uuid expects a string literal"));
        }
    };
    if !is_canonical_uuid(text) {
        return Err(tag_err(
            span,
            format!("#uuid \"{}\" is not in canonical 8-4-4-4-12 form", text),
        ));
    }
    Ok(tagged("uuid", value.clone(), span))
}

fn tagged(tag: &str, value: Form, span: Span) -> Form {
    Form::new(
        FormKind::Tagged {
            tag: Symbol::simple(tag),
            value: Box::new(value),
        },
        span,
    )
}

fn tag_err(span: Span, message: impl Into<String>) -> ClatterError {
    ClatterError::reader(ReaderErrorKind::InvalidDispatchChar, message).with_span(span)
}

fn is_canonical_uuid(text: &str) -> bool {
    let groups: Vec<&str> = text.split('-').collect();
    let widths = [8usize, 4, 4, 4, 12];
    groups.len() == widths.len()
        && groups
            .iter()
            .zip(widths)
            .all(|(g, w)| g.len() == w && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;

    #[test]
    fn inst_and_uuid_validate_their_payload() {
        let form = Reader::new("#inst \"2024-03-01T12:00:00Z\"")
            .read_one()
            .unwrap()
            .unwrap();
        assert!(matches!(form.kind, FormKind::Tagged { .. }));

        assert!(Reader::new("#inst \"not-a-date\"").read_one().is_err());
        assert!(Reader::new("#uuid \"1234\"").read_one().is_err());

        let form = Reader::new("#uuid \"f81d4fae-7dec-11d0-a765-00a0c91e6bf6\"")
            .read_one()
            .unwrap()
            .unwrap();
        assert!(matches!(form.kind, FormKind::Tagged { .. }));
    }
}
