use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::content::ContentPart;

/// Which lifecycle a part id belongs to. Text and reasoning ids live in separate namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartKind {
    Text,
    Reasoning,
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Reasoning => f.write_str("reasoning"),
        }
    }
}

/// An event violated the start → delta* → end lifecycle of a part.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{kind} part {id} not found")]
    UnknownPart { kind: PartKind, id: String },
    #[error("{kind} part {id} already started")]
    DuplicatePart { kind: PartKind, id: String },
}

/// Accumulates the content parts of the step in progress.
///
/// Parts are stored in the order their first event arrived; open ids index
/// into that list so interleaved deltas land on the right part.
#[derive(Debug, Default)]
pub struct ContentAssembler {
    parts: Vec<ContentPart>,
    open: HashMap<(PartKind, String), usize>,
}

impl ContentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &mut self,
        kind: PartKind,
        id: &str,
        provider_metadata: Option<Value>,
    ) -> Result<(), LifecycleError> {
        let key = (kind, id.to_string());
        if self.open.contains_key(&key) {
            return Err(LifecycleError::DuplicatePart {
                kind,
                id: id.to_string(),
            });
        }
        let part = match kind {
            PartKind::Text => ContentPart::Text {
                text: String::new(),
                provider_metadata,
            },
            PartKind::Reasoning => ContentPart::Reasoning {
                text: String::new(),
                provider_metadata,
            },
        };
        self.open.insert(key, self.parts.len());
        self.parts.push(part);
        Ok(())
    }

    /// Appends to an open part. Zero-length deltas are ignored.
    pub fn delta(
        &mut self,
        kind: PartKind,
        id: &str,
        delta: &str,
        provider_metadata: Option<Value>,
    ) -> Result<(), LifecycleError> {
        if delta.is_empty() && provider_metadata.is_none() {
            return Ok(());
        }
        let part = self.open_part(kind, id)?;
        if let ContentPart::Text {
            text,
            provider_metadata: meta,
        }
        | ContentPart::Reasoning {
            text,
            provider_metadata: meta,
        } = part
        {
            text.push_str(delta);
            if provider_metadata.is_some() {
                *meta = provider_metadata;
            }
        }
        Ok(())
    }

    pub fn end(
        &mut self,
        kind: PartKind,
        id: &str,
        provider_metadata: Option<Value>,
    ) -> Result<(), LifecycleError> {
        let part = self.open_part(kind, id)?;
        if provider_metadata.is_some()
            && let ContentPart::Text { provider_metadata: meta, .. }
            | ContentPart::Reasoning { provider_metadata: meta, .. } = part
        {
            *meta = provider_metadata;
        }
        self.open.remove(&(kind, id.to_string()));
        Ok(())
    }

    /// Appends a part that has no lifecycle (tool calls, results, sources, files).
    pub fn push(&mut self, part: ContentPart) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn has_open_parts(&self) -> bool {
        !self.open.is_empty()
    }

    /// Takes the assembled parts and resets for the next step.
    ///
    /// Parts that were never ended keep the text they received.
    pub fn finish_step(&mut self) -> Vec<ContentPart> {
        self.open.clear();
        std::mem::take(&mut self.parts)
    }

    fn open_part(&mut self, kind: PartKind, id: &str) -> Result<&mut ContentPart, LifecycleError> {
        let unknown = || LifecycleError::UnknownPart {
            kind,
            id: id.to_string(),
        };
        let index = *self.open.get(&(kind, id.to_string())).ok_or_else(unknown)?;
        self.parts.get_mut(index).ok_or_else(unknown)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::content::text_of;

    #[test]
    fn interleaved_parts_keep_first_event_order() {
        let mut assembler = ContentAssembler::new();
        assembler.start(PartKind::Text, "a", None).expect("start a");
        assembler.start(PartKind::Text, "b", None).expect("start b");
        assembler.delta(PartKind::Text, "b", "world", None).expect("delta b");
        assembler.delta(PartKind::Text, "a", "hello ", None).expect("delta a");
        assembler.end(PartKind::Text, "a", None).expect("end a");
        assembler.end(PartKind::Text, "b", None).expect("end b");
        assert_eq!(text_of(assembler.parts()), "hello world");
        assert!(!assembler.has_open_parts());
    }

    #[test]
    fn delta_for_unknown_id_is_a_lifecycle_error() {
        let mut assembler = ContentAssembler::new();
        let err = assembler
            .delta(PartKind::Text, "missing", "x", None)
            .expect_err("unknown id");
        assert_eq!(err.to_string(), "text part missing not found");
    }

    #[test]
    fn delta_after_end_is_rejected() {
        let mut assembler = ContentAssembler::new();
        assembler.start(PartKind::Reasoning, "r", None).expect("start");
        assembler.end(PartKind::Reasoning, "r", None).expect("end");
        assert!(matches!(
            assembler.delta(PartKind::Reasoning, "r", "late", None),
            Err(LifecycleError::UnknownPart { .. })
        ));
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mut assembler = ContentAssembler::new();
        assembler.start(PartKind::Text, "a", None).expect("start");
        assert!(matches!(
            assembler.start(PartKind::Text, "a", None),
            Err(LifecycleError::DuplicatePart { .. })
        ));
    }

    #[test]
    fn empty_delta_is_ignored_even_for_unknown_id() {
        let mut assembler = ContentAssembler::new();
        assert!(assembler.delta(PartKind::Text, "nope", "", None).is_ok());
        assert!(assembler.parts().is_empty());
    }

    #[test]
    fn provider_metadata_is_last_write_wins() {
        let mut assembler = ContentAssembler::new();
        assembler
            .start(PartKind::Text, "a", Some(json!({"v": 1})))
            .expect("start");
        assembler
            .delta(PartKind::Text, "a", "x", Some(json!({"v": 2})))
            .expect("delta");
        assembler
            .end(PartKind::Text, "a", Some(json!({"v": 3})))
            .expect("end");
        let parts = assembler.finish_step();
        assert_eq!(
            parts[0],
            ContentPart::Text {
                text: "x".into(),
                provider_metadata: Some(json!({"v": 3})),
            }
        );
        assert!(assembler.parts().is_empty());
    }

    #[test]
    fn unterminated_parts_keep_received_text() {
        let mut assembler = ContentAssembler::new();
        assembler.start(PartKind::Text, "a", None).expect("start");
        assembler.delta(PartKind::Text, "a", "partial", None).expect("delta");
        assert!(assembler.has_open_parts());
        assert_eq!(text_of(&assembler.finish_step()), "partial");
    }
}
