//! Conversational-query classification.
//!
//! A deterministic regex rule engine that decides whether a query refers back
//! to the ongoing conversation and, if so, how: by position ("what did I say
//! first?"), by topic ("what did we discuss?"), or as an overview ("summarize
//! our conversation"). No I/O, no model calls — the pattern sets below are
//! the contract and the confidence ladder is fixed.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a conversational query addresses the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "GENERAL")]
    General,
    #[serde(rename = "POSITIONAL")]
    Positional,
    #[serde(rename = "TOPICAL")]
    Topical,
    #[serde(rename = "OVERVIEW")]
    Overview,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::Positional => "POSITIONAL",
            Self::Topical => "TOPICAL",
            Self::Overview => "OVERVIEW",
        }
    }
}

/// Conversation context accompanying the query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationContext {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "messageCount")]
    pub message_count: Option<u64>,
    #[serde(rename = "hasHistory")]
    pub has_history: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    #[serde(rename = "hasSessionContext")]
    pub has_session_context: bool,
    #[serde(rename = "hasMessageHistory")]
    pub has_message_history: bool,
    #[serde(rename = "messageCount")]
    pub message_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    #[serde(rename = "isConversational")]
    pub is_conversational: bool,
    pub classification: Classification,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(rename = "contextInfo")]
    pub context_info: ContextInfo,
}

fn patterns(list: &[&str]) -> Vec<Regex> {
    list.iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("valid classifier pattern"))
        .collect()
}

/// Explicit references to something already said.
static DISCOURSE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\bas (you|i|we) (said|mentioned|discussed)\b",
        r"\blike (you|i|we) (said|mentioned)\b",
        r"\bas mentioned (earlier|before|above)\b",
        r"\bas we (discussed|talked about)\b",
    ])
});

/// Questions about a specific position in the conversation.
static POSITIONAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(what|which)\b.*\b(did|was)\b.*\b(i|you|we)\b.*\b(first|last|earlier|before|initially|previously)\b",
        r"\b(first|last|previous) (thing|question|message|point)\b",
        r"\bat the (start|beginning) of (the|this|our) (conversation|chat|session)\b",
        r"\bwhat did (i|you|we) (just|originally) (say|ask|write)\b",
    ])
});

/// Temporal back-references to the conversation.
static TEMPORAL_CONVERSATIONAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(earlier|just now|a (moment|minute) ago)\b.*\b(said|asked|mentioned|told|meant)\b",
        r"\b(said|asked|mentioned|told)\b.*\b(earlier|just now|a (moment|minute) ago|before)\b",
    ])
});

/// Questions about what the conversation covered.
static TOPICAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\bwhat (did|have) we (discuss|discussed|talk about|talked about|cover|covered)\b",
        r"\bwhat (was|were) (the|our) (topics?|conversation) about\b",
        r"\bwhich (topics|subjects) (did|have) we\b",
    ])
});

/// Requests for a digest of the whole conversation.
static OVERVIEW: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(summarize|summarise|recap)\b.*\b(conversation|chat|discussion|session|everything)\b",
        r"\b(summary|overview) of (the|this|our) (conversation|chat|discussion|session)\b",
        r"\bwhat have we covered so far\b",
    ])
});

/// Pronoun-anchored references to something already said.
static CONVERSATIONAL_PRONOUNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(i|you|we)\b.*\b(say|said|ask|asked|tell|told|mention|mentioned|mean|meant)\b",
        r"\b(my|your|our) (question|message|answer|point)\b",
    ])
});

/// Anaphoric references that lean on prior turns.
static ANAPHORA: LazyLock<Vec<Regex>> =
    LazyLock::new(|| patterns(&[r"\b(that|this|it|those)\b"]));

/// Time markers strong enough to anchor a query without session context.
static TEMPORAL_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[r"\b(earlier|just now|a (moment|minute) ago|recently|previously|before)\b"])
});

fn any_match(set: &[Regex], query: &str) -> bool {
    set.iter().any(|p| p.is_match(query))
}

/// Classify a query against its conversation context. First matching rule
/// wins after the context gate.
pub fn classify_query(query: &str, context: &ConversationContext) -> ClassificationResult {
    let has_session_context = context
        .session_id
        .as_deref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    let message_count = context.message_count.unwrap_or(0);
    let has_message_history = message_count > 0 || context.has_history == Some(true);
    let has_conversation_context = has_session_context && has_message_history;

    let context_info = ContextInfo {
        has_session_context,
        has_message_history,
        message_count,
    };

    let query = query.trim();

    if !has_conversation_context {
        // Without a live conversation, only very strong markers count.
        if any_match(&DISCOURSE_MARKERS, query) {
            return ClassificationResult {
                is_conversational: true,
                classification: Classification::Positional,
                confidence: 0.9,
                reasoning: "explicit discourse marker without session context".into(),
                context_info,
            };
        }
        if any_match(&CONVERSATIONAL_PRONOUNS, query) && any_match(&TEMPORAL_MARKERS, query) {
            return ClassificationResult {
                is_conversational: true,
                classification: Classification::Positional,
                confidence: 0.75,
                reasoning: "conversational pronouns with temporal markers, no session context"
                    .into(),
                context_info,
            };
        }
        return ClassificationResult {
            is_conversational: false,
            classification: Classification::General,
            confidence: 0.95,
            reasoning: "no conversation context".into(),
            context_info,
        };
    }

    if any_match(&DISCOURSE_MARKERS, query) {
        return conversational(
            Classification::Positional,
            0.98,
            "explicit discourse marker",
            context_info,
        );
    }
    if any_match(&POSITIONAL, query) || any_match(&TEMPORAL_CONVERSATIONAL, query) {
        return conversational(
            Classification::Positional,
            0.95,
            "positional or temporal back-reference",
            context_info,
        );
    }
    if any_match(&TOPICAL, query) {
        return conversational(
            Classification::Topical,
            0.92,
            "topical reference to the discussion",
            context_info,
        );
    }
    if any_match(&OVERVIEW, query) {
        return conversational(
            Classification::Overview,
            0.90,
            "overview request for the conversation",
            context_info,
        );
    }
    if any_match(&ANAPHORA, query) && any_match(&CONVERSATIONAL_PRONOUNS, query) {
        return conversational(
            Classification::Positional,
            0.85,
            "anaphora with conversational pronouns",
            context_info,
        );
    }
    if any_match(&CONVERSATIONAL_PRONOUNS, query) {
        return ClassificationResult {
            is_conversational: false,
            classification: Classification::General,
            confidence: 0.60,
            reasoning: "conversational pronouns only".into(),
            context_info,
        };
    }

    ClassificationResult {
        is_conversational: false,
        classification: Classification::General,
        confidence: 0.8,
        reasoning: "no conversational markers".into(),
        context_info,
    }
}

fn conversational(
    classification: Classification,
    confidence: f64,
    reasoning: &str,
    context_info: ContextInfo,
) -> ClassificationResult {
    ClassificationResult {
        is_conversational: true,
        classification,
        confidence,
        reasoning: reasoning.into(),
        context_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_context() -> ConversationContext {
        ConversationContext {
            session_id: Some("s1".into()),
            message_count: Some(5),
            has_history: None,
        }
    }

    fn no_context() -> ConversationContext {
        ConversationContext::default()
    }

    #[test]
    fn positional_with_context() {
        let result = classify_query("what did I say first?", &with_context());
        assert!(result.is_conversational);
        assert_eq!(result.classification, Classification::Positional);
        assert!(result.confidence >= 0.90);
    }

    #[test]
    fn same_query_without_context_is_general() {
        let result = classify_query("what did I say first?", &no_context());
        assert_eq!(result.classification, Classification::General);
        assert!(!result.is_conversational);
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn overview_with_context() {
        let result = classify_query("summarize our conversation", &with_context());
        assert_eq!(result.classification, Classification::Overview);
        assert!(result.is_conversational);
        assert!((result.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn discourse_marker_beats_everything() {
        let result = classify_query("as you said, the deploy is on Friday", &with_context());
        assert_eq!(result.classification, Classification::Positional);
        assert!((result.confidence - 0.98).abs() < 1e-9);
    }

    #[test]
    fn topical_with_context() {
        let result = classify_query("what did we discuss about the budget?", &with_context());
        assert_eq!(result.classification, Classification::Topical);
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn anaphora_with_pronouns() {
        let result = classify_query("can you explain that thing you mentioned?", &with_context());
        assert_eq!(result.classification, Classification::Positional);
        assert!((result.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn pronouns_only_is_weak_general() {
        let result = classify_query("do you think i should tell marketing?", &with_context());
        assert_eq!(result.classification, Classification::General);
        assert!((result.confidence - 0.60).abs() < 1e-9);
        assert!(!result.is_conversational);
    }

    #[test]
    fn plain_question_is_general() {
        let result = classify_query("what is the capital of France?", &with_context());
        assert_eq!(result.classification, Classification::General);
        assert!(!result.is_conversational);
    }

    #[test]
    fn discourse_marker_counts_without_context() {
        let result = classify_query("as you said, let's go with option B", &no_context());
        assert!(result.is_conversational);
        assert_eq!(result.classification, Classification::Positional);
    }

    #[test]
    fn pronouns_plus_temporal_count_without_context() {
        let result = classify_query("what did you tell me earlier?", &no_context());
        assert!(result.is_conversational);
    }

    #[test]
    fn session_without_history_is_not_conversation_context() {
        let context = ConversationContext {
            session_id: Some("s1".into()),
            message_count: Some(0),
            has_history: Some(false),
        };
        let result = classify_query("what did I say first?", &context);
        assert_eq!(result.classification, Classification::General);
        assert!(!result.context_info.has_message_history);
    }

    #[test]
    fn has_history_flag_enables_context() {
        let context = ConversationContext {
            session_id: Some("s1".into()),
            message_count: None,
            has_history: Some(true),
        };
        let result = classify_query("what did I say first?", &context);
        assert_eq!(result.classification, Classification::Positional);
    }

    #[test]
    fn context_info_is_reported() {
        let result = classify_query("hello", &with_context());
        assert!(result.context_info.has_session_context);
        assert!(result.context_info.has_message_history);
        assert_eq!(result.context_info.message_count, 5);
    }

    #[test]
    fn classification_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&Classification::Positional).unwrap(),
            "\"POSITIONAL\""
        );
    }
}
