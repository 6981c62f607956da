//! Rule-based name cleaning and validation, no external service involved.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use larder_shared::{EnrichedRecord, NameValidator, RecipeMeta, Result, Verdict};

static PREFIXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^아삭하고\s*맛있는\s*",
        r"^초간단\s*",
        r"^초스피드\s*",
        r"^간단한?\s*",
        r"^맛있는\s*",
        r"^따뜻한\s*",
        r"^시원한\s*",
        r"^쉬운\s*",
        r"^만능\s*",
        r"^꿀맛\s*",
        r"^대박\s*",
        r"^존맛\s*",
        r"^\d+분\s*",
        r"^\d+색\s*",
        r"^HACCP\s*",
    ])
});

static SUFFIXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\s*황금\s*레시피$",
        r"\s*만들기$",
        r"\s*레시피$",
        r"\s*만드는\s*법$",
        r"\s*꿀팁$",
    ])
});

static SOURCES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^\[([^\]]+)\]\s*",
        r"^([가-힣]+)의\s+",
        r"^([가-힣]+)표\s+",
    ])
});

static DECORATION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[!~♥♡★☆]").ok());

/// Names that describe a collection rather than one dish.
static COLLECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"모음|\d+\s*가지|\d+\s*종").ok());

static SERVINGS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+인분(?:\s*이상)?)").ok());
static COOK_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+분\s*이내|\d+시간\s*이내|\d+시간\s*이상)").ok());
static DIFFICULTY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(아무나|초급|중급|고급|신의경지)").ok());

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Split a leading attribution off a title.
///
/// `"백종원의 김치찌개"` → `("김치찌개", Some("백종원"))`.
pub fn split_attribution(title: &str) -> (String, Option<String>) {
    let title = title.trim();
    for pattern in SOURCES.iter() {
        if let Some(caps) = pattern.captures(title) {
            let source = caps.get(1).map(|m| m.as_str().trim().to_string());
            let rest = pattern.replace(title, "").trim().to_string();
            if !rest.is_empty() {
                return (rest, source);
            }
        }
    }
    (title.to_string(), None)
}

/// Strip promotional modifiers, attribution and decoration from a dish name.
pub fn clean_name(name: &str) -> String {
    let (mut name, _) = split_attribution(name);
    if let Some(decoration) = DECORATION.as_ref() {
        name = decoration.replace_all(&name, "").into_owned();
    }
    name = name.split_whitespace().collect::<Vec<_>>().join(" ");

    // Modifiers can stack ("초간단 맛있는 ..."), so repeat until stable.
    loop {
        let before = name.clone();
        for pattern in PREFIXES.iter() {
            name = pattern.replace(&name, "").into_owned();
        }
        for pattern in SUFFIXES.iter() {
            name = pattern.replace(&name, "").into_owned();
        }
        name = name.trim().to_string();
        if name == before {
            return name;
        }
    }
}

/// Whether a name reads like a collection of several dishes.
pub fn is_collection_name(name: &str) -> bool {
    COLLECTION.as_ref().is_some_and(|re| re.is_match(name))
}

/// Pull servings, cook time and difficulty out of a free-text description.
pub fn parse_meta(description: &str) -> RecipeMeta {
    let capture = |pattern: &Option<Regex>| {
        pattern
            .as_ref()?
            .captures(description)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    RecipeMeta {
        servings: capture(&SERVINGS),
        cook_time: capture(&COOK_TIME),
        difficulty: capture(&DIFFICULTY),
    }
}

/// [`NameValidator`] built from the cleaning rules above.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedValidator;

#[async_trait]
impl NameValidator for RuleBasedValidator {
    async fn validate(&self, record: &EnrichedRecord) -> Result<Verdict> {
        let cleaned = clean_name(&record.canonical_name);
        if cleaned.is_empty() || is_collection_name(&cleaned) {
            return Ok(Verdict::Delete);
        }
        if cleaned == record.canonical_name {
            Ok(Verdict::Keep)
        } else {
            Ok(Verdict::Modify(cleaned))
        }
    }
}
