//! DT-004: Canonical dictionary and tier classification.
//!
//! Normalized terms are looked up in three disjoint maps:
//! state names (Tier A), region aliases (Tier B), and business predicates
//! (Tier B). Anything else is Tier C and is never guessed.

use crate::core::types::{FilterOperator, Suggestion, Tier};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

pub const BUILTIN_DICT_VERSION: &str = "canonical_dict_v1";

/// Maximum suggestions returned for a Tier-C term.
const MAX_SUGGESTIONS: usize = 3;

/// Returned when nothing in the dictionary resembles the term.
const FALLBACK_SUGGESTIONS: [&str; 3] = ["SOUTHEAST", "SOUTHWEST", "MIDWEST"];

const COMPANY_COLUMN_PATTERNS: [&str; 4] =
    ["company", "company_name", "business_name", "ship_to_company"];

const STATES: [(&str, &str); 50] = [
    ("alabama", "AL"),
    ("alaska", "AK"),
    ("arizona", "AZ"),
    ("arkansas", "AR"),
    ("california", "CA"),
    ("colorado", "CO"),
    ("connecticut", "CT"),
    ("delaware", "DE"),
    ("florida", "FL"),
    ("georgia", "GA"),
    ("hawaii", "HI"),
    ("idaho", "ID"),
    ("illinois", "IL"),
    ("indiana", "IN"),
    ("iowa", "IA"),
    ("kansas", "KS"),
    ("kentucky", "KY"),
    ("louisiana", "LA"),
    ("maine", "ME"),
    ("maryland", "MD"),
    ("massachusetts", "MA"),
    ("michigan", "MI"),
    ("minnesota", "MN"),
    ("mississippi", "MS"),
    ("missouri", "MO"),
    ("montana", "MT"),
    ("nebraska", "NE"),
    ("nevada", "NV"),
    ("new hampshire", "NH"),
    ("new jersey", "NJ"),
    ("new mexico", "NM"),
    ("new york", "NY"),
    ("north carolina", "NC"),
    ("north dakota", "ND"),
    ("ohio", "OH"),
    ("oklahoma", "OK"),
    ("oregon", "OR"),
    ("pennsylvania", "PA"),
    ("rhode island", "RI"),
    ("south carolina", "SC"),
    ("south dakota", "SD"),
    ("tennessee", "TN"),
    ("texas", "TX"),
    ("utah", "UT"),
    ("vermont", "VT"),
    ("virginia", "VA"),
    ("washington", "WA"),
    ("west virginia", "WV"),
    ("wisconsin", "WI"),
    ("wyoming", "WY"),
];

const REGIONS: [(&str, &[&str]); 10] = [
    (
        "NORTHEAST",
        &["NY", "MA", "CT", "PA", "NJ", "ME", "NH", "RI", "VT"],
    ),
    ("NEW_ENGLAND", &["ME", "NH", "VT", "MA", "RI", "CT"]),
    ("MID_ATLANTIC", &["NY", "NJ", "PA", "DE", "MD", "DC"]),
    (
        "SOUTHEAST",
        &[
            "VA", "WV", "NC", "SC", "GA", "FL", "KY", "TN", "AL", "MS", "AR", "LA",
        ],
    ),
    (
        "MIDWEST",
        &[
            "OH", "MI", "IN", "IL", "WI", "MN", "IA", "MO", "ND", "SD", "NE", "KS",
        ],
    ),
    ("SOUTHWEST", &["TX", "OK", "NM", "AZ"]),
    ("WEST", &["MT", "WY", "CO", "ID", "UT", "NV"]),
    ("WEST_COAST", &["WA", "OR", "CA"]),
    ("PACIFIC", &["HI", "AK"]),
    (
        "ALL_US",
        &[
            "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN",
            "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV",
            "NH", "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN",
            "TX", "UT", "VT", "VA", "WA", "WV", "WI", "WY", "DC", "PR",
        ],
    ),
];

const REGION_ALIASES: [(&str, &str); 25] = [
    ("northeast", "NORTHEAST"),
    ("the northeast", "NORTHEAST"),
    ("northeastern", "NORTHEAST"),
    ("new england", "NEW_ENGLAND"),
    ("mid atlantic", "MID_ATLANTIC"),
    ("midatlantic", "MID_ATLANTIC"),
    ("southeast", "SOUTHEAST"),
    ("the southeast", "SOUTHEAST"),
    ("southeastern", "SOUTHEAST"),
    ("midwest", "MIDWEST"),
    ("the midwest", "MIDWEST"),
    ("midwestern", "MIDWEST"),
    ("southwest", "SOUTHWEST"),
    ("the southwest", "SOUTHWEST"),
    ("southwestern", "SOUTHWEST"),
    ("west", "WEST"),
    ("the west", "WEST"),
    ("western", "WEST"),
    ("west coast", "WEST_COAST"),
    ("the west coast", "WEST_COAST"),
    ("pacific", "PACIFIC"),
    ("the pacific", "PACIFIC"),
    ("all us", "ALL_US"),
    ("all states", "ALL_US"),
    ("nationwide", "ALL_US"),
];

// ============================================================================
// Normalization
// ============================================================================

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Casefold, turn `-`/`_`/`/` into spaces, drop other punctuation,
/// collapse whitespace.
pub fn normalize_term(term: &str) -> String {
    let mapped: String = term
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '-' | '_' | '/' => Some(' '),
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => None,
        })
        .collect();
    WHITESPACE_RUN
        .replace_all(&mapped, " ")
        .trim()
        .to_string()
}

// ============================================================================
// Dictionary
// ============================================================================

/// How a business predicate expands onto its matched column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateExpansion {
    IsBlank,
    IsNotBlank,
}

impl PredicateExpansion {
    pub fn operator(&self) -> FilterOperator {
        match self {
            Self::IsBlank => FilterOperator::IsBlank,
            Self::IsNotBlank => FilterOperator::IsNotBlank,
        }
    }
}

/// A heuristic predicate over whichever schema column matches a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessPredicate {
    pub column_patterns: Vec<String>,
    pub expansion: PredicateExpansion,
    pub description: String,
}

/// Versioned term dictionary. Deserializable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDictionary {
    pub version: String,
    /// Normalized full state name to 2-letter code.
    pub states: BTreeMap<String, String>,
    /// Region key to member state codes.
    pub regions: IndexMap<String, Vec<String>>,
    /// Normalized alias to region key.
    pub region_aliases: BTreeMap<String, String>,
    /// Predicate key to definition.
    pub predicates: IndexMap<String, BusinessPredicate>,
}

/// Classification of a term against the dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum TermClass<'a> {
    State {
        code: &'a str,
    },
    Region {
        key: &'a str,
        states: &'a [String],
    },
    Predicate {
        key: &'a str,
        predicate: &'a BusinessPredicate,
    },
    Unknown,
}

impl TermClass<'_> {
    pub fn tier(&self) -> Tier {
        match self {
            TermClass::State { .. } => Tier::A,
            TermClass::Region { .. } | TermClass::Predicate { .. } => Tier::B,
            TermClass::Unknown => Tier::C,
        }
    }
}

impl CanonicalDictionary {
    /// The compiled-in US dictionary.
    pub fn builtin() -> Self {
        let patterns: Vec<String> = COMPANY_COLUMN_PATTERNS.iter().map(|s| s.to_string()).collect();
        let mut predicates = IndexMap::new();
        predicates.insert(
            "BUSINESS_RECIPIENT".to_string(),
            BusinessPredicate {
                column_patterns: patterns.clone(),
                expansion: PredicateExpansion::IsNotBlank,
                description: "rows where the company name is populated".to_string(),
            },
        );
        predicates.insert(
            "PERSONAL_RECIPIENT".to_string(),
            BusinessPredicate {
                column_patterns: patterns,
                expansion: PredicateExpansion::IsBlank,
                description: "rows where the company name is empty".to_string(),
            },
        );

        Self {
            version: BUILTIN_DICT_VERSION.to_string(),
            states: STATES
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect(),
            regions: REGIONS
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            region_aliases: REGION_ALIASES
                .iter()
                .map(|(a, k)| (a.to_string(), k.to_string()))
                .collect(),
            predicates,
        }
    }

    /// Parse and validate a dictionary from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let mut dict: CanonicalDictionary =
            serde_yaml_ng::from_str(yaml).map_err(|e| format!("dictionary parse error: {}", e))?;
        dict.states = std::mem::take(&mut dict.states)
            .into_iter()
            .map(|(k, v)| (normalize_term(&k), v))
            .collect();
        dict.region_aliases = std::mem::take(&mut dict.region_aliases)
            .into_iter()
            .map(|(k, v)| (normalize_term(&k), v))
            .collect();
        let errors = dict.validate();
        if !errors.is_empty() {
            return Err(format!("invalid dictionary: {}", errors.join("; ")));
        }
        Ok(dict)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Disjointness and referential checks. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.version.trim().is_empty() {
            errors.push("version must not be empty".to_string());
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut claim = |term: String, map: &str, errors: &mut Vec<String>| {
            if !seen.insert(term.clone()) {
                errors.push(format!("term '{}' in {} overlaps another map", term, map));
            }
        };
        for name in self.states.keys() {
            claim(normalize_term(name), "states", &mut errors);
        }
        for alias in self.region_aliases.keys() {
            claim(normalize_term(alias), "region_aliases", &mut errors);
        }
        for key in self.predicates.keys() {
            claim(normalize_term(key), "predicates", &mut errors);
        }

        for (alias, region) in &self.region_aliases {
            if !self.regions.contains_key(region) {
                errors.push(format!(
                    "alias '{}' points at undefined region '{}'",
                    alias, region
                ));
            }
        }
        for (key, states) in &self.regions {
            if states.is_empty() {
                errors.push(format!("region '{}' has no states", key));
            }
        }
        for (key, p) in &self.predicates {
            if p.column_patterns.is_empty() {
                errors.push(format!("predicate '{}' has no column patterns", key));
            }
        }
        errors
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Look a raw term up. Region keys (`NEW_ENGLAND`) normalize onto
    /// their aliases (`new england`).
    pub fn classify(&self, term: &str) -> TermClass<'_> {
        let normalized = normalize_term(term);

        if let Some(code) = self.states.get(&normalized) {
            return TermClass::State { code };
        }

        if let Some(region_key) = self.region_aliases.get(&normalized) {
            if let Some((key, states)) = self.regions.get_key_value(region_key) {
                return TermClass::Region { key, states };
            }
        }

        if let Some((key, predicate)) = self
            .predicates
            .iter()
            .find(|(k, _)| normalize_term(k) == normalized)
        {
            return TermClass::Predicate { key, predicate };
        }

        TermClass::Unknown
    }

    /// Ranked alternatives for a Tier-C term. Always returns 2 or 3.
    pub fn suggest(&self, term: &str) -> Vec<Suggestion> {
        let normalized = normalize_term(term);
        let words: HashSet<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();

        let mut best: BTreeMap<String, usize> = BTreeMap::new();
        let mut score_candidate = |key: &str, phrase: &str| {
            let shared = phrase.split(' ').filter(|w| words.contains(w)).count();
            let prefix = common_prefix_len(&normalized, phrase);
            let score = shared * 100 + if prefix >= 3 { prefix } else { 0 };
            if score > 0 {
                let entry = best.entry(key.to_string()).or_insert(0);
                *entry = (*entry).max(score);
            }
        };
        for (alias, region) in &self.region_aliases {
            score_candidate(region, alias);
        }
        for key in self.predicates.keys() {
            score_candidate(key, &normalize_term(key));
        }
        for (name, code) in &self.states {
            score_candidate(code, name);
        }

        let mut ranked: Vec<(String, usize)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut keys: Vec<String> = ranked
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(k, _)| k)
            .collect();
        for fallback in FALLBACK_SUGGESTIONS {
            if keys.len() >= MAX_SUGGESTIONS {
                break;
            }
            if !keys.iter().any(|k| k == fallback) {
                keys.push(fallback.to_string());
            }
        }

        keys.into_iter()
            .map(|key| {
                let description = self.describe_key(&key);
                Suggestion { key, description }
            })
            .collect()
    }

    fn describe_key(&self, key: &str) -> String {
        if let Some(states) = self.regions.get(key) {
            return format!("region {} ({} states: {})", key, states.len(), states.join(", "));
        }
        if let Some(p) = self.predicates.get(key) {
            return p.description.clone();
        }
        if let Some((name, _)) = self.states.iter().find(|(_, c)| c.as_str() == key) {
            return format!("state {} ({})", key, name);
        }
        key.to_string()
    }
}

impl Default for CanonicalDictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt004_normalize() {
        assert_eq!(normalize_term("  The   North-East. "), "the north east");
        assert_eq!(normalize_term("NEW_ENGLAND"), "new england");
        assert_eq!(normalize_term("Mid-Atlantic!"), "mid atlantic");
        assert_eq!(normalize_term("Business_Recipient"), "business recipient");
    }

    #[test]
    fn test_dt004_builtin_is_valid() {
        let dict = CanonicalDictionary::builtin();
        assert!(dict.validate().is_empty(), "{:?}", dict.validate());
        assert_eq!(dict.states.len(), 50);
        assert_eq!(dict.regions["NORTHEAST"].len(), 9);
        assert_eq!(dict.regions["ALL_US"].len(), 52);
    }

    #[test]
    fn test_dt004_classify_tiers() {
        let dict = CanonicalDictionary::builtin();
        assert_eq!(dict.classify("California"), TermClass::State { code: "CA" });
        assert_eq!(dict.classify("new york").tier(), Tier::A);

        match dict.classify("NORTHEAST") {
            TermClass::Region { key, states } => {
                assert_eq!(key, "NORTHEAST");
                assert_eq!(states.len(), 9);
            }
            other => panic!("expected region, got {:?}", other),
        }
        assert_eq!(dict.classify("the Mid-Atlantic").tier(), Tier::B);
        assert_eq!(dict.classify("business recipient").tier(), Tier::B);
        assert_eq!(dict.classify("BUSINESS_RECIPIENT").tier(), Tier::B);
        assert_eq!(dict.classify("the moon").tier(), Tier::C);
    }

    #[test]
    fn test_dt004_suggest_overlap() {
        let dict = CanonicalDictionary::builtin();
        let s = dict.suggest("northeast coast");
        assert!((2..=3).contains(&s.len()));
        let keys: Vec<&str> = s.iter().map(|x| x.key.as_str()).collect();
        assert!(keys.contains(&"NORTHEAST"));
        assert!(keys.contains(&"WEST_COAST"));
    }

    #[test]
    fn test_dt004_suggest_fallback() {
        let dict = CanonicalDictionary::builtin();
        let s = dict.suggest("zzz");
        let keys: Vec<&str> = s.iter().map(|x| x.key.as_str()).collect();
        assert_eq!(keys, vec!["SOUTHEAST", "SOUTHWEST", "MIDWEST"]);
        assert!(s[0].description.contains("12 states"));
    }

    #[test]
    fn test_dt004_suggest_deterministic() {
        let dict = CanonicalDictionary::builtin();
        assert_eq!(dict.suggest("the south"), dict.suggest("the south"));
    }

    #[test]
    fn test_dt004_yaml_rejects_overlap() {
        let yaml = r#"
version: test_v1
states:
  georgia: GA
regions:
  SOUTH: [GA]
region_aliases:
  georgia: SOUTH
predicates: {}
"#;
        let err = CanonicalDictionary::from_yaml(yaml).unwrap_err();
        assert!(err.contains("overlaps"), "{}", err);
    }

    #[test]
    fn test_dt004_yaml_rejects_dangling_alias() {
        let yaml = r#"
version: test_v1
states: {}
regions: {}
region_aliases:
  down south: SOUTH
predicates: {}
"#;
        let err = CanonicalDictionary::from_yaml(yaml).unwrap_err();
        assert!(err.contains("undefined region"), "{}", err);
    }

    #[test]
    fn test_dt004_yaml_roundtrip_builtin() {
        let dict = CanonicalDictionary::builtin();
        let yaml = serde_yaml_ng::to_string(&dict).unwrap();
        let back = CanonicalDictionary::from_yaml(&yaml).unwrap();
        assert_eq!(back, dict);
    }
}
