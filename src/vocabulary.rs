use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use tracing::info;

// Include the default vocabulary at compile time
const DEFAULT_VOCABULARY_BYTES: &[u8] = include_bytes!("../default_tag_vocabulary.txt");

/// File looked up in the working directory when no vocabulary is given.
pub const DEFAULT_VOCABULARY_FILE: &str = "tag_vocabulary.txt";

/// Highest vocabulary format version this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// What a tag is used for once a URL has been labeled with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRole {
    /// Counted per path and fed to the model.
    Feature,
    /// Its presence anywhere in a path marks the path as converted.
    PurchaseIntent,
    /// Accepted by the parser, rejected by validation.
    Both,
    /// Labels URLs without taking part in counting or outcomes.
    Neither,
}

impl FromStr for TagRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(TagRole::Feature),
            "purchase-intent" => Ok(TagRole::PurchaseIntent),
            "both" => Ok(TagRole::Both),
            "neither" => Ok(TagRole::Neither),
            other => anyhow::bail!(
                "Unknown tag role '{}' (expected feature, purchase-intent, both or neither)",
                other
            ),
        }
    }
}

impl fmt::Display for TagRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TagRole::Feature => "feature",
            TagRole::PurchaseIntent => "purchase-intent",
            TagRole::Both => "both",
            TagRole::Neither => "neither",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDefinition {
    pub tag: String,
    pub role: TagRole,
}

impl TagDefinition {
    pub fn new(tag: impl Into<String>, role: TagRole) -> Self {
        Self {
            tag: tag.into(),
            role,
        }
    }
}

/// The shared tag configuration handed to every stage.
///
/// Construction validates it, so holding a `TagVocabulary` means the feature
/// and purchase-intent sets are non-empty and disjoint.
#[derive(Debug, Clone)]
pub struct TagVocabulary {
    version: u32,
    definitions: Vec<TagDefinition>,
    match_order: Vec<String>,
    features: Vec<String>,
    purchase_tags: Vec<String>,
}

impl TagVocabulary {
    pub fn new(version: u32, definitions: Vec<TagDefinition>) -> Result<Self> {
        if version == 0 || version > SUPPORTED_VERSION {
            anyhow::bail!(
                "Unsupported vocabulary version {} (this build supports up to {})",
                version,
                SUPPORTED_VERSION
            );
        }
        if definitions.is_empty() {
            anyhow::bail!("Tag vocabulary is empty");
        }

        let mut seen = HashSet::new();
        for def in &definitions {
            let malformed = def.tag.is_empty()
                || def.tag.contains('/')
                || def.tag.contains(char::is_whitespace);
            if malformed {
                anyhow::bail!(
                    "Invalid tag '{}': tags must be a single non-empty URL segment",
                    def.tag
                );
            }
            if !seen.insert(def.tag.as_str()) {
                anyhow::bail!("Duplicate tag '{}' in vocabulary", def.tag);
            }
            if def.role == TagRole::Both {
                anyhow::bail!(
                    "Tag '{}' has role '{}': feature and purchase-intent tags must be disjoint",
                    def.tag,
                    def.role
                );
            }
        }

        let features: Vec<String> = definitions
            .iter()
            .filter(|d| d.role == TagRole::Feature)
            .map(|d| d.tag.clone())
            .collect();
        let purchase_tags: Vec<String> = definitions
            .iter()
            .filter(|d| d.role == TagRole::PurchaseIntent)
            .map(|d| d.tag.clone())
            .collect();

        if features.is_empty() {
            anyhow::bail!("Tag vocabulary declares no feature tags");
        }
        if purchase_tags.is_empty() {
            anyhow::bail!("Tag vocabulary declares no purchase-intent tags");
        }

        // Longest first; sort_by_key is stable so equal lengths keep declared order
        let mut match_order: Vec<String> = definitions.iter().map(|d| d.tag.clone()).collect();
        match_order.sort_by_key(|tag| std::cmp::Reverse(tag.chars().count()));

        Ok(Self {
            version,
            definitions,
            match_order,
            features,
            purchase_tags,
        })
    }

    /// Parse the line-oriented vocabulary format.
    pub fn parse(content: &str) -> Result<Self> {
        let version_re = Regex::new(r"^version\s+(\d+)$")?;
        let entry_re = Regex::new(r"^(\S+)\s+(\S+)$")?;

        let mut version = None;
        let mut definitions = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(captures) = version_re.captures(line) {
                if version.is_some() {
                    anyhow::bail!("Duplicate version directive at line {}", line_num + 1);
                }
                let value = captures[1]
                    .parse::<u32>()
                    .with_context(|| format!("Invalid version at line {}", line_num + 1))?;
                version = Some(value);
                continue;
            }

            if version.is_none() {
                anyhow::bail!(
                    "Tag vocabulary must start with a version directive (line {})",
                    line_num + 1
                );
            }

            let Some(captures) = entry_re.captures(line) else {
                anyhow::bail!(
                    "Invalid vocabulary entry at line {}: expected '<tag> <role>'",
                    line_num + 1
                );
            };
            let role = captures[2]
                .parse::<TagRole>()
                .with_context(|| format!("Invalid vocabulary entry at line {}", line_num + 1))?;
            definitions.push(TagDefinition::new(&captures[1], role));
        }

        let Some(version) = version else {
            anyhow::bail!("Tag vocabulary has no version directive");
        };
        Self::new(version, definitions)
    }

    /// The vocabulary compiled into the binary.
    pub fn embedded() -> Result<Self> {
        let content = std::str::from_utf8(DEFAULT_VOCABULARY_BYTES)
            .context("Failed to decode embedded default vocabulary")?;
        Self::parse(content)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn definitions(&self) -> &[TagDefinition] {
        &self.definitions
    }

    /// Every tag, longest first, in the order the labeler tries them.
    pub fn match_order(&self) -> &[String] {
        &self.match_order
    }

    /// Feature tags in declared order; this is the feature column order.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn purchase_tags(&self) -> &[String] {
        &self.purchase_tags
    }

    pub fn is_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn is_purchase_intent(&self, label: &str) -> bool {
        self.purchase_tags.iter().any(|t| t == label)
    }
}

pub fn load_vocabulary(vocabulary_path: Option<&Path>) -> Result<TagVocabulary> {
    let start_time = Instant::now();
    info!(
        action = "start",
        component = "vocabulary_loading",
        "Starting tag vocabulary loading"
    );

    let vocabulary = if let Some(path) = vocabulary_path {
        info!(action = "load", component = "vocabulary_file", file_path = ?path, "Loading vocabulary from specified file");
        if !path.exists() {
            anyhow::bail!("Vocabulary file not found: {:?}", path);
        }
        let content = fs::read_to_string(path)?;
        TagVocabulary::parse(&content)
            .with_context(|| format!("Invalid vocabulary file {:?}", path))?
    } else {
        // Try default file
        let default_file = Path::new(DEFAULT_VOCABULARY_FILE);
        if default_file.exists() {
            info!(action = "load", component = "default_vocabulary_file", file_path = ?default_file, "Loading vocabulary from default file");
            let content = fs::read_to_string(default_file)?;
            TagVocabulary::parse(&content)
                .with_context(|| format!("Invalid vocabulary file {:?}", default_file))?
        } else {
            info!(
                action = "load",
                component = "embedded_vocabulary",
                "Using embedded default vocabulary"
            );
            TagVocabulary::embedded()?
        }
    };

    let load_time = start_time.elapsed();
    info!(
        action = "complete",
        component = "vocabulary_loading",
        version = vocabulary.version(),
        tag_count = vocabulary.definitions().len(),
        feature_count = vocabulary.features().len(),
        purchase_tag_count = vocabulary.purchase_tags().len(),
        duration_ms = load_time.as_millis(),
        "Loaded tag vocabulary"
    );
    Ok(vocabulary)
}

pub fn init_default_vocabulary(target: &Path) -> Result<()> {
    if target.exists() {
        anyhow::bail!(
            "{} already exists. Remove it first if you want to reinitialize.",
            target.display()
        );
    }

    let default_content = std::str::from_utf8(DEFAULT_VOCABULARY_BYTES)
        .context("Failed to decode embedded default vocabulary")?;

    fs::write(target, default_content)?;
    println!("Created {} with default tag vocabulary", target.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_vocabulary_has_expected_shape() {
        let vocab = TagVocabulary::embedded().unwrap();
        assert_eq!(vocab.version(), 1);
        assert_eq!(vocab.definitions().len(), 29);
        assert_eq!(vocab.features().len(), 25);
        assert_eq!(
            vocab.purchase_tags(),
            ["channel=offline", "channel=online", "sell-channels", "channel_details"]
        );
        assert_eq!(vocab.features()[0], "write-review-please");
        assert_eq!(vocab.features()[16], "category_list");
        assert_eq!(vocab.features()[24], "reviews");
    }

    #[test]
    fn match_order_is_longest_first_and_stable() {
        let vocab = TagVocabulary::embedded().unwrap();
        let order = vocab.match_order();
        assert_eq!(order[0], "write-review-please");
        assert_eq!(order[1], "beauty-ranking-tour");
        for pair in order.windows(2) {
            assert!(pair[0].chars().count() >= pair[1].chars().count());
        }
        // equal lengths keep declared order
        let coupons = order.iter().position(|t| t == "coupons").unwrap();
        let ranking = order.iter().position(|t| t == "ranking").unwrap();
        assert!(coupons < ranking);
        assert_eq!(order.last().unwrap(), "vip");
    }

    #[test]
    fn rejects_both_role() {
        let err = TagVocabulary::parse("version 1\na feature\nb purchase-intent\nc both\n")
            .unwrap_err();
        assert!(err.to_string().contains("must be disjoint"));
    }

    #[test]
    fn rejects_duplicates_and_bad_tags() {
        let dup = TagVocabulary::parse("version 1\na feature\na purchase-intent\n").unwrap_err();
        assert!(dup.to_string().contains("Duplicate tag"));

        let slash = TagVocabulary::parse("version 1\na/b feature\nc purchase-intent\n").unwrap_err();
        assert!(slash.to_string().contains("single non-empty URL segment"));
    }

    #[test]
    fn requires_version_and_both_roles() {
        assert!(TagVocabulary::parse("a feature\nb purchase-intent\n").is_err());
        assert!(TagVocabulary::parse("version 2\na feature\nb purchase-intent\n").is_err());
        assert!(TagVocabulary::parse("version 1\na feature\n").is_err());
        assert!(TagVocabulary::parse("version 1\nb purchase-intent\n").is_err());
        assert!(TagVocabulary::parse("version 1\na feature\nb vip\n").is_err());
    }

    #[test]
    fn neither_role_labels_but_is_not_counted() {
        let vocab =
            TagVocabulary::parse("version 1\n# c\n\nhome neither\na feature\nb purchase-intent\n")
                .unwrap();
        assert_eq!(vocab.match_order().len(), 3);
        assert_eq!(vocab.features(), ["a"]);
        assert!(!vocab.is_feature("home"));
        assert!(!vocab.is_purchase_intent("home"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(DEFAULT_VOCABULARY_FILE);
        init_default_vocabulary(&target).unwrap();
        let written = fs::read_to_string(&target).unwrap();
        assert_eq!(TagVocabulary::parse(&written).unwrap().features().len(), 25);
        assert!(init_default_vocabulary(&target).is_err());
    }

    #[test]
    fn load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        fs::write(&path, "version 1\nx feature\ny purchase-intent\n").unwrap();
        let vocab = load_vocabulary(Some(&path)).unwrap();
        assert_eq!(vocab.features(), ["x"]);

        let missing = dir.path().join("missing.txt");
        assert!(load_vocabulary(Some(&missing)).is_err());
    }
}
