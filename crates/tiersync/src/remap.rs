//! Archive entry name → destination name mapping.

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RemapError {
    #[error("Invalid remap pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Maps an archive entry name to its destination name. `None` skips the entry.
pub trait FilenameRemapper: Send + Sync {
    fn remap(&self, name: &str) -> Option<String>;
}

impl<F> FilenameRemapper for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn remap(&self, name: &str) -> Option<String> {
        self(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    /// Regex replacement; `${1}` refers to capture groups.
    pub replacement: String,
    /// Replace every match instead of the first.
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapRules {
    pub skip_suffixes: Vec<String>,
    pub skip_prefixes: Vec<String>,
    /// Applied in order, each to the output of the previous one.
    pub rewrites: Vec<RewriteRule>,
    /// When non-empty, a rewritten name must match one of these.
    pub accept: Vec<String>,
}

impl Default for RemapRules {
    fn default() -> Self {
        Self {
            skip_suffixes: vec![".url".to_string(), ".pdf".to_string()],
            skip_prefixes: Vec::new(),
            rewrites: Vec::new(),
            accept: Vec::new(),
        }
    }
}

struct CompiledRewrite {
    regex: Regex,
    replacement: String,
    all: bool,
}

pub struct RuleRemapper {
    skip_suffixes: Vec<String>,
    skip_prefixes: Vec<String>,
    rewrites: Vec<CompiledRewrite>,
    accept: Option<RegexSet>,
}

fn compile(pattern: &str) -> Result<Regex, RemapError> {
    Regex::new(pattern).map_err(|source| RemapError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl RuleRemapper {
    pub fn from_rules(rules: &RemapRules) -> Result<Self, RemapError> {
        let rewrites = rules
            .rewrites
            .iter()
            .map(|rule| {
                Ok(CompiledRewrite {
                    regex: compile(&rule.pattern)?,
                    replacement: rule.replacement.clone(),
                    all: rule.all,
                })
            })
            .collect::<Result<Vec<_>, RemapError>>()?;

        let accept = if rules.accept.is_empty() {
            None
        } else {
            // Compile individually first so the error names the bad pattern.
            for pattern in &rules.accept {
                compile(pattern)?;
            }
            Some(
                RegexSet::new(&rules.accept).map_err(|source| RemapError::Pattern {
                    pattern: rules.accept.join(" | "),
                    source,
                })?,
            )
        };

        Ok(Self {
            skip_suffixes: rules.skip_suffixes.clone(),
            skip_prefixes: rules.skip_prefixes.clone(),
            rewrites,
            accept,
        })
    }
}

impl FilenameRemapper for RuleRemapper {
    fn remap(&self, name: &str) -> Option<String> {
        if self.skip_suffixes.iter().any(|s| name.ends_with(s.as_str()))
            || self.skip_prefixes.iter().any(|p| name.starts_with(p.as_str()))
        {
            return None;
        }

        let mut mapped = name.to_string();
        for rewrite in &self.rewrites {
            let replaced = if rewrite.all {
                rewrite.regex.replace_all(&mapped, rewrite.replacement.as_str())
            } else {
                rewrite.regex.replace(&mapped, rewrite.replacement.as_str())
            };
            mapped = replaced.into_owned();
        }

        match &self.accept {
            Some(accept) if !accept.is_match(&mapped) => {
                tracing::warn!(entry = name, mapped = %mapped, "No accept rule matches, skipping");
                None
            }
            _ => Some(mapped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_rules() -> RemapRules {
        serde_json::from_value(serde_json::json!({
            "skip_prefixes": ["Mapmaking/"],
            "rewrites": [
                {"pattern": "^FA_Tokens/", "replacement": "Tokens/"},
                {"pattern": "1⁄2", "replacement": "1∕2", "all": true},
                {"pattern": "CR (.)", "replacement": "CR_${1}"},
                {"pattern": "Townsfolk_(\\d+)", "replacement": "Townsfolk"},
                {"pattern": "^Creatures", "replacement": "Tokens/Creatures"}
            ],
            "accept": [
                "^Tokens/Creatures/CR_\\d∕?\\d?/",
                "^Tokens/NPCs/(Commoners|Townsfolk)/"
            ]
        }))
        .unwrap()
    }

    #[test]
    fn default_rules_skip_links_and_documents() {
        let remapper = RuleRemapper::from_rules(&RemapRules::default()).unwrap();
        assert_eq!(remapper.remap("Tokens/readme.pdf"), None);
        assert_eq!(remapper.remap("Tokens/site.url"), None);
        assert_eq!(remapper.remap("Tokens/a.png").as_deref(), Some("Tokens/a.png"));
    }

    #[test]
    fn rewrites_apply_in_order() {
        let remapper = RuleRemapper::from_rules(&token_rules()).unwrap();
        assert_eq!(
            remapper.remap("FA_Tokens/Creatures/CR 1⁄2/Goblin_1⁄2.png").as_deref(),
            Some("Tokens/Creatures/CR_1∕2/Goblin_1∕2.png")
        );
        assert_eq!(
            remapper.remap("Creatures/CR 3/Ogre.png").as_deref(),
            Some("Tokens/Creatures/CR_3/Ogre.png")
        );
        assert_eq!(
            remapper.remap("Tokens/NPCs/Townsfolk_02/Townsfolk_AA1_01.png").as_deref(),
            Some("Tokens/NPCs/Townsfolk/Townsfolk_AA1_01.png")
        );
    }

    #[test]
    fn skip_prefixes_and_unaccepted_names_are_dropped() {
        let remapper = RuleRemapper::from_rules(&token_rules()).unwrap();
        // Defaults survive a partial rules document.
        assert_eq!(remapper.remap("Tokens/Creatures/CR_1/a.pdf"), None);
        assert_eq!(remapper.remap("Mapmaking/Tiles/a.png"), None);
        assert_eq!(remapper.remap("Tokens/Vehicles/Cart.png"), None);
    }

    #[test]
    fn forgotten_adventures_rule_file() {
        let rules: RemapRules =
            serde_json::from_str(include_str!("../rules/forgotten-adventures.json")).unwrap();
        let remapper = RuleRemapper::from_rules(&rules).unwrap();

        let cases = [
            (
                "FA_Tokens/Creatures/CR 1⁄2/Goblin_1⁄2.png",
                "Tokens/Creatures/CR_1∕2/Goblin_1∕2.png",
            ),
            ("Tokens/Creatures/CR 1⁄8/Rat.png", "Tokens/Creatures/CR_1∕8/Rat.png"),
            (
                "Creatures/CR_1/Giant_Bearded_Vulture_Large_Beast_01.png",
                "Tokens/Creatures/CR_1/Giant_Bearded_Vulture_Large_Beast_01.png",
            ),
            (
                "Tokens/NPCs/Townsfolk_02/Townsfolk_AA1_01.png",
                "Tokens/NPCs/Townsfolk/Townsfolk_AA1_01.png",
            ),
            (
                "Tokens/Spirits/Creature Spirits_Pack_3/Ghost.png",
                "Tokens/Spirits/Creatures/Ghost.png",
            ),
            (
                "Tokens/Spirits/Spirits_Heroes/Elf_Spirit.png",
                "Tokens/Spirits/Heroes/Elf_Spirit.png",
            ),
            (
                "Tokens/Spirits/Commoner_Spirits/Farmer.png",
                "Tokens/Spirits/Commoners/Farmer.png",
            ),
            (
                "Creature Tokens Pack 2/Creatures/Beast/Wolf.png",
                "Tokens/Creatures/Beast/Wolf.png",
            ),
            (
                "Tokens/Creatures/Unknown_CR/Thing.png",
                "Tokens/Creatures/CR_unknown/Thing.png",
            ),
            (
                "Tokens/Heroes/_Catch-All_Heroes/Hero_01.png",
                "Tokens/Heroes/Catch-All_Heroes/Hero_01.png",
            ),
            (
                "Tokens/Spirits/Catch-All_Heroes_Spirits/A.png",
                "Tokens/Spirits/Catch-All_Heroes/A.png",
            ),
            ("Tokens/Baseless/CR 5/X.png", "Tokens/Baseless/CR_5/X.png"),
            ("Tokens/Adversaries/Cultist.png", "Tokens/Adversaries/Cultist.png"),
        ];
        for (entry, expected) in cases {
            assert_eq!(remapper.remap(entry).as_deref(), Some(expected), "{entry}");
        }

        for entry in [
            "Mapmaking/Tiles/a.png",
            "Tokens/readme.pdf",
            "Tokens/Patreon.url",
            "Tokens/Vehicles/Cart.png",
            "Tokens/Heroes/Centaur/A.png",
        ] {
            assert_eq!(remapper.remap(entry), None, "{entry}");
        }
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let rules = RemapRules {
            rewrites: vec![RewriteRule {
                pattern: "(unclosed".into(),
                replacement: String::new(),
                all: false,
            }],
            ..RemapRules::default()
        };
        let err = RuleRemapper::from_rules(&rules).err().unwrap();
        assert!(matches!(err, RemapError::Pattern { ref pattern, .. } if pattern == "(unclosed"));

        let rules = RemapRules {
            accept: vec!["^ok/".into(), "[".into()],
            ..RemapRules::default()
        };
        let err = RuleRemapper::from_rules(&rules).err().unwrap();
        assert!(matches!(err, RemapError::Pattern { ref pattern, .. } if pattern == "["));
    }

    #[test]
    fn closures_are_remappers() {
        let upper = |name: &str| Some(name.to_uppercase());
        assert_eq!(upper.remap("a/b.png").as_deref(), Some("A/B.PNG"));
    }
}
