//! Reference course catalog (license/specialty vocabulary plus per-course
//! details) and the similarity-based normalizer that uses it.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use dsc_core::CourseEntry;
use serde::Deserialize;
use strsim::jaro_winkler;

use crate::Normalizer;

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct CourseDetail {
    #[serde(default)]
    pub min_days: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseCatalog {
    #[serde(default)]
    pub licenses: Vec<String>,
    #[serde(default)]
    pub specialties: Vec<String>,
    #[serde(default)]
    pub courses: BTreeMap<String, CourseDetail>,
    #[serde(skip)]
    vocabulary: Vec<String>,
}

impl CourseCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut catalog: Self = serde_yaml::from_str(text).context("parsing course catalog")?;
        catalog.vocabulary = catalog
            .licenses
            .iter()
            .chain(catalog.specialties.iter())
            .cloned()
            .collect();
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Licenses followed by specialties.
    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    /// Fill `min_days`/`description` from the catalog. Unknown courses are untouched.
    pub fn enrich(&self, course: &mut CourseEntry) {
        let Some(detail) = self.courses.get(&course.name) else {
            return;
        };
        if detail.min_days.is_some() {
            course.min_days = detail.min_days;
        }
        if detail.description.is_some() {
            course.description = detail.description.clone();
        }
    }
}

/// Folds width and punctuation variants so `ｵｰﾌﾟﾝ`-style and `・`-separated
/// spellings compare on their letters only.
pub fn fold_course_name(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct VocabularyNormalizer {
    pub threshold: f64,
    /// Shorter folded name over longer one; pairs below this never match.
    pub min_length_ratio: f64,
}

impl Default for VocabularyNormalizer {
    fn default() -> Self {
        Self {
            threshold: 0.88,
            min_length_ratio: 0.75,
        }
    }
}

impl VocabularyNormalizer {
    /// A name that contains another name plus extra letters is a different
    /// course (`ジュニア・オープン・ウォーター・ダイバー` is not the adult license).
    fn comparable(&self, folded: &str, candidate: &str) -> bool {
        let (a, b) = (folded.chars().count(), candidate.chars().count());
        if a == 0 || b == 0 {
            return false;
        }
        if a != b && (folded.contains(candidate) || candidate.contains(folded)) {
            return false;
        }
        (a.min(b) as f64 / a.max(b) as f64) >= self.min_length_ratio
    }
}

impl Normalizer for VocabularyNormalizer {
    fn normalize(&self, text: &str, vocabulary: &[String]) -> String {
        if vocabulary.iter().any(|v| v == text) {
            return text.to_string();
        }
        let folded = fold_course_name(text);
        if folded.is_empty() {
            return text.to_string();
        }

        let mut best: Option<(&String, f64)> = None;
        for candidate in vocabulary {
            let folded_candidate = fold_course_name(candidate);
            if !self.comparable(&folded, &folded_candidate) {
                continue;
            }
            let score = jaro_winkler(&folded, &folded_candidate);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }

        match best {
            Some((candidate, score)) if score >= self.threshold => candidate.clone(),
            _ => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
licenses:
  - オープン・ウォーター・ダイバー
  - アドヴァンスド・オープン・ウォーター・ダイバー
  - Rescue Diver
specialties:
  - ディープ・ダイバー
courses:
  オープン・ウォーター・ダイバー:
    min_days: 3
    description: 初めてのライセンス
  Rescue Diver:
    min_days: 3
"#;

    #[test]
    fn vocabulary_lists_licenses_then_specialties() {
        let catalog = CourseCatalog::from_yaml_str(CATALOG).expect("catalog");
        assert_eq!(catalog.vocabulary().len(), 4);
        assert_eq!(catalog.vocabulary()[3], "ディープ・ダイバー");
    }

    #[test]
    fn punctuation_variants_map_onto_the_vocabulary() {
        let catalog = CourseCatalog::from_yaml_str(CATALOG).expect("catalog");
        let normalizer = VocabularyNormalizer::default();
        assert_eq!(
            normalizer.normalize("オープンウォーターダイバー", catalog.vocabulary()),
            "オープン・ウォーター・ダイバー"
        );
        assert_eq!(
            normalizer.normalize("ディープダイバー", catalog.vocabulary()),
            "ディープ・ダイバー"
        );
        assert_eq!(
            normalizer.normalize("ＲＥＳＣＵＥ　ＤＩＶＥＲ", catalog.vocabulary()),
            "Rescue Diver"
        );
    }

    #[test]
    fn unrelated_names_are_left_alone() {
        let catalog = CourseCatalog::from_yaml_str(CATALOG).expect("catalog");
        let normalizer = VocabularyNormalizer::default();
        assert_eq!(
            normalizer.normalize("体験ダイビング", catalog.vocabulary()),
            "体験ダイビング"
        );
        assert_eq!(normalizer.normalize("", catalog.vocabulary()), "");
    }

    #[test]
    fn longer_variants_of_a_license_keep_their_own_name() {
        let catalog = CourseCatalog::from_yaml_str(CATALOG).expect("catalog");
        let normalizer = VocabularyNormalizer::default();
        for name in [
            "ジュニア・オープン・ウォーター・ダイバー",
            "ジュニアオープンウォーターダイバー",
            "ジュニア・スクーバ・ダイバー",
            "オープン・ウォーター",
        ] {
            assert_eq!(normalizer.normalize(name, catalog.vocabulary()), name);
        }
        assert_eq!(
            normalizer.normalize("アドバンスド・オープン・ウォーター・ダイバー", catalog.vocabulary()),
            "アドヴァンスド・オープン・ウォーター・ダイバー"
        );
    }

    #[test]
    fn junior_courses_do_not_collapse_onto_the_shipped_vocabulary() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../course_catalog.yaml");
        let catalog = CourseCatalog::load(path).expect("catalog");
        let normalizer = VocabularyNormalizer::default();
        assert_eq!(
            normalizer.normalize("ジュニア・オープン・ウォーター・ダイバー", catalog.vocabulary()),
            "ジュニア・オープン・ウォーター・ダイバー"
        );
        assert_eq!(
            normalizer.normalize("ジュニア・スクーバ・ダイバー", catalog.vocabulary()),
            "ジュニア・スクーバ・ダイバー"
        );
        assert_eq!(
            normalizer.normalize("スクーバダイバー", catalog.vocabulary()),
            "スクーバ・ダイバー"
        );
    }

    #[test]
    fn enrich_fills_known_courses_only() {
        let catalog = CourseCatalog::from_yaml_str(CATALOG).expect("catalog");
        let mut known = CourseEntry::new("オープン・ウォーター・ダイバー", Some(39800), None);
        let mut unknown = CourseEntry::new("Fun Dive", Some(12000), None);
        unknown.min_days = Some(1);

        catalog.enrich(&mut known);
        catalog.enrich(&mut unknown);

        assert_eq!(known.min_days, Some(3));
        assert_eq!(known.description.as_deref(), Some("初めてのライセンス"));
        assert_eq!(unknown.min_days, Some(1));
        assert_eq!(unknown.description, None);
    }
}
