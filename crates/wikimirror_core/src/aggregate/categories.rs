//! Tag-derived category membership.

use crate::constants::{ORIGINAL_TAG, STRUCTURAL_TAGS};
use crate::models::stats::Category;
use std::collections::BTreeSet;

/// Membership test over a page's normalized tag set.
#[derive(Debug, Clone, Copy)]
pub struct CategoryRule {
    pub required_all: &'static [&'static str],
    pub required_any: &'static [&'static str],
    pub excluded: &'static [&'static str],
}

/// Pages that only accompany another work and never count as translations.
const TRANSLATION_EXCLUDED: &[&str] = &["作者", "author", "掩盖页", "段落", "补充材料"];

impl CategoryRule {
    pub fn for_category(category: Category) -> Self {
        const NONE: &[&str] = &[];
        let (required_all, required_any, excluded): (&[&str], &[&str], &[&str]) = match category {
            Category::Overall => (NONE, NONE, NONE),
            Category::Original => (&[ORIGINAL_TAG], NONE, NONE),
            Category::Scp => (&[ORIGINAL_TAG, "scp"], NONE, NONE),
            Category::Story => (&[ORIGINAL_TAG], &["故事", "tale"], NONE),
            Category::GoiFormat => (&[ORIGINAL_TAG, "goi格式"], NONE, NONE),
            Category::WanderersLibrary => (&[ORIGINAL_TAG, "图书馆"], NONE, NONE),
            Category::Art => (&["艺术作品"], NONE, NONE),
            // Translation is the absence of the original tag.
            Category::Translation => (NONE, NONE, TRANSLATION_EXCLUDED),
        };
        Self {
            required_all,
            required_any,
            excluded,
        }
    }

    /// `true` when `tags` (already lowercased) satisfy the rule.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        self.required_all.iter().all(|tag| tags.contains(*tag))
            && (self.required_any.is_empty()
                || self.required_any.iter().any(|tag| tags.contains(*tag)))
            && !self.excluded.iter().any(|tag| tags.contains(*tag))
    }
}

/// Lowercased, trimmed tag set.
pub fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter().map(|tag| tag.trim().to_lowercase()).collect()
}

/// Every category a page with `tags` belongs to, in report order.
pub fn categories_for(tags: &[String]) -> Vec<Category> {
    let tags = normalize_tags(tags);
    let original = tags.contains(ORIGINAL_TAG);
    let structural = STRUCTURAL_TAGS.iter().any(|tag| tags.contains(*tag));
    Category::ALL
        .into_iter()
        .filter(|category| match category {
            Category::Translation if original || structural => false,
            _ => CategoryRule::for_category(*category).matches(&tags),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|tag| tag.to_string()).collect()
    }

    #[test]
    fn original_scp_lands_in_scp_and_original() {
        assert_eq!(
            categories_for(&tags(&["原创", "SCP", "keter"])),
            vec![Category::Overall, Category::Original, Category::Scp]
        );
    }

    #[test]
    fn story_accepts_either_tale_tag() {
        assert!(categories_for(&tags(&["原创", "故事"])).contains(&Category::Story));
        assert!(categories_for(&tags(&["原创", "Tale"])).contains(&Category::Story));
        assert!(!categories_for(&tags(&["故事"])).contains(&Category::Story));
    }

    #[test]
    fn translation_is_absence_of_original() {
        assert_eq!(
            categories_for(&tags(&["scp", "keter"])),
            vec![Category::Overall, Category::Translation]
        );
        assert!(!categories_for(&tags(&["作者"])).contains(&Category::Translation));
        assert!(!categories_for(&tags(&["_component"])).contains(&Category::Translation));
    }

    #[test]
    fn art_does_not_require_original() {
        let found = categories_for(&tags(&["艺术作品"]));
        assert!(found.contains(&Category::Art));
        assert!(found.contains(&Category::Translation));
    }
}
