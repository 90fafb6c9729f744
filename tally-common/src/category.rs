use serde::{Deserialize, Serialize};

/// One category with its subcategories, as configured by a user.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub category: String,
    pub subcategories: Vec<String>,
}

/// A user's classification taxonomy. Read-only input to classification;
/// owned and mutated by a separate management surface, not by this pipeline.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct UserCategories {
    pub user_id: String,
    pub categories: Vec<CategoryGroup>,
}

impl UserCategories {
    /// The flat candidate set handed to the classification oracle.
    pub fn candidate_ids(&self) -> Vec<String> {
        self.categories
            .iter()
            .map(|group| group.category.clone())
            .collect()
    }

    /// The taxonomy used when a user has not configured categories.
    pub fn default_for(user_id: &str) -> Self {
        let categories = [
            "Housing",
            "Transportation",
            "Food",
            "Utilities",
            "Insurance",
            "Healthcare",
            "Savings",
            "Personal",
            "Entertainment",
            "Miscellaneous",
        ]
        .iter()
        .map(|category| CategoryGroup {
            category: (*category).to_owned(),
            subcategories: Vec::new(),
        })
        .collect();

        Self {
            user_id: user_id.to_owned(),
            categories,
        }
    }
}
