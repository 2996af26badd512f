//! Catalog rules applied to upstream product data: keyword-based category
//! refinement and the (brand, category) unit-cost override table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PRE_ROLLS: &str = "Pre-Rolls";
pub const DISPOSABLES: &str = "Disposables";
pub const CARTRIDGES: &str = "Cartridges";

const PRE_ROLL_KEYWORDS: &[&str] = &["pre-roll", "preroll", "pre roll", "infused roll", "blunt"];
const DISPOSABLE_KEYWORDS: &[&str] = &["disposable", "all-in-one", "all in one", "aio vape"];
const CARTRIDGE_KEYWORDS: &[&str] = &["cartridge", "cart", "510", "pod"];

/// Reassigns a canonical category when the type, category or product name
/// mention a known keyword family. Disposables are checked before cartridges
/// since disposable listings frequently mention "cart" as well.
pub fn refine_category(item_type: &str, category: &str, product: &str) -> String {
    let text = format!("{} {} {}", item_type, category, product).to_lowercase();
    let families: [(&[&str], &str); 3] = [
        (PRE_ROLL_KEYWORDS, PRE_ROLLS),
        (DISPOSABLE_KEYWORDS, DISPOSABLES),
        (CARTRIDGE_KEYWORDS, CARTRIDGES),
    ];

    for (keywords, canonical) in families {
        if keywords.iter().any(|kw| text.contains(kw)) {
            return canonical.to_string();
        }
    }
    category.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostOverride {
    pub brand: String,
    pub category: String,
    pub unit_cost: f64,
}

/// Exact, case-insensitive (brand, category) lookup. No partial matching.
#[derive(Debug, Clone, Default)]
pub struct CostOverrides {
    rules: HashMap<(String, String), f64>,
}

impl CostOverrides {
    pub fn new(rules: Vec<CostOverride>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                (
                    (rule.brand.to_lowercase(), rule.category.to_lowercase()),
                    rule.unit_cost,
                )
            })
            .collect();
        Self { rules }
    }

    pub fn unit_cost(&self, brand: &str, category: &str) -> Option<f64> {
        self.rules
            .get(&(brand.to_lowercase(), category.to_lowercase()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
