/// One case-insensitive rule for spotting aggregate lines. Values are kept
/// lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    Exact(String),
    Contains(String),
    Prefix(String),
}

impl MatchRule {
    pub fn exact(value: &str) -> Self {
        MatchRule::Exact(value.to_lowercase())
    }

    pub fn contains(value: &str) -> Self {
        MatchRule::Contains(value.to_lowercase())
    }

    pub fn prefix(value: &str) -> Self {
        MatchRule::Prefix(value.to_lowercase())
    }

    /// `name` must already be lower-cased.
    fn matches(&self, name: &str) -> bool {
        match self {
            MatchRule::Exact(v) => name == v,
            MatchRule::Contains(v) => name.contains(v.as_str()),
            MatchRule::Prefix(v) => name.starts_with(v.as_str()),
        }
    }
}

/// Rejects category subtotals, totals and tax lines that the extraction
/// model sometimes reports as products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryFilter {
    rules: Vec<MatchRule>,
}

impl Default for SummaryFilter {
    fn default() -> Self {
        Self::new(vec![
            MatchRule::exact("non-food"),
            MatchRule::exact("nonfood"),
            MatchRule::exact("käyttötavara"),
            MatchRule::exact("elintarvikkeet"),
            MatchRule::contains("yhteensä"),
            MatchRule::contains("total"),
            MatchRule::contains("summa"),
            MatchRule::prefix("alv "),
            MatchRule::prefix("vero"),
        ])
    }
}

impl SummaryFilter {
    pub fn new(rules: Vec<MatchRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn is_summary(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.rules.iter().any(|rule| rule.matches(&name))
    }
}
