// ===============================
// src/compliance.rs
// ===============================
use ahash::AHashSet as HashSet;
use std::collections::BTreeSet;
use std::fmt;

/// Why a purchase was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyBlock {
    WashSale,
    Excluded,
}

impl fmt::Display for BuyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuyBlock::WashSale => write!(f, "recent loss sale (wash sale window)"),
            BuyBlock::Excluded => write!(f, "on exclusion list"),
        }
    }
}

/// Exclusion and retention sets for one run. Symbols in broker notation.
#[derive(Debug, Clone, Default)]
pub struct ComplianceSets {
    exclusion: HashSet<String>,
    explicit: HashSet<String>,
    wash_sale: BTreeSet<String>,
    retention: Vec<String>,
}

impl ComplianceSets {
    /// exclusion = explicit list ∪ wash-sale symbols; retention keeps its configured order.
    pub fn build(explicit: &[String], wash_sale: &BTreeSet<String>, retention: &[String]) -> Self {
        let explicit: HashSet<String> = explicit.iter().cloned().collect();
        let exclusion = explicit.iter().chain(wash_sale.iter()).cloned().collect();
        let mut ordered: Vec<String> = Vec::with_capacity(retention.len());
        for s in retention {
            if !ordered.contains(s) {
                ordered.push(s.clone());
            }
        }
        Self { exclusion, explicit, wash_sale: wash_sale.clone(), retention: ordered }
    }

    pub fn is_excluded(&self, symbol: &str) -> bool { self.exclusion.contains(symbol) }
    pub fn is_wash_sale(&self, symbol: &str) -> bool { self.wash_sale.contains(symbol) }
    pub fn is_retained(&self, symbol: &str) -> bool { self.retention.iter().any(|s| s == symbol) }
    pub fn retention(&self) -> &[String] { &self.retention }
    pub fn exclusion_len(&self) -> usize { self.exclusion.len() }

    /// Purchase precedence, first match wins:
    /// 1. wash-sale flagged   -> never bought (retention only keeps it held)
    /// 2. retained            -> may be bought
    /// 3. explicitly excluded -> never bought
    pub fn purchase_block(&self, symbol: &str) -> Option<BuyBlock> {
        if self.is_wash_sale(symbol) {
            Some(BuyBlock::WashSale)
        } else if self.is_retained(symbol) {
            None
        } else if self.explicit.contains(symbol) {
            Some(BuyBlock::Excluded)
        } else {
            None
        }
    }

    /// Score-driven exit is allowed only for symbols neither excluded nor retained.
    pub fn may_exit(&self, symbol: &str) -> bool {
        !self.is_excluded(symbol) && !self.is_retained(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets() -> ComplianceSets {
        let wash: BTreeSet<String> = ["AAPL".to_string(), "TSLA".to_string()].into_iter().collect();
        ComplianceSets::build(
            &["BKNG".to_string(), "MSFT".to_string()],
            &wash,
            &["AAPL".to_string(), "MSFT".to_string(), "AAPL".to_string()],
        )
    }

    #[test]
    fn exclusion_is_union() {
        let s = sets();
        assert!(s.is_excluded("BKNG"));
        assert!(s.is_excluded("TSLA"));
        assert!(!s.is_excluded("NVDA"));
        assert_eq!(s.exclusion_len(), 4);
        assert_eq!(s.retention(), &["AAPL".to_string(), "MSFT".to_string()]);
    }

    #[test]
    fn purchase_precedence() {
        let s = sets();
        // retained but wash-sale flagged
        assert_eq!(s.purchase_block("AAPL"), Some(BuyBlock::WashSale));
        // retained and explicitly excluded
        assert_eq!(s.purchase_block("MSFT"), None);
        assert_eq!(s.purchase_block("BKNG"), Some(BuyBlock::Excluded));
        assert_eq!(s.purchase_block("TSLA"), Some(BuyBlock::WashSale));
        assert_eq!(s.purchase_block("NVDA"), None);
    }

    #[test]
    fn exits_skip_retained_and_excluded() {
        let s = sets();
        assert!(!s.may_exit("AAPL"));
        assert!(!s.may_exit("BKNG"));
        assert!(!s.may_exit("TSLA"));
        assert!(s.may_exit("NVDA"));
    }
}
