//! Human-readable document numbers: `PREFIX-YYYY-NNNNN`
//!
//! Each kind has its own counter per calendar year, handed out by the store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    Order,
    /// Purchase order acknowledgement (bon de commande)
    Commande,
    Invoice,
    Quote,
}

impl SequenceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SequenceKind::Order => "CMD",
            SequenceKind::Commande => "BC",
            SequenceKind::Invoice => "FAC",
            SequenceKind::Quote => "DEV",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceKind::Order => "order",
            SequenceKind::Commande => "commande",
            SequenceKind::Invoice => "invoice",
            SequenceKind::Quote => "quote",
        }
    }
}

pub fn format_number(kind: SequenceKind, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:05}", kind.prefix(), year, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pads_sequence() {
        assert_eq!(format_number(SequenceKind::Order, 2026, 7), "CMD-2026-00007");
        assert_eq!(format_number(SequenceKind::Commande, 2026, 12), "BC-2026-00012");
        assert_eq!(format_number(SequenceKind::Invoice, 2027, 1), "FAC-2027-00001");
        assert_eq!(format_number(SequenceKind::Quote, 2026, 123456), "DEV-2026-123456");
    }
}
