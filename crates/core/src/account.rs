use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const CARD_ACCOUNT_TYPE: &str = "sim";
pub const LOCAL_ACCOUNT_TYPE: &str = "local";
pub const LOCAL_ACCOUNT_NAME: &str = "phone";

/// Which physical card a card-backed account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CardId {
    Sim1,
    Sim2,
}

impl CardId {
    pub fn account_name(&self) -> &'static str {
        match self {
            Self::Sim1 => "SIM1",
            Self::Sim2 => "SIM2",
        }
    }

    pub fn from_account_name(name: &str) -> Self {
        if name == Self::Sim2.account_name() {
            Self::Sim2
        } else {
            Self::Sim1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub account_type: String,
    pub account_name: String,
}

impl Account {
    pub fn new(account_type: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            account_type: account_type.into(),
            account_name: account_name.into(),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_ACCOUNT_TYPE, LOCAL_ACCOUNT_NAME)
    }

    pub fn card(card: CardId) -> Self {
        Self::new(CARD_ACCOUNT_TYPE, card.account_name())
    }

    /// The account marker: `Some` routes saves through card synchronization.
    pub fn card_id(&self) -> Option<CardId> {
        (self.account_type == CARD_ACCOUNT_TYPE)
            .then(|| CardId::from_account_name(&self.account_name))
    }

    pub fn is_card(&self) -> bool {
        self.card_id().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AggregationMode {
    #[default]
    Default,
    /// Held while a multi-step edit is in flight.
    Suspended,
    Disabled,
}

impl AggregationMode {
    pub fn code(&self) -> i64 {
        match self {
            Self::Default => 0,
            Self::Suspended => 2,
            Self::Disabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Self::Default),
            2 => Ok(Self::Suspended),
            3 => Ok(Self::Disabled),
            other => Err(CoreError::UnknownAggregationMode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_marker() {
        assert_eq!(Account::card(CardId::Sim2).card_id(), Some(CardId::Sim2));
        assert_eq!(Account::card(CardId::Sim1).card_id(), Some(CardId::Sim1));
        assert_eq!(Account::local().card_id(), None);
    }

    #[test]
    fn aggregation_codes() {
        for mode in [AggregationMode::Default, AggregationMode::Suspended, AggregationMode::Disabled] {
            assert_eq!(AggregationMode::from_code(mode.code()).unwrap(), mode);
        }
        assert!(AggregationMode::from_code(1).is_err());
    }
}
