use crate::model::ItemId;
use thiserror::Error;

/// Errors raised while compiling or stepping a model.
///
/// Each variant optionally names the graph item that caused it so that a
/// host can highlight it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    #[error("{message}")]
    Structural {
        message: String,
        item: Option<ItemId>,
    },
    #[error("{message}")]
    Accounting {
        message: String,
        item: Option<ItemId>,
    },
    #[error("{message}")]
    Differentiation {
        message: String,
        item: Option<ItemId>,
    },
    #[error("{message}")]
    Numeric {
        message: String,
        item: Option<ItemId>,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;

impl SimError {
    pub fn structural(message: impl Into<String>) -> Self {
        SimError::Structural {
            message: message.into(),
            item: None,
        }
    }

    pub fn accounting(message: impl Into<String>) -> Self {
        SimError::Accounting {
            message: message.into(),
            item: None,
        }
    }

    pub fn differentiation(message: impl Into<String>) -> Self {
        SimError::Differentiation {
            message: message.into(),
            item: None,
        }
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        SimError::Numeric {
            message: message.into(),
            item: None,
        }
    }

    /// Attaches `item` unless an item has already been recorded.
    pub fn with_item(mut self, id: ItemId) -> Self {
        match &mut self {
            SimError::Structural { item, .. }
            | SimError::Accounting { item, .. }
            | SimError::Differentiation { item, .. }
            | SimError::Numeric { item, .. } => {
                if item.is_none() {
                    *item = Some(id);
                }
            }
        }
        self
    }

    /// Same as [`SimError::with_item`], for an optional item.
    pub fn with_optional_item(self, id: Option<ItemId>) -> Self {
        match id {
            Some(id) => self.with_item(id),
            None => self,
        }
    }

    pub fn item(&self) -> Option<ItemId> {
        match self {
            SimError::Structural { item, .. }
            | SimError::Accounting { item, .. }
            | SimError::Differentiation { item, .. }
            | SimError::Numeric { item, .. } => *item,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SimError::Structural { message, .. }
            | SimError::Accounting { message, .. }
            | SimError::Differentiation { message, .. }
            | SimError::Numeric { message, .. } => message,
        }
    }
}

/// Where a host should draw attention when an error is reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorLocation {
    Item(ItemId),
    Point { x: f64, y: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_item_keeps_first_item() {
        let err = SimError::numeric("bad").with_item(ItemId(3)).with_item(ItemId(7));
        assert_eq!(err.item(), Some(ItemId(3)));
        assert_eq!(err.to_string(), "bad");
    }

    #[test]
    fn with_optional_item_passes_none_through() {
        let err = SimError::structural("cycle").with_optional_item(None);
        assert_eq!(err.item(), None);
        assert!(matches!(err, SimError::Structural { .. }));
    }
}
